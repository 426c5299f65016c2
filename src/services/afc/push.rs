//! Recursive bundle upload over AFC
//!
//! Mirrors a local directory tree onto the device. Directories are created before their
//! contents, symlinks are recreated with their literal target, and regular files are
//! streamed in fixed size chunks. A file that fails to transfer is logged and counted as
//! missing instead of aborting the push.

use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::AfcClient;
use crate::{DeployError, bridge::AfcFopenMode, bridge::DeviceBridge};

/// Size of each write sent to the device
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of a push
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferReport {
    /// Files and links created on the device
    pub transferred: usize,
    /// Files and links found locally
    pub total: usize,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.transferred == self.total
    }

    /// Turns a short transfer into `TransferIncomplete`
    pub fn into_result(self) -> Result<usize, DeployError> {
        if self.is_complete() {
            Ok(self.transferred)
        } else {
            Err(DeployError::TransferIncomplete {
                transferred: self.transferred,
                total: self.total,
            })
        }
    }
}

/// Completed/total counters for one push, reporting in 10% steps
struct TransferProgress {
    completed: usize,
    total: usize,
    last_reported: Option<u64>,
}

impl TransferProgress {
    fn new(total: usize) -> Self {
        Self {
            completed: 0,
            total,
            last_reported: None,
        }
    }

    /// Records a finished file, returning the new percentage if it crossed a 10% step
    fn complete_one(&mut self) -> Option<u64> {
        self.completed += 1;
        let percent = if self.total == 0 {
            100
        } else {
            (self.completed * 100 / self.total) as u64
        };
        let step = percent / 10 * 10;
        if self.last_reported.is_some_and(|l| l >= step) {
            return None;
        }
        self.last_reported = Some(step);
        Some(step)
    }
}

/// Joins a remote root and a relative local path with `/`, whatever the host separator
pub fn remote_path(remote_root: &str, relative: &Path) -> String {
    let root = remote_root.trim_end_matches(['/', '\\']);
    let parts = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<String>>();

    if parts.is_empty() {
        root.to_string()
    } else if root.is_empty() {
        parts.join("/")
    } else {
        format!("{root}/{}", parts.join("/"))
    }
}

/// Counts every non-directory entry under `root`
pub async fn count_files(root: &Path) -> Result<usize, DeployError> {
    let mut count = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                pending.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Reads a directory's entries sorted by name
async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, DeployError> {
    let mut rd = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

impl<B: DeviceBridge> AfcClient<'_, B> {
    /// Uploads `local_root` to `remote_root`
    ///
    /// # Returns
    /// How many of the local files made it to the device. Individual failures only show
    /// up as a shortfall; use [`TransferReport::into_result`] to treat that as an error.
    ///
    /// # Errors
    /// Local I/O failures while walking the tree
    pub async fn push(
        &mut self,
        local_root: impl AsRef<Path>,
        remote_root: &str,
    ) -> Result<TransferReport, DeployError> {
        self.push_with_callback(local_root, remote_root, |_| {}, ())
            .await
    }

    /// Same as [`push`](Self::push), calling `callback` with `(percent, state)` every
    /// time the completed share crosses a 10% step
    pub async fn push_with_callback<S>(
        &mut self,
        local_root: impl AsRef<Path>,
        remote_root: &str,
        callback: impl Fn((u64, S)),
        state: S,
    ) -> Result<TransferReport, DeployError>
    where
        S: Clone,
    {
        let local_root = local_root.as_ref();
        let total = count_files(local_root).await?;
        let mut progress = TransferProgress::new(total);
        let mut transferred = 0;
        info!(
            "Pushing {total} files from {} to {remote_root}",
            local_root.display()
        );

        let mut pending = vec![local_root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let relative = dir.strip_prefix(local_root).unwrap_or(Path::new(""));
            let remote_dir = remote_path(remote_root, relative);
            if let Err(e) = self.mk_dir(&remote_dir).await {
                warn!("Unable to create {remote_dir}: {e}");
            }

            let mut subdirs = Vec::new();
            for path in sorted_entries(&dir).await? {
                let meta = tokio::fs::symlink_metadata(&path).await?;
                if meta.is_dir() {
                    subdirs.push(path);
                    continue;
                }

                let relative = path.strip_prefix(local_root).unwrap_or(path.as_path());
                let remote = remote_path(remote_root, relative);

                let res = if meta.file_type().is_symlink() {
                    self.push_symlink(&path, &remote).await
                } else if meta.is_file() {
                    self.push_file(&path, &remote).await
                } else {
                    warn!("Skipping special file {}", path.display());
                    continue;
                };

                match res {
                    Ok(()) => {
                        transferred += 1;
                        if let Some(percent) = progress.complete_one() {
                            info!("Transferred {percent}% of files");
                            callback((percent, state.clone()));
                        }
                    }
                    Err(e) => {
                        warn!("Failed to transfer {} to {remote}: {e}", path.display());
                    }
                }
            }

            // reversed so the stack pops them in name order
            pending.extend(subdirs.into_iter().rev());
        }

        let report = TransferReport { transferred, total };
        if !report.is_complete() {
            warn!("Only transferred {transferred} of {total} files");
        }
        Ok(report)
    }

    async fn push_symlink(&mut self, local: &Path, remote: &str) -> Result<(), DeployError> {
        let target = tokio::fs::read_link(local).await?;
        let target = target.to_string_lossy();
        debug!("Linking {remote} -> {target}");
        self.symlink(&target, remote).await
    }

    async fn push_file(&mut self, local: &Path, remote: &str) -> Result<(), DeployError> {
        let mut file = tokio::fs::File::open(local).await?;
        let fd = self.open(remote, AfcFopenMode::WrOnly).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let res = loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(DeployError::from(e)),
            };
            if let Err(e) = self.write_all(&fd, &buf[..n]).await {
                break Err(e);
            }
        };

        let closed = self.close(fd).await;
        res?;
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceSession, ServiceKind, test_support::MockBridge};

    fn bundle() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path();
        std::fs::write(app.join("Info.plist"), b"plist").unwrap();
        std::fs::write(app.join("HelloApp"), vec![7u8; CHUNK_SIZE * 2 + 17]).unwrap();
        std::fs::create_dir_all(app.join("Frameworks/Lib.framework")).unwrap();
        std::fs::write(app.join("Frameworks/Lib.framework/Lib"), b"lib").unwrap();
        std::fs::create_dir(app.join("Base.lproj")).unwrap();
        std::fs::write(app.join("Base.lproj/Main.strings"), b"strings").unwrap();
        dir
    }

    #[test]
    fn remote_paths_are_slash_joined() {
        assert_eq!(
            remote_path("PublicStaging/Hello.app/", Path::new("a/b.txt")),
            "PublicStaging/Hello.app/a/b.txt"
        );
        assert_eq!(
            remote_path("PublicStaging/Hello.app//", Path::new("")),
            "PublicStaging/Hello.app"
        );
        let nested: PathBuf = ["Frameworks", "Lib.framework", "Lib"].iter().collect();
        assert_eq!(
            remote_path("Staging", &nested),
            "Staging/Frameworks/Lib.framework/Lib"
        );
    }

    #[test]
    fn progress_reports_each_step_once() {
        let mut p = TransferProgress::new(3);
        assert_eq!(p.complete_one(), Some(30));
        assert_eq!(p.complete_one(), Some(60));
        assert_eq!(p.complete_one(), Some(100));

        let mut p = TransferProgress::new(40);
        let reported = (0..40).filter_map(|_| p.complete_one()).collect::<Vec<_>>();
        assert_eq!(reported, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[tokio::test]
    async fn counts_files_recursively() {
        let dir = bundle();
        assert_eq!(count_files(dir.path()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn pushes_whole_tree() {
        let dir = bundle();
        let bridge = MockBridge::new();
        let percents = std::sync::Mutex::new(Vec::new());
        {
            let device = DeviceSession::open(&bridge, None).await.unwrap();
            let lockdown = device.lockdown("ideploy").await.unwrap();
            let service = lockdown
                .start_service(ServiceKind::FileConduit)
                .await
                .unwrap();
            let mut afc = AfcClient::new(&service).await.unwrap();
            let report = afc
                .push_with_callback(
                    dir.path(),
                    "PublicStaging/Hello.app/",
                    |(p, _)| percents.lock().unwrap().push(p),
                    (),
                )
                .await
                .unwrap();
            assert_eq!(report, TransferReport { transferred: 4, total: 4 });
            assert_eq!(report.into_result().unwrap(), 4);
        }

        let state = bridge.state();
        assert!(state.dirs.contains("PublicStaging/Hello.app"));
        assert!(state.dirs.contains("PublicStaging/Hello.app/Frameworks"));
        assert!(
            state
                .dirs
                .contains("PublicStaging/Hello.app/Frameworks/Lib.framework")
        );
        assert_eq!(
            state.files["PublicStaging/Hello.app/HelloApp"].len(),
            CHUNK_SIZE * 2 + 17
        );
        assert_eq!(
            state.files["PublicStaging/Hello.app/Frameworks/Lib.framework/Lib"],
            b"lib"
        );
        assert!(state.open_files.is_empty());
        assert_eq!(*percents.lock().unwrap().last().unwrap(), 100);
    }

    #[tokio::test]
    async fn one_unwritable_file_is_skipped() {
        let dir = bundle();
        let bridge = MockBridge::new();
        bridge
            .state()
            .failing_writes
            .insert("Staging/Base.lproj/Main.strings".into());

        let device = DeviceSession::open(&bridge, None).await.unwrap();
        let lockdown = device.lockdown("ideploy").await.unwrap();
        let service = lockdown
            .start_service(ServiceKind::FileConduit)
            .await
            .unwrap();
        let mut afc = AfcClient::new(&service).await.unwrap();
        let report = afc.push(dir.path(), "Staging").await.unwrap();

        assert_eq!(report.transferred, 3);
        assert_eq!(report.total, 4);
        assert!(!report.is_complete());
        assert!(matches!(
            report.into_result(),
            Err(DeployError::TransferIncomplete {
                transferred: 3,
                total: 4
            })
        ));

        let state = bridge.state();
        assert!(state.files.contains_key("Staging/HelloApp"));
        assert!(state.files.contains_key("Staging/Info.plist"));
        assert!(state.files.contains_key("Staging/Frameworks/Lib.framework/Lib"));
        // the failed descriptor is still closed
        assert!(state.open_files.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_keep_their_literal_target() {
        let dir = bundle();
        std::os::unix::fs::symlink("Lib.framework/Lib", dir.path().join("Frameworks/Current"))
            .unwrap();

        let bridge = MockBridge::new();
        let device = DeviceSession::open(&bridge, None).await.unwrap();
        let lockdown = device.lockdown("ideploy").await.unwrap();
        let service = lockdown
            .start_service(ServiceKind::FileConduit)
            .await
            .unwrap();
        let mut afc = AfcClient::new(&service).await.unwrap();
        let report = afc.push(dir.path(), "Staging").await.unwrap();
        assert_eq!(report, TransferReport { transferred: 5, total: 5 });

        let state = bridge.state();
        assert_eq!(
            state.links["Staging/Frameworks/Current"],
            "Lib.framework/Lib"
        );
        assert!(!state.files.contains_key("Staging/Frameworks/Current"));
    }
}
