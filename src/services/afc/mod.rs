//! AFC (Apple File Conduit) client used to stage bundles on the device
//!
//! Wraps the native AFC handle created from a `file-conduit` service and exposes the
//! handful of primitives the push engine needs.

use errors::AfcError;
use tracing::debug;

use crate::{
    DeployError,
    bridge::{AfcFopenMode, DeviceBridge, LinkType},
    session::{ServiceHandle, ServiceKind},
};

pub mod errors;
pub mod push;

pub use push::TransferReport;

/// Client for the AFC service of one device
///
/// The native client is freed when this value drops.
pub struct AfcClient<'a, B: DeviceBridge> {
    bridge: &'a B,
    handle: Option<B::Afc>,
}

/// An open remote file
///
/// Call [`AfcClient::close`] with it when done; the descriptor is not closed on drop.
#[derive(Debug)]
pub struct FileDescriptor {
    fd: u64,
    path: String,
}

impl FileDescriptor {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<'a, B: DeviceBridge> AfcClient<'a, B> {
    /// Creates an AFC client on top of a started `file-conduit` service
    ///
    /// # Errors
    /// `InvalidArgument` if the service is not the file conduit, or the native result
    /// code mapped into `DeployError`
    pub async fn new(service: &'a ServiceHandle<'a, B>) -> Result<Self, DeployError> {
        if service.kind() != ServiceKind::FileConduit {
            return Err(DeployError::InvalidArgument);
        }
        let bridge = service.bridge();
        let handle = bridge
            .afc_client_new(service.device(), service.raw()?)
            .await
            .map_err(|e| DeployError::native("afc_client_new", e))?;
        Ok(Self {
            bridge,
            handle: Some(handle),
        })
    }

    fn handle(&self) -> Result<&B::Afc, DeployError> {
        self.handle.as_ref().ok_or(DeployError::InvalidArgument)
    }

    /// Creates a directory. An already existing directory is not an error.
    pub async fn mk_dir(&mut self, path: &str) -> Result<(), DeployError> {
        match self.bridge.afc_make_directory(self.handle()?, path).await {
            Ok(()) => Ok(()),
            Err(e) => match AfcError::from(e) {
                AfcError::ObjectExists => Ok(()),
                e => Err(e.into()),
            },
        }
    }

    /// Creates a symbolic link at `link_name` whose target is `target`, verbatim
    pub async fn symlink(&mut self, target: &str, link_name: &str) -> Result<(), DeployError> {
        self.bridge
            .afc_make_link(self.handle()?, LinkType::Symlink, target, link_name)
            .await
            .map_err(|e| AfcError::from(e).into())
    }

    /// Opens a remote file
    pub async fn open(
        &mut self,
        path: impl Into<String>,
        mode: AfcFopenMode,
    ) -> Result<FileDescriptor, DeployError> {
        let path = path.into();
        let fd = self
            .bridge
            .afc_file_open(self.handle()?, &path, mode)
            .await
            .map_err(AfcError::from)?;
        debug!("Opened {path} as fd {fd}");
        Ok(FileDescriptor { fd, path })
    }

    /// Writes the whole buffer, looping over short writes
    pub async fn write_all(
        &mut self,
        file: &FileDescriptor,
        mut data: &[u8],
    ) -> Result<(), DeployError> {
        while !data.is_empty() {
            let written = self
                .bridge
                .afc_file_write(self.handle()?, file.fd, data)
                .await
                .map_err(AfcError::from)?;
            if written == 0 {
                return Err(AfcError::WriteError.into());
            }
            data = &data[written.min(data.len())..];
        }
        Ok(())
    }

    pub async fn close(&mut self, file: FileDescriptor) -> Result<(), DeployError> {
        self.bridge
            .afc_file_close(self.handle()?, file.fd)
            .await
            .map_err(|e| AfcError::from(e).into())
    }
}

impl<B: DeviceBridge> Drop for AfcClient<'_, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.bridge.afc_client_free(handle);
        }
    }
}
