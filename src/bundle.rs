//! Metadata of a local `.app` bundle

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::DeployError;

/// Identity of an application bundle, read from its `Info.plist`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleInfo {
    pub path: PathBuf,
    pub identifier: String,
    pub executable: String,
    pub version: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawInfoPlist {
    #[serde(rename = "CFBundleIdentifier")]
    identifier: String,
    #[serde(rename = "CFBundleExecutable")]
    executable: String,
    #[serde(rename = "CFBundleShortVersionString")]
    version: Option<String>,
}

impl BundleInfo {
    /// Reads `Info.plist` from a bundle directory
    ///
    /// # Arguments
    /// * `bundle_dir` - Path to the `.app` directory
    ///
    /// # Errors
    /// * `InvalidArgument` if the path isn't a directory
    /// * `UnexpectedResponse` if `Info.plist` lacks the bundle identifier or executable
    pub fn read(bundle_dir: impl AsRef<Path>) -> Result<Self, DeployError> {
        let bundle_dir = bundle_dir.as_ref();
        if !bundle_dir.is_dir() {
            warn!("{} is not a bundle directory", bundle_dir.display());
            return Err(DeployError::InvalidArgument);
        }
        let bytes = std::fs::read(bundle_dir.join("Info.plist"))?;
        let raw = match plist::from_bytes::<RawInfoPlist>(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to read Info.plist of {}: {e:?}", bundle_dir.display());
                return Err(DeployError::UnexpectedResponse);
            }
        };

        Ok(Self {
            path: bundle_dir.to_path_buf(),
            identifier: raw.identifier,
            executable: raw.executable,
            version: raw.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_info(dir: &Path, body: &str) {
        let plist = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
{body}
</dict>
</plist>"#
        );
        std::fs::write(dir.join("Info.plist"), plist).unwrap();
    }

    #[test]
    fn reads_identity() {
        let dir = tempfile::tempdir().unwrap();
        write_info(
            dir.path(),
            "<key>CFBundleIdentifier</key><string>com.example.hello</string>
             <key>CFBundleExecutable</key><string>Hello</string>
             <key>CFBundleShortVersionString</key><string>1.2</string>
             <key>UIRequiredDeviceCapabilities</key><array><string>arm64</string></array>",
        );
        let info = BundleInfo::read(dir.path()).unwrap();
        assert_eq!(info.identifier, "com.example.hello");
        assert_eq!(info.executable, "Hello");
        assert_eq!(info.version.as_deref(), Some("1.2"));
    }

    #[test]
    fn missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        write_info(
            dir.path(),
            "<key>CFBundleIdentifier</key><string>com.example.hello</string>",
        );
        assert!(matches!(
            BundleInfo::read(dir.path()),
            Err(DeployError::UnexpectedResponse)
        ));
    }

    #[test]
    fn not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            BundleInfo::read(dir.path().join("Missing.app")),
            Err(DeployError::InvalidArgument)
        ));
        assert!(matches!(
            BundleInfo::read(dir.path()),
            Err(DeployError::Socket(_))
        ));
    }
}
