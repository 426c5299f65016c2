//! Deployment settings
//!
//! Settings live in a plist so they sit next to the bundle's own `Info.plist`. Every key
//! is optional; missing keys take the defaults below.

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::DeployError;

/// Environment variable that overrides the configured device identifier
pub const UDID_ENV: &str = "IDEPLOY_UDID";

/// Directory inside the AFC jail where bundles are staged for installation
pub const PUBLIC_STAGING: &str = "PublicStaging";

/// Settings for one deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployConfig {
    /// Label presented to lockdownd
    pub label: String,
    /// Device to deploy to, or the first attached device
    pub udid: Option<String>,
    /// Staging directory for pushed bundles
    pub staging_dir: String,
    pub install_timeout: Duration,
    /// Bound on each debugserver handshake reply
    pub reply_timeout: Duration,
    /// Bound on a single debugserver read
    pub read_timeout: Duration,
    /// Bound on each wait for an event from the running process
    pub exit_timeout: Option<Duration>,
    pub launch_args: Vec<String>,
    pub launch_env: BTreeMap<String, String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            label: "ideploy".into(),
            udid: None,
            staging_dir: PUBLIC_STAGING.into(),
            install_timeout: Duration::from_secs(5 * 60),
            reply_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(500),
            exit_timeout: None,
            launch_args: Vec::new(),
            launch_env: BTreeMap::new(),
        }
    }
}

/// On-disk form. Durations are whole seconds except the read timeout, in milliseconds.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase")]
struct RawDeployConfig {
    label: Option<String>,
    #[serde(rename = "UDID", skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
    staging_directory: Option<String>,
    install_timeout: Option<u64>,
    reply_timeout: Option<u64>,
    read_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_timeout: Option<u64>,
    #[serde(default)]
    arguments: Vec<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
}

impl From<RawDeployConfig> for DeployConfig {
    fn from(raw: RawDeployConfig) -> Self {
        let defaults = Self::default();
        Self {
            label: raw.label.unwrap_or(defaults.label),
            udid: raw.udid.filter(|u| !u.is_empty()),
            staging_dir: raw
                .staging_directory
                .map(|s| s.trim_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.staging_dir),
            install_timeout: raw
                .install_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.install_timeout),
            reply_timeout: raw
                .reply_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.reply_timeout),
            read_timeout: raw
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.read_timeout),
            exit_timeout: raw.exit_timeout.map(Duration::from_secs),
            launch_args: raw.arguments,
            launch_env: raw.environment,
        }
    }
}

impl From<&DeployConfig> for RawDeployConfig {
    fn from(c: &DeployConfig) -> Self {
        Self {
            label: Some(c.label.clone()),
            udid: c.udid.clone(),
            staging_directory: Some(c.staging_dir.clone()),
            install_timeout: Some(c.install_timeout.as_secs()),
            reply_timeout: Some(c.reply_timeout.as_secs()),
            read_timeout_ms: Some(c.read_timeout.as_millis() as u64),
            exit_timeout: c.exit_timeout.map(|d| d.as_secs()),
            arguments: c.launch_args.clone(),
            environment: c.launch_env.clone(),
        }
    }
}

impl DeployConfig {
    /// Reads settings from a plist file
    ///
    /// # Arguments
    /// * `path` - Path to the settings plist
    ///
    /// # Errors
    /// Returns `DeployError` if the file can't be read or isn't a settings plist
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses settings from plist bytes, XML or binary
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeployError> {
        match plist::from_bytes::<RawDeployConfig>(bytes) {
            Ok(r) => Ok(r.into()),
            Err(e) => {
                warn!("Unable to parse deploy config: {e:?}");
                Err(e.into())
            }
        }
    }

    /// Serializes the settings as an XML plist
    pub fn serialize(&self) -> Result<Vec<u8>, DeployError> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &RawDeployConfig::from(self))?;
        Ok(buf)
    }

    /// Applies `IDEPLOY_UDID` if it is set
    pub fn with_env_overrides(self) -> Self {
        self.with_udid_override(std::env::var(UDID_ENV).ok())
    }

    fn with_udid_override(mut self, udid: Option<String>) -> Self {
        if let Some(udid) = udid.filter(|u| !u.trim().is_empty()) {
            debug!("Using device {udid} from {UDID_ENV}");
            self.udid = Some(udid.trim().to_string());
        }
        self
    }

    /// Staging path for a local bundle: the staging directory plus the bundle's final
    /// path component
    pub fn staging_path(&self, bundle: &Path) -> Result<String, DeployError> {
        let name = bundle
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(DeployError::InvalidArgument)?;
        Ok(format!("{}/{name}", self.staging_dir))
    }

    /// Launch settings for `executable` using the configured arguments, environment and
    /// timeouts
    #[cfg(feature = "debug_proxy")]
    pub fn launch_config(&self, executable: impl Into<String>) -> crate::launch::LaunchConfig {
        let mut config = crate::launch::LaunchConfig::new(executable).args(self.launch_args.clone());
        config.env = self
            .launch_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        config.read_timeout = self.read_timeout;
        config.reply_timeout = self.reply_timeout;
        config.exit_timeout = self.exit_timeout;
        config
    }
}
