//! Deploy application bundles onto iOS devices and launch them under debugserver.
//!
//! The crate speaks the protocols that sit on top of a native, handle based device
//! library: it stages a bundle over AFC, drives installation_proxy until the device
//! reports completion, and runs the GDB remote serial protocol against debugserver to
//! start the app and relay its console. The native library itself is abstracted by the
//! [`bridge::DeviceBridge`] trait.

pub mod bridge;
pub mod bundle;
pub mod config;
#[cfg(feature = "deploy")]
pub mod deploy;
#[cfg(feature = "debug_proxy")]
pub mod launch;
pub mod services;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::{DeviceBridge, NativeCode};
pub use bundle::BundleInfo;
pub use config::DeployConfig;
#[cfg(feature = "deploy")]
pub use deploy::{DeployContext, Deployer};
#[cfg(feature = "debug_proxy")]
pub use launch::{LaunchConfig, LaunchHandle};
pub use services::*;
pub use session::{DeviceSession, LockdownSession, ServiceHandle, ServiceKind};

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use plist_macro::pretty_print_plist;

/// A trait combining all required characteristics for a device connection
///
/// Anything that can carry the debugserver byte stream: tokio's `TcpStream`, a
/// `DuplexStream` in tests, or whatever the native layer hands back from a port connect.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Error type for every deployment stage
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum DeployError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -2,
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error) = -3,
    #[error("unexpected response from device")]
    UnexpectedResponse = -4,
    #[error("no devices connected")]
    NoDevices = -5,
    #[error("device {0} not found")]
    DeviceNotFound(String) = -6,
    #[error("lockdown handshake failed with code {0}")]
    HandshakeFailed(i32) = -7,
    #[error("service {service} unavailable (code {code})")]
    ServiceUnavailable { service: &'static str, code: i32 } = -8,
    #[error("device is locked, unlock it and try again")]
    DeviceLocked = -9,
    #[error("native call {operation} failed with code {code}")]
    NativeFailure { operation: &'static str, code: i32 } = -10,

    #[cfg(feature = "afc")]
    #[error("afc error: {0}")]
    Afc(#[from] afc::errors::AfcError) = -11,

    #[cfg(feature = "afc")]
    #[error("transferred {transferred} of {total} files")]
    TransferIncomplete { transferred: usize, total: usize } = -12,

    #[cfg(feature = "installation_proxy")]
    #[error("installation failed: {error}{}", detail(" - ", .description))]
    InstallFailed {
        error: String,
        description: Option<String>,
    } = -13,

    #[cfg(feature = "installation_proxy")]
    #[error("installation did not complete in time")]
    InstallTimeout = -14,

    #[cfg(feature = "installation_proxy")]
    #[error("{0} is not installed on the device")]
    AppNotInstalled(String) = -15,

    #[cfg(feature = "debug_proxy")]
    #[error("unexpected debugserver response: {0}")]
    ProtocolViolation(String) = -16,

    #[cfg(feature = "debug_proxy")]
    #[error("bad packet checksum, expected {expected:02x}, got {actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 } = -17,

    #[cfg(feature = "debug_proxy")]
    #[error("process crashed with signal {signal}{}; check the device logs for details", detail(": ", .description))]
    Crashed {
        signal: u8,
        description: Option<String>,
    } = -18,

    #[error("timed out waiting for the device")]
    Timeout = -19,
    #[error("operation interrupted")]
    Interrupted = -20,
    #[error("connection closed by the device")]
    ConnectionClosed = -21,
    #[error("invalid argument passed")]
    InvalidArgument = -22,
    #[error("internal error")]
    InternalError(String) = -23,
}

#[allow(dead_code)]
fn detail(sep: &str, description: &Option<String>) -> String {
    match description {
        Some(d) => format!("{sep}{d}"),
        None => String::new(),
    }
}

impl DeployError {
    /// Whether the caller may retry the operation, possibly after user interaction
    pub fn is_retryable(&self) -> bool {
        match self {
            DeployError::DeviceLocked | DeployError::Timeout => true,
            #[cfg(feature = "installation_proxy")]
            DeployError::InstallTimeout => true,
            _ => false,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            DeployError::Socket(_) => -1,
            DeployError::Plist(_) => -2,
            DeployError::Utf8(_) => -3,
            DeployError::UnexpectedResponse => -4,
            DeployError::NoDevices => -5,
            DeployError::DeviceNotFound(_) => -6,
            DeployError::HandshakeFailed(_) => -7,
            DeployError::ServiceUnavailable { .. } => -8,
            DeployError::DeviceLocked => -9,
            DeployError::NativeFailure { .. } => -10,

            #[cfg(feature = "afc")]
            DeployError::Afc(_) => -11,
            #[cfg(feature = "afc")]
            DeployError::TransferIncomplete { .. } => -12,

            #[cfg(feature = "installation_proxy")]
            DeployError::InstallFailed { .. } => -13,
            #[cfg(feature = "installation_proxy")]
            DeployError::InstallTimeout => -14,
            #[cfg(feature = "installation_proxy")]
            DeployError::AppNotInstalled(_) => -15,

            #[cfg(feature = "debug_proxy")]
            DeployError::ProtocolViolation(_) => -16,
            #[cfg(feature = "debug_proxy")]
            DeployError::ChecksumMismatch { .. } => -17,
            #[cfg(feature = "debug_proxy")]
            DeployError::Crashed { .. } => -18,

            DeployError::Timeout => -19,
            DeployError::Interrupted => -20,
            DeployError::ConnectionClosed => -21,
            DeployError::InvalidArgument => -22,
            DeployError::InternalError(_) => -23,
        }
    }
}
