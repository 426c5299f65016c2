//! Device, lockdown and service handle ownership
//!
//! Each native handle is wrapped in a guard that frees it exactly once, either when the
//! owner calls `close` or on drop. Services borrow the lockdown session that started
//! them, so a session cannot be closed while one of its services is still alive.

use std::fmt;

use tracing::{debug, warn};

use crate::{
    DeployError,
    bridge::{DeviceBridge, NativeCode},
};

/// Services this crate starts through lockdown
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Apple File Conduit, used to stage bundles
    FileConduit,
    /// installation_proxy, installs and browses applications
    InstallProxy,
    /// debugserver, launches processes under the GDB remote protocol
    DebugServer,
}

impl ServiceKind {
    /// Service identifier as registered with lockdownd
    pub fn service_name(&self) -> &'static str {
        match self {
            ServiceKind::FileConduit => "com.apple.afc",
            ServiceKind::InstallProxy => "com.apple.mobile.installation_proxy",
            ServiceKind::DebugServer => "com.apple.debugserver",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceKind::FileConduit => "file-conduit",
            ServiceKind::InstallProxy => "install-proxy",
            ServiceKind::DebugServer => "debug-server",
        };
        write!(f, "{name}")
    }
}

impl DeployError {
    fn from_handshake_code(code: NativeCode) -> Self {
        if code.is_device_locked() {
            DeployError::DeviceLocked
        } else {
            DeployError::HandshakeFailed(code.0)
        }
    }

    fn from_service_code(kind: ServiceKind, code: NativeCode) -> Self {
        if code.is_device_locked() {
            DeployError::DeviceLocked
        } else {
            DeployError::ServiceUnavailable {
                service: kind.service_name(),
                code: code.0,
            }
        }
    }

    pub(crate) fn native(operation: &'static str, code: NativeCode) -> Self {
        if code.is_device_locked() {
            DeployError::DeviceLocked
        } else {
            DeployError::NativeFailure {
                operation,
                code: code.0,
            }
        }
    }
}

/// An opened device, owned for the duration of one operation
pub struct DeviceSession<'b, B: DeviceBridge> {
    bridge: &'b B,
    device: Option<B::Device>,
    udid: String,
}

impl<'b, B: DeviceBridge> DeviceSession<'b, B> {
    /// Opens a device by identifier, or the first attached device when `udid` is `None`
    ///
    /// # Errors
    /// * `NoDevices` if nothing is attached and no identifier was given
    /// * `DeviceNotFound` if the native layer cannot open the device
    pub async fn open(bridge: &'b B, udid: Option<&str>) -> Result<Self, DeployError> {
        let udid = match udid {
            Some(u) => u.to_string(),
            None => {
                let devices = bridge
                    .device_list()
                    .await
                    .map_err(|e| DeployError::native("device_list", e))?;
                devices.into_iter().next().ok_or(DeployError::NoDevices)?
            }
        };

        let device = match bridge.device_new(&udid).await {
            Ok(d) => d,
            Err(e) => {
                warn!("Unable to open device {udid}: {e}");
                return Err(DeployError::DeviceNotFound(udid));
            }
        };
        debug!("Opened device {udid}");

        Ok(Self {
            bridge,
            device: Some(device),
            udid,
        })
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn bridge(&self) -> &'b B {
        self.bridge
    }

    fn device(&self) -> Result<&B::Device, DeployError> {
        self.device.as_ref().ok_or(DeployError::InvalidArgument)
    }

    /// Performs the lockdown handshake and returns the session guard
    ///
    /// # Errors
    /// `DeviceLocked` for the passcode-protected result code, `HandshakeFailed` otherwise
    pub async fn lockdown(&self, label: &str) -> Result<LockdownSession<'_, B>, DeployError> {
        let device = self.device()?;
        let handle = self
            .bridge
            .lockdown_handshake(device, label)
            .await
            .map_err(DeployError::from_handshake_code)?;
        debug!("Lockdown session opened as {label}");

        Ok(LockdownSession {
            bridge: self.bridge,
            device,
            handle: Some(handle),
            label: label.to_string(),
        })
    }

    /// Opens a raw connection to a device port
    pub async fn connect(&self, port: u16) -> Result<B::Connection, DeployError> {
        self.bridge
            .device_connect(self.device()?, port)
            .await
            .map_err(|e| DeployError::native("device_connect", e))
    }
}

impl<B: DeviceBridge> Drop for DeviceSession<'_, B> {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            self.bridge.device_free(device);
        }
    }
}

/// A live lockdown session
pub struct LockdownSession<'d, B: DeviceBridge> {
    bridge: &'d B,
    device: &'d B::Device,
    handle: Option<B::Lockdown>,
    label: String,
}

impl<B: DeviceBridge> LockdownSession<'_, B> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Starts a named service
    ///
    /// # Errors
    /// * `DeviceLocked` if the device refuses because it is locked
    /// * `ServiceUnavailable` for any other result code
    /// * `InvalidArgument` if the session has already been closed
    pub async fn start_service(
        &self,
        kind: ServiceKind,
    ) -> Result<ServiceHandle<'_, B>, DeployError> {
        let lockdown = self.handle.as_ref().ok_or(DeployError::InvalidArgument)?;
        let handle = self
            .bridge
            .lockdown_start_service(lockdown, kind.service_name())
            .await
            .map_err(|e| DeployError::from_service_code(kind, e))?;
        let port = self.bridge.service_port(&handle);
        debug!("Started {kind} on port {port}");

        Ok(ServiceHandle {
            bridge: self.bridge,
            device: self.device,
            handle: Some(handle),
            kind,
        })
    }

    /// Releases the session. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Closing lockdown session {}", self.label);
            self.bridge.lockdown_free(handle);
        }
    }
}

impl<B: DeviceBridge> Drop for LockdownSession<'_, B> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A started service, bound to the session that started it
pub struct ServiceHandle<'s, B: DeviceBridge> {
    bridge: &'s B,
    device: &'s B::Device,
    handle: Option<B::Service>,
    kind: ServiceKind,
}

impl<'s, B: DeviceBridge> ServiceHandle<'s, B> {
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn bridge(&self) -> &'s B {
        self.bridge
    }

    pub fn device(&self) -> &'s B::Device {
        self.device
    }

    pub(crate) fn raw(&self) -> Result<&B::Service, DeployError> {
        self.handle.as_ref().ok_or(DeployError::InvalidArgument)
    }

    /// Port the device assigned to this service
    pub fn port(&self) -> Result<u16, DeployError> {
        Ok(self.bridge.service_port(self.raw()?))
    }

    /// Frees the service. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Freeing {} service", self.kind);
            self.bridge.service_free(handle);
        }
    }
}

impl<B: DeviceBridge> Drop for ServiceHandle<'_, B> {
    fn drop(&mut self) {
        self.close();
    }
}
