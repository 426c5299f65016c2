//! Native handle layer contract
//!
//! The device communication library (usbmuxd transport, lockdown pairing, the AFC and
//! installation_proxy wire formats) is an external collaborator. It hands out opaque
//! handles and reports failures as integer result codes. This module describes that
//! surface as a trait so the protocol engines in this crate can be driven by any
//! implementation: a binding to the C library, a pure Rust stack, or a test double.
//!
//! Every `*_free` call is synchronous and infallible so that release can happen from
//! `Drop` on every exit path.

use std::{fmt, future::Future, sync::Arc};

use crate::ReadWrite;

/// Lockdown reports this code when the device is passcode protected and locked
pub const LOCKDOWN_E_PASSWORD_PROTECTED: i32 = -17;

/// A raw, non-zero result code returned by the native layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeCode(pub i32);

impl NativeCode {
    pub fn is_device_locked(&self) -> bool {
        self.0 == LOCKDOWN_E_PASSWORD_PROTECTED
    }
}

impl fmt::Display for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Open modes understood by the AFC file-open primitive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcFopenMode {
    RdOnly = 0x00000001,   // r   O_RDONLY
    Rw = 0x00000002,       // r+  O_RDWR   | O_CREAT
    WrOnly = 0x00000003,   // w   O_WRONLY | O_CREAT  | O_TRUNC
    Wr = 0x00000004,       // w+  O_RDWR   | O_CREAT  | O_TRUNC
    Append = 0x00000005,   // a   O_WRONLY | O_APPEND | O_CREAT
    RdAppend = 0x00000006, // a+  O_RDWR   | O_APPEND | O_CREAT
}

/// Link kinds for the AFC make-link primitive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum LinkType {
    Hardlink = 0x00000001,
    Symlink = 0x00000002,
}

/// Status callback registered with an install-proxy operation
///
/// Receives the `command` and `status` plist values for every status message the device
/// sends. The native layer may invoke it from any thread, any number of times.
pub type StatusCallback = Arc<dyn Fn(plist::Value, plist::Value) + Send + Sync>;

/// Capability surface of the native device library
///
/// Handles are associated types so an implementation can use whatever it owns
/// internally (raw pointers, ids, structs). The crate never clones a handle; it borrows
/// it for calls and moves it back into the matching `*_free` exactly once.
pub trait DeviceBridge: Send + Sync + fmt::Debug {
    type Device: Send + Sync;
    type Lockdown: Send + Sync;
    type Service: Send + Sync;
    type Afc: Send + Sync;
    type InstProxy: Send + Sync;
    /// A byte stream to a device port. It must not borrow the device handle, since it
    /// outlives the session that opened it.
    type Connection: ReadWrite + 'static;

    /// Lists the identifiers of every attached device
    fn device_list(&self) -> impl Future<Output = Result<Vec<String>, NativeCode>> + Send;

    fn device_new(&self, udid: &str)
    -> impl Future<Output = Result<Self::Device, NativeCode>> + Send;

    fn device_free(&self, device: Self::Device);

    /// Opens a raw connection to `port` on the device
    fn device_connect(
        &self,
        device: &Self::Device,
        port: u16,
    ) -> impl Future<Output = Result<Self::Connection, NativeCode>> + Send;

    /// Connects to lockdownd and performs the pairing handshake under `label`
    fn lockdown_handshake(
        &self,
        device: &Self::Device,
        label: &str,
    ) -> impl Future<Output = Result<Self::Lockdown, NativeCode>> + Send;

    fn lockdown_free(&self, lockdown: Self::Lockdown);

    /// Asks lockdownd to start the service with the given identifier
    fn lockdown_start_service(
        &self,
        lockdown: &Self::Lockdown,
        name: &str,
    ) -> impl Future<Output = Result<Self::Service, NativeCode>> + Send;

    /// Port the device assigned to a started service
    fn service_port(&self, service: &Self::Service) -> u16;

    fn service_free(&self, service: Self::Service);

    fn afc_client_new(
        &self,
        device: &Self::Device,
        service: &Self::Service,
    ) -> impl Future<Output = Result<Self::Afc, NativeCode>> + Send;

    fn afc_client_free(&self, afc: Self::Afc);

    fn afc_make_directory(
        &self,
        afc: &Self::Afc,
        path: &str,
    ) -> impl Future<Output = Result<(), NativeCode>> + Send;

    fn afc_make_link(
        &self,
        afc: &Self::Afc,
        link_type: LinkType,
        target: &str,
        link_name: &str,
    ) -> impl Future<Output = Result<(), NativeCode>> + Send;

    /// Opens a remote file, returning its descriptor
    fn afc_file_open(
        &self,
        afc: &Self::Afc,
        path: &str,
        mode: AfcFopenMode,
    ) -> impl Future<Output = Result<u64, NativeCode>> + Send;

    /// Writes `data` to an open descriptor, returning how many bytes were accepted
    fn afc_file_write(
        &self,
        afc: &Self::Afc,
        fd: u64,
        data: &[u8],
    ) -> impl Future<Output = Result<usize, NativeCode>> + Send;

    fn afc_file_close(
        &self,
        afc: &Self::Afc,
        fd: u64,
    ) -> impl Future<Output = Result<(), NativeCode>> + Send;

    fn instproxy_client_new(
        &self,
        device: &Self::Device,
        service: &Self::Service,
    ) -> impl Future<Output = Result<Self::InstProxy, NativeCode>> + Send;

    fn instproxy_client_free(&self, client: Self::InstProxy);

    /// Lists installed applications matching `options`
    fn instproxy_browse(
        &self,
        client: &Self::InstProxy,
        options: plist::Dictionary,
    ) -> impl Future<Output = Result<Vec<plist::Value>, NativeCode>> + Send;

    /// Submits an upgrade request and returns once it is accepted
    ///
    /// Progress and completion arrive later through `callback`.
    fn instproxy_upgrade(
        &self,
        client: &Self::InstProxy,
        package_path: &str,
        options: plist::Dictionary,
        callback: StatusCallback,
    ) -> impl Future<Output = Result<(), NativeCode>> + Send;
}
