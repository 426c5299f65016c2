//! installation_proxy client
//!
//! Installs staged bundles and browses installed applications. The native layer reports
//! install progress through a callback that may fire on any thread; this module turns
//! that stream of status messages into one awaited result.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
    time::Duration,
};

use plist_macro::{plist, pretty_print_plist};
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    DeployError,
    bridge::{DeviceBridge, StatusCallback},
    session::{ServiceHandle, ServiceKind},
};

/// Longest time an install may take before it is considered failed
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One status message as sent by the device
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase")]
struct RawStatus {
    error: Option<String>,
    error_description: Option<String>,
    status: Option<String>,
    percent_complete: Option<u64>,
}

/// A decoded status message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    Progress {
        status: Option<String>,
        percent: Option<u64>,
    },
    Complete,
    Failed {
        error: String,
        description: Option<String>,
    },
}

impl InstallEvent {
    /// Decodes the `status` value of a callback
    ///
    /// # Errors
    /// Returns `UnexpectedResponse` if the value isn't a dictionary of the expected shape
    pub fn decode(status: plist::Value) -> Result<Self, DeployError> {
        if status.as_dictionary().is_none() {
            return Err(DeployError::UnexpectedResponse);
        }
        let raw: RawStatus = plist::from_value(&status)?;

        if let Some(error) = raw.error {
            return Ok(Self::Failed {
                error,
                description: raw.error_description,
            });
        }
        match raw.status {
            Some(s) if s.eq_ignore_ascii_case("complete") => Ok(Self::Complete),
            status => Ok(Self::Progress {
                status,
                percent: raw.percent_complete,
            }),
        }
    }
}

/// Layers caller supplied options over the defaults
fn merge_options(
    defaults: plist::Value,
    extra: Option<plist::Value>,
) -> Result<plist::Dictionary, DeployError> {
    let mut merged = defaults
        .into_dictionary()
        .ok_or(DeployError::InvalidArgument)?;
    match extra {
        Some(plist::Value::Dictionary(extra)) => {
            for (k, v) in extra {
                merged.insert(k, v);
            }
        }
        Some(_) => return Err(DeployError::InvalidArgument),
        None => {}
    }
    Ok(merged)
}

/// Single-fire completion shared with the native callback
///
/// The first terminal outcome takes the sender; later ones find it gone and are dropped.
struct Completion {
    sender: Mutex<Option<oneshot::Sender<Result<(), DeployError>>>>,
}

impl Completion {
    fn new() -> (Arc<Self>, oneshot::Receiver<Result<(), DeployError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Returns false if a terminal outcome was already delivered
    fn fire(&self, outcome: Result<(), DeployError>) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut s) => s.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                // the receiver may have timed out already
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Client for the installation_proxy service
///
/// The native client is freed when this value drops, on success and failure alike.
pub struct InstallationProxyClient<'a, B: DeviceBridge> {
    bridge: &'a B,
    handle: Option<B::InstProxy>,
    timeout: Duration,
}

impl<'a, B: DeviceBridge> InstallationProxyClient<'a, B> {
    /// Creates a client on top of a started `install-proxy` service
    pub async fn new(service: &'a ServiceHandle<'a, B>) -> Result<Self, DeployError> {
        if service.kind() != ServiceKind::InstallProxy {
            return Err(DeployError::InvalidArgument);
        }
        let bridge = service.bridge();
        let handle = bridge
            .instproxy_client_new(service.device(), service.raw()?)
            .await
            .map_err(|e| DeployError::native("instproxy_client_new", e))?;
        Ok(Self {
            bridge,
            handle: Some(handle),
            timeout: INSTALL_TIMEOUT,
        })
    }

    /// Overrides how long an upgrade may run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn handle(&self) -> Result<&B::InstProxy, DeployError> {
        self.handle.as_ref().ok_or(DeployError::InvalidArgument)
    }

    /// Installs or upgrades the bundle staged at `package_path`
    ///
    /// # Arguments
    /// * `package_path` - Path inside the AFC jail, e.g. `PublicStaging/Hello.app`
    /// * `options` - Extra ClientOptions merged over `PackageType = Developer`
    pub async fn upgrade(
        &mut self,
        package_path: &str,
        options: Option<plist::Value>,
    ) -> Result<(), DeployError> {
        self.upgrade_with_callback(package_path, options, |_| {}, ())
            .await
    }

    /// Installs or upgrades the bundle staged at `package_path`
    ///
    /// # Arguments
    /// * `package_path` - Path inside the AFC jail
    /// * `options` - Extra ClientOptions merged over `PackageType = Developer`
    /// * `callback` - Receives `(percent_complete, state)` for each progress message. It
    ///   runs on whatever thread the native layer delivers status on.
    /// * `state` - State to pass to the callback
    ///
    /// # Errors
    /// * `InstallFailed` with the device's `Error`/`ErrorDescription`
    /// * `InstallTimeout` if nothing terminal arrives within the timeout
    /// * native failures submitting the request
    pub async fn upgrade_with_callback<S>(
        &mut self,
        package_path: &str,
        options: Option<plist::Value>,
        callback: impl Fn((u64, S)) + Send + Sync + 'static,
        state: S,
    ) -> Result<(), DeployError>
    where
        S: Clone + Send + Sync + 'static,
    {
        let options = merge_options(plist!({"PackageType": "Developer"}), options)?;

        let (completion, rx) = Completion::new();
        let cb_completion = completion.clone();
        let status_callback: StatusCallback = Arc::new(move |command, status| {
            let handled = catch_unwind(AssertUnwindSafe(|| {
                debug!(
                    "instproxy {}: {}",
                    command.as_string().unwrap_or("?"),
                    pretty_print_plist(&status)
                );
                match InstallEvent::decode(status) {
                    Ok(InstallEvent::Progress { status, percent }) => {
                        if let Some(p) = percent {
                            info!("{}: {p}%", status.as_deref().unwrap_or("Installing"));
                            callback((p, state.clone()));
                        }
                        None
                    }
                    Ok(InstallEvent::Complete) => Some(Ok(())),
                    Ok(InstallEvent::Failed { error, description }) => {
                        Some(Err(DeployError::InstallFailed { error, description }))
                    }
                    Err(e) => Some(Err(DeployError::InstallFailed {
                        error: "MalformedStatus".into(),
                        description: Some(e.to_string()),
                    })),
                }
            }));

            let outcome = match handled {
                Ok(Some(outcome)) => outcome,
                Ok(None) => return,
                Err(_) => Err(DeployError::InstallFailed {
                    error: "CallbackPanicked".into(),
                    description: None,
                }),
            };
            if !cb_completion.fire(outcome) {
                debug!("Ignoring status after completion");
            }
        });

        info!("Installing {package_path}");
        self.bridge
            .instproxy_upgrade(self.handle()?, package_path, options, status_callback)
            .await
            .map_err(|e| DeployError::native("instproxy_upgrade", e))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(DeployError::InternalError(
                "install callback dropped".into(),
            )),
            Err(_) => {
                warn!("Install of {package_path} timed out");
                // late callbacks must not find a live sender
                completion.fire(Err(DeployError::InstallTimeout));
                Err(DeployError::InstallTimeout)
            }
        }
    }

    /// Browses installed user applications
    pub async fn browse(
        &mut self,
        options: Option<plist::Value>,
    ) -> Result<Vec<plist::Value>, DeployError> {
        let options = merge_options(plist!({"ApplicationType": "User"}), options)?;
        self.bridge
            .instproxy_browse(self.handle()?, options)
            .await
            .map_err(|e| DeployError::native("instproxy_browse", e))
    }

    /// Resolves the on-device executable path of an installed application
    ///
    /// # Errors
    /// `AppNotInstalled` if no installed app has the bundle identifier
    pub async fn lookup_executable(&mut self, bundle_id: &str) -> Result<String, DeployError> {
        let apps = self
            .browse(Some(plist!({
                "ReturnAttributes": ["CFBundleIdentifier", "CFBundleExecutable", "Path"]
            })))
            .await?;

        for app in apps {
            let Some(app) = app.as_dictionary() else {
                warn!("browse returned a non-dictionary entry");
                continue;
            };
            if app.get("CFBundleIdentifier").and_then(|x| x.as_string()) != Some(bundle_id) {
                continue;
            }
            let path = app.get("Path").and_then(|x| x.as_string());
            let executable = app.get("CFBundleExecutable").and_then(|x| x.as_string());
            return match (path, executable) {
                (Some(p), Some(e)) => Ok(format!("{}/{e}", p.trim_end_matches('/'))),
                _ => Err(DeployError::UnexpectedResponse),
            };
        }
        Err(DeployError::AppNotInstalled(bundle_id.to_string()))
    }
}

impl<B: DeviceBridge> Drop for InstallationProxyClient<'_, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.bridge.instproxy_client_free(handle);
        }
    }
}
