//! End-to-end deployment: stage, install, launch
//!
//! Each step opens its own device session and releases every handle before returning.
//! Only the launch worker outlives its step, and it owns nothing but its connection.

use std::path::Path;

use plist_macro::plist;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use crate::{
    DeployConfig, DeployError, DeviceBridge, DeviceSession, ServiceKind,
    afc::{AfcClient, TransferReport},
    bundle::BundleInfo,
    installation_proxy::InstallationProxyClient,
    launch::LaunchHandle,
};

/// What an install produced, needed to launch the app later
#[derive(Clone, Debug)]
pub struct DeployContext {
    /// Device the bundle was installed on
    pub udid: String,
    pub bundle: BundleInfo,
    /// Where the bundle was staged inside the AFC jail
    pub staging_path: String,
    pub transfer: TransferReport,
}

/// Deploys bundles through one device bridge with fixed settings
pub struct Deployer<'b, B: DeviceBridge> {
    bridge: &'b B,
    config: DeployConfig,
}

impl<'b, B: DeviceBridge> Deployer<'b, B> {
    pub fn new(bridge: &'b B, config: DeployConfig) -> Self {
        Self { bridge, config }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Pushes a bundle to the staging area and installs it
    ///
    /// # Arguments
    /// * `bundle_dir` - The local `.app` directory
    ///
    /// # Errors
    /// * `TransferIncomplete` if any file failed to reach the device; nothing is
    ///   installed in that case
    /// * `DeviceLocked` if the device is locked at any step
    /// * install failures reported by the device
    pub async fn install(&self, bundle_dir: impl AsRef<Path>) -> Result<DeployContext, DeployError> {
        let bundle = BundleInfo::read(bundle_dir)?;
        let staging_path = self.config.staging_path(&bundle.path)?;

        let device = DeviceSession::open(self.bridge, self.config.udid.as_deref()).await?;
        let lockdown = device.lockdown(&self.config.label).await?;

        let transfer = {
            let service = lockdown.start_service(ServiceKind::FileConduit).await?;
            let mut afc = AfcClient::new(&service).await?;
            afc.mk_dir(&self.config.staging_dir).await?;
            afc.push(&bundle.path, &staging_path).await?
        };
        transfer.into_result()?;

        {
            let service = lockdown.start_service(ServiceKind::InstallProxy).await?;
            let mut instproxy = InstallationProxyClient::new(&service)
                .await?
                .with_timeout(self.config.install_timeout);
            instproxy
                .upgrade_with_callback(
                    &staging_path,
                    Some(plist!({"CFBundleIdentifier": bundle.identifier.clone()})),
                    |(percent, identifier): (u64, String)| {
                        debug!("Installing {identifier}: {percent}%")
                    },
                    bundle.identifier.clone(),
                )
                .await?;
        }
        info!("Installed {} on {}", bundle.identifier, device.udid());

        Ok(DeployContext {
            udid: device.udid().to_string(),
            bundle,
            staging_path,
            transfer,
        })
    }

    /// Starts an installed app under debugserver
    ///
    /// # Arguments
    /// * `ctx` - Result of a previous [`install`](Self::install)
    /// * `output` - Where the app's console output goes
    ///
    /// # Returns
    /// A handle to wait on or cancel the running app
    ///
    /// # Errors
    /// * `AppNotInstalled` if the bundle identifier isn't installed
    /// * `DeviceLocked` if the device is locked when starting debugserver
    pub async fn launch<W>(&self, ctx: &DeployContext, output: W) -> Result<LaunchHandle, DeployError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let device = DeviceSession::open(self.bridge, Some(ctx.udid.as_str())).await?;
        let lockdown = device.lockdown(&self.config.label).await?;

        let executable = {
            let service = lockdown.start_service(ServiceKind::InstallProxy).await?;
            let mut instproxy = InstallationProxyClient::new(&service).await?;
            instproxy.lookup_executable(&ctx.bundle.identifier).await?
        };
        debug!("Resolved {} to {executable}", ctx.bundle.identifier);

        let connection = {
            let service = lockdown.start_service(ServiceKind::DebugServer).await?;
            device.connect(service.port()?).await?
        };

        Ok(LaunchHandle::spawn(
            connection,
            self.config.launch_config(executable),
            output,
        ))
    }

    /// Starts an installed app and relays its console to this process's stdout
    pub async fn launch_to_stdout(&self, ctx: &DeployContext) -> Result<LaunchHandle, DeployError> {
        self.launch(ctx, tokio::io::stdout()).await
    }

    /// Installs a bundle and launches it
    pub async fn install_and_launch<W>(
        &self,
        bundle_dir: impl AsRef<Path>,
        output: W,
    ) -> Result<(DeployContext, LaunchHandle), DeployError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = self.install(bundle_dir).await?;
        let handle = self.launch(&ctx, output).await?;
        Ok((ctx, handle))
    }
}
