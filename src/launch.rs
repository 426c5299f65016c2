//! Background launch worker
//!
//! A launch runs on its own task so the caller can wait for the exit code or interrupt
//! the process from elsewhere.

use std::time::Duration;

use tokio::{io::AsyncWrite, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    DeployError, ReadWrite,
    debug_proxy::{DebugProxyClient, READ_TIMEOUT, REPLY_TIMEOUT},
};

/// What to launch and how long to wait on debugserver
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Executable path on the device followed by the arguments
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub read_timeout: Duration,
    pub reply_timeout: Duration,
    /// Bound on waiting for each event once the process runs, `None` to wait forever
    pub exit_timeout: Option<Duration>,
}

impl LaunchConfig {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            argv: vec![executable.into()],
            env: Vec::new(),
            read_timeout: READ_TIMEOUT,
            reply_timeout: REPLY_TIMEOUT,
            exit_timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Handle to a running launch
///
/// Dropping the handle does not stop the process; call [`LaunchHandle::cancel`] first.
pub struct LaunchHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<Result<i32, DeployError>>,
}

impl LaunchHandle {
    /// Spawns the handshake and event loop on a new task
    ///
    /// # Arguments
    /// * `connection` - Connection to the debugserver port, owned by the worker
    /// * `config` - What to launch
    /// * `output` - Where the process's console output is written
    pub fn spawn<R, W>(connection: R, config: LaunchConfig, mut output: W) -> Self
    where
        R: ReadWrite + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let join_handle = tokio::spawn(async move {
            let mut client = DebugProxyClient::new(connection)
                .with_timeouts(
                    config.read_timeout,
                    config.reply_timeout,
                    config.exit_timeout,
                )
                .with_cancellation(token);
            client.launch(&config.argv, &config.env).await?;
            let code = client.run(&mut output).await;
            debug!("Launch worker finished: {code:?}");
            code
        });

        Self {
            cancel_token,
            join_handle,
        }
    }

    /// Interrupts the launch. The worker kills the remote process before it returns.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// A token that interrupts this launch when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Returns whether the worker is still running
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }

    /// Waits for the process to finish and returns its exit code
    pub async fn wait(self) -> Result<i32, DeployError> {
        match self.join_handle.await {
            Ok(res) => res,
            Err(e) => {
                warn!("Launch worker failed: {e}");
                Err(DeployError::InternalError(e.to_string()))
            }
        }
    }
}
