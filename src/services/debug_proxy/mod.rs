//! GDB Remote Debugging Protocol client for debugserver
//!
//! Launches an installed application through the device's debugserver, relays its
//! console output and watches for exit, signal stops and crashes. Packet format is
//! documented at:
//! https://sourceware.org/gdb/current/onlinedocs/gdb.html/Packets.html#Packets

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DeployError, ReadWrite};

pub mod packet;
pub mod reply;

use packet::{FrameBuffer, Incoming, encode_argv, encode_frame, hex_encode};
use reply::{StopReply, continue_packet};

/// Default bound on a single socket read
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Default bound on waiting for a handshake reply
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte debugserver treats as an interrupt request
const INTERRUPT: u8 = 0x03;

/// Client for a debugserver connection
///
/// Owns the connection for the whole launch. Reads go through an internal buffer so
/// frames split across reads are reassembled. Until no-ack mode is negotiated, a `-`
/// from debugserver resends the last packet and a corrupted frame is answered with `-`.
pub struct DebugProxyClient<R: ReadWrite> {
    /// The underlying connection to debugserver
    pub socket: R,
    buffer: FrameBuffer,
    ack_mode: bool,
    last_sent: Vec<u8>,
    read_timeout: Duration,
    reply_timeout: Duration,
    exit_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<R: ReadWrite> DebugProxyClient<R> {
    /// Creates a client with the default timeouts and no cancellation
    ///
    /// # Arguments
    /// * `socket` - Established connection to the debugserver port
    pub fn new(socket: R) -> Self {
        Self {
            socket,
            buffer: FrameBuffer::new(),
            ack_mode: true,
            last_sent: Vec::new(),
            read_timeout: READ_TIMEOUT,
            reply_timeout: REPLY_TIMEOUT,
            exit_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the per-read bound, the handshake reply bound and the optional bound on
    /// waiting for the next event once the process runs
    pub fn with_timeouts(
        mut self,
        read: Duration,
        reply: Duration,
        exit: Option<Duration>,
    ) -> Self {
        self.read_timeout = read;
        self.reply_timeout = reply;
        self.exit_timeout = exit;
        self
    }

    /// Uses `token` to interrupt reads
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Consumes the client and returns the underlying socket
    pub fn into_inner(self) -> R {
        self.socket
    }

    /// Frames and sends one packet
    pub async fn send_packet(&mut self, payload: &str) -> Result<(), DeployError> {
        debug!("Sending packet: {payload}");
        let frame = encode_frame(payload);
        self.send_raw(&frame).await?;
        self.last_sent = frame;
        Ok(())
    }

    async fn resend(&mut self) -> Result<(), DeployError> {
        if self.last_sent.is_empty() {
            return Ok(());
        }
        debug!(
            "Resending packet: {}",
            String::from_utf8_lossy(&self.last_sent)
        );
        let frame = std::mem::take(&mut self.last_sent);
        let res = self.send_raw(&frame).await;
        self.last_sent = frame;
        res
    }

    /// Sends an acknowledgment (+)
    pub async fn send_ack(&mut self) -> Result<(), DeployError> {
        self.send_raw(b"+").await
    }

    /// Sends raw bytes directly to the connection
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), DeployError> {
        self.socket.write_all(bytes).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Waits for the next complete frame and returns its payload
    ///
    /// # Arguments
    /// * `deadline` - How long to wait for a complete frame, `None` to wait forever
    ///
    /// # Errors
    /// * `Timeout` if no frame completes before the deadline
    /// * `Interrupted` if cancelled; the remote process is killed first
    /// * `ConnectionClosed` on end of stream
    /// * `ChecksumMismatch` for a corrupted frame once no-ack mode is on
    pub async fn read_frame(&mut self, deadline: Option<Duration>) -> Result<String, DeployError> {
        let started = Instant::now();
        let cancel = self.cancel.clone();
        let mut chunk = [0u8; 4096];

        loop {
            match self.buffer.next_packet() {
                Ok(Some(Incoming::Frame(frame))) => {
                    debug!("Received packet: {frame}");
                    return Ok(frame);
                }
                Ok(Some(Incoming::Ack)) => continue,
                Ok(Some(Incoming::Nak)) => {
                    if self.ack_mode {
                        self.resend().await?;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e @ DeployError::ChecksumMismatch { .. }) if self.ack_mode => {
                    warn!("Asking for a resend: {e}");
                    self.send_raw(b"-").await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
            if cancel.is_cancelled() {
                return Err(self.interrupted().await);
            }
            if deadline.is_some_and(|d| started.elapsed() >= d) {
                return Err(DeployError::Timeout);
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(self.read_timeout, self.socket.read(&mut chunk)) => Some(r),
            };
            match read {
                None => return Err(self.interrupted().await),
                // read timed out, go around to check the deadline
                Some(Err(_)) => continue,
                Some(Ok(Ok(0))) => return Err(DeployError::ConnectionClosed),
                Some(Ok(Ok(n))) => self.buffer.extend(&chunk[..n]),
                Some(Ok(Err(e))) => return Err(e.into()),
            }
        }
    }

    async fn interrupted(&mut self) -> DeployError {
        info!("Launch interrupted, killing the remote process");
        self.kill().await;
        DeployError::Interrupted
    }

    /// Sends a packet and requires an `OK` reply
    ///
    /// # Errors
    /// `DeviceLocked` for an `Elocked` reply, `ProtocolViolation` for any other reply
    pub async fn send_expect_ok(&mut self, payload: &str) -> Result<(), DeployError> {
        self.send_packet(payload).await?;
        let reply = self.read_frame(Some(self.reply_timeout)).await?;
        check_ok(payload, &reply)
    }

    /// Runs the launch handshake and starts the process
    ///
    /// # Arguments
    /// * `argv` - Executable path on the device followed by its arguments
    /// * `env` - Environment variables for the process
    ///
    /// # Errors
    /// `DeviceLocked` if debugserver refuses because the device is locked, otherwise
    /// the first failing step's error
    pub async fn launch(
        &mut self,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<(), DeployError> {
        let argv_packet = encode_argv(argv)?;

        self.send_ack().await?;
        self.send_expect_ok("QStartNoAckMode").await?;
        self.send_ack().await?;
        self.ack_mode = false;

        self.send_expect_ok("QEnvironment:NSUnbufferedIO=YES").await?;
        for (key, value) in env {
            let pair = format!("{key}={value}");
            self.send_expect_ok(&format!(
                "QEnvironmentHexEncoded:{}",
                hex_encode(pair.as_bytes())
            ))
            .await?;
        }
        self.send_expect_ok("QListThreadsInStopReply").await?;
        self.send_expect_ok(&argv_packet).await?;
        self.send_expect_ok("qLaunchSuccess").await?;

        info!("Launching {}", argv[0]);
        self.send_packet("c").await
    }

    /// Drives the process until it exits
    ///
    /// Console output is written to `output` as it arrives. Signal stops are resumed
    /// with the signal re-delivered to the stopped thread.
    ///
    /// # Returns
    /// The process exit code
    ///
    /// # Errors
    /// * `Crashed` if the process was terminated by a signal
    /// * `ProtocolViolation` for any unexpected packet
    /// * `Interrupted`, `Timeout` or `ConnectionClosed` from waiting
    pub async fn run<W: AsyncWrite + Unpin>(&mut self, output: &mut W) -> Result<i32, DeployError> {
        loop {
            let frame = self.read_frame(self.exit_timeout).await?;
            match StopReply::parse(&frame)? {
                StopReply::Exited(code) => {
                    info!("Process exited with code {code}");
                    return Ok(code as i32);
                }
                StopReply::Output(bytes) => {
                    output.write_all(&bytes).await?;
                    output.flush().await?;
                }
                StopReply::Signaled {
                    signal,
                    thread,
                    threads,
                } => {
                    debug!("Thread {thread:?} stopped with signal {signal}");
                    let packet = continue_packet(signal, thread.as_deref(), &threads);
                    self.send_packet(&packet).await?;
                }
                StopReply::Crashed {
                    signal,
                    description,
                } => {
                    warn!("Process crashed with signal {signal}");
                    return Err(DeployError::Crashed {
                        signal,
                        description,
                    });
                }
            }
        }
    }

    /// Asks debugserver to kill the process. Failures are logged, not returned.
    pub async fn kill(&mut self) {
        let frame = encode_frame("k");
        let bound = self.read_timeout;
        let socket = &mut self.socket;
        let attempt = async move {
            socket.write_all(&[INTERRUPT]).await?;
            socket.write_all(&frame).await?;
            socket.flush().await
        };
        match tokio::time::timeout(bound, attempt).await {
            Ok(Ok(())) => debug!("Sent kill"),
            Ok(Err(e)) => warn!("Failed to send kill: {e}"),
            Err(_) => warn!("Timed out sending kill"),
        }
    }
}

/// Interprets a handshake reply
fn check_ok(request: &str, reply: &str) -> Result<(), DeployError> {
    if reply == "OK" {
        return Ok(());
    }
    if reply
        .get(..7)
        .is_some_and(|p| p.eq_ignore_ascii_case("elocked"))
    {
        return Err(DeployError::DeviceLocked);
    }
    Err(DeployError::ProtocolViolation(format!(
        "{request} answered with '{reply}'"
    )))
}
