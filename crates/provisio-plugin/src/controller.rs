//! Plugin lifecycle controller.
//!
//! A [`PluginHandle`] owns one plugin process and runs its event loop:
//!
//! ```text
//! serve()
//!   ├─► PluginProcess::start()
//!   ├─► first stdout line ──► address delivery (once)
//!   ├─► attach_stream(stdout), attach_stream(stderr)
//!   └─► loop select {
//!         stdout line   → info!
//!         stderr line   → debug!
//!         owner cancel  → kill process group, wait
//!         close()       → SIGTERM, grace, kill, wait
//!       }
//! ```
//!
//! `address()` may be called from any task, any number of times; the first
//! successful call validates and caches the address.

use std::sync::OnceLock;
use std::time::Duration;

use provisio_exec::LossyLines;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::{validate_address, DEFAULT_DIAL_TIMEOUT};
use crate::error::{PluginError, PluginResult};
use crate::identity::PluginIdentity;
use crate::resolve::PluginKind;
use crate::supervisor::PluginProcess;

/// Default ceiling for address discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a plugin gets to exit after being asked to stop.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Timing knobs for a [`PluginHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub discovery_timeout: Duration,
    pub dial_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// One supervised plugin invocation.
#[derive(Debug)]
pub struct PluginHandle {
    identity: PluginIdentity,
    instance: Uuid,
    options: ControllerOptions,
    process: Mutex<Option<PluginProcess>>,
    addr_tx: Mutex<Option<oneshot::Sender<String>>>,
    addr_rx: Mutex<Option<oneshot::Receiver<String>>>,
    address: OnceLock<String>,
    pid: OnceLock<u32>,
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl PluginHandle {
    /// Prepare (but do not start) a plugin. `cancel` is the owner's token;
    /// firing it kills the plugin immediately.
    pub fn new(
        identity: PluginIdentity,
        kind: PluginKind,
        options: ControllerOptions,
        cancel: CancellationToken,
    ) -> Self {
        let process = PluginProcess::new(identity.clone(), kind, cancel.child_token());
        let (tx, rx) = oneshot::channel();
        Self {
            identity,
            instance: Uuid::new_v4(),
            options,
            process: Mutex::new(Some(process)),
            addr_tx: Mutex::new(Some(tx)),
            addr_rx: Mutex::new(Some(rx)),
            address: OnceLock::new(),
            pid: OnceLock::new(),
            stop: CancellationToken::new(),
            cancel,
        }
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    /// Pid of the plugin once `serve` has started it.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Run the plugin until it is closed or the owner cancels.
    ///
    /// Only the first call starts a process; later calls fail with
    /// [`PluginError::AlreadyStarted`].
    pub async fn serve(&self) -> PluginResult<()> {
        let mut process = self
            .process
            .lock()
            .await
            .take()
            .ok_or_else(|| PluginError::AlreadyStarted {
                identity: self.identity.to_string(),
            })?;
        // Taken before start so a failed spawn also ends address discovery.
        let addr_tx = self.addr_tx.lock().await.take();
        let (mut stdout, stderr) = process.start()?;
        if let Some(pid) = process.pid() {
            let _ = self.pid.set(pid);
        }

        let first = tokio::select! {
            line = stdout.next_line() => Some(line),
            _ = self.stop.cancelled() => None,
            _ = self.cancel.cancelled() => None,
        };
        match first {
            None => return self.shutdown(process).await,
            Some(Ok(Some(line))) => {
                debug!(plugin = %self.identity, line = %line, "handshake line received");
                if let Some(tx) = addr_tx {
                    let _ = tx.send(line);
                }
            }
            Some(Ok(None)) => {
                warn!(plugin = %self.identity, "plugin closed stdout before handshake");
                drop(addr_tx);
            }
            Some(Err(err)) => {
                warn!(plugin = %self.identity, error = %err, "failed reading handshake line");
                drop(addr_tx);
            }
        }

        let mut out = attach_stream(stdout, self.stop.clone());
        let mut err = attach_stream(stderr, self.stop.clone());

        loop {
            tokio::select! {
                Some(line) = out.recv() => {
                    info!(plugin = %self.identity, instance = %self.instance, stream = "stdout", "{line}");
                }
                Some(line) = err.recv() => {
                    debug!(plugin = %self.identity, instance = %self.instance, stream = "stderr", "{line}");
                }
                _ = self.cancel.cancelled() => {
                    info!(plugin = %self.identity, "owner cancelled, killing plugin");
                    return self.shutdown(process).await;
                }
                _ = self.stop.cancelled() => {
                    return self.shutdown(process).await;
                }
            }
        }
    }

    /// Block until the handshake address is known, validated and cached.
    ///
    /// A discovery timeout leaves the plugin running; it stays under
    /// `serve`'s control until [`close`](Self::close).
    pub async fn address(&self) -> PluginResult<String> {
        if let Some(address) = self.address.get() {
            return Ok(address.clone());
        }

        let mut slot = self.addr_rx.lock().await;
        if let Some(address) = self.address.get() {
            return Ok(address.clone());
        }
        let rx = slot.as_mut().ok_or_else(|| PluginError::HandshakeConsumed {
            identity: self.identity.to_string(),
        })?;

        let line = match tokio::time::timeout(self.options.discovery_timeout, rx).await {
            Ok(Ok(line)) => line,
            Ok(Err(_)) => {
                *slot = None;
                return Err(PluginError::HandshakeAborted {
                    identity: self.identity.to_string(),
                });
            }
            Err(_) => {
                warn!(
                    plugin = %self.identity,
                    timeout_ms = self.options.discovery_timeout.as_millis() as u64,
                    "plugin address discovery timed out"
                );
                return Err(PluginError::HandshakeTimeout {
                    identity: self.identity.to_string(),
                    timeout: self.options.discovery_timeout,
                });
            }
        };
        // The delivery channel is spent; later calls only read the cache.
        *slot = None;

        let address = validate_address(&line, self.options.dial_timeout).await?;
        info!(plugin = %self.identity, address = %address, "plugin address discovered");
        Ok(self.address.get_or_init(|| address).clone())
    }

    /// Ask `serve` to stop the plugin. Does not wait for the process.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Graceful-then-forceful teardown, or immediate kill on owner cancel.
    async fn shutdown(&self, mut process: PluginProcess) -> PluginResult<()> {
        let grace = if self.cancel.is_cancelled() {
            None
        } else {
            process.terminate();
            let kill = process.kill_token().clone();
            let delay = self.options.shutdown_grace;
            Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                kill.cancel();
            }))
        };

        let result = process.close().await;
        if let Some(timer) = grace {
            timer.abort();
        }
        result
    }
}

/// Relay lines from `lines` into an unbounded channel until `stop` fires or
/// the stream ends. Per-stream order is preserved; undecodable bytes are
/// replaced, never fatal.
pub fn attach_stream<R>(
    mut lines: LossyLines<R>,
    stop: CancellationToken,
) -> UnboundedReceiver<String>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(error = %err, "plugin output stream failed");
                        break;
                    }
                },
            }
        }
    });
    rx
}
