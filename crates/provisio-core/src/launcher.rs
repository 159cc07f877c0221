//! How the sequencer obtains a running plugin.
//!
//! [`ProcessLauncher`] is the real implementation: resolve, spawn, serve.
//! Tests substitute launchers that serve a driver in-process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provisio_plugin::{
    ControllerOptions, PluginError, PluginHandle, PluginIdentity, PluginResolver, PluginResult,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A started plugin, owned by one sequence.
#[async_trait]
pub trait RunningPlugin: Send + Sync {
    /// Validated RPC address; cached after the first success.
    async fn address(&self) -> PluginResult<String>;

    /// Stop the plugin and wait for it to go away.
    async fn shutdown(self: Box<Self>) -> PluginResult<()>;
}

#[async_trait]
pub trait PluginLauncher: Send + Sync {
    /// Start the plugin for `identity`. Firing `cancel` must eventually
    /// tear it down even if `shutdown` is never called.
    async fn launch(
        &self,
        identity: PluginIdentity,
        cancel: CancellationToken,
    ) -> PluginResult<Box<dyn RunningPlugin>>;
}

/// Launches plugins as child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    resolver: PluginResolver,
    options: ControllerOptions,
}

impl ProcessLauncher {
    pub fn new(resolver: PluginResolver, options: ControllerOptions) -> Self {
        Self { resolver, options }
    }
}

#[async_trait]
impl PluginLauncher for ProcessLauncher {
    async fn launch(
        &self,
        identity: PluginIdentity,
        cancel: CancellationToken,
    ) -> PluginResult<Box<dyn RunningPlugin>> {
        let kind = self.resolver.resolve(&identity)?;

        // The owner's cancellation reaches the plugin one grace period late,
        // so an orderly exit still has a chance to happen first.
        let plugin_cancel = CancellationToken::new();
        let forward = tokio::spawn(forward_cancel(
            cancel,
            plugin_cancel.clone(),
            self.options.shutdown_grace,
        ));

        let handle = Arc::new(PluginHandle::new(
            identity,
            kind,
            self.options.clone(),
            plugin_cancel,
        ));
        let serving = handle.clone();
        let serve = tokio::spawn(async move { serving.serve().await });

        Ok(Box::new(ProcessPlugin {
            handle,
            serve: Mutex::new(Some(serve)),
            forward,
        }))
    }
}

async fn forward_cancel(owner: CancellationToken, plugin: CancellationToken, grace: Duration) {
    tokio::select! {
        _ = owner.cancelled() => {}
        _ = plugin.cancelled() => return,
    }
    tokio::time::sleep(grace).await;
    plugin.cancel();
}

const SERVE_SETTLE: Duration = Duration::from_millis(200);

struct ProcessPlugin {
    handle: Arc<PluginHandle>,
    serve: Mutex<Option<JoinHandle<PluginResult<()>>>>,
    forward: JoinHandle<()>,
}

impl ProcessPlugin {
    /// If `serve` ended with an error, that error explains a failed
    /// discovery better than the discovery error itself.
    async fn serve_failure(&self) -> Option<PluginError> {
        let mut slot = self.serve.lock().await;
        let task = slot.as_mut()?;
        match tokio::time::timeout(SERVE_SETTLE, task).await {
            // Still supervising a live process; leave it for `shutdown`.
            Err(_) => None,
            Ok(joined) => {
                *slot = None;
                match joined {
                    Ok(Err(err)) => Some(err),
                    _ => None,
                }
            }
        }
    }
}

#[async_trait]
impl RunningPlugin for ProcessPlugin {
    async fn address(&self) -> PluginResult<String> {
        match self.handle.address().await {
            Ok(address) => Ok(address),
            Err(err @ PluginError::HandshakeAborted { .. }) => {
                Err(self.serve_failure().await.unwrap_or(err))
            }
            Err(err) => Err(err),
        }
    }

    async fn shutdown(self: Box<Self>) -> PluginResult<()> {
        let ProcessPlugin {
            handle,
            serve,
            forward,
        } = *self;
        handle.close();
        let result = match serve.into_inner() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(err) => Err(PluginError::Protocol(format!(
                    "plugin supervisor task failed: {err}"
                ))),
            },
            // Already reaped by `serve_failure`.
            None => Ok(()),
        };
        forward.abort();
        debug!(plugin = %handle.identity(), ok = result.is_ok(), "plugin shut down");
        result
    }
}
