//! Plugin process supervision: spawn with the handshake environment, expose
//! line readers, tear down on request or cancellation.

use std::process::Stdio;

use provisio_exec::process_tree::isolate_process_group;
use provisio_exec::{kill_process_tree, terminate_process_tree, LossyLines};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::identity::PluginIdentity;
use crate::resolve::PluginKind;

pub type StdoutLines = LossyLines<BufReader<ChildStdout>>;
pub type StderrLines = LossyLines<BufReader<ChildStderr>>;

/// One plugin subprocess.
///
/// `kill` is the token whose firing terminates the process group; the
/// controller derives it from the owner's cancellation token.
#[derive(Debug)]
pub struct PluginProcess {
    identity: PluginIdentity,
    kind: PluginKind,
    kill: CancellationToken,
    child: Option<Child>,
}

impl PluginProcess {
    pub fn new(identity: PluginIdentity, kind: PluginKind, kill: CancellationToken) -> Self {
        Self {
            identity,
            kind,
            kill,
            child: None,
        }
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn kind(&self) -> &PluginKind {
        &self.kind
    }

    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }

    /// Pid of the running plugin (also its process-group id).
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Launch the binary and hand back line readers for both streams.
    ///
    /// The pipes exist before the child runs, so nothing written between
    /// spawn and the first read is lost.
    pub fn start(&mut self) -> PluginResult<(StdoutLines, StderrLines)> {
        if self.child.is_some() {
            return Err(PluginError::AlreadyStarted {
                identity: self.identity.to_string(),
            });
        }

        let mut command = Command::new(self.kind.path());
        command
            .envs(self.identity.handshake_env(self.kind.is_builtin()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        let mut child = command.spawn().map_err(|source| PluginError::Spawn {
            identity: self.identity.to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            PluginError::Protocol(format!("plugin {} has no stdout pipe", self.identity))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            PluginError::Protocol(format!("plugin {} has no stderr pipe", self.identity))
        })?;

        info!(
            plugin = %self.identity,
            pid = ?child.id(),
            path = %self.kind.path().display(),
            builtin = self.kind.is_builtin(),
            "plugin started"
        );
        self.child = Some(child);

        Ok((
            LossyLines::new(BufReader::new(stdout)),
            LossyLines::new(BufReader::new(stderr)),
        ))
    }

    /// Ask the plugin's process group to exit (SIGTERM); plugins trap it.
    pub fn terminate(&self) {
        if let Some(pgid) = self.pid() {
            if let Err(err) = terminate_process_tree(pgid) {
                warn!(plugin = %self.identity, error = %err, "failed to signal plugin");
            }
        }
    }

    /// Wait for the plugin to exit, killing its process group as soon as the
    /// kill token fires.
    pub async fn close(&mut self) -> PluginResult<()> {
        let mut child = self.child.take().ok_or_else(|| PluginError::NotStarted {
            identity: self.identity.to_string(),
        })?;
        let pid = child.id();

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = self.kill.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status,
            None => {
                debug!(plugin = %self.identity, pid = ?pid, "killing plugin process group");
                if let Some(pgid) = pid {
                    if let Err(err) = kill_process_tree(pgid) {
                        warn!(plugin = %self.identity, error = %err, "process-group kill failed");
                        child.start_kill().ok();
                    }
                }
                child.wait().await
            }
        }
        .map_err(|source| PluginError::Wait {
            identity: self.identity.to_string(),
            source,
        })?;

        if status.success() {
            info!(plugin = %self.identity, "plugin exited");
            Ok(())
        } else {
            warn!(plugin = %self.identity, status = %status, "plugin exited abnormally");
            Err(PluginError::Exited {
                identity: self.identity.to_string(),
                status: status.to_string(),
            })
        }
    }
}
