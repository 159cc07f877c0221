//! Command definitions and their builder.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::{ExecError, ExecResult};
use crate::shell::ShellKind;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed pause between failed attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// A fully resolved, immutable command description.
///
/// Built through [`CommandSpec::builder`]; run with [`crate::run`].
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub(crate) shell: ShellKind,
    pub(crate) command: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) timeout: Duration,
    pub(crate) force_kill: bool,
    pub(crate) retries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) work_dir: Option<PathBuf>,
    pub(crate) tap: Option<UnboundedSender<String>>,
}

impl CommandSpec {
    /// Start building a command. With a shell, `command` is the whole script;
    /// without one it is the program path.
    pub fn builder(command: impl Into<String>) -> CommandSpecBuilder {
        CommandSpecBuilder::new(command)
    }

    pub fn shell(&self) -> ShellKind {
        self.shell
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn force_kill(&self) -> bool {
        self.force_kill
    }

    /// Attempt count, always at least 1.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// `(program, argv)` as handed to the OS.
    pub fn invocation(&self) -> (String, Vec<String>) {
        match self.shell.program() {
            None => (self.command.clone(), self.args.clone()),
            Some(shell) => (shell.to_string(), vec!["-c".to_string(), self.script()]),
        }
    }

    /// Human-readable form used in logs and errors.
    pub fn display(&self) -> String {
        match self.shell {
            ShellKind::None if !self.args.is_empty() => {
                format!("{} {}", self.command, self.args.join(" "))
            }
            ShellKind::None => self.command.clone(),
            _ => self.script(),
        }
    }

    fn script(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Options builder for [`CommandSpec`].
#[derive(Debug)]
pub struct CommandSpecBuilder {
    shell: Option<Result<ShellKind, String>>,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    force_kill: bool,
    retries: u32,
    retry_delay: Duration,
    work_dir: Option<PathBuf>,
    tap: Option<UnboundedSender<String>>,
}

impl CommandSpecBuilder {
    fn new(command: impl Into<String>) -> Self {
        Self {
            shell: None,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            force_kill: true,
            retries: 1,
            retry_delay: DEFAULT_RETRY_DELAY,
            work_dir: None,
            tap: None,
        }
    }

    pub fn shell(mut self, shell: ShellKind) -> Self {
        self.shell = Some(Ok(shell));
        self
    }

    /// Select the shell by name; unknown names fail at [`build`](Self::build).
    pub fn shell_name(mut self, name: &str) -> Self {
        self.shell = Some(name.parse::<ShellKind>().map_err(|_| name.to_string()));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    pub fn force_kill(mut self, force_kill: bool) -> Self {
        self.force_kill = force_kill;
        self
    }

    /// Total attempts; values below 1 are clamped to 1.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Copy every output line (both streams) into `tap` as it is produced.
    pub fn tap(mut self, tap: UnboundedSender<String>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn build(self) -> ExecResult<CommandSpec> {
        if self.command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let shell = match self.shell {
            Some(Ok(shell)) => shell,
            Some(Err(name)) => return Err(ExecError::UnsupportedShell(name)),
            None => ShellKind::detect(),
        };

        Ok(CommandSpec {
            shell,
            command: self.command,
            args: self.args,
            env: self.env,
            timeout: self.timeout,
            force_kill: self.force_kill,
            retries: self.retries.max(1),
            retry_delay: self.retry_delay,
            work_dir: self.work_dir,
            tap: self.tap,
        })
    }
}
