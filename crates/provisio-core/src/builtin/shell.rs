//! Shell-command drivers.
//!
//! Each phase runs an operator-supplied command taken from the request
//! parameters (`create_command`, `install_command`, `health_command`,
//! `done_command`) through the bounded command runner. A phase without a
//! command succeeds without doing anything. Commands see the record id in
//! `PROVISIO_RECORD_ID`; their output is relayed into the plugin's log.
//!
//! Optional parameters: `shell` (`bash`, `sh` or `none`) and `work_dir`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use provisio_exec::{run, CommandSpec, ExecResult};
use provisio_plugin::{
    ChainDriver, Draft, HealthReply, HealthRequest, InitRequest, MachineDriver, PhaseReply,
    PluginError, PluginResult, RecordRequest,
};
use tokio::sync::mpsc;
use tracing::info;

pub const RECORD_ID_ENV: &str = "PROVISIO_RECORD_ID";

const CREATE_TIMEOUT: Duration = Duration::from_secs(600);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
const DONE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Steps {
    driver: &'static str,
}

impl Steps {
    fn spec(
        &self,
        command: &str,
        timeout: Duration,
        record_id: i64,
        params: &BTreeMap<String, String>,
        tap: mpsc::UnboundedSender<String>,
    ) -> ExecResult<CommandSpec> {
        let mut builder = CommandSpec::builder(command)
            .timeout(timeout)
            .env(RECORD_ID_ENV, record_id.to_string())
            .tap(tap);
        if let Some(shell) = params.get("shell") {
            builder = builder.shell_name(shell);
        }
        if let Some(dir) = params.get("work_dir") {
            builder = builder.work_dir(dir);
        }
        builder.build()
    }

    async fn exec(
        &self,
        step: &'static str,
        command: &str,
        timeout: Duration,
        record_id: i64,
        params: &BTreeMap<String, String>,
    ) -> ExecResult<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let spec = self.spec(command, timeout, record_id, params, tx)?;

        let driver = self.driver;
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                info!(driver, step, "{line}");
            }
        });

        run(&spec).await
    }

    async fn phase(
        &self,
        step: &'static str,
        key: &str,
        timeout: Duration,
        request: &RecordRequest,
    ) -> PluginResult<PhaseReply> {
        let Some(command) = request.params.get(key) else {
            return Ok(PhaseReply {
                detail: Some(format!("{step}: no {key} given")),
            });
        };
        let output = self
            .exec(step, command, timeout, request.record_id, &request.params)
            .await
            .map_err(|err| PluginError::Driver(format!("{step}: {err}")))?;
        let output = output.trim();
        Ok(PhaseReply {
            detail: (!output.is_empty()).then(|| output.to_string()),
        })
    }

    /// A failing health command means "not healthy yet", not a driver error.
    async fn health(&self, request: &HealthRequest) -> PluginResult<HealthReply> {
        let Some(command) = request.params.get("health_command") else {
            return Ok(HealthReply {
                healthy: true,
                message: "no health_command given".to_string(),
            });
        };
        match self
            .exec(
                "health",
                command,
                HEALTH_TIMEOUT,
                request.record_id,
                &request.params,
            )
            .await
        {
            Ok(output) => Ok(HealthReply {
                healthy: true,
                message: output.trim().to_string(),
            }),
            Err(err) if err.is_config() => Err(PluginError::Driver(err.to_string())),
            Err(err) => Ok(HealthReply {
                healthy: false,
                message: err.to_string(),
            }),
        }
    }
}

fn draft(request: InitRequest) -> Draft {
    Draft {
        host: request.params.get("host").cloned(),
        name: request.name,
        labels: request.params,
    }
}

/// Machine driver backed by shell commands.
#[derive(Debug, Clone)]
pub struct ShellMachineDriver {
    steps: Steps,
}

impl ShellMachineDriver {
    pub fn new() -> Self {
        Self {
            steps: Steps { driver: "shell" },
        }
    }
}

impl Default for ShellMachineDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineDriver for ShellMachineDriver {
    async fn init(&self, request: InitRequest) -> PluginResult<Draft> {
        Ok(draft(request))
    }

    async fn create(&self, request: RecordRequest) -> PluginResult<PhaseReply> {
        self.steps
            .phase("create", "create_command", CREATE_TIMEOUT, &request)
            .await
    }

    async fn install_robot(&self, request: RecordRequest) -> PluginResult<PhaseReply> {
        self.steps
            .phase("install", "install_command", INSTALL_TIMEOUT, &request)
            .await
    }

    async fn health_check(&self, request: HealthRequest) -> PluginResult<HealthReply> {
        self.steps.health(&request).await
    }

    async fn done(&self, request: RecordRequest) -> PluginResult<PhaseReply> {
        self.steps
            .phase("done", "done_command", DONE_TIMEOUT, &request)
            .await
    }
}

/// Chain driver backed by shell commands.
#[derive(Debug, Clone)]
pub struct ShellChainDriver {
    steps: Steps,
}

impl ShellChainDriver {
    pub fn new() -> Self {
        Self {
            steps: Steps {
                driver: "shell-chain",
            },
        }
    }
}

impl Default for ShellChainDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainDriver for ShellChainDriver {
    async fn init(&self, request: InitRequest) -> PluginResult<Draft> {
        Ok(draft(request))
    }

    async fn create(&self, request: RecordRequest) -> PluginResult<PhaseReply> {
        self.steps
            .phase("create", "create_command", CREATE_TIMEOUT, &request)
            .await
    }

    async fn install(&self, request: RecordRequest) -> PluginResult<PhaseReply> {
        self.steps
            .phase("install", "install_command", INSTALL_TIMEOUT, &request)
            .await
    }

    async fn health_check(&self, request: HealthRequest) -> PluginResult<HealthReply> {
        self.steps.health(&request).await
    }

    async fn done(&self, request: RecordRequest) -> PluginResult<PhaseReply> {
        self.steps
            .phase("done", "done_command", DONE_TIMEOUT, &request)
            .await
    }
}
