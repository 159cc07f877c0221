//! Machine and chain provisioning sequences.
//!
//! ```text
//! Init ──► Reported ──► Created ──► AgentInstalled ──► HealthChecked ──► Done
//!  │          │
//!  │          └─ driver init, record persisted, id assigned
//!  └─ driver lookup, category check, plugin start, address, session
//! ```
//!
//! Phases run strictly in order, one blocking remote call at a time. The
//! first failure ends the sequence with an error naming the phase and the
//! operation within it. Nothing is rolled back: a record persisted in
//! `Reported` stays in the store, marked `Failed { phase, reason }`.
//! Whatever happens, the plugin is shut down exactly once before
//! returning.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use provisio_plugin::{
    open_session, DriverKind, DriverSession, Draft, HealthReply, HealthRequest, InitRequest,
    PhaseReply, PluginIdentity, PluginResult, RecordRequest,
};
use provisio_state::{
    DriverCategory, NewChain, NewMachine, RecordStatus, RecordStore, StoreResult,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::error::{PhaseFailure, ProvisionError, ProvisionResult};
use crate::launcher::{PluginLauncher, RunningPlugin};
use crate::obs;
use crate::phase::LifecyclePhase;

/// Timing knobs for a [`Sequencer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerOptions {
    pub connect_timeout: Duration,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub health_call_timeout: Duration,
    /// Ceiling on the best-effort `driver.exit` sent after a failure.
    pub exit_timeout: Duration,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            health_attempts: 10,
            health_interval: Duration::from_secs(3),
            health_call_timeout: Duration::from_secs(30),
            exit_timeout: Duration::from_secs(1),
        }
    }
}

/// What to provision: a resource name and driver parameters, passed
/// unchanged to every phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Result of a completed sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    /// Store-assigned id of the machine or chain record.
    pub record_id: i64,
    /// Completed phases, in order.
    pub phases: Vec<LifecyclePhase>,
}

/// Drives plugins through the provisioning phases.
pub struct Sequencer {
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn PluginLauncher>,
    options: SequencerOptions,
    cancel: CancellationToken,
}

impl Sequencer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        launcher: Arc<dyn PluginLauncher>,
        options: SequencerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            launcher,
            options,
            cancel,
        }
    }

    pub async fn create_machine(
        &self,
        driver_id: i64,
        request: ProvisionRequest,
    ) -> ProvisionResult<ProvisionOutcome> {
        self.run(&MachineFlow, driver_id, request).await
    }

    pub async fn create_chain(
        &self,
        driver_id: i64,
        request: ProvisionRequest,
    ) -> ProvisionResult<ProvisionOutcome> {
        self.run(&ChainFlow, driver_id, request).await
    }

    async fn run(
        &self,
        flow: &dyn Flow,
        driver_id: i64,
        request: ProvisionRequest,
    ) -> ProvisionResult<ProvisionOutcome> {
        obs::emit_phase_entered(LifecyclePhase::Init, None);
        let driver = self
            .guard(
                LifecyclePhase::Init,
                "get driver",
                self.store.get_driver(driver_id),
            )
            .await?;
        if driver.category != flow.category() {
            return Err(ProvisionError::CategoryMismatch {
                driver_id,
                expected: flow.category(),
                actual: driver.category,
            });
        }

        let span = obs::sequence_span(flow.category().as_str(), &driver.name, &request.name);
        let identity = PluginIdentity::new(driver.name, driver.version, driver.id);
        self.run_plugin(flow, identity, &request)
            .instrument(span)
            .await
    }

    async fn run_plugin(
        &self,
        flow: &dyn Flow,
        identity: PluginIdentity,
        request: &ProvisionRequest,
    ) -> ProvisionResult<ProvisionOutcome> {
        let started = Instant::now();
        let plugin = self
            .guard(
                LifecyclePhase::Init,
                flow.op_start_plugin(),
                self.launcher
                    .launch(identity.clone(), self.cancel.child_token()),
            )
            .await?;

        let mut progress = Progress::default();
        let result = self
            .drive(flow, &*plugin, identity, request, &mut progress)
            .await;

        if let Err(err) = plugin.shutdown().await {
            warn!(error = %err, "plugin did not shut down cleanly");
        }

        let outcome = match result {
            Ok(record_id) => Ok(ProvisionOutcome {
                record_id,
                phases: progress.phases,
            }),
            Err(err) => {
                if let Some(id) = progress.record_id {
                    self.mark_failed(flow, id, &err).await;
                }
                Err(err)
            }
        };

        obs::emit_sequence_finished(
            progress.record_id,
            started.elapsed().as_millis() as u64,
            outcome.is_ok(),
        );
        outcome
    }

    /// Init (address, session) then the remote phases. On failure the
    /// driver is asked to exit before the session is dropped.
    async fn drive(
        &self,
        flow: &dyn Flow,
        plugin: &dyn RunningPlugin,
        identity: PluginIdentity,
        request: &ProvisionRequest,
        progress: &mut Progress,
    ) -> ProvisionResult<i64> {
        let address = self
            .guard(
                LifecyclePhase::Init,
                "discover plugin address",
                plugin.address(),
            )
            .await?;
        obs::emit_plugin_address(&identity, &address);
        let session = self
            .guard(
                LifecyclePhase::Init,
                "connect driver",
                open_session(
                    &address,
                    driver_kind(flow.category()),
                    identity,
                    self.options.connect_timeout,
                ),
            )
            .await?;
        progress.phases.push(LifecyclePhase::Init);

        let result = self.phases(flow, &session, request, progress).await;
        if result.is_err() {
            self.best_effort_exit(&session).await;
        }
        result
    }

    async fn phases(
        &self,
        flow: &dyn Flow,
        session: &DriverSession,
        request: &ProvisionRequest,
        progress: &mut Progress,
    ) -> ProvisionResult<i64> {
        // Reported
        obs::emit_phase_entered(LifecyclePhase::Reported, None);
        let init = InitRequest {
            name: request.name.clone(),
            params: request.params.clone(),
        };
        let draft = self
            .guard(
                LifecyclePhase::Reported,
                flow.op_init(),
                flow.init(session, &init),
            )
            .await?;
        let driver_id = session.identity().id;
        let record_id = self
            .guard(
                LifecyclePhase::Reported,
                flow.op_report(),
                flow.persist(&*self.store, driver_id, draft),
            )
            .await?;
        progress.record_id = Some(record_id);
        progress.phases.push(LifecyclePhase::Reported);
        info!(record_id, "record reported");

        let call = RecordRequest {
            record_id,
            params: request.params.clone(),
        };

        // Created
        obs::emit_phase_entered(LifecyclePhase::Created, Some(record_id));
        self.guard(
            LifecyclePhase::Created,
            flow.op_create(),
            flow.create(session, &call),
        )
        .await?;
        self.advance(flow, LifecyclePhase::Created, record_id, progress)
            .await?;

        // AgentInstalled
        obs::emit_phase_entered(LifecyclePhase::AgentInstalled, Some(record_id));
        self.guard(
            LifecyclePhase::AgentInstalled,
            flow.op_install(),
            flow.install(session, &call),
        )
        .await?;
        self.advance(flow, LifecyclePhase::AgentInstalled, record_id, progress)
            .await?;

        // HealthChecked
        obs::emit_phase_entered(LifecyclePhase::HealthChecked, Some(record_id));
        self.poll_health(flow, session, record_id, &request.params)
            .await?;
        self.advance(flow, LifecyclePhase::HealthChecked, record_id, progress)
            .await?;

        // Done
        obs::emit_phase_entered(LifecyclePhase::Done, Some(record_id));
        self.guard(
            LifecyclePhase::Done,
            flow.op_done(),
            flow.done(session, &call),
        )
        .await?;
        self.guard(LifecyclePhase::Done, "exit driver", session.exit())
            .await?;
        self.advance(flow, LifecyclePhase::Done, record_id, progress)
            .await?;

        Ok(record_id)
    }

    /// Poll until healthy, up to `health_attempts`. A poll that times out
    /// counts as unhealthy; a remote error ends the phase immediately.
    async fn poll_health(
        &self,
        flow: &dyn Flow,
        session: &DriverSession,
        record_id: i64,
        params: &BTreeMap<String, String>,
    ) -> ProvisionResult<()> {
        let phase = LifecyclePhase::HealthChecked;
        let operation = flow.op_health();
        let attempts = self.options.health_attempts.max(1);
        let mut last = String::from("no health check performed");

        for attempt in 1..=attempts {
            let request = HealthRequest {
                record_id,
                attempt,
                params: params.clone(),
            };
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(self.fail(phase, operation, PhaseFailure::Cancelled));
                }
                polled = tokio::time::timeout(
                    self.options.health_call_timeout,
                    flow.health(session, &request),
                ) => polled,
            };
            match polled {
                Ok(Ok(reply)) if reply.healthy => {
                    info!(record_id, attempt, "health check passed");
                    return Ok(());
                }
                Ok(Ok(reply)) => last = reply.message,
                Ok(Err(err)) => {
                    return Err(self.fail(phase, operation, PhaseFailure::Plugin(err)));
                }
                Err(_) => {
                    last = format!(
                        "no answer within {}s",
                        self.options.health_call_timeout.as_secs_f64()
                    );
                }
            }
            debug!(record_id, attempt, message = %last, "not healthy yet");

            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(self.fail(phase, operation, PhaseFailure::Cancelled));
                    }
                    _ = tokio::time::sleep(self.options.health_interval) => {}
                }
            }
        }

        Err(self.fail(
            phase,
            operation,
            PhaseFailure::Unhealthy {
                attempts,
                message: last,
            },
        ))
    }

    /// Record a completed phase.
    async fn advance(
        &self,
        flow: &dyn Flow,
        phase: LifecyclePhase,
        record_id: i64,
        progress: &mut Progress,
    ) -> ProvisionResult<()> {
        if let Some(status) = phase.record_status() {
            self.guard(
                phase,
                flow.op_status(),
                flow.set_status(&*self.store, record_id, status),
            )
            .await?;
        }
        progress.phases.push(phase);
        Ok(())
    }

    /// Await `fut` unless the sequence is cancelled first; tag failures with
    /// the phase and operation.
    async fn guard<T, E, F>(
        &self,
        phase: LifecyclePhase,
        operation: &str,
        fut: F,
    ) -> ProvisionResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<PhaseFailure>,
    {
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = fut => Some(result),
        };
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(self.fail(phase, operation, err.into())),
            None => Err(self.fail(phase, operation, PhaseFailure::Cancelled)),
        }
    }

    fn fail(&self, phase: LifecyclePhase, operation: &str, source: PhaseFailure) -> ProvisionError {
        let err = ProvisionError::Phase {
            phase,
            operation: operation.to_string(),
            source,
        };
        obs::emit_phase_failed(phase, operation, &err);
        err
    }

    async fn mark_failed(&self, flow: &dyn Flow, record_id: i64, err: &ProvisionError) {
        let status = RecordStatus::Failed {
            phase: err
                .phase()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default(),
            reason: err.to_string(),
        };
        if let Err(store_err) = flow.set_status(&*self.store, record_id, status).await {
            warn!(record_id, error = %store_err, "could not mark record failed");
        }
    }

    async fn best_effort_exit(&self, session: &DriverSession) {
        match tokio::time::timeout(self.options.exit_timeout, session.exit()).await {
            Ok(Ok(())) => info!("driver exit acknowledged"),
            Ok(Err(err)) => warn!(error = %err, "driver exit failed"),
            Err(_) => warn!("driver exit timed out"),
        }
    }
}

/// Client kind that serves a stored driver category.
pub fn driver_kind(category: DriverCategory) -> DriverKind {
    match category {
        DriverCategory::Machine => DriverKind::Machine,
        DriverCategory::Chain => DriverKind::Chain,
    }
}

#[derive(Default)]
struct Progress {
    record_id: Option<i64>,
    phases: Vec<LifecyclePhase>,
}

/// The per-category half of a sequence: which client calls to make, which
/// table to persist to, and what to call each step.
#[async_trait]
trait Flow: Send + Sync {
    fn category(&self) -> DriverCategory;

    fn op_start_plugin(&self) -> &'static str;
    fn op_init(&self) -> &'static str;
    fn op_report(&self) -> &'static str;
    fn op_create(&self) -> &'static str;
    fn op_install(&self) -> &'static str;
    fn op_health(&self) -> &'static str;
    fn op_done(&self) -> &'static str;
    fn op_status(&self) -> &'static str;

    async fn init(&self, session: &DriverSession, request: &InitRequest) -> PluginResult<Draft>;
    async fn persist(&self, store: &dyn RecordStore, driver_id: i64, draft: Draft)
        -> StoreResult<i64>;
    async fn set_status(
        &self,
        store: &dyn RecordStore,
        record_id: i64,
        status: RecordStatus,
    ) -> StoreResult<()>;
    async fn create(&self, session: &DriverSession, request: &RecordRequest)
        -> PluginResult<PhaseReply>;
    async fn install(
        &self,
        session: &DriverSession,
        request: &RecordRequest,
    ) -> PluginResult<PhaseReply>;
    async fn health(
        &self,
        session: &DriverSession,
        request: &HealthRequest,
    ) -> PluginResult<HealthReply>;
    async fn done(&self, session: &DriverSession, request: &RecordRequest)
        -> PluginResult<PhaseReply>;
}

struct MachineFlow;

#[async_trait]
impl Flow for MachineFlow {
    fn category(&self) -> DriverCategory {
        DriverCategory::Machine
    }

    fn op_start_plugin(&self) -> &'static str {
        "start machine plugin"
    }
    fn op_init(&self) -> &'static str {
        "init machine"
    }
    fn op_report(&self) -> &'static str {
        "report machine"
    }
    fn op_create(&self) -> &'static str {
        "create machine"
    }
    fn op_install(&self) -> &'static str {
        "install machine robot"
    }
    fn op_health(&self) -> &'static str {
        "health check machine"
    }
    fn op_done(&self) -> &'static str {
        "finish machine"
    }
    fn op_status(&self) -> &'static str {
        "update machine status"
    }

    async fn init(&self, session: &DriverSession, request: &InitRequest) -> PluginResult<Draft> {
        session.machine()?.init(request).await
    }

    async fn persist(
        &self,
        store: &dyn RecordStore,
        driver_id: i64,
        draft: Draft,
    ) -> StoreResult<i64> {
        store
            .insert_machine(NewMachine {
                driver_id,
                name: draft.name,
                host: draft.host,
                labels: draft.labels,
            })
            .await
    }

    async fn set_status(
        &self,
        store: &dyn RecordStore,
        record_id: i64,
        status: RecordStatus,
    ) -> StoreResult<()> {
        store.set_machine_status(record_id, status).await
    }

    async fn create(
        &self,
        session: &DriverSession,
        request: &RecordRequest,
    ) -> PluginResult<PhaseReply> {
        session.machine()?.create(request).await
    }

    async fn install(
        &self,
        session: &DriverSession,
        request: &RecordRequest,
    ) -> PluginResult<PhaseReply> {
        session.machine()?.install_robot(request).await
    }

    async fn health(
        &self,
        session: &DriverSession,
        request: &HealthRequest,
    ) -> PluginResult<HealthReply> {
        session.machine()?.health_check(request).await
    }

    async fn done(
        &self,
        session: &DriverSession,
        request: &RecordRequest,
    ) -> PluginResult<PhaseReply> {
        session.machine()?.done(request).await
    }
}

struct ChainFlow;

#[async_trait]
impl Flow for ChainFlow {
    fn category(&self) -> DriverCategory {
        DriverCategory::Chain
    }

    fn op_start_plugin(&self) -> &'static str {
        "start chain plugin"
    }
    fn op_init(&self) -> &'static str {
        "init chain"
    }
    fn op_report(&self) -> &'static str {
        "report chain"
    }
    fn op_create(&self) -> &'static str {
        "create chain"
    }
    fn op_install(&self) -> &'static str {
        "install chain"
    }
    fn op_health(&self) -> &'static str {
        "health check chain"
    }
    fn op_done(&self) -> &'static str {
        "finish chain"
    }
    fn op_status(&self) -> &'static str {
        "update chain status"
    }

    async fn init(&self, session: &DriverSession, request: &InitRequest) -> PluginResult<Draft> {
        session.chain()?.init(request).await
    }

    async fn persist(
        &self,
        store: &dyn RecordStore,
        driver_id: i64,
        draft: Draft,
    ) -> StoreResult<i64> {
        store
            .insert_chain(NewChain {
                driver_id,
                name: draft.name,
                labels: draft.labels,
            })
            .await
    }

    async fn set_status(
        &self,
        store: &dyn RecordStore,
        record_id: i64,
        status: RecordStatus,
    ) -> StoreResult<()> {
        store.set_chain_status(record_id, status).await
    }

    async fn create(
        &self,
        session: &DriverSession,
        request: &RecordRequest,
    ) -> PluginResult<PhaseReply> {
        session.chain()?.create(request).await
    }

    async fn install(
        &self,
        session: &DriverSession,
        request: &RecordRequest,
    ) -> PluginResult<PhaseReply> {
        session.chain()?.install(request).await
    }

    async fn health(
        &self,
        session: &DriverSession,
        request: &HealthRequest,
    ) -> PluginResult<HealthReply> {
        session.chain()?.health_check(request).await
    }

    async fn done(
        &self,
        session: &DriverSession,
        request: &RecordRequest,
    ) -> PluginResult<PhaseReply> {
        session.chain()?.done(request).await
    }
}
