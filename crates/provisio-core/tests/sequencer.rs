//! Sequencer tests against drivers served in-process over real TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use provisio_core::{
    LifecyclePhase, PhaseFailure, PluginLauncher, ProvisionError, ProvisionRequest,
    RunningPlugin, Sequencer, SequencerOptions,
};
use provisio_plugin::{
    serve_listener, ChainDriver, Draft, DriverService, HealthReply, HealthRequest, InitRequest,
    MachineDriver, PhaseReply, PluginError, PluginIdentity, PluginResult, RecordRequest,
};
use provisio_state::{DriverCategory, MemoryRecordStore, RecordStatus, RecordStore, StoreError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Scripted driver
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    fail_install: bool,
    hang_create: bool,
    healthy_after: u32,
    slow_first_health: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl Script {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn draft(&self, request: InitRequest) -> Draft {
        self.record("init");
        Draft {
            name: request.name,
            host: Some("10.0.0.9".to_string()),
            labels: request.params,
        }
    }

    async fn create(&self) -> PluginResult<PhaseReply> {
        self.record("create");
        if self.hang_create {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(PhaseReply::default())
    }

    fn install(&self) -> PluginResult<PhaseReply> {
        self.record("install");
        if self.fail_install {
            return Err(PluginError::Driver("agent package unavailable".to_string()));
        }
        Ok(PhaseReply::default())
    }

    async fn health(&self, request: &HealthRequest) -> HealthReply {
        self.record("health_check");
        if let (1, Some(delay)) = (request.attempt, self.slow_first_health) {
            tokio::time::sleep(delay).await;
        }
        HealthReply {
            healthy: request.attempt >= self.healthy_after,
            message: format!("attempt {}", request.attempt),
        }
    }
}

struct ScriptedMachine(Arc<Script>);

#[async_trait]
impl MachineDriver for ScriptedMachine {
    async fn init(&self, request: InitRequest) -> PluginResult<Draft> {
        Ok(self.0.draft(request))
    }
    async fn create(&self, _request: RecordRequest) -> PluginResult<PhaseReply> {
        self.0.create().await
    }
    async fn install_robot(&self, _request: RecordRequest) -> PluginResult<PhaseReply> {
        self.0.install()
    }
    async fn health_check(&self, request: HealthRequest) -> PluginResult<HealthReply> {
        Ok(self.0.health(&request).await)
    }
    async fn done(&self, _request: RecordRequest) -> PluginResult<PhaseReply> {
        self.0.record("done");
        Ok(PhaseReply::default())
    }
}

struct ScriptedChain(Arc<Script>);

#[async_trait]
impl ChainDriver for ScriptedChain {
    async fn init(&self, request: InitRequest) -> PluginResult<Draft> {
        Ok(self.0.draft(request))
    }
    async fn create(&self, _request: RecordRequest) -> PluginResult<PhaseReply> {
        self.0.create().await
    }
    async fn install(&self, _request: RecordRequest) -> PluginResult<PhaseReply> {
        self.0.install()
    }
    async fn health_check(&self, request: HealthRequest) -> PluginResult<HealthReply> {
        Ok(self.0.health(&request).await)
    }
    async fn done(&self, _request: RecordRequest) -> PluginResult<PhaseReply> {
        self.0.record("done");
        Ok(PhaseReply::default())
    }
}

// ---------------------------------------------------------------------------
// In-process launcher
// ---------------------------------------------------------------------------

struct InProcessLauncher {
    service: DriverService,
    launches: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
}

impl InProcessLauncher {
    fn new(service: DriverService) -> Arc<Self> {
        Arc::new(Self {
            service,
            launches: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

struct InProcessPlugin {
    address: String,
    stop: CancellationToken,
    task: JoinHandle<PluginResult<()>>,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl PluginLauncher for InProcessLauncher {
    async fn launch(
        &self,
        _identity: PluginIdentity,
        cancel: CancellationToken,
    ) -> PluginResult<Box<dyn RunningPlugin>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let stop = cancel.child_token();
        let task = tokio::spawn(serve_listener(listener, self.service.clone(), stop.clone()));
        Ok(Box::new(InProcessPlugin {
            address,
            stop,
            task,
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

#[async_trait]
impl RunningPlugin for InProcessPlugin {
    async fn address(&self) -> PluginResult<String> {
        Ok(self.address.clone())
    }

    async fn shutdown(self: Box<Self>) -> PluginResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
        self.task
            .await
            .map_err(|err| PluginError::Protocol(err.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_options() -> SequencerOptions {
    SequencerOptions {
        connect_timeout: Duration::from_secs(2),
        health_attempts: 5,
        health_interval: Duration::from_millis(10),
        health_call_timeout: Duration::from_secs(2),
        exit_timeout: Duration::from_millis(200),
    }
}

async fn setup(
    category: DriverCategory,
    script: Arc<Script>,
) -> (Arc<MemoryRecordStore>, Arc<InProcessLauncher>, i64) {
    let store = Arc::new(MemoryRecordStore::new());
    let driver = store
        .register_driver("scripted", "1.0", category)
        .await
        .unwrap();
    let service = match category {
        DriverCategory::Machine => DriverService::Machine(Arc::new(ScriptedMachine(script))),
        DriverCategory::Chain => DriverService::Chain(Arc::new(ScriptedChain(script))),
    };
    (store, InProcessLauncher::new(service), driver.id)
}

fn sequencer(
    store: &Arc<MemoryRecordStore>,
    launcher: &Arc<InProcessLauncher>,
    options: SequencerOptions,
    cancel: CancellationToken,
) -> Sequencer {
    Sequencer::new(store.clone(), launcher.clone(), options, cancel)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn machine_sequence_runs_all_phases_in_order() {
    let script = Arc::new(Script {
        healthy_after: 1,
        ..Default::default()
    });
    let (store, launcher, driver_id) = setup(DriverCategory::Machine, script.clone()).await;

    let outcome = sequencer(&store, &launcher, fast_options(), CancellationToken::new())
        .create_machine(driver_id, ProvisionRequest::new("web-1").param("zone", "a"))
        .await
        .unwrap();

    assert_eq!(outcome.phases, LifecyclePhase::ALL.to_vec());
    assert_eq!(
        script.calls(),
        vec!["init", "create", "install", "health_check", "done"]
    );

    let record = store.get_machine(outcome.record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Ready);
    assert_eq!(record.name, "web-1");
    assert_eq!(record.host.as_deref(), Some("10.0.0.9"));
    assert_eq!(record.labels.get("zone").map(String::as_str), Some("a"));

    assert_eq!(launcher.launches(), 1);
    assert_eq!(launcher.shutdowns(), 1);
}

#[tokio::test]
async fn failed_agent_install_keeps_reported_record() {
    let script = Arc::new(Script {
        fail_install: true,
        healthy_after: 1,
        ..Default::default()
    });
    let (store, launcher, driver_id) = setup(DriverCategory::Machine, script.clone()).await;

    let err = sequencer(&store, &launcher, fast_options(), CancellationToken::new())
        .create_machine(driver_id, ProvisionRequest::new("db-1"))
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(LifecyclePhase::AgentInstalled));
    assert_eq!(err.operation(), Some("install machine robot"));
    assert!(err.to_string().contains("install machine robot"));
    assert!(err.to_string().contains("agent package unavailable"));

    let machines = store.list_machines().await.unwrap();
    assert_eq!(machines.len(), 1, "reported record must not be retracted");
    match &machines[0].status {
        RecordStatus::Failed { phase, reason } => {
            assert_eq!(phase, "agent_installed");
            assert!(reason.contains("install machine robot"));
        }
        other => panic!("expected Failed status, got {other:?}"),
    }

    assert!(!script.calls().contains(&"health_check".to_string()));
    assert_eq!(launcher.shutdowns(), 1);
}

#[tokio::test]
async fn failed_chain_install_names_install_chain() {
    let script = Arc::new(Script {
        fail_install: true,
        ..Default::default()
    });
    let (store, launcher, driver_id) = setup(DriverCategory::Chain, script).await;

    let err = sequencer(&store, &launcher, fast_options(), CancellationToken::new())
        .create_chain(driver_id, ProvisionRequest::new("ledger"))
        .await
        .unwrap_err();

    assert_eq!(err.operation(), Some("install chain"));
    let chains = store.list_chains().await.unwrap();
    assert_eq!(chains.len(), 1);
    assert!(matches!(chains[0].status, RecordStatus::Failed { .. }));
    assert_eq!(launcher.shutdowns(), 1);
}

#[tokio::test]
async fn chain_sequence_completes() {
    let script = Arc::new(Script {
        healthy_after: 1,
        ..Default::default()
    });
    let (store, launcher, driver_id) = setup(DriverCategory::Chain, script).await;

    let outcome = sequencer(&store, &launcher, fast_options(), CancellationToken::new())
        .create_chain(driver_id, ProvisionRequest::new("ledger"))
        .await
        .unwrap();

    assert_eq!(outcome.phases.len(), 6);
    let chain = store.get_chain(outcome.record_id).await.unwrap();
    assert_eq!(chain.status, RecordStatus::Ready);
    assert_eq!(launcher.shutdowns(), 1);
}

#[tokio::test]
async fn category_mismatch_rejected_before_launch() {
    let (store, launcher, driver_id) =
        setup(DriverCategory::Chain, Arc::new(Script::default())).await;

    let err = sequencer(&store, &launcher, fast_options(), CancellationToken::new())
        .create_machine(driver_id, ProvisionRequest::new("m"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::CategoryMismatch {
            expected: DriverCategory::Machine,
            actual: DriverCategory::Chain,
            ..
        }
    ));
    assert!(err.is_config());
    assert_eq!(launcher.launches(), 0);
    assert!(store.list_machines().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_driver_fails_in_init() {
    let (store, launcher, _) = setup(DriverCategory::Machine, Arc::new(Script::default())).await;

    let err = sequencer(&store, &launcher, fast_options(), CancellationToken::new())
        .create_machine(999, ProvisionRequest::new("m"))
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(LifecyclePhase::Init));
    assert!(matches!(
        err,
        ProvisionError::Phase {
            source: PhaseFailure::Store(StoreError::DriverNotFound { id: 999 }),
            ..
        }
    ));
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn health_check_polls_until_healthy() {
    let script = Arc::new(Script {
        healthy_after: 3,
        ..Default::default()
    });
    let (store, launcher, driver_id) = setup(DriverCategory::Machine, script.clone()).await;

    sequencer(&store, &launcher, fast_options(), CancellationToken::new())
        .create_machine(driver_id, ProvisionRequest::new("slow-boot"))
        .await
        .unwrap();

    let polls = script
        .calls()
        .iter()
        .filter(|c| c.as_str() == "health_check")
        .count();
    assert_eq!(polls, 3);
}

#[tokio::test]
async fn health_poll_that_times_out_counts_as_unhealthy() {
    let script = Arc::new(Script {
        healthy_after: 1,
        slow_first_health: Some(Duration::from_millis(500)),
        ..Default::default()
    });
    let (store, launcher, driver_id) = setup(DriverCategory::Machine, script.clone()).await;
    let options = SequencerOptions {
        health_call_timeout: Duration::from_millis(200),
        ..fast_options()
    };

    let outcome = sequencer(&store, &launcher, options, CancellationToken::new())
        .create_machine(driver_id, ProvisionRequest::new("sluggish"))
        .await
        .unwrap();

    assert_eq!(outcome.phases, LifecyclePhase::ALL.to_vec());
    assert_eq!(
        script.calls(),
        vec!["init", "create", "install", "health_check", "health_check", "done"]
    );
    assert_eq!(launcher.shutdowns(), 1);
}

#[tokio::test]
async fn health_check_gives_up_after_attempts() {
    let script = Arc::new(Script {
        healthy_after: 100,
        ..Default::default()
    });
    let (store, launcher, driver_id) = setup(DriverCategory::Machine, script).await;
    let options = SequencerOptions {
        health_attempts: 2,
        ..fast_options()
    };

    let err = sequencer(&store, &launcher, options, CancellationToken::new())
        .create_machine(driver_id, ProvisionRequest::new("never"))
        .await
        .unwrap_err();

    match err {
        ProvisionError::Phase {
            phase: LifecyclePhase::HealthChecked,
            source: PhaseFailure::Unhealthy { attempts, message },
            ..
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(message, "attempt 2");
        }
        other => panic!("expected Unhealthy, got {other:?}"),
    }
    assert_eq!(launcher.shutdowns(), 1);
}

#[tokio::test]
async fn cancellation_aborts_in_flight_phase() {
    let script = Arc::new(Script {
        hang_create: true,
        ..Default::default()
    });
    let (store, launcher, driver_id) = setup(DriverCategory::Machine, script).await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        sequencer(&store, &launcher, fast_options(), cancel)
            .create_machine(driver_id, ProvisionRequest::new("hung")),
    )
    .await
    .expect("cancellation must end the sequence")
    .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.phase(), Some(LifecyclePhase::Created));
    assert_eq!(launcher.shutdowns(), 1);

    let machines = store.list_machines().await.unwrap();
    assert!(matches!(machines[0].status, RecordStatus::Failed { .. }));
}
