//! Plugin side of the protocol: implement a driver trait, hand it to
//! [`serve_plugin`], and the process speaks the handshake and RPC frames.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::DriverKind;
use crate::error::{PluginError, PluginResult};
use crate::signals::wait_for_shutdown_signal;
use crate::wire::{
    self, methods, Draft, HealthReply, HealthRequest, InitRequest, PhaseReply, RecordRequest,
    RpcRequest, RpcResponse,
};

#[async_trait]
pub trait MachineDriver: Send + Sync {
    async fn init(&self, request: InitRequest) -> PluginResult<Draft>;
    async fn create(&self, request: RecordRequest) -> PluginResult<PhaseReply>;
    async fn install_robot(&self, request: RecordRequest) -> PluginResult<PhaseReply>;
    async fn health_check(&self, request: HealthRequest) -> PluginResult<HealthReply>;
    async fn done(&self, request: RecordRequest) -> PluginResult<PhaseReply>;
}

#[async_trait]
pub trait ChainDriver: Send + Sync {
    async fn init(&self, request: InitRequest) -> PluginResult<Draft>;
    async fn create(&self, request: RecordRequest) -> PluginResult<PhaseReply>;
    async fn install(&self, request: RecordRequest) -> PluginResult<PhaseReply>;
    async fn health_check(&self, request: HealthRequest) -> PluginResult<HealthReply>;
    async fn done(&self, request: RecordRequest) -> PluginResult<PhaseReply>;
}

/// The driver a plugin process serves.
#[derive(Clone)]
pub enum DriverService {
    Machine(Arc<dyn MachineDriver>),
    Chain(Arc<dyn ChainDriver>),
}

impl std::fmt::Debug for DriverService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DriverService").field(&self.kind()).finish()
    }
}

impl DriverService {
    pub fn kind(&self) -> DriverKind {
        match self {
            DriverService::Machine(_) => DriverKind::Machine,
            DriverService::Chain(_) => DriverKind::Chain,
        }
    }

    /// Route one call to the driver. `driver.exit` is handled by the server.
    pub async fn dispatch(&self, method: &str, params: Value) -> PluginResult<Value> {
        match (self, method) {
            (DriverService::Machine(d), methods::MACHINE_INIT) => {
                reply(d.init(wire::from_params(method, params)?).await?)
            }
            (DriverService::Machine(d), methods::MACHINE_CREATE) => {
                reply(d.create(wire::from_params(method, params)?).await?)
            }
            (DriverService::Machine(d), methods::MACHINE_INSTALL_ROBOT) => {
                reply(d.install_robot(wire::from_params(method, params)?).await?)
            }
            (DriverService::Machine(d), methods::MACHINE_HEALTH_CHECK) => {
                reply(d.health_check(wire::from_params(method, params)?).await?)
            }
            (DriverService::Machine(d), methods::MACHINE_DONE) => {
                reply(d.done(wire::from_params(method, params)?).await?)
            }
            (DriverService::Chain(d), methods::CHAIN_INIT) => {
                reply(d.init(wire::from_params(method, params)?).await?)
            }
            (DriverService::Chain(d), methods::CHAIN_CREATE) => {
                reply(d.create(wire::from_params(method, params)?).await?)
            }
            (DriverService::Chain(d), methods::CHAIN_INSTALL) => {
                reply(d.install(wire::from_params(method, params)?).await?)
            }
            (DriverService::Chain(d), methods::CHAIN_HEALTH_CHECK) => {
                reply(d.health_check(wire::from_params(method, params)?).await?)
            }
            (DriverService::Chain(d), methods::CHAIN_DONE) => {
                reply(d.done(wire::from_params(method, params)?).await?)
            }
            (service, other) => Err(PluginError::Protocol(format!(
                "{} driver does not implement {other}",
                service.kind()
            ))),
        }
    }
}

fn reply<T: Serialize>(value: T) -> PluginResult<Value> {
    wire::to_params(&value)
}

/// Run a plugin process: bind a loopback port, print the address as the
/// first line of stdout, then serve until `driver.exit` or a termination
/// signal.
pub async fn serve_plugin(service: DriverService) -> PluginResult<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{address}\n").as_bytes()).await?;
    stdout.flush().await?;
    info!(address = %address, kind = %service.kind(), "plugin listening");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => info!("termination signal received"),
            Err(err) => warn!(error = %err, "cannot install signal handlers"),
        }
        on_signal.cancel();
    });

    serve_listener(listener, service, shutdown).await
}

/// Accept connections on `listener` until `shutdown` fires.
///
/// `driver.exit` from any connection fires `shutdown` after its reply has
/// been written.
pub async fn serve_listener(
    listener: TcpListener,
    service: DriverService,
    shutdown: CancellationToken,
) -> PluginResult<()> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => None,
            accepted = listener.accept() => Some(accepted),
        };
        match accepted {
            None => break,
            Some(Ok((stream, peer))) => {
                debug!(peer = %peer, "driver connection accepted");
                let service = service.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, service, shutdown).await {
                        warn!(error = %err, "driver connection ended with error");
                    }
                });
            }
            Some(Err(err)) => {
                warn!(error = %err, "accept failed");
            }
        }
    }
    info!("plugin stopped serving");
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    service: DriverService,
    shutdown: CancellationToken,
) -> PluginResult<()> {
    let (read, mut write) = stream.split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            frame = wire::read_frame::<_, RpcRequest>(&mut lines) => Some(frame),
        };
        let request = match next {
            None => return Ok(()),
            Some(frame) => match frame? {
                Some(request) => request,
                None => return Ok(()),
            },
        };

        if request.method == methods::DRIVER_EXIT {
            info!("driver exit requested");
            let ack = reply(PhaseReply::default())?;
            wire::write_frame(&mut write, &RpcResponse::ok(request.id, ack)).await?;
            shutdown.cancel();
            return Ok(());
        }

        let response = match service.dispatch(&request.method, request.params).await {
            Ok(result) => RpcResponse::ok(request.id, result),
            Err(err) => {
                warn!(method = %request.method, error = %err, "driver call failed");
                RpcResponse::fault(request.id, err.to_string())
            }
        };
        wire::write_frame(&mut write, &response).await?;
    }
}
