//! Driver client factory: typed clients over a plugin's RPC endpoint.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PluginError, PluginResult};
use crate::identity::PluginIdentity;
use crate::wire::{
    self, methods, Draft, HealthReply, HealthRequest, InitRequest, PhaseReply, RecordRequest,
    RpcRequest, RpcResponse,
};

/// Category of driver a plugin implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Machine,
    Chain,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Machine => "machine",
            DriverKind::Chain => "chain",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "machine" => Ok(DriverKind::Machine),
            "chain" => Ok(DriverKind::Chain),
            other => Err(format!("unknown driver category: {other}")),
        }
    }
}

struct Channel {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// A single request/response connection to a driver.
pub struct RpcConnection {
    address: String,
    channel: Mutex<Channel>,
    next_id: AtomicU64,
}

impl fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConnection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl RpcConnection {
    /// Dial `address`, giving up after `timeout`. No retry.
    pub async fn connect(address: &str, timeout: Duration) -> PluginResult<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(PluginError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(PluginError::ConnectTimeout {
                    address: address.to_string(),
                    timeout,
                })
            }
        };
        stream.set_nodelay(true).ok();
        let (read, writer) = stream.into_split();
        Ok(Self {
            address: address.to_string(),
            channel: Mutex::new(Channel {
                lines: BufReader::new(read).lines(),
                writer,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Invoke `method` and decode its result.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> PluginResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };

        let mut channel = self.channel.lock().await;
        debug!(address = %self.address, id, method, "driver call");
        wire::write_frame(&mut channel.writer, &request).await?;
        // Calls abandoned mid-flight (timed out, cancelled) leave their
        // replies queued ahead of ours; ids are monotonic, so skip them.
        let response = loop {
            let response: RpcResponse = wire::read_frame(&mut channel.lines)
                .await?
                .ok_or(PluginError::ConnectionClosed)?;
            if response.id >= id {
                break response;
            }
            debug!(address = %self.address, stale = response.id, id, "discarding stale reply");
        };
        drop(channel);

        if response.id != id {
            return Err(PluginError::Protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(fault) = response.error {
            return Err(PluginError::Remote {
                method: method.to_string(),
                message: fault.message,
            });
        }
        wire::from_params(method, response.result.unwrap_or(Value::Null))
    }
}

/// Remote surface of a machine driver.
#[derive(Debug, Clone)]
pub struct MachineDriverClient {
    conn: Arc<RpcConnection>,
}

impl MachineDriverClient {
    pub fn new(conn: Arc<RpcConnection>) -> Self {
        Self { conn }
    }

    pub async fn init(&self, request: &InitRequest) -> PluginResult<Draft> {
        self.conn.call(methods::MACHINE_INIT, request).await
    }

    pub async fn create(&self, request: &RecordRequest) -> PluginResult<PhaseReply> {
        self.conn.call(methods::MACHINE_CREATE, request).await
    }

    /// Install the provisioning agent ("robot") on the machine.
    pub async fn install_robot(&self, request: &RecordRequest) -> PluginResult<PhaseReply> {
        self.conn.call(methods::MACHINE_INSTALL_ROBOT, request).await
    }

    pub async fn health_check(&self, request: &HealthRequest) -> PluginResult<HealthReply> {
        self.conn.call(methods::MACHINE_HEALTH_CHECK, request).await
    }

    pub async fn done(&self, request: &RecordRequest) -> PluginResult<PhaseReply> {
        self.conn.call(methods::MACHINE_DONE, request).await
    }
}

/// Remote surface of a chain driver.
#[derive(Debug, Clone)]
pub struct ChainDriverClient {
    conn: Arc<RpcConnection>,
}

impl ChainDriverClient {
    pub fn new(conn: Arc<RpcConnection>) -> Self {
        Self { conn }
    }

    pub async fn init(&self, request: &InitRequest) -> PluginResult<Draft> {
        self.conn.call(methods::CHAIN_INIT, request).await
    }

    pub async fn create(&self, request: &RecordRequest) -> PluginResult<PhaseReply> {
        self.conn.call(methods::CHAIN_CREATE, request).await
    }

    pub async fn install(&self, request: &RecordRequest) -> PluginResult<PhaseReply> {
        self.conn.call(methods::CHAIN_INSTALL, request).await
    }

    pub async fn health_check(&self, request: &HealthRequest) -> PluginResult<HealthReply> {
        self.conn.call(methods::CHAIN_HEALTH_CHECK, request).await
    }

    pub async fn done(&self, request: &RecordRequest) -> PluginResult<PhaseReply> {
        self.conn.call(methods::CHAIN_DONE, request).await
    }
}

/// One client per driver category.
#[derive(Debug, Clone)]
pub enum DriverClient {
    Machine(MachineDriverClient),
    Chain(ChainDriverClient),
}

impl DriverClient {
    pub fn kind(&self) -> DriverKind {
        match self {
            DriverClient::Machine(_) => DriverKind::Machine,
            DriverClient::Chain(_) => DriverKind::Chain,
        }
    }

    pub fn as_machine(&self) -> PluginResult<&MachineDriverClient> {
        match self {
            DriverClient::Machine(client) => Ok(client),
            other => Err(PluginError::WrongDriverKind {
                expected: DriverKind::Machine.as_str(),
                actual: other.kind().as_str(),
            }),
        }
    }

    pub fn as_chain(&self) -> PluginResult<&ChainDriverClient> {
        match self {
            DriverClient::Chain(client) => Ok(client),
            other => Err(PluginError::WrongDriverKind {
                expected: DriverKind::Chain.as_str(),
                actual: other.kind().as_str(),
            }),
        }
    }
}

/// A live connection to one plugin, plus the typed client for its category.
#[derive(Debug)]
pub struct DriverSession {
    identity: PluginIdentity,
    conn: Arc<RpcConnection>,
    client: DriverClient,
}

impl DriverSession {
    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn address(&self) -> &str {
        self.conn.address()
    }

    pub fn client(&self) -> &DriverClient {
        &self.client
    }

    pub fn machine(&self) -> PluginResult<&MachineDriverClient> {
        self.client.as_machine()
    }

    pub fn chain(&self) -> PluginResult<&ChainDriverClient> {
        self.client.as_chain()
    }

    /// Ask the plugin to stop serving. It exits on its own shortly after.
    pub async fn exit(&self) -> PluginResult<()> {
        let _: PhaseReply = self.conn.call(methods::DRIVER_EXIT, &Value::Null).await?;
        Ok(())
    }
}

/// Connect to a validated plugin address and build the client for `kind`.
///
/// A failed connection is final for this attempt.
pub async fn open_session(
    address: &str,
    kind: DriverKind,
    identity: PluginIdentity,
    connect_timeout: Duration,
) -> PluginResult<DriverSession> {
    let conn = Arc::new(RpcConnection::connect(address, connect_timeout).await?);
    let client = match kind {
        DriverKind::Machine => DriverClient::Machine(MachineDriverClient::new(conn.clone())),
        DriverKind::Chain => DriverClient::Chain(ChainDriverClient::new(conn.clone())),
    };
    info!(plugin = %identity, address, kind = %kind, "driver session opened");
    Ok(DriverSession {
        identity,
        conn,
        client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("Machine".parse::<DriverKind>().unwrap(), DriverKind::Machine);
        assert_eq!("chain".parse::<DriverKind>().unwrap(), DriverKind::Chain);
        assert!("router".parse::<DriverKind>().is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = open_session(
            &addr,
            DriverKind::Machine,
            PluginIdentity::new("shell", "1", 1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PluginError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_wrong_category_accessor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let session = open_session(
            &addr,
            DriverKind::Chain,
            PluginIdentity::new("fabric", "2", 2),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(session.chain().is_ok());
        assert!(matches!(
            session.machine(),
            Err(PluginError::WrongDriverKind {
                expected: "machine",
                actual: "chain"
            })
        ));
    }

    #[tokio::test]
    async fn test_remote_fault_and_mismatched_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.split();
            let mut lines = BufReader::new(read).lines();

            let first: RpcRequest = wire::read_frame(&mut lines).await.unwrap().unwrap();
            wire::write_frame(&mut write, &RpcResponse::fault(first.id, "no capacity"))
                .await
                .unwrap();

            let _second: RpcRequest = wire::read_frame(&mut lines).await.unwrap().unwrap();
            wire::write_frame(&mut write, &RpcResponse::ok(999, Value::Null))
                .await
                .unwrap();
            write.shutdown().await.ok();
        });

        let conn = RpcConnection::connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        let client = MachineDriverClient::new(Arc::new(conn));
        let request = RecordRequest {
            record_id: 1,
            ..Default::default()
        };

        match client.create(&request).await.unwrap_err() {
            PluginError::Remote { method, message } => {
                assert_eq!(method, methods::MACHINE_CREATE);
                assert_eq!(message, "no capacity");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
        assert!(matches!(
            client.install_robot(&request).await.unwrap_err(),
            PluginError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_late_reply_to_abandoned_call_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.split();
            let mut lines = BufReader::new(read).lines();

            let slow: RpcRequest = wire::read_frame(&mut lines).await.unwrap().unwrap();
            let next: RpcRequest = wire::read_frame(&mut lines).await.unwrap().unwrap();
            let late = HealthReply {
                healthy: false,
                message: "late".into(),
            };
            let fresh = HealthReply {
                healthy: true,
                message: "fresh".into(),
            };
            for (id, reply) in [(slow.id, late), (next.id, fresh)] {
                let response = RpcResponse::ok(id, serde_json::to_value(reply).unwrap());
                wire::write_frame(&mut write, &response).await.unwrap();
            }
        });

        let conn = RpcConnection::connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        let client = MachineDriverClient::new(Arc::new(conn));
        let request = HealthRequest {
            record_id: 1,
            attempt: 1,
            ..Default::default()
        };

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), client.health_check(&request)).await;
        assert!(abandoned.is_err());

        let reply = client
            .health_check(&HealthRequest {
                attempt: 2,
                ..request
            })
            .await
            .unwrap();
        assert!(reply.healthy);
        assert_eq!(reply.message, "fresh");
    }
}
