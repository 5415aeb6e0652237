//! TCP bootstrap for remoting connections.
//!
//! Every socket starts with a handshake: the 36-character connection id
//! followed by a 4-byte type tag (`comm` or `data`). Two sockets with the
//! same id form one connection.
//!
//! - [`connect`] dials the host and serves exactly one connection.
//! - [`Agent`] listens, pairs incoming sockets by id and serves every
//!   completed pair on its own task.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::communicator::RemoteCommunicator;
use crate::registry::DataSourceRegistry;

/// Default listen address in agent mode.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:56145";

/// Maximum time to receive the handshake of a new socket.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum time a socket waits for its counterpart.
const PAIR_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECTION_ID_LENGTH: usize = 36;

/// Which of the two sockets a handshake announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Comm,
    Data,
}

impl ChannelKind {
    pub fn tag(&self) -> &'static [u8; 4] {
        match self {
            ChannelKind::Comm => b"comm",
            ChannelKind::Data => b"data",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"comm" => Some(ChannelKind::Comm),
            b"data" => Some(ChannelKind::Data),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Comm => f.write_str("comm"),
            ChannelKind::Data => f.write_str("data"),
        }
    }
}

/// Send the handshake for one socket.
pub async fn write_handshake(
    stream: &mut TcpStream,
    connection_id: Uuid,
    kind: ChannelKind,
) -> Result<()> {
    let mut handshake = connection_id.hyphenated().to_string().into_bytes();
    handshake.extend_from_slice(kind.tag());

    stream
        .write_all(&handshake)
        .await
        .context("Failed to send handshake")?;
    stream.flush().await.context("Failed to flush handshake")?;
    Ok(())
}

/// Receive the handshake of one socket.
pub async fn read_handshake(stream: &mut TcpStream) -> Result<(Uuid, ChannelKind)> {
    let mut id = [0u8; CONNECTION_ID_LENGTH];
    stream
        .read_exact(&mut id)
        .await
        .context("Failed to read connection id")?;

    let id = std::str::from_utf8(&id).context("Connection id is not valid UTF-8")?;
    let id = Uuid::parse_str(id).with_context(|| format!("Invalid connection id '{}'", id))?;

    let mut tag = [0u8; 4];
    stream
        .read_exact(&mut tag)
        .await
        .context("Failed to read communication type")?;

    let Some(kind) = ChannelKind::from_tag(&tag) else {
        bail!(
            "Unknown communication type '{}'",
            String::from_utf8_lossy(&tag)
        );
    };

    Ok((id, kind))
}

/// Dial the host, then serve one connection until it closes.
pub async fn connect(
    address: &str,
    connection_id: Uuid,
    registry: DataSourceRegistry,
) -> Result<()> {
    let comm = open(address, connection_id, ChannelKind::Comm).await?;
    let data = open(address, connection_id, ChannelKind::Data).await?;

    info!("Connected to {} (connection ID {})", address, connection_id);

    let mut communicator = RemoteCommunicator::from_streams(comm, data, registry);
    communicator.run().await.context("Remoting failed")
}

async fn open(address: &str, connection_id: Uuid, kind: ChannelKind) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("Failed to connect {} socket to {}", kind, address))?;
    stream.set_nodelay(true)?;

    write_handshake(&mut stream, connection_id, kind).await?;
    Ok(stream)
}

/// One half-open connection waiting for its counterpart.
struct PendingPair {
    comm: Option<TcpStream>,
    data: Option<TcpStream>,
    created: Instant,
}

impl PendingPair {
    fn new() -> Self {
        Self {
            comm: None,
            data: None,
            created: Instant::now(),
        }
    }
}

type PendingPairs = Arc<Mutex<HashMap<Uuid, PendingPair>>>;

/// Listener that pairs `comm`/`data` sockets and serves each pair.
pub struct Agent {
    listener: TcpListener,
    registry: DataSourceRegistry,
    pending: PendingPairs,
}

impl Agent {
    pub async fn bind(address: &str, registry: DataSourceRegistry) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to listen on {}", address))?;

        Ok(Self {
            listener,
            registry,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients forever.
    pub async fn serve(self) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("Failed to accept client")?;

            let pending = Arc::clone(&self.pending);
            let registry = self.registry.clone();

            tokio::spawn(async move {
                handle_client(stream, peer, pending, registry).await;
            });
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    pending: PendingPairs,
    registry: DataSourceRegistry,
) {
    let (id, kind) = match timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream)).await {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(e)) => {
            warn!("Rejecting client {}: {:#}", peer, e);
            return;
        }
        Err(_) => {
            warn!("Rejecting client {}: handshake timed out", peer);
            return;
        }
    };

    debug!(
        "Accept TCP client with connection ID {} and communication type {}",
        id, kind
    );

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let Some((comm, data)) = insert_pending(&pending, id, kind, stream) else {
        tokio::spawn(expire_pending(pending, id));
        return;
    };

    info!("Accept remoting client with connection ID {}", id);

    let mut communicator = RemoteCommunicator::from_streams(comm, data, registry);
    match communicator.run().await {
        Ok(()) => info!("Connection {} closed", id),
        Err(e) => warn!("Connection {} failed: {}", id, e),
    }
}

/// Store `stream`; return the complete pair once both halves are present.
///
/// A newer socket replaces (and closes) an older one of the same kind and
/// restarts the pairing deadline.
fn insert_pending(
    pending: &PendingPairs,
    id: Uuid,
    kind: ChannelKind,
    stream: TcpStream,
) -> Option<(TcpStream, TcpStream)> {
    let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
    let pair = pending.entry(id).or_insert_with(PendingPair::new);

    let slot = match kind {
        ChannelKind::Comm => &mut pair.comm,
        ChannelKind::Data => &mut pair.data,
    };
    if slot.replace(stream).is_some() {
        debug!("Replacing {} socket of connection {}", kind, id);
        pair.created = Instant::now();
    }

    if pair.comm.is_none() || pair.data.is_none() {
        return None;
    }

    let pair = pending.remove(&id)?;
    Some((pair.comm?, pair.data?))
}

/// Drop an incomplete pair once it outlived `PAIR_TIMEOUT`.
async fn expire_pending(pending: PendingPairs, id: Uuid) {
    tokio::time::sleep(PAIR_TIMEOUT).await;

    let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
    let expired = pending
        .get(&id)
        .is_some_and(|pair| pair.created.elapsed() >= PAIR_TIMEOUT);

    if expired {
        debug!("Dropping incomplete connection {}", id);
        pending.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{read_frame, write_frame};
    use crate::sample::SampleDataSource;
    use serde_json::{json, Value};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn registry() -> DataSourceRegistry {
        DataSourceRegistry::new().register::<SampleDataSource>("sample")
    }

    async fn api_version(comm: &mut TcpStream) -> Value {
        write_frame(
            comm,
            br#"{"jsonrpc":"2.0","id":1,"method":"getApiVersion","params":[]}"#,
        )
        .await
        .unwrap();
        let frame = timeout(TEST_TIMEOUT, read_frame(comm))
            .await
            .expect("Test timed out")
            .unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    #[test]
    fn test_channel_kind_tags() {
        assert_eq!(ChannelKind::from_tag(b"comm"), Some(ChannelKind::Comm));
        assert_eq!(ChannelKind::from_tag(b"data"), Some(ChannelKind::Data));
        assert_eq!(ChannelKind::from_tag(b"ctrl"), None);
        assert_eq!(ChannelKind::Data.tag(), b"data");
    }

    #[tokio::test]
    async fn test_agent_pairs_sockets() {
        let agent = Agent::bind("127.0.0.1:0", registry()).await.unwrap();
        let address = agent.local_addr().unwrap();
        tokio::spawn(agent.serve());

        let id = Uuid::new_v4();

        // Data first, then comm
        let mut data = TcpStream::connect(address).await.unwrap();
        write_handshake(&mut data, id, ChannelKind::Data).await.unwrap();
        let mut comm = TcpStream::connect(address).await.unwrap();
        write_handshake(&mut comm, id, ChannelKind::Comm).await.unwrap();

        let response = api_version(&mut comm).await;
        assert_eq!(response, json!({"jsonrpc": "2.0", "id": 1, "result": {"apiVersion": 1}}));
    }

    async fn socket_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let address = listener.local_addr().unwrap();
        let local = TcpStream::connect(address).await.unwrap();
        let (remote, _) = listener.accept().await.unwrap();
        (local, remote)
    }

    #[tokio::test]
    async fn test_replaced_socket_restarts_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pending: PendingPairs = Arc::new(Mutex::new(HashMap::new()));
        let id = Uuid::new_v4();

        let (mut old_peer, old) = socket_pair(&listener).await;
        assert!(insert_pending(&pending, id, ChannelKind::Comm, old).is_none());
        let first = pending.lock().unwrap()[&id].created;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_new_peer, new) = socket_pair(&listener).await;
        assert!(insert_pending(&pending, id, ChannelKind::Comm, new).is_none());
        let second = pending.lock().unwrap()[&id].created;
        assert!(second >= first + Duration::from_millis(20));

        // The replaced socket was closed
        let mut buf = [0u8; 1];
        let read = timeout(TEST_TIMEOUT, old_peer.read(&mut buf))
            .await
            .expect("Test timed out");
        assert!(matches!(read, Ok(0) | Err(_)));

        let (_data_peer, data) = socket_pair(&listener).await;
        assert!(insert_pending(&pending, id, ChannelKind::Data, data).is_some());
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agent_rejects_unknown_type() {
        let agent = Agent::bind("127.0.0.1:0", registry()).await.unwrap();
        let address = agent.local_addr().unwrap();
        tokio::spawn(agent.serve());

        let mut stream = TcpStream::connect(address).await.unwrap();
        let mut handshake = Uuid::new_v4().hyphenated().to_string().into_bytes();
        handshake.extend_from_slice(b"ctrl");
        stream.write_all(&handshake).await.unwrap();

        // The agent closes the socket
        let mut buf = [0u8; 1];
        let read = timeout(TEST_TIMEOUT, stream.read(&mut buf))
            .await
            .expect("Test timed out");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_connect_mode_serves_until_host_closes() {
        let host = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = host.local_addr().unwrap().to_string();
        let id = Uuid::new_v4();

        let client = tokio::spawn(async move { connect(&address, id, registry()).await });

        let (mut comm, _) = host.accept().await.unwrap();
        assert_eq!(read_handshake(&mut comm).await.unwrap(), (id, ChannelKind::Comm));
        let (mut data, _) = host.accept().await.unwrap();
        assert_eq!(read_handshake(&mut data).await.unwrap(), (id, ChannelKind::Data));

        let response = api_version(&mut comm).await;
        assert_eq!(response["result"], json!({"apiVersion": 1}));

        drop(comm);
        drop(data);

        let result = timeout(TEST_TIMEOUT, client)
            .await
            .expect("Test timed out")
            .unwrap();
        assert!(result.is_ok(), "connect failed: {:?}", result.err());
    }
}
