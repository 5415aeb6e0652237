//! The remote communication engine.
//!
//! One [`RemoteCommunicator`] serves one host connection (a control socket and
//! a data socket). It processes one request at a time to completion,
//! including any nested `readData` round trips, before reading the next
//! frame.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::dispatch::{Completion, Dispatcher};
use crate::error::{MethodError, RemotingError, Result};
use crate::ipc::{read_frame, BoxedReader, BoxedWriter, ChannelWriter};
use crate::protocol::{
    parse_request, JsonRpcResponse, ProtocolViolation, ResponseOutcome, JSONRPC_VERSION,
};
use crate::registry::DataSourceRegistry;

/// Time of the last observed activity on a connection.
///
/// Clones share the same timestamp, so a supervisor can poll it while the
/// communicator is running.
#[derive(Debug, Clone)]
pub struct Watchdog {
    last: Arc<Mutex<Instant>>,
}

impl Watchdog {
    fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn touch(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    /// Time since the last communication.
    pub fn last_communication(&self) -> Duration {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }
}

/// Plugin-side endpoint of one host connection.
pub struct RemoteCommunicator {
    comm_reader: BoxedReader,
    writer: ChannelWriter,
    data_reader: BoxedReader,
    data_writer: BoxedWriter,
    dispatcher: Dispatcher,
    watchdog: Watchdog,
}

impl RemoteCommunicator {
    /// Create a communicator from the split halves of both sockets.
    pub fn new<CR, CW, DR, DW>(
        comm_reader: CR,
        comm_writer: CW,
        data_reader: DR,
        data_writer: DW,
        registry: DataSourceRegistry,
    ) -> Self
    where
        CR: AsyncRead + Unpin + Send + 'static,
        CW: AsyncWrite + Unpin + Send + 'static,
        DR: AsyncRead + Unpin + Send + 'static,
        DW: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = ChannelWriter::new(comm_writer);

        Self {
            comm_reader: Box::new(comm_reader),
            dispatcher: Dispatcher::new(registry, writer.clone()),
            writer,
            data_reader: Box::new(data_reader),
            data_writer: Box::new(data_writer),
            watchdog: Watchdog::new(),
        }
    }

    /// Create a communicator from two bidirectional streams.
    pub fn from_streams<C, D>(comm: C, data: D, registry: DataSourceRegistry) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (comm_reader, comm_writer) = tokio::io::split(comm);
        let (data_reader, data_writer) = tokio::io::split(data);
        Self::new(comm_reader, comm_writer, data_reader, data_writer, registry)
    }

    /// Time since the last communication with the host.
    pub fn last_communication(&self) -> Duration {
        self.watchdog.last_communication()
    }

    /// Handle for polling liveness from another task.
    pub fn watchdog(&self) -> Watchdog {
        self.watchdog.clone()
    }

    /// Serve requests until the host closes either socket.
    ///
    /// Returns `Ok(())` on peer shutdown, without sending a response for the
    /// request in flight. Any other transport failure is returned as an error.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.process_next().await {
                Ok(()) => {}
                Err(RemotingError::ConnectionClosed) => {
                    info!("Host closed the connection, shutting down");
                    return Ok(());
                }
                Err(e) => {
                    error!("Remoting failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Receive one frame, dispatch it and send the response.
    async fn process_next(&mut self) -> Result<()> {
        let frame = read_frame(&mut self.comm_reader).await?;
        self.watchdog.touch();

        let request = match parse_request(&frame) {
            Ok(request) => request,
            Err(ProtocolViolation {
                id: Some(id),
                message,
            }) => {
                warn!("Protocol violation (id: {}): {}", id, message);
                let error = MethodError::Protocol(message).to_json_rpc();
                return self.writer.send(&JsonRpcResponse::failure(id, error)).await;
            }
            Err(ProtocolViolation { id: None, message }) => {
                warn!("Dropping frame: {}", message);
                return Ok(());
            }
        };

        let (outcome, buffers) = match self
            .dispatcher
            .dispatch(&request, &mut self.data_reader)
            .await
        {
            Ok(Completion { result, buffers }) => (ResponseOutcome::Result(result), buffers),
            Err(MethodError::Transport(e)) => return Err(e),
            Err(e) => {
                warn!("{} (id: {}) failed: {}", request.method, request.id, e);
                (ResponseOutcome::Error(e.to_json_rpc()), None)
            }
        };

        let response = JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: request.id,
            outcome,
        };
        self.writer.send(&response).await?;

        if let Some(buffers) = buffers {
            debug!("Sending {} bytes of sample data", buffers.len());
            buffers.send(&mut self.data_writer).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::write_frame;
    use serde_json::{json, Value};
    use tokio::io::duplex;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_watchdog_tracks_activity() {
        let (comm, mut host_comm) = duplex(4096);
        let (data, _host_data) = duplex(4096);
        let mut communicator =
            RemoteCommunicator::from_streams(comm, data, DataSourceRegistry::new());
        let watchdog = communicator.watchdog();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watchdog.last_communication() >= Duration::from_millis(50));

        let run = tokio::spawn(async move {
            let result = communicator.run().await;
            result.map(|_| communicator)
        });

        write_frame(
            &mut host_comm,
            br#"{"jsonrpc":"2.0","id":1,"method":"getApiVersion","params":[]}"#,
        )
        .await
        .unwrap();
        let frame = timeout(TEST_TIMEOUT, read_frame(&mut host_comm))
            .await
            .expect("Test timed out")
            .unwrap();
        let response: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(response, json!({"jsonrpc": "2.0", "id": 1, "result": {"apiVersion": 1}}));

        assert!(watchdog.last_communication() < Duration::from_millis(50));

        drop(host_comm);
        let communicator = timeout(TEST_TIMEOUT, run)
            .await
            .expect("Test timed out")
            .unwrap()
            .expect("run failed");
        assert!(communicator.last_communication() < TEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (comm, mut host_comm) = duplex(4096);
        let (data, _host_data) = duplex(4096);
        let mut communicator =
            RemoteCommunicator::from_streams(comm, data, DataSourceRegistry::new());

        let size = (crate::ipc::MAX_FRAME_SIZE as u32) + 1;
        tokio::io::AsyncWriteExt::write_all(&mut host_comm, &size.to_be_bytes())
            .await
            .unwrap();

        let result = timeout(TEST_TIMEOUT, communicator.run())
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(RemotingError::FrameTooLarge { .. })));
    }
}
