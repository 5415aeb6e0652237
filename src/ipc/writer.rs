//! Serialized access to the control socket.
//!
//! The response path, the remote logger and the nested `readData` requester
//! all write to the same socket. Every send holds the mutex guard for exactly
//! one encode-and-frame operation, so frames from logically concurrent
//! producers never interleave on the wire.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::ipc::framing::write_frame;

/// Type-erased socket write half.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Handle for sending framed JSON messages over the control socket.
///
/// Cheaply cloneable; all clones share one underlying socket.
#[derive(Clone)]
pub struct ChannelWriter {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl ChannelWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Encode `message` as JSON and send it as one frame.
    ///
    /// Encoding happens before the lock is taken; the guard is dropped on
    /// every return path.
    pub async fn send<T>(&self, message: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message)?;

        let mut writer = self.inner.lock().await;
        write_frame(&mut *writer, &payload).await
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::framing::read_frame;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_send_frames_json() {
        let (client, mut server) = duplex(1024);
        let writer = ChannelWriter::new(client);

        writer
            .send(&json!({"jsonrpc": "2.0", "method": "log", "params": ["Information", "hi"]}))
            .await
            .expect("Send failed");

        let frame = timeout(TEST_TIMEOUT, read_frame(&mut server))
            .await
            .expect("Test timed out")
            .expect("Read failed");
        let value: Value = serde_json::from_slice(&frame).expect("Invalid JSON");

        assert_eq!(value["method"], "log");
        assert_eq!(value["params"][1], "hi");
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_interleave() {
        // Small pipe capacity forces writers to suspend mid-frame
        let (client, mut server) = duplex(64);
        let writer = ChannelWriter::new(client);

        let producers = 8;
        let messages_per_producer = 25;
        let mut handles = Vec::new();

        for producer in 0..producers {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..messages_per_producer {
                    let padding = "x".repeat(100 + producer * 7);
                    writer
                        .send(&json!({
                            "jsonrpc": "2.0",
                            "method": "log",
                            "params": [format!("{producer}:{n}"), padding]
                        }))
                        .await
                        .expect("Send failed");
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..producers * messages_per_producer {
                let frame = read_frame(&mut server).await.expect("Read failed");
                let value: Value = serde_json::from_slice(&frame).expect("Corrupted frame");
                seen.push(value["params"][0].as_str().unwrap().to_string());
            }
            seen
        });

        for handle in handles {
            handle.await.expect("Producer panicked");
        }

        let seen = timeout(TEST_TIMEOUT, reader)
            .await
            .expect("Test timed out")
            .expect("Reader panicked");

        assert_eq!(seen.len(), producers * messages_per_producer);

        // Per-producer FIFO order is preserved
        for producer in 0..producers {
            let order: Vec<usize> = seen
                .iter()
                .filter_map(|tag| {
                    let (p, n) = tag.split_once(':')?;
                    (p.parse::<usize>().ok()? == producer).then(|| n.parse().unwrap())
                })
                .collect();
            assert_eq!(order, (0..messages_per_producer).collect::<Vec<_>>());
        }
    }
}
