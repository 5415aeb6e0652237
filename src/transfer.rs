//! Bulk sample delivery for `readSingle`.
//!
//! # Sequence
//!
//! ```text
//! host                         bridge                         plugin
//!  │ readSingle (control) ───►  │ allocate data/status buffers    │
//!  │                            │ read(...) ────────────────────► │
//!  │ ◄─── readData (control)    │ ◄──── read_data(path, b, e) ─── │
//!  │ [len][f64...] (data) ───►  │ ────── samples ───────────────► │
//!  │                            │ ◄───────────── Ok ───────────── │
//!  │ ◄─── response (control)    │                                 │
//!  │ ◄─── data ++ status (data, no prefix)                        │
//! ```
//!
//! The final transmission carries no length prefix: the host derives both
//! lengths from the time range and representation it sent.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::data_source::{DataSource, Logger, ReadDataHandler};
use crate::error::{MethodError, RemotingError};
use crate::ipc::{read_frame, BoxedReader, BoxedWriter, ChannelWriter};
use crate::models::{decode_f64, CatalogItem, LogLevel, ReadRequest};
use crate::protocol::{format_timestamp, make_notification, Params};

/// Buffers produced by one `readSingle`, owned by that request only.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBuffers {
    pub data: Vec<u8>,
    pub status: Vec<u8>,
}

impl ReadBuffers {
    pub fn len(&self) -> usize {
        self.data.len() + self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write data then status to the data socket, unframed.
    pub async fn send(&self, data_writer: &mut BoxedWriter) -> Result<(), RemotingError> {
        data_writer.write_all(&self.data).await?;
        data_writer.write_all(&self.status).await?;
        data_writer.flush().await?;
        Ok(())
    }
}

/// Read-data callback backed by the host.
///
/// Requests go out on the control socket through the shared writer; replies
/// come back length-prefixed on the data socket. Any transport failure leaves
/// the sockets unusable, so the first one is kept and ends the connection once
/// the plugin returns.
pub struct RemoteReadData<'a> {
    writer: ChannelWriter,
    data_reader: &'a mut BoxedReader,
    logger: Arc<dyn Logger>,
    failure: Option<RemotingError>,
}

impl<'a> RemoteReadData<'a> {
    pub fn new(
        writer: ChannelWriter,
        data_reader: &'a mut BoxedReader,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            writer,
            data_reader,
            logger,
            failure: None,
        }
    }

    /// First transport failure seen by any callback of this read.
    pub fn failure(&self) -> Option<&RemotingError> {
        self.failure.as_ref()
    }

    pub fn into_failure(self) -> Option<RemotingError> {
        self.failure
    }

    async fn fetch(
        &mut self,
        resource_path: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<u8>, RemotingError> {
        let request = make_notification(
            "readData",
            vec![
                json!(resource_path),
                json!(format_timestamp(&begin)),
                json!(format_timestamp(&end)),
            ],
        );
        self.writer.send(&request).await?;

        read_frame(&mut *self.data_reader).await
    }
}

/// Copy of a transport error for the plugin; the original stays with the handler.
fn report(error: &RemotingError) -> RemotingError {
    match error {
        RemotingError::ConnectionClosed => RemotingError::ConnectionClosed,
        RemotingError::FrameTooLarge { size, max } => RemotingError::FrameTooLarge {
            size: *size,
            max: *max,
        },
        RemotingError::Io(e) => RemotingError::Io(std::io::Error::new(e.kind(), e.to_string())),
        other => RemotingError::Protocol(other.to_string()),
    }
}

#[async_trait]
impl ReadDataHandler for RemoteReadData<'_> {
    async fn read_data(
        &mut self,
        resource_path: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, RemotingError> {
        if let Some(failure) = &self.failure {
            return Err(report(failure));
        }

        self.logger
            .log(
                LogLevel::Debug,
                &format!("Read resource path {} from Nexus", resource_path),
            )
            .await;
        debug!("readData {} [{}, {})", resource_path, begin, end);

        let bytes = match self.fetch(resource_path, begin, end).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let reported = report(&e);
                self.failure = Some(e);
                return Err(reported);
            }
        };

        decode_f64(&bytes).ok_or_else(|| {
            RemotingError::Protocol(format!(
                "Received {} bytes for {}, which is not a whole number of FLOAT64 samples",
                bytes.len(),
                resource_path
            ))
        })
    }
}

/// Progress is not forwarded to the host.
fn report_progress(_progress: f64) {}

/// Execute `readSingle` against the plugin and return the filled buffers.
///
/// Params: `[begin, end, originalResourceName, catalogItem]`.
pub async fn read_single(
    data_source: &mut dyn DataSource,
    params: Params<'_>,
    writer: &ChannelWriter,
    logger: Arc<dyn Logger>,
    data_reader: &mut BoxedReader,
) -> Result<ReadBuffers, MethodError> {
    let begin = params.timestamp(0, "begin")?;
    let end = params.timestamp(1, "end")?;
    let original_resource_name: String = params.get(2, "originalResourceName")?;
    let catalog_item: CatalogItem = params.get(3, "catalogItem")?;

    let request = ReadRequest::new(original_resource_name, catalog_item, begin, end)?;
    debug!(
        "readSingle {} [{}, {}) -> {} samples",
        request.original_resource_name,
        begin,
        end,
        request.element_count()
    );

    let mut requests = [request];
    let mut handler = RemoteReadData::new(writer.clone(), data_reader, logger);

    let outcome = data_source
        .read(begin, end, &mut requests, &mut handler, &report_progress)
        .await;

    // A broken socket wins over whatever the plugin made of the error
    if let Some(failure) = handler.into_failure() {
        return Err(MethodError::Transport(failure));
    }
    outcome?;

    let [request] = requests;
    Ok(ReadBuffers {
        data: request.data,
        status: request.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::write_frame;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingLogger {
        messages: Mutex<Vec<(LogLevel, String)>>,
    }

    #[async_trait]
    impl Logger for RecordingLogger {
        async fn log(&self, level: LogLevel, message: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((level, message.to_string()));
        }
    }

    fn ts(value: &str) -> DateTime<Utc> {
        crate::protocol::parse_timestamp(value).unwrap()
    }

    #[tokio::test]
    async fn test_read_data_roundtrip() {
        let (control_local, mut control_remote) = duplex(4096);
        let (data_local, mut data_remote) = duplex(4096);

        let writer = ChannelWriter::new(control_local);
        let mut data_reader: BoxedReader = Box::new(data_local);
        let logger = Arc::new(RecordingLogger::default());

        let host = tokio::spawn(async move {
            let frame = read_frame(&mut control_remote).await.unwrap();
            let request: Value = serde_json::from_slice(&frame).unwrap();

            let samples: Vec<u8> = [1.0f64, 2.0, 3.0]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect();
            write_frame(&mut data_remote, &samples).await.unwrap();
            request
        });

        let mut handler = RemoteReadData::new(writer, &mut data_reader, logger.clone());
        let samples = timeout(
            TEST_TIMEOUT,
            handler.read_data(
                "/IN_MEMORY/TEST/ACCESSIBLE/V1/1_s",
                ts("2020-01-01T00:00:00Z"),
                ts("2020-01-01T00:00:03Z"),
            ),
        )
        .await
        .expect("Test timed out")
        .expect("read_data failed");

        assert_eq!(samples, vec![1.0, 2.0, 3.0]);
        assert!(handler.failure().is_none());

        let request = host.await.unwrap();
        assert_eq!(
            request,
            json!({
                "jsonrpc": "2.0",
                "method": "readData",
                "params": [
                    "/IN_MEMORY/TEST/ACCESSIBLE/V1/1_s",
                    "2020-01-01T00:00:00Z",
                    "2020-01-01T00:00:03Z"
                ]
            })
        );

        let messages = logger.messages.lock().unwrap();
        assert_eq!(
            messages.as_slice(),
            &[(
                LogLevel::Debug,
                "Read resource path /IN_MEMORY/TEST/ACCESSIBLE/V1/1_s from Nexus".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_read_data_closed_data_socket() {
        let (control_local, _control_remote) = duplex(4096);
        let (data_local, data_remote) = duplex(4096);
        drop(data_remote);

        let writer = ChannelWriter::new(control_local);
        let mut data_reader: BoxedReader = Box::new(data_local);

        let mut handler =
            RemoteReadData::new(writer, &mut data_reader, Arc::new(RecordingLogger::default()));
        let result = timeout(
            TEST_TIMEOUT,
            handler.read_data(
                "/A/B/C/1_s",
                ts("2020-01-01T00:00:00Z"),
                ts("2020-01-01T00:00:01Z"),
            ),
        )
        .await
        .expect("Test timed out");

        assert!(matches!(result, Err(RemotingError::ConnectionClosed)));
        assert!(matches!(
            handler.failure(),
            Some(RemotingError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_data_oversized_frame_is_kept() {
        let (control_local, mut control_remote) = duplex(4096);
        let (data_local, mut data_remote) = duplex(4096);

        let writer = ChannelWriter::new(control_local);
        let mut data_reader: BoxedReader = Box::new(data_local);

        tokio::spawn(async move {
            let _ = read_frame(&mut control_remote).await;
            data_remote.write_all(&0x7FFF_FFFFu32.to_be_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut handler =
            RemoteReadData::new(writer, &mut data_reader, Arc::new(RecordingLogger::default()));
        let result = timeout(
            TEST_TIMEOUT,
            handler.read_data(
                "/A/B/C/1_s",
                ts("2020-01-01T00:00:00Z"),
                ts("2020-01-01T00:00:01Z"),
            ),
        )
        .await
        .expect("Test timed out");
        assert!(matches!(result, Err(RemotingError::FrameTooLarge { .. })));

        // Later calls fail without touching the socket again
        let again = handler
            .read_data(
                "/A/B/C/1_s",
                ts("2020-01-01T00:00:00Z"),
                ts("2020-01-01T00:00:01Z"),
            )
            .await;
        assert!(matches!(again, Err(RemotingError::FrameTooLarge { .. })));
        assert!(matches!(
            handler.into_failure(),
            Some(RemotingError::FrameTooLarge { size: 0x7FFF_FFFF, .. })
        ));
    }

    #[tokio::test]
    async fn test_read_data_rejects_partial_sample() {
        let (control_local, mut control_remote) = duplex(4096);
        let (data_local, mut data_remote) = duplex(4096);

        let writer = ChannelWriter::new(control_local);
        let mut data_reader: BoxedReader = Box::new(data_local);

        tokio::spawn(async move {
            let _ = read_frame(&mut control_remote).await;
            write_frame(&mut data_remote, &[0u8; 5]).await.unwrap();
            // Keep the socket open until the reader is done
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut handler =
            RemoteReadData::new(writer, &mut data_reader, Arc::new(RecordingLogger::default()));
        let result = handler
            .read_data(
                "/A/B/C/1_s",
                ts("2020-01-01T00:00:00Z"),
                ts("2020-01-01T00:00:01Z"),
            )
            .await;

        assert!(matches!(result, Err(RemotingError::Protocol(_))));
        assert!(handler.failure().is_none());
    }

    #[tokio::test]
    async fn test_read_buffers_send_unframed() {
        let (local, mut remote) = duplex(4096);
        let mut data_writer: BoxedWriter = Box::new(local);

        let buffers = ReadBuffers {
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            status: vec![1],
        };
        buffers.send(&mut data_writer).await.unwrap();
        drop(data_writer);

        let mut received = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut remote, &mut received)
            .await
            .unwrap();
        assert_eq!(received, vec![1, 2, 3, 4, 5, 6, 7, 8, 1]);
        assert_eq!(buffers.len(), 9);
    }
}
