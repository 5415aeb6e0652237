//! Request dispatch and per-connection session state.
//!
//! The dispatcher turns a validated [`JsonRpcRequest`] into a [`Completion`]
//! or a [`MethodError`]. Session-bound methods require a data source created
//! by `setContext`; invoking them earlier is a precondition failure.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::data_source::{DataSource, Logger};
use crate::error::MethodError;
use crate::ipc::{BoxedReader, ChannelWriter};
use crate::models::{CatalogRegistration, DataSourceContext, LogLevel, ResourceCatalog};
use crate::protocol::{make_notification, timestamp, JsonRpcRequest, Method, Params, API_VERSION};
use crate::registry::DataSourceRegistry;
use crate::transfer::{read_single, ReadBuffers};

// =============================================================================
// Result payloads
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiVersionResponse {
    api_version: i32,
}

#[derive(Debug, Serialize)]
struct CatalogRegistrationsResponse {
    registrations: Vec<CatalogRegistration>,
}

#[derive(Debug, Serialize)]
struct CatalogResponse {
    catalog: ResourceCatalog,
}

#[derive(Debug, Serialize)]
struct TimeRangeResponse {
    #[serde(with = "timestamp")]
    begin: DateTime<Utc>,
    #[serde(with = "timestamp")]
    end: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct AvailabilityResponse {
    availability: f64,
}

/// Successful outcome of one method.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// JSON `result`; `null` for methods without a payload.
    pub result: Value,
    /// Buffers to stream over the data socket after the response.
    pub buffers: Option<ReadBuffers>,
}

impl Completion {
    fn empty() -> Self {
        Self {
            result: Value::Null,
            buffers: None,
        }
    }

    fn with_result<T: Serialize>(payload: T) -> Result<Self, MethodError> {
        let result = serde_json::to_value(payload).context("Failed to encode result")?;
        Ok(Self {
            result,
            buffers: None,
        })
    }
}

// =============================================================================
// Remote logger
// =============================================================================

/// Forwards plugin log messages to the host as `log` notifications.
#[derive(Debug, Clone)]
pub struct RemoteLogger {
    writer: ChannelWriter,
}

impl RemoteLogger {
    pub fn new(writer: ChannelWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Logger for RemoteLogger {
    async fn log(&self, level: LogLevel, message: &str) {
        let notification = make_notification("log", vec![json!(level.as_str()), json!(message)]);

        if let Err(e) = self.writer.send(&notification).await {
            warn!("Failed to forward {} log message to host: {}", level, e);
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

struct Session {
    data_source: Box<dyn DataSource>,
    logger: Arc<dyn Logger>,
}

/// Method table for one connection.
pub struct Dispatcher {
    registry: DataSourceRegistry,
    writer: ChannelWriter,
    session: Option<Session>,
}

impl Dispatcher {
    pub fn new(registry: DataSourceRegistry, writer: ChannelWriter) -> Self {
        Self {
            registry,
            writer,
            session: None,
        }
    }

    /// Whether `setContext` has succeeded on this connection.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Execute one request.
    ///
    /// `data_reader` is lent to `readSingle` for nested `readData` replies.
    pub async fn dispatch(
        &mut self,
        request: &JsonRpcRequest,
        data_reader: &mut BoxedReader,
    ) -> Result<Completion, MethodError> {
        let method: Method = request.method.parse()?;
        let params = Params(&request.params);

        debug!("Dispatching {} (id: {})", method, request.id);

        match method {
            Method::GetApiVersion => Completion::with_result(ApiVersionResponse {
                api_version: API_VERSION,
            }),
            Method::SetContext => {
                self.set_context(params).await?;
                Ok(Completion::empty())
            }
            // Cancellation and progress are accepted but not implemented
            Method::CancelRequest | Method::Progress => Ok(Completion::empty()),
            Method::GetCatalogRegistrations => {
                let session = self.session.as_mut().ok_or_else(MethodError::precondition)?;
                let path: String = params.get(0, "path")?;
                let registrations = session
                    .data_source
                    .get_catalog_registrations(&path)
                    .await?;
                Completion::with_result(CatalogRegistrationsResponse { registrations })
            }
            Method::EnrichCatalog => {
                let session = self.session.as_mut().ok_or_else(MethodError::precondition)?;
                let original: ResourceCatalog = params.get(0, "catalog")?;
                let catalog = session.data_source.enrich_catalog(original).await?;
                Completion::with_result(CatalogResponse { catalog })
            }
            Method::GetTimeRange => {
                let session = self.session.as_mut().ok_or_else(MethodError::precondition)?;
                let catalog_id: String = params.get(0, "catalogId")?;
                let (begin, end) = session.data_source.get_time_range(&catalog_id).await?;
                Completion::with_result(TimeRangeResponse { begin, end })
            }
            Method::GetAvailability => {
                let session = self.session.as_mut().ok_or_else(MethodError::precondition)?;
                let catalog_id: String = params.get(0, "catalogId")?;
                let begin = params.timestamp(1, "begin")?;
                let end = params.timestamp(2, "end")?;
                let availability = session
                    .data_source
                    .get_availability(&catalog_id, begin, end)
                    .await?;
                Completion::with_result(AvailabilityResponse { availability })
            }
            Method::ReadSingle => {
                let session = self.session.as_mut().ok_or_else(MethodError::precondition)?;
                let buffers = read_single(
                    session.data_source.as_mut(),
                    params,
                    &self.writer,
                    session.logger.clone(),
                    data_reader,
                )
                .await?;
                Ok(Completion {
                    result: Value::Null,
                    buffers: Some(buffers),
                })
            }
        }
    }

    /// `setContext`: params `[typeName, rawContext]`.
    ///
    /// The session is only replaced once the plugin accepted the context.
    async fn set_context(&mut self, params: Params<'_>) -> Result<(), MethodError> {
        let type_name: String = params.get(0, "type")?;
        let context = DataSourceContext::from_raw(params.raw(1, "context")?)?;

        let mut data_source = self.registry.create(&type_name)?;
        let logger: Arc<dyn Logger> = Arc::new(RemoteLogger::new(self.writer.clone()));

        data_source.set_context(context, logger.clone()).await?;

        if self.session.is_some() {
            warn!("setContext called again, replacing the current data source");
        }
        info!("Data source '{}' ready", type_name);

        self.session = Some(Session {
            data_source,
            logger,
        });
        Ok(())
    }
}
