//! Capability contract between the bridge and a data-source plugin.
//!
//! A plugin implements [`DataSource`]. The bridge hands it a [`Logger`] in
//! `set_context` and a [`ReadDataHandler`] in `read`, so callbacks into the
//! host are explicit parameters rather than re-entrant calls.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RemotingError;
use crate::models::{
    CatalogRegistration, DataSourceContext, LogLevel, ReadRequest, ResourceCatalog,
};

/// Progress callback passed to `DataSource::read`. Values are in `[0, 1]`.
pub type ReportProgress = dyn Fn(f64) + Send + Sync;

/// Sink for plugin log messages. The bridge forwards them to the host.
#[async_trait]
pub trait Logger: Send + Sync {
    async fn log(&self, level: LogLevel, message: &str);
}

/// Pulls samples of another resource from the host while a read is running.
#[async_trait]
pub trait ReadDataHandler: Send {
    /// Fetch FLOAT64 samples of `resource_path` over `[begin, end)`.
    ///
    /// # Errors
    ///
    /// Returns `RemotingError::ConnectionClosed` if the host closed the data
    /// socket. The bridge shuts the connection down after the read returns.
    async fn read_data(
        &mut self,
        resource_path: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, RemotingError>;
}

/// A data-source plugin.
///
/// `set_context` is called once per connection before any other method.
#[async_trait]
pub trait DataSource: Send {
    async fn set_context(
        &mut self,
        context: DataSourceContext,
        logger: Arc<dyn Logger>,
    ) -> Result<()>;

    async fn get_catalog_registrations(&mut self, path: &str) -> Result<Vec<CatalogRegistration>>;

    async fn enrich_catalog(&mut self, catalog: ResourceCatalog) -> Result<ResourceCatalog>;

    async fn get_time_range(&mut self, catalog_id: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)>;

    async fn get_availability(
        &mut self,
        catalog_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64>;

    /// Fill the buffers of every request for `[begin, end)`.
    async fn read(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        requests: &mut [ReadRequest],
        read_data: &mut dyn ReadDataHandler,
        report_progress: &ReportProgress,
    ) -> Result<()>;
}
