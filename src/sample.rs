//! A small built-in data source.
//!
//! `/SAMPLE/LOCAL` has two FLOAT64 resources at one sample per second:
//!
//! - `T1`, a sine wave computed locally
//! - `V1`, read back from the host as `/SAMPLE/REMOTE/V1/1_s` and doubled

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::data_source::{DataSource, Logger, ReadDataHandler, ReportProgress};
use crate::models::{
    CatalogRegistration, DataSourceContext, LogLevel, NexusDataType, ReadRequest, Representation,
    Resource, ResourceCatalog,
};

pub const TYPE_NAME: &str = "sample";

pub const LOCAL_CATALOG_ID: &str = "/SAMPLE/LOCAL";

const REMOTE_RESOURCE_PATH: &str = "/SAMPLE/REMOTE/V1/1_s";

const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Period of the `T1` sine wave in seconds.
const SINE_PERIOD: i64 = 60;

#[derive(Default)]
pub struct SampleDataSource {
    logger: Option<Arc<dyn Logger>>,
}

impl SampleDataSource {
    async fn log(&self, level: LogLevel, message: &str) {
        if let Some(logger) = &self.logger {
            logger.log(level, message).await;
        }
    }

    fn begin_of_data() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    fn ensure_catalog(catalog_id: &str) -> Result<()> {
        if catalog_id != LOCAL_CATALOG_ID {
            bail!("Unknown catalog identifier '{}'.", catalog_id);
        }
        Ok(())
    }

    fn sine(begin: DateTime<Utc>, count: usize) -> Vec<f64> {
        let start = begin.timestamp();
        (0..count as i64)
            .map(|i| {
                let phase = (start + i).rem_euclid(SINE_PERIOD) as f64 / SINE_PERIOD as f64;
                (2.0 * PI * phase).sin()
            })
            .collect()
    }

    async fn read_one(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        request: &mut ReadRequest,
        read_data: &mut dyn ReadDataHandler,
    ) -> Result<()> {
        let count = request.element_count();

        let values = match request.catalog_item.resource.id.as_str() {
            "T1" => Self::sine(begin, count),
            "V1" => {
                let mut values = read_data
                    .read_data(REMOTE_RESOURCE_PATH, begin, end)
                    .await
                    .with_context(|| format!("Unable to read {}", REMOTE_RESOURCE_PATH))?;
                values.truncate(count);
                values.iter_mut().for_each(|v| *v *= 2.0);
                values
            }
            other => bail!("Unknown resource identifier '{}'.", other),
        };

        request.write_f64(0, &values)
    }
}

#[async_trait]
impl DataSource for SampleDataSource {
    async fn set_context(
        &mut self,
        context: DataSourceContext,
        logger: Arc<dyn Logger>,
    ) -> Result<()> {
        if let Some(locator) = &context.resource_locator {
            debug!("Sample data source located at {}", locator);
        }
        self.logger = Some(logger);

        self.log(LogLevel::Information, "Sample data source ready").await;
        Ok(())
    }

    async fn get_catalog_registrations(&mut self, path: &str) -> Result<Vec<CatalogRegistration>> {
        if path == "/" {
            Ok(vec![CatalogRegistration::new(
                LOCAL_CATALOG_ID,
                "Sample catalog",
            )])
        } else {
            Ok(Vec::new())
        }
    }

    async fn enrich_catalog(&mut self, catalog: ResourceCatalog) -> Result<ResourceCatalog> {
        Self::ensure_catalog(&catalog.id)?;

        let representation = Representation::new(NexusDataType::Float64, SAMPLE_PERIOD);

        Ok(catalog
            .with_resource(Resource::new("T1").with_representation(representation.clone()))
            .with_resource(Resource::new("V1").with_representation(representation)))
    }

    async fn get_time_range(&mut self, catalog_id: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        Self::ensure_catalog(catalog_id)?;
        Ok((Self::begin_of_data(), Utc::now()))
    }

    async fn get_availability(
        &mut self,
        catalog_id: &str,
        _begin: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<f64> {
        Self::ensure_catalog(catalog_id)?;
        Ok(1.0)
    }

    async fn read(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        requests: &mut [ReadRequest],
        read_data: &mut dyn ReadDataHandler,
        report_progress: &ReportProgress,
    ) -> Result<()> {
        let total = requests.len();

        for (i, request) in requests.iter_mut().enumerate() {
            debug!("Reading {}", request.catalog_item.to_path());
            self.read_one(begin, end, request, read_data).await?;
            report_progress((i + 1) as f64 / total as f64);
        }

        Ok(())
    }
}
