//! Data models exchanged with the Nexus host.
//!
//! These structs match the host's extensibility types. Property names are
//! camelCase on the wire; fields this crate does not interpret are kept in
//! `extensions` so catalogs pass through `enrichCatalog` unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use url::Url;

/// Session configuration supplied once by `setContext`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSourceContext {
    pub resource_locator: Option<Url>,
    pub system_configuration: Option<Value>,
    pub source_configuration: Option<Value>,
    pub request_configuration: Option<Value>,
}

impl DataSourceContext {
    /// Build a context from the raw `setContext` object.
    ///
    /// A present but unparseable `resourceLocator` is an error; `null` or a
    /// missing key means no locator.
    pub fn from_raw(raw: &Value) -> Result<Self> {
        let field = |name: &str| raw.get(name).filter(|v| !v.is_null()).cloned();

        let resource_locator = match field("resourceLocator") {
            Some(Value::String(locator)) => Some(
                Url::parse(&locator)
                    .with_context(|| format!("Invalid resource locator '{}'", locator))?,
            ),
            Some(other) => bail!("Resource locator must be a string, got {}", other),
            None => None,
        };

        Ok(Self {
            resource_locator,
            system_configuration: field("systemConfiguration"),
            source_configuration: field("sourceConfiguration"),
            request_configuration: field("requestConfiguration"),
        })
    }
}

/// A catalog exposed under a path, as returned by `getCatalogRegistrations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRegistration {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub is_transient: bool,
}

impl CatalogRegistration {
    pub fn new(path: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            title: Some(title.into()),
            is_transient: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCatalog {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<Resource>>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl ResourceCatalog {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: None,
            resources: None,
            extensions: Map::new(),
        }
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.get_or_insert_with(Vec::new).push(resource);
        self
    }

    pub fn find(&self, resource_id: &str) -> Option<&Resource> {
        self.resources
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|r| r.id == resource_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub representations: Option<Vec<Representation>>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Resource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: None,
            representations: None,
            extensions: Map::new(),
        }
    }

    pub fn with_representation(mut self, representation: Representation) -> Self {
        self.representations
            .get_or_insert_with(Vec::new)
            .push(representation);
        self
    }
}

/// Sampling shape of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Representation {
    pub data_type: NexusDataType,
    #[serde(with = "sample_period")]
    pub sample_period: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Representation {
    pub fn new(data_type: NexusDataType, sample_period: Duration) -> Self {
        Self {
            data_type,
            sample_period,
            parameters: None,
            extensions: Map::new(),
        }
    }

    /// Size of one sample in bytes.
    pub fn element_size(&self) -> usize {
        self.data_type.element_size()
    }

    /// Number of samples covering `[begin, end)`.
    pub fn element_count(&self, begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        if end < begin {
            bail!("The end date/time must be equal to or greater than the begin date/time.");
        }

        let period = self.sample_period.as_nanos();
        if period == 0 {
            bail!("The sample period must be greater than zero.");
        }

        let span = (end - begin)
            .to_std()
            .context("Time range is out of bounds")?
            .as_nanos();

        usize::try_from(span / period).context("Element count is out of bounds")
    }
}

/// Sample data type. The low byte of the numeric code is the bit width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NexusDataType {
    Uint8 = 0x108,
    Int8 = 0x208,
    Uint16 = 0x110,
    Int16 = 0x210,
    Uint32 = 0x120,
    Int32 = 0x220,
    Uint64 = 0x140,
    Int64 = 0x240,
    Float32 = 0x320,
    Float64 = 0x340,
}

impl NexusDataType {
    pub fn element_size(&self) -> usize {
        ((*self as u16 & 0xFF) >> 3) as usize
    }
}

/// A resource inside a catalog, bound to one representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub catalog: ResourceCatalog,
    pub resource: Resource,
    pub representation: Representation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
}

impl CatalogItem {
    /// `/<catalog>/<resource>/<period>`, e.g. `/SAMPLE/LOCAL/T1/1_s`.
    pub fn to_path(&self) -> String {
        format!(
            "{}/{}/{}",
            self.catalog.id,
            self.resource.id,
            unit_string(self.representation.sample_period)
        )
    }
}

/// One unit of work for `DataSource::read`.
///
/// `data` holds `element_count * element_size` bytes in little-endian order,
/// `status` one byte per sample (1 = valid).
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub original_resource_name: String,
    pub catalog_item: CatalogItem,
    pub data: Vec<u8>,
    pub status: Vec<u8>,
}

impl ReadRequest {
    /// Allocate zeroed buffers for `catalog_item` over `[begin, end)`.
    pub fn new(
        original_resource_name: impl Into<String>,
        catalog_item: CatalogItem,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        let (data, status) = create_buffers(&catalog_item.representation, begin, end)?;

        Ok(Self {
            original_resource_name: original_resource_name.into(),
            catalog_item,
            data,
            status,
        })
    }

    pub fn element_count(&self) -> usize {
        self.status.len()
    }

    /// Store `values` as FLOAT64 samples starting at `offset`, marking them valid.
    pub fn write_f64(&mut self, offset: usize, values: &[f64]) -> Result<()> {
        let end = offset + values.len();
        if end > self.element_count() {
            bail!(
                "Cannot write {} samples at offset {} into a buffer of {} samples.",
                values.len(),
                offset,
                self.element_count()
            );
        }
        if self.catalog_item.representation.data_type != NexusDataType::Float64 {
            bail!(
                "Resource '{}' is not of type FLOAT64.",
                self.original_resource_name
            );
        }

        for (i, value) in values.iter().enumerate() {
            let start = (offset + i) * 8;
            self.data[start..start + 8].copy_from_slice(&value.to_le_bytes());
        }
        self.status[offset..end].fill(1);

        Ok(())
    }
}

/// Allocate the data and status buffers for one read.
pub fn create_buffers(
    representation: &Representation,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let element_count = representation.element_count(begin, end)?;
    let data_size = element_count
        .checked_mul(representation.element_size())
        .context("Data buffer size is out of bounds")?;

    Ok((zeroed(data_size)?, zeroed(element_count)?))
}

/// Allocate `size` zero bytes, failing instead of aborting when memory runs out.
fn zeroed(size: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .with_context(|| format!("Unable to allocate {} bytes", size))?;
    buffer.resize(size, 0);
    Ok(buffer)
}

/// Decode little-endian FLOAT64 samples.
pub fn decode_f64(bytes: &[u8]) -> Option<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return None;
    }

    Some(
        bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect(),
    )
}

/// Severity of a plugin log message, named as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "Trace",
            LogLevel::Debug => "Debug",
            LogLevel::Information => "Information",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Critical => "Critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a sample period as a path unit (`1_s`, `100_ms`, `10_min`).
fn unit_string(period: Duration) -> String {
    let nanos = period.as_nanos();
    let units: [(u128, &str); 6] = [
        (3_600_000_000_000, "h"),
        (60_000_000_000, "min"),
        (1_000_000_000, "s"),
        (1_000_000, "ms"),
        (1_000, "us"),
        (1, "ns"),
    ];

    for (size, unit) in units {
        if nanos >= size && nanos % size == 0 {
            return format!("{}_{}", nanos / size, unit);
        }
    }
    "0_ns".to_string()
}

/// Serde adapter for .NET-style time spans: `[d.]hh:mm:ss[.fffffff]`.
pub mod sample_period {
    use super::*;

    pub fn format(value: &Duration) -> String {
        let total = value.as_secs();
        let (days, rest) = (total / 86_400, total % 86_400);
        let (hours, minutes, seconds) = (rest / 3600, (rest % 3600) / 60, rest % 60);
        let ticks = value.subsec_nanos() / 100;

        let mut out = String::new();
        if days > 0 {
            out.push_str(&format!("{}.", days));
        }
        out.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
        if ticks > 0 {
            out.push_str(&format!(".{:07}", ticks));
        }
        out
    }

    pub fn parse(value: &str) -> Result<Duration> {
        let invalid = || anyhow::anyhow!("Invalid time span '{}'", value);

        // Plain ASCII digits only: no sign, no whitespace
        let number = |part: &str| -> Result<u64> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u64>().map_err(|_| invalid())
        };

        let mut parts = value.split(':');
        let (Some(head), Some(minutes), Some(tail), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let (days, hours) = match head.split_once('.') {
            Some((days, hours)) => (number(days)?, hours),
            None => (0, head),
        };
        let hours = number(hours)?;
        let minutes = number(minutes)?;

        let (seconds, fraction) = match tail.split_once('.') {
            Some((seconds, fraction)) => (seconds, Some(fraction)),
            None => (tail, None),
        };
        let seconds = number(seconds)?;

        if hours > 23 || minutes > 59 || seconds > 59 {
            return Err(invalid());
        }

        let nanos = match fraction {
            None => 0,
            Some(fraction) if fraction.len() > 7 => return Err(invalid()),
            Some(fraction) => {
                let digits = number(fraction)? as u32;
                digits * 10u32.pow(9 - fraction.len() as u32)
            }
        };

        let secs = days
            .checked_mul(86_400)
            .and_then(|s| s.checked_add(hours * 3600 + minutes * 60 + seconds))
            .ok_or_else(invalid)?;

        Ok(Duration::new(secs, nanos))
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
