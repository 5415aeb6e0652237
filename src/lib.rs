//! Nexus Remoting Library
//!
//! Plugin-side bridge that lets a data-source implementation serve a Nexus
//! host over two TCP sockets:
//!
//! - `ipc` - length-prefixed framing and the shared control-socket writer
//! - `protocol` - JSON-RPC 2.0 envelopes, method names and parameters
//! - `models` - catalog, representation and read-request types
//! - `data_source` - the traits a plugin implements
//! - `dispatch` / `transfer` - method handling and the `readSingle` path
//! - `communicator` - the per-connection request loop
//! - `agent` - TCP bootstrap (connect mode and listen mode)
//!
//! # Example
//!
//! ```ignore
//! use nexus_remoting::{connect, DataSourceRegistry, SampleDataSource};
//!
//! let registry = DataSourceRegistry::new().register::<SampleDataSource>("sample");
//! connect("127.0.0.1:56145", connection_id, registry).await?;
//! ```

pub mod agent;
pub mod communicator;
pub mod data_source;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod sample;
pub mod transfer;

pub use agent::{connect, Agent};
pub use communicator::{RemoteCommunicator, Watchdog};
pub use data_source::{DataSource, Logger, ReadDataHandler, ReportProgress};
pub use error::{MethodError, RemotingError};
pub use registry::DataSourceRegistry;
pub use sample::SampleDataSource;
