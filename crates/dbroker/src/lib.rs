//! 🔌 dbroker: one query surface over four backends that all page differently.
//!
//! Name a backend, hand over its native client, and get back a lazy [`RecordStream`] that
//! hides whether the records came from a Mongo cursor, an Elasticsearch scroll, a Splunk
//! search job or an ODBC offset window. Writes go through [`bulk_insert`] and come back as a
//! [`WriteSummary`].
//!
//! ```text
//! caller → broker::{query, bulk_insert} → backends::{mongo, elasticsearch, splunk, odbc} → native calls
//! ```

pub mod app_config;
pub mod backends;
pub mod broker;
pub mod common;
pub mod error;
pub mod progress;
pub mod stream;

pub use app_config::{AppConfig, load_config};
pub use backends::{
    ElasticsearchClient, ElasticsearchConfig, QueryDefaults, SplunkClient, SplunkConfig,
    SplunkJobState,
};
pub use broker::{BackendClient, BulkInsertRequest, QueryPayload, QueryRequest, bulk_insert, query};
pub use common::{BackendKind, Record, WriteFailure, WriteSummary};
pub use error::BrokerError;
pub use progress::ProgressMetrics;
pub use stream::{BlockingRecords, RecordStream};
