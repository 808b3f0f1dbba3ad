//! 🎯 The dispatcher: one `query`, one `bulk_insert`, four backends.
//!
//! Everything here is validation and routing. Every configuration error (unknown backend,
//! missing locator, wrong client handle, Splunk asked to write) is raised before a single
//! native call happens, and the dispatcher keeps no state between calls.
//!
//! ```text
//! caller → query(client, request) → PagerBackend::{Mongo, Elasticsearch, Splunk, Odbc} → RecordStream
//! caller → bulk_insert(client, request) → mongo | elasticsearch | odbc adapter → WriteSummary
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::backends::common_config::{
    DEFAULT_MAX_REQUEST_SIZE_BYTES, DEFAULT_PAGE_SIZE, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT,
    DEFAULT_SCROLL_TTL,
};
use crate::backends::elasticsearch::{self, ElasticsearchClient, ScrollPager};
use crate::backends::mongo::{self, FindOptions, MongoClient, MongoPager, Namespace};
use crate::backends::odbc::{self, OdbcConnection, OdbcPager, PagingStrategy};
use crate::backends::splunk::{SplunkClient, SplunkJobOptions, SplunkJobPager};
use crate::backends::{PagerBackend, QueryDefaults};
use crate::common::{BackendKind, Record, WriteSummary, json_kind};
use crate::error::BrokerError;
use crate::stream::RecordStream;

/// 🔌 The native handle a request runs against. The variant must match the request's backend.
#[derive(Debug, Clone)]
pub enum BackendClient {
    Mongo(Arc<dyn MongoClient>),
    Elasticsearch(ElasticsearchClient),
    Splunk(SplunkClient),
    Odbc(Arc<dyn OdbcConnection>),
}

impl BackendClient {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendClient::Mongo(_) => BackendKind::Mongo,
            BackendClient::Elasticsearch(_) => BackendKind::Elasticsearch,
            BackendClient::Splunk(_) => BackendKind::Splunk,
            BackendClient::Odbc(_) => BackendKind::Odbc,
        }
    }

    fn mismatch(&self, requested: BackendKind) -> BrokerError {
        BrokerError::ClientMismatch {
            requested,
            actual: self.kind(),
        }
    }

    fn expect_kind(&self, requested: BackendKind) -> Result<(), BrokerError> {
        if self.kind() == requested {
            Ok(())
        } else {
            Err(self.mismatch(requested))
        }
    }
}

/// 📝 What to ask for: a structured filter/body (mongo, elasticsearch) or a search string (splunk).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum QueryPayload {
    Structured(Value),
    Search(String),
    #[default]
    Empty,
}

/// 📋 One logical query. Build it with the backend constructors and the chained setters.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub backend: BackendKind,
    pub payload: QueryPayload,
    pub db_name: Option<String>,
    pub collection: Option<String>,
    pub index: Option<String>,
    pub base_query: Option<String>,
    pub page_size: usize,
    /// ✂️ Stop after this many records, whatever the backend.
    pub max_results: Option<u64>,
    pub projection: Option<Value>,
    pub scroll_ttl: String,
    pub earliest_time: Option<String>,
    pub latest_time: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub use_limit_offset: bool,
    pub offset: u64,
}

impl QueryRequest {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            payload: QueryPayload::Empty,
            db_name: None,
            collection: None,
            index: None,
            base_query: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_results: None,
            projection: None,
            scroll_ttl: DEFAULT_SCROLL_TTL.to_string(),
            earliest_time: None,
            latest_time: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            use_limit_offset: true,
            offset: 0,
        }
    }

    /// 🏷️ From a backend name. Unknown names fail with `UnsupportedBackend`.
    pub fn for_backend(backend: &str) -> Result<Self> {
        Ok(Self::new(backend.parse::<BackendKind>()?))
    }

    pub fn mongo(db_name: impl Into<String>, collection: impl Into<String>, filter: Value) -> Self {
        let mut request = Self::new(BackendKind::Mongo).payload(QueryPayload::Structured(filter));
        request.db_name = Some(db_name.into());
        request.collection = Some(collection.into());
        request
    }

    pub fn elasticsearch(index: impl Into<String>, body: Value) -> Self {
        Self::new(BackendKind::Elasticsearch)
            .payload(QueryPayload::Structured(body))
            .index(index)
    }

    pub fn splunk(search: impl Into<String>) -> Self {
        Self::new(BackendKind::Splunk).payload(QueryPayload::Search(search.into()))
    }

    pub fn odbc(base_query: impl Into<String>) -> Self {
        Self::new(BackendKind::Odbc).base_query(base_query)
    }

    pub fn payload(mut self, payload: QueryPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = Some(db_name.into());
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn base_query(mut self, base_query: impl Into<String>) -> Self {
        self.base_query = Some(base_query.into());
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn max_results(mut self, max_results: u64) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn projection(mut self, projection: Value) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn scroll_ttl(mut self, ttl: impl Into<String>) -> Self {
        self.scroll_ttl = ttl.into();
        self
    }

    pub fn time_range(mut self, earliest: Option<String>, latest: Option<String>) -> Self {
        self.earliest_time = earliest;
        self.latest_time = latest;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn use_limit_offset(mut self, use_limit_offset: bool) -> Self {
        self.use_limit_offset = use_limit_offset;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// 🔧 Take page size, scroll TTL and poll timings from loaded configuration.
    pub fn with_defaults(mut self, defaults: &QueryDefaults) -> Self {
        self.page_size = defaults.page_size;
        self.scroll_ttl = defaults.scroll_ttl.clone();
        self.poll_interval = defaults.poll_interval();
        self.poll_timeout = defaults.poll_timeout();
        self
    }
}

/// ✍️ One logical bulk insert.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkInsertRequest {
    pub backend: BackendKind,
    pub records: Vec<Record>,
    pub db_name: Option<String>,
    pub collection: Option<String>,
    pub index: Option<String>,
    pub table: Option<String>,
    /// Mongo: stop at the first failure. Defaults to false.
    pub ordered: bool,
    /// Elasticsearch: which field carries the document identity.
    pub id_field: String,
    /// Mongo: records per `bulkWrite`. `None` sends one write.
    pub batch_size: Option<usize>,
    /// Elasticsearch: ceiling for one `_bulk` body.
    pub max_request_size_bytes: usize,
}

impl BulkInsertRequest {
    pub fn new(backend: BackendKind, records: Vec<Record>) -> Self {
        Self {
            backend,
            records,
            db_name: None,
            collection: None,
            index: None,
            table: None,
            ordered: false,
            id_field: "_id".to_string(),
            batch_size: None,
            max_request_size_bytes: DEFAULT_MAX_REQUEST_SIZE_BYTES,
        }
    }

    pub fn for_backend(backend: &str, records: Vec<Record>) -> Result<Self> {
        Ok(Self::new(backend.parse::<BackendKind>()?, records))
    }

    pub fn mongo(
        db_name: impl Into<String>,
        collection: impl Into<String>,
        records: Vec<Record>,
    ) -> Self {
        let mut request = Self::new(BackendKind::Mongo, records);
        request.db_name = Some(db_name.into());
        request.collection = Some(collection.into());
        request
    }

    pub fn elasticsearch(index: impl Into<String>, records: Vec<Record>) -> Self {
        let mut request = Self::new(BackendKind::Elasticsearch, records);
        request.index = Some(index.into());
        request
    }

    pub fn odbc(table: impl Into<String>, records: Vec<Record>) -> Self {
        let mut request = Self::new(BackendKind::Odbc, records);
        request.table = Some(table.into());
        request
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn max_request_size_bytes(mut self, bytes: usize) -> Self {
        self.max_request_size_bytes = bytes;
        self
    }

    pub fn with_defaults(mut self, defaults: &QueryDefaults) -> Self {
        self.max_request_size_bytes = defaults.max_request_size_bytes;
        self
    }
}

fn required<'a>(
    value: &'a Option<String>,
    backend: BackendKind,
    parameter: &'static str,
) -> Result<&'a str, BrokerError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BrokerError::MissingParameter { backend, parameter }),
    }
}

fn structured_payload(
    payload: QueryPayload,
    backend: BackendKind,
    empty: Value,
) -> Result<Value, BrokerError> {
    match payload {
        QueryPayload::Structured(value @ Value::Object(_)) => Ok(value),
        QueryPayload::Structured(other) => Err(BrokerError::InvalidParameter {
            parameter: "query",
            reason: format!("{backend} expects a JSON object, got {}", json_kind(&other)),
        }),
        QueryPayload::Empty => Ok(empty),
        QueryPayload::Search(_) => Err(BrokerError::InvalidParameter {
            parameter: "query",
            reason: format!("{backend} expects a structured query, not a search string"),
        }),
    }
}

/// 🔎 Validate a query and hand back its lazy record stream.
///
/// No native call happens here. The first one happens on the first pull.
pub fn query(client: &BackendClient, request: QueryRequest) -> Result<RecordStream> {
    let backend = request.backend;
    if request.page_size == 0 {
        return Err(BrokerError::InvalidParameter {
            parameter: "page_size",
            reason: "must be at least 1".to_string(),
        }
        .into());
    }

    let pager = match backend {
        BackendKind::Mongo => {
            let db_name = required(&request.db_name, backend, "db_name")?;
            let collection = required(&request.collection, backend, "collection")?;
            let BackendClient::Mongo(mongo) = client else {
                return Err(client.mismatch(backend).into());
            };
            let filter = structured_payload(request.payload, backend, json!({}))?;
            let batch_size =
                u32::try_from(request.page_size).map_err(|_| BrokerError::InvalidParameter {
                    parameter: "page_size",
                    reason: format!("{} does not fit a Mongo batch size", request.page_size),
                })?;
            PagerBackend::Mongo(MongoPager::new(
                mongo.clone(),
                Namespace::new(db_name, collection),
                filter,
                FindOptions {
                    projection: request.projection,
                    batch_size,
                },
            ))
        }
        BackendKind::Elasticsearch => {
            let index = required(&request.index, backend, "index")?.to_string();
            let BackendClient::Elasticsearch(es) = client else {
                return Err(client.mismatch(backend).into());
            };
            let match_all = json!({"query": {"match_all": {}}});
            let body = structured_payload(request.payload, backend, match_all)?;
            PagerBackend::Elasticsearch(ScrollPager::new(
                es.clone(),
                index,
                body,
                request.scroll_ttl,
                request.page_size,
            ))
        }
        BackendKind::Splunk => {
            let BackendClient::Splunk(splunk) = client else {
                return Err(client.mismatch(backend).into());
            };
            let search = match request.payload {
                QueryPayload::Search(search) if !search.trim().is_empty() => search,
                QueryPayload::Structured(_) => {
                    return Err(BrokerError::InvalidParameter {
                        parameter: "query",
                        reason: "splunk expects a search string".to_string(),
                    }
                    .into());
                }
                _ => {
                    return Err(BrokerError::MissingParameter {
                        backend,
                        parameter: "search",
                    }
                    .into());
                }
            };
            PagerBackend::Splunk(SplunkJobPager::new(
                splunk.clone(),
                search,
                SplunkJobOptions {
                    page_size: request.page_size,
                    earliest_time: request.earliest_time,
                    latest_time: request.latest_time,
                    poll_interval: request.poll_interval,
                    poll_timeout: request.poll_timeout,
                },
            ))
        }
        BackendKind::Odbc => {
            let base_query = required(&request.base_query, backend, "base_query")?.to_string();
            let BackendClient::Odbc(connection) = client else {
                return Err(client.mismatch(backend).into());
            };
            PagerBackend::Odbc(OdbcPager::new(
                connection.clone(),
                base_query,
                PagingStrategy::from_use_limit_offset(request.use_limit_offset),
                request.page_size,
                request.offset,
            ))
        }
    };

    debug!(
        "🎯 query dispatched to {} (page_size={}, max_results={:?})",
        backend, request.page_size, request.max_results
    );
    Ok(RecordStream::new(pager, request.max_results))
}

/// ✍️ Validate a bulk insert and run it.
///
/// Splunk always fails with `UnsupportedOperation`. Empty input returns an empty summary
/// without a native call.
pub async fn bulk_insert(
    client: &BackendClient,
    request: BulkInsertRequest,
) -> Result<WriteSummary> {
    let backend = request.backend;
    if !backend.supports_bulk_insert() {
        return Err(BrokerError::UnsupportedOperation {
            backend,
            operation: "bulk_insert",
        }
        .into());
    }

    match backend {
        BackendKind::Mongo => {
            required(&request.db_name, backend, "db_name")?;
            required(&request.collection, backend, "collection")?;
        }
        BackendKind::Elasticsearch => {
            required(&request.index, backend, "index")?;
        }
        BackendKind::Odbc => {
            required(&request.table, backend, "table")?;
        }
        BackendKind::Splunk => {}
    }
    client.expect_kind(backend)?;

    if request.records.is_empty() {
        debug!("🤷 empty bulk insert into {}, nothing to send", backend);
        return Ok(WriteSummary::empty(backend));
    }

    info!("✍️ bulk inserting {} records into {}", request.records.len(), backend);
    let BulkInsertRequest {
        records,
        db_name,
        collection,
        index,
        table,
        ordered,
        id_field,
        batch_size,
        max_request_size_bytes,
        ..
    } = request;

    match client {
        BackendClient::Mongo(mongo) => {
            let namespace =
                Namespace::new(db_name.unwrap_or_default(), collection.unwrap_or_default());
            mongo::bulk_insert(mongo.as_ref(), &namespace, records, ordered, batch_size).await
        }
        BackendClient::Elasticsearch(es) => {
            elasticsearch::bulk_insert(
                es,
                &index.unwrap_or_default(),
                records,
                &id_field,
                max_request_size_bytes,
            )
            .await
        }
        BackendClient::Odbc(connection) => {
            odbc::bulk_insert(connection.as_ref(), &table.unwrap_or_default(), records).await
        }
        BackendClient::Splunk(_) => Err(BrokerError::UnsupportedOperation {
            backend,
            operation: "bulk_insert",
        }
        .into()),
    }
}
