//! 🍃 The Mongo backend: a server-side cursor wearing a client-side batch size.
//!
//! The driver does the heavy lifting here. Mongo already pages for us: open a cursor with
//! `batch_size = page_size`, and every `getMore` hands back the next batch. Our job is to
//! open it lazily, pull until it comes back empty, and close it when we're done (or when
//! the caller gets bored first).
//!
//! 🔌 The native handle is the [`MongoClient`] trait. Driver bindings live outside this
//! crate; [`crate::backends::in_mem::InMemoryMongo`] lives inside it for tests and local dev.
//!
//! ⚠️ No sort is enforced. Records arrive in the store's natural order, which is whatever
//! mood the storage engine is in today.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use crate::backends::Pager;
use crate::common::{BackendKind, Record, WriteFailure, WriteSummary};

/// 📍 database + collection. Mongo's idea of an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// 🔧 What `find` needs besides the filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Value>,
    pub batch_size: u32,
}

/// ✍️ One insert in a batched write.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOne {
    pub document: Record,
}

/// 📊 The native batched-write result, shaped the way drivers report it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteOutcome {
    pub inserted_count: usize,
    pub write_errors: Vec<MongoWriteError>,
}

/// 💀 A single rejected operation. `index` is relative to the submitted batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MongoWriteError {
    pub index: usize,
    pub code: Option<i32>,
    pub message: String,
}

/// 🔌 The native Mongo handle: just enough driver surface to page and to batch-write.
#[async_trait]
pub trait MongoClient: std::fmt::Debug + Send + Sync {
    /// 📡 `db.collection.find(filter, projection).batch_size(n)`. Opens the server cursor.
    async fn find(
        &self,
        namespace: &Namespace,
        filter: Value,
        options: FindOptions,
    ) -> Result<Box<dyn MongoCursor>>;

    /// ✍️ One `bulkWrite` of insert operations. Unordered keeps going past failures.
    async fn bulk_write(
        &self,
        namespace: &Namespace,
        operations: Vec<InsertOne>,
        ordered: bool,
    ) -> Result<BulkWriteOutcome>;
}

/// 🧵 A server-side cursor. An empty batch also means exhausted.
#[async_trait]
pub trait MongoCursor: std::fmt::Debug + Send {
    async fn next_batch(&mut self) -> Result<Vec<Record>>;

    /// 🏁 True once the server has said the cursor is done (cursor id 0). Lets the pager skip
    /// the trailing getMore that would only come back empty.
    fn is_exhausted(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}

/// 📄 Turns a Mongo cursor into pages. The cursor is the continuation state.
#[derive(Debug)]
pub(crate) struct MongoPager {
    client: Arc<dyn MongoClient>,
    namespace: Namespace,
    filter: Value,
    options: FindOptions,
    cursor: Option<Box<dyn MongoCursor>>,
    exhausted: bool,
    batches_pulled: usize,
}

impl MongoPager {
    pub(crate) fn new(
        client: Arc<dyn MongoClient>,
        namespace: Namespace,
        filter: Value,
        options: FindOptions,
    ) -> Self {
        Self {
            client,
            namespace,
            filter,
            options,
            cursor: None,
            exhausted: false,
            batches_pulled: 0,
        }
    }
}

#[async_trait]
impl Pager for MongoPager {
    async fn next_page(&mut self) -> Result<Option<Vec<Record>>> {
        if self.exhausted {
            return Ok(None);
        }

        // 🚀 first pull opens the cursor. Not a nanosecond before.
        if self.cursor.is_none() {
            trace!(
                "🍃 opening cursor on {} (batch_size={})",
                self.namespace, self.options.batch_size
            );
            let namespace = &self.namespace;
            let cursor = self
                .client
                .find(namespace, self.filter.clone(), self.options.clone())
                .await
                .with_context(|| {
                    format!(
                        "💀 Mongo refused to open a cursor on '{namespace}'. \
                         The filter may be cursed, or the server may be napping."
                    )
                })?;
            self.cursor = Some(cursor);
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let batch = cursor
            .next_batch()
            .await
            .with_context(|| format!("💀 getMore on '{}' failed mid-stream", self.namespace))?;

        if batch.is_empty() {
            debug!(
                "✅ cursor on {} exhausted after {} batches",
                self.namespace, self.batches_pulled
            );
            self.exhausted = true;
            return Ok(None);
        }

        self.batches_pulled += 1;
        debug!(
            "📦 batch {} from {}: {} documents",
            self.batches_pulled,
            self.namespace,
            batch.len()
        );
        if cursor.is_exhausted() {
            debug!("✅ cursor on {} closed server-side with this batch", self.namespace);
            self.exhausted = true;
        }
        Ok(Some(batch))
    }

    async fn release(&mut self) -> Result<()> {
        self.exhausted = true;
        if let Some(mut cursor) = self.cursor.take() {
            trace!("🗑️ closing cursor on {}", self.namespace);
            let namespace = &self.namespace;
            cursor
                .close()
                .await
                .with_context(|| format!("💀 Could not close the cursor on '{namespace}'"))?;
        }
        Ok(())
    }
}

/// ✍️ One insert per record, submitted as batched writes.
///
/// `batch_size = None` sends everything in one `bulkWrite`. With a batch size the records go
/// out in chunks; an ordered write stops sending chunks after the first one that reports a
/// failure, because "ordered" means "stop at the first failure", not "stop at the first
/// failure in this chunk but carry on with the next one".
pub(crate) async fn bulk_insert(
    client: &dyn MongoClient,
    namespace: &Namespace,
    records: Vec<Record>,
    ordered: bool,
    batch_size: Option<usize>,
) -> Result<WriteSummary> {
    let submitted = records.len();
    let mut summary = WriteSummary::empty(BackendKind::Mongo);
    summary.submitted = submitted;
    if records.is_empty() {
        return Ok(summary);
    }

    let chunk_len = batch_size.filter(|n| *n > 0).unwrap_or(submitted);
    let mut chunk_start = 0;
    let mut records = records.into_iter().peekable();

    while records.peek().is_some() {
        let operations: Vec<InsertOne> = records
            .by_ref()
            .take(chunk_len)
            .map(|document| InsertOne { document })
            .collect();
        let chunk_size = operations.len();
        let ids: Vec<Option<String>> = operations
            .iter()
            .map(|op| op.document.get("_id").and_then(identity_of))
            .collect();

        trace!("🍃 bulkWrite of {} inserts into {} (ordered={})", chunk_size, namespace, ordered);
        let outcome = client
            .bulk_write(namespace, operations, ordered)
            .await
            .with_context(|| format!("💀 bulkWrite into '{}' failed outright", namespace))?;

        summary.written += outcome.inserted_count;
        let chunk_failed = !outcome.write_errors.is_empty();
        summary
            .failures
            .extend(outcome.write_errors.into_iter().map(|err| WriteFailure {
                position: Some(chunk_start + err.index),
                id: ids.get(err.index).cloned().flatten(),
                reason: match err.code {
                    Some(code) => format!("E{code}: {}", err.message),
                    None => err.message,
                },
            }));

        chunk_start += chunk_size;
        if ordered && chunk_failed {
            debug!(
                "⚠️ ordered write into {} stopped at chunk starting {}",
                namespace,
                chunk_start - chunk_size
            );
            break;
        }
    }

    debug!("✅ {} of {} documents landed in {}", summary.written, submitted, namespace);
    Ok(summary)
}

/// 🏷️ Mongo `_id`s come in all shapes. Strings and numbers get a readable form.
pub(crate) fn identity_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
