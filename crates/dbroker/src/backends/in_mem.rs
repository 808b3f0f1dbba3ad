//! # Previously, on dbroker...
//!
//! 🎬 Two of our four backends talk through a driver we don't ship. Someone had to stand in
//! for them. Someone had to be a database so simple it lives entirely in RAM, gone the
//! moment you blink. That someone is this module.
//!
//! - [`InMemoryMongo`] implements [`MongoClient`]: collections in a map, equality filters,
//!   include/exclude projections, cursors that hand out `batch_size` documents per batch,
//!   and duplicate `_id` detection for bulk writes.
//! - [`InMemoryOdbc`] implements [`OdbcConnection`] over one table. It understands exactly
//!   the two paged statement shapes the ODBC pager emits (`LIMIT/OFFSET` and the
//!   `ROW_NUMBER()` window) plus `INSERT INTO`. It is not a SQL engine. Please do not ask it
//!   to join anything.
//!
//! 📊 Both count every native call so tests can assert "no native call happened" and
//! "exactly N fetches happened" without a single mock.
//!
//! ⚠️ For tests and local development. If you deploy this to prod, please also deploy a therapist.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::backends::mongo::{
    BulkWriteOutcome, FindOptions, InsertOne, MongoClient, MongoCursor, MongoWriteError, Namespace,
};
use crate::backends::odbc::{OdbcConnection, ResultSet};
use crate::common::Record;

// ============================================================
// 🍃 InMemoryMongo
// ============================================================

/// 📊 Call counters shared between the client and the cursors it opens.
#[derive(Debug, Default)]
pub struct InMemoryMongoStats {
    find_calls: AtomicUsize,
    next_batch_calls: AtomicUsize,
    batches_served: AtomicUsize,
    cursors_closed: AtomicUsize,
    bulk_writes: AtomicUsize,
    batch_sizes: std::sync::Mutex<Vec<usize>>,
}

impl InMemoryMongoStats {
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    /// 🔁 Every `next_batch` call, empty answers included.
    pub fn next_batch_calls(&self) -> usize {
        self.next_batch_calls.load(Ordering::SeqCst)
    }

    /// 📦 Non-empty batches handed out across all cursors.
    pub fn batches_served(&self) -> usize {
        self.batches_served.load(Ordering::SeqCst)
    }

    pub fn cursors_closed(&self) -> usize {
        self.cursors_closed.load(Ordering::SeqCst)
    }

    pub fn bulk_writes(&self) -> usize {
        self.bulk_writes.load(Ordering::SeqCst)
    }

    /// 📏 Size of every non-empty batch, in the order they were served.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .map(|sizes| sizes.clone())
            .unwrap_or_default()
    }
}

/// 🍃 A Mongo that fits in a HashMap.
#[derive(Debug, Default)]
pub struct InMemoryMongo {
    collections: Mutex<HashMap<Namespace, Vec<Record>>>,
    stats: Arc<InMemoryMongoStats>,
}

impl InMemoryMongo {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🌱 Drop documents straight into a collection. No bulk write, no stats.
    pub async fn seed(&self, namespace: &Namespace, documents: Vec<Record>) {
        self.collections
            .lock()
            .await
            .entry(namespace.clone())
            .or_default()
            .extend(documents);
    }

    pub async fn documents(&self, namespace: &Namespace) -> Vec<Record> {
        self.collections
            .lock()
            .await
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> &InMemoryMongoStats {
        &self.stats
    }
}

#[async_trait]
impl MongoClient for InMemoryMongo {
    async fn find(
        &self,
        namespace: &Namespace,
        filter: Value,
        options: FindOptions,
    ) -> Result<Box<dyn MongoCursor>> {
        self.stats.find_calls.fetch_add(1, Ordering::SeqCst);
        let Value::Object(filter) = filter else {
            bail!("💀 filter must be a document");
        };
        if options.batch_size == 0 {
            bail!("💀 batch_size must be positive");
        }

        let collections = self.collections.lock().await;
        let matched: VecDeque<Record> = collections
            .get(namespace)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, &filter))
                    .map(|doc| project(doc, options.projection.as_ref()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Box::new(InMemoryCursor {
            remaining: matched,
            batch_size: options.batch_size as usize,
            stats: Arc::clone(&self.stats),
            closed: false,
        }))
    }

    async fn bulk_write(
        &self,
        namespace: &Namespace,
        operations: Vec<InsertOne>,
        ordered: bool,
    ) -> Result<BulkWriteOutcome> {
        self.stats.bulk_writes.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(namespace.clone()).or_default();
        let mut outcome = BulkWriteOutcome::default();

        for (index, InsertOne { document }) in operations.into_iter().enumerate() {
            let duplicate = document
                .get("_id")
                .is_some_and(|id| docs.iter().any(|existing| existing.get("_id") == Some(id)));
            if duplicate {
                outcome.write_errors.push(MongoWriteError {
                    index,
                    code: Some(11000),
                    message: format!(
                        "duplicate key error collection: {namespace} dup key: {{ _id: {} }}",
                        document["_id"]
                    ),
                });
                if ordered {
                    break;
                }
                continue;
            }
            docs.push(document);
            outcome.inserted_count += 1;
        }
        Ok(outcome)
    }
}

#[derive(Debug)]
struct InMemoryCursor {
    remaining: VecDeque<Record>,
    batch_size: usize,
    stats: Arc<InMemoryMongoStats>,
    closed: bool,
}

#[async_trait]
impl MongoCursor for InMemoryCursor {
    async fn next_batch(&mut self) -> Result<Vec<Record>> {
        if self.closed {
            bail!("💀 cursor already closed");
        }
        self.stats.next_batch_calls.fetch_add(1, Ordering::SeqCst);
        let take = self.batch_size.min(self.remaining.len());
        let batch: Vec<Record> = self.remaining.drain(..take).collect();
        if !batch.is_empty() {
            self.stats.batches_served.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut sizes) = self.stats.batch_sizes.lock() {
                sizes.push(batch.len());
            }
        }
        Ok(batch)
    }

    fn is_exhausted(&self) -> bool {
        self.remaining.is_empty()
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.stats.cursors_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// -- 🔍 top-level equality only. `{}` matches everything.
fn matches_filter(doc: &Record, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(field, wanted)| doc.get(field) == Some(wanted))
}

// -- 🔍 Mongo projection rules, the short version: all-truthy = include (plus _id unless
// -- excluded), all-falsy = exclude.
fn project(doc: &Record, projection: Option<&Value>) -> Record {
    let Some(Value::Object(spec)) = projection else {
        return doc.clone();
    };
    if spec.is_empty() {
        return doc.clone();
    }
    let truthy = |v: &Value| match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    };
    let including = spec
        .iter()
        .any(|(field, flag)| field != "_id" && truthy(flag));

    if including {
        let keep_id = spec.get("_id").is_none_or(truthy);
        doc.iter()
            .filter(|(field, _)| {
                (field.as_str() == "_id" && keep_id)
                    || (field.as_str() != "_id" && spec.get(*field).is_some_and(truthy))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        doc.iter()
            .filter(|(field, _)| spec.get(*field).is_none_or(truthy))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

// ============================================================
// 🗄️ InMemoryOdbc
// ============================================================

/// 🗄️ One table, one connection, a memory for every statement it ever saw.
#[derive(Debug)]
pub struct InMemoryOdbc {
    columns: Vec<String>,
    rows: Mutex<Vec<Vec<Value>>>,
    executed: Mutex<Vec<String>>,
    batches: Mutex<Vec<(String, Vec<Vec<Value>>)>>,
    commits: AtomicUsize,
}

impl InMemoryOdbc {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: Mutex::new(rows),
            executed: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            commits: AtomicUsize::new(0),
        }
    }

    /// 📜 Every statement passed to `execute`, in order.
    pub async fn executed(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }

    /// ✍️ Every `execute_batch` call: statement plus parameter rows.
    pub async fn batches(&self) -> Vec<(String, Vec<Vec<Value>>)> {
        self.batches.lock().await.clone()
    }

    pub async fn row_count(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OdbcConnection for InMemoryOdbc {
    async fn execute(&self, statement: &str) -> Result<ResultSet> {
        self.executed.lock().await.push(statement.to_string());
        let rows = self.rows.lock().await;

        if let Some((limit, offset)) = parse_limit_offset(statement) {
            let page = rows.iter().skip(offset).take(limit).cloned().collect();
            return Ok(ResultSet {
                columns: self.columns.clone(),
                rows: page,
            });
        }

        if let Some((lower, upper)) = parse_rownum_window(statement) {
            // -- 🔢 the real window query adds a rownum column up front, so we do too
            let mut columns = vec!["rownum".to_string()];
            columns.extend(self.columns.iter().cloned());
            let page = rows
                .iter()
                .enumerate()
                .map(|(i, row)| (i + 1, row))
                .filter(|(n, _)| *n > lower && *n <= upper)
                .map(|(n, row)| {
                    let mut numbered = vec![Value::from(n)];
                    numbered.extend(row.iter().cloned());
                    numbered
                })
                .collect();
            return Ok(ResultSet { columns, rows: page });
        }

        Ok(ResultSet {
            columns: self.columns.clone(),
            rows: rows.clone(),
        })
    }

    async fn execute_batch(&self, statement: &str, parameters: Vec<Vec<Value>>) -> Result<u64> {
        self.batches
            .lock()
            .await
            .push((statement.to_string(), parameters.clone()));

        let Some(insert_columns) = parse_insert_columns(statement) else {
            bail!("💀 InMemoryOdbc only understands INSERT INTO <table> (<cols>) VALUES (...)");
        };
        // 🔀 map statement column order onto table column order, or refuse
        let mut positions = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            match insert_columns.iter().position(|c| c == column) {
                Some(p) => positions.push(p),
                None => bail!("💀 INSERT is missing column '{column}'"),
            }
        }
        if insert_columns.len() != self.columns.len() {
            bail!("💀 INSERT names columns the table does not have: {insert_columns:?}");
        }

        let mut rows = self.rows.lock().await;
        let inserted = parameters.len() as u64;
        for params in parameters {
            if params.len() != insert_columns.len() {
                bail!(
                    "💀 parameter row has {} values for {} columns",
                    params.len(),
                    insert_columns.len()
                );
            }
            rows.push(positions.iter().map(|p| params[*p].clone()).collect());
        }
        Ok(inserted)
    }

    async fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn parse_limit_offset(statement: &str) -> Option<(usize, usize)> {
    let (_, tail) = statement.rsplit_once(" LIMIT ")?;
    let mut words = tail.split_whitespace();
    let limit = words.next()?.parse().ok()?;
    if words.next()? != "OFFSET" {
        return None;
    }
    let offset = words.next()?.parse().ok()?;
    Some((limit, offset))
}

fn parse_rownum_window(statement: &str) -> Option<(usize, usize)> {
    let number_after = |marker: &str| -> Option<usize> {
        let (_, tail) = statement.rsplit_once(marker)?;
        tail.split_whitespace().next()?.parse().ok()
    };
    Some((number_after("rownum > ")?, number_after("rownum <= ")?))
}

fn parse_insert_columns(statement: &str) -> Option<Vec<String>> {
    let rest = statement.trim().strip_prefix("INSERT INTO ")?;
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    Some(
        rest[open + 1..close]
            .split(',')
            .map(|c| c.trim().to_string())
            .collect(),
    )
}
