//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 Every backend has its own idea of "give me the next page": a Mongo cursor batches,
//! an Elasticsearch scroll hands out window tokens, a Splunk job has to be polled until it
//! finishes and then paged by offset, and an ODBC driver just re-runs a statement with a
//! different LIMIT. This module is the casting agency that makes all four audition for the
//! same role: [`Pager`].
//!
//! 🎭 [`PagerBackend`] is the tagged union over the four continuation strategies. The
//! dispatcher picks the variant once, the stream drives it, and nobody downstream ever
//! asks which one it was. That's called abstraction. We put it in the docs.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{BackendKind, Record};

pub mod common_config;
pub mod elasticsearch;
pub mod in_mem;
pub mod mongo;
pub mod odbc;
pub mod splunk;

// 🎯 Re-export the configs so callers can say `backends::QueryDefaults` and move on with life.
pub use common_config::QueryDefaults;
pub use elasticsearch::{ElasticsearchClient, ElasticsearchConfig};
pub use splunk::{SplunkClient, SplunkConfig, SplunkJobState};

/// 📄 A continuation strategy that produces one page of records per call.
///
/// # Contract 📜
/// - The first call is the first native call. Constructing a pager never touches the network.
/// - `Ok(Some(page))` carries at least one record. `Ok(None)` means the backend has nothing
///   more to say, ever. Pagers never hand out empty pages.
/// - `release` frees whatever the backend is holding for us (scroll context, search job,
///   server cursor). It is idempotent: the second call is a no-op.
/// - The continuation state inside is owned by exactly one pager. `&mut self` enforces it.
#[async_trait]
pub(crate) trait Pager: std::fmt::Debug + Send {
    /// 📡 Advance the continuation state by one page.
    async fn next_page(&mut self) -> Result<Option<Vec<Record>>>;

    /// 🗑️ Give back the server-side resources. Safe to call at any time, any number of times.
    async fn release(&mut self) -> Result<()>;
}

/// 🎭 The many faces of a Pager: mongo-cursor, es-scroll, splunk-job, odbc-offset.
#[derive(Debug)]
pub(crate) enum PagerBackend {
    Mongo(mongo::MongoPager),
    Elasticsearch(elasticsearch::ScrollPager),
    Splunk(splunk::SplunkJobPager),
    Odbc(odbc::OdbcPager),
}

impl PagerBackend {
    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            PagerBackend::Mongo(_) => BackendKind::Mongo,
            PagerBackend::Elasticsearch(_) => BackendKind::Elasticsearch,
            PagerBackend::Splunk(_) => BackendKind::Splunk,
            PagerBackend::Odbc(_) => BackendKind::Odbc,
        }
    }
}

#[async_trait]
impl Pager for PagerBackend {
    async fn next_page(&mut self) -> Result<Option<Vec<Record>>> {
        match self {
            PagerBackend::Mongo(p) => p.next_page().await,
            PagerBackend::Elasticsearch(p) => p.next_page().await,
            PagerBackend::Splunk(p) => p.next_page().await,
            PagerBackend::Odbc(p) => p.next_page().await,
        }
    }

    async fn release(&mut self) -> Result<()> {
        match self {
            PagerBackend::Mongo(p) => p.release().await,
            PagerBackend::Elasticsearch(p) => p.release().await,
            PagerBackend::Splunk(p) => p.release().await,
            PagerBackend::Odbc(p) => p.release().await,
        }
    }
}

/// 📐 Applies the trailing-slash hygiene every HTTP backend needs.
/// Without it: `https://host//_bulk`. With it: `https://host/_bulk`. One slash, infinite suffering.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_slashes_are_not_doubled() {
        assert_eq!(join_url("http://es:9200/", "/_bulk"), "http://es:9200/_bulk");
        assert_eq!(join_url("http://es:9200", "logs/_search"), "http://es:9200/logs/_search");
    }
}
