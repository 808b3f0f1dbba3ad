//! 📦 **Common Query Config**: the shared knobs every paging adapter reads.
//!
//! 🧠 Knowledge graph:
//! - `QueryDefaults` lives in `[query]` of the app config and seeds every
//!   `QueryRequest` / `BulkInsertRequest` the CLI builds.
//! - Library callers who never touch config get the same numbers from `Default`.
//!   One opinion this time. We learned.
//!
//! "He who hardcodes a page size in three places, debugs three page sizes." 🦆

use std::time::Duration;

use serde::Deserialize;

/// 📦 Shared paging and batching defaults.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueryDefaults {
    /// 📄 Records per page / cursor batch / scroll window / results fetch.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// ⏳ Elasticsearch scroll keep-alive, in ES time units ("2m", "30s").
    #[serde(default = "default_scroll_ttl")]
    pub scroll_ttl: String,
    /// 🔄 Pause between Splunk job status checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// ⏱️ Give up on a Splunk job that is still not done after this long.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// 🚰 Max bytes per `_bulk` request body before we split it.
    #[serde(default = "default_max_request_size_bytes")]
    pub max_request_size_bytes: usize,
}

pub(crate) const DEFAULT_PAGE_SIZE: usize = 1000;
pub(crate) const DEFAULT_SCROLL_TTL: &str = "2m";
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);
// -- 10 MiB, same ceiling the sink side always used. 10 * 1024 * 1024, for the record.
pub(crate) const DEFAULT_MAX_REQUEST_SIZE_BYTES: usize = 10 * 1024 * 1024;

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_scroll_ttl() -> String {
    DEFAULT_SCROLL_TTL.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_poll_timeout_secs() -> u64 {
    DEFAULT_POLL_TIMEOUT.as_secs()
}

fn default_max_request_size_bytes() -> usize {
    DEFAULT_MAX_REQUEST_SIZE_BYTES
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            scroll_ttl: default_scroll_ttl(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            max_request_size_bytes: DEFAULT_MAX_REQUEST_SIZE_BYTES,
        }
    }
}

impl QueryDefaults {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}
