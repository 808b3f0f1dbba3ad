//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN: INT. SERVER ROOM, 3:47 AM
//!
//! Somebody asked for "all of it". Elasticsearch does not do "all of it". It does ten
//! thousand at a time, with a scroll token it expects you to bring back every visit, and a
//! keep-alive that quietly expires if you take too long in the bathroom.
//!
//! This module speaks both directions:
//! - 🚰 [`ScrollPager`]: opens a scroll on the first pull, follows the token page by page,
//!   and clears the scroll context exactly once when it's done (or dropped, or errored).
//! - ✍️ [`bulk_insert`]: turns records into `_bulk` NDJSON, split by request size, and reports
//!   per-item failures instead of pretending everything went fine.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::backends::{Pager, join_url};
use crate::common::{BackendKind, Record, WriteFailure, WriteSummary, json_kind};
use crate::error::BrokerError;

/// 🔧 Where the cluster lives and how to knock.
///
/// Auth is tri-modal: username+password, api_key, or "I hope anonymous works".
/// API key wins when both are set. Hierarchy. This struct respects hierarchy.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ElasticsearchConfig {
    /// 📡 Scheme + host + port. `localhost` alone is not a URL, no matter how it worked in dev.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

impl ElasticsearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
            accept_invalid_certs: false,
        }
    }
}

/// 📡 The native Elasticsearch handle. Cheap to clone; the connection pool is shared.
#[derive(Debug, Clone)]
pub struct ElasticsearchClient {
    http: reqwest::Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchClient {
    /// 🚀 Builds the HTTP client. No request leaves the building until someone pulls.
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("💀 The HTTP client refused to be born. Probably a TLS stack having a moment.")?;
        Ok(Self { http, config })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    // -- every endpoint funnels through here: auth, send, status check, JSON body
    async fn send_json(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| {
                format!("💀 The {what} request never made it to Elasticsearch at '{}'", self.url())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("💀 Elasticsearch answered the {what} request with {status}. Body: '{body}'");
        }
        response
            .json::<Value>()
            .await
            .with_context(|| format!("💀 The {what} response was not JSON"))
    }

    /// 🏓 `GET /`. Proves the cluster exists and likes our credentials.
    pub async fn ping(&self) -> Result<Value> {
        self.send_json(self.http.get(&self.config.url), "ping").await
    }

    /// 📜 `POST /{index}/_search?scroll=<ttl>&size=<n>`: first page plus a scroll id.
    pub async fn open_scroll(
        &self,
        index: &str,
        body: &Value,
        ttl: &str,
        size: usize,
    ) -> Result<Value> {
        let url = join_url(&self.config.url, &format!("{index}/_search"));
        trace!("📡 opening scroll on {} (ttl={}, size={})", index, ttl, size);
        let request = self
            .http
            .post(url)
            .query(&[("scroll", ttl.to_string()), ("size", size.to_string())])
            .json(body);
        self.send_json(request, "scroll search").await
    }

    /// 📜 `POST /_search/scroll`: the next page for a scroll id.
    pub async fn continue_scroll(&self, scroll_id: &str, ttl: &str) -> Result<Value> {
        let url = join_url(&self.config.url, "_search/scroll");
        trace!("📡 continuing scroll");
        let request = self
            .http
            .post(url)
            .json(&json!({ "scroll": ttl, "scroll_id": scroll_id }));
        self.send_json(request, "scroll continuation").await
    }

    /// 🗑️ `DELETE /_search/scroll`: frees the server-side scroll context.
    pub async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        let url = join_url(&self.config.url, "_search/scroll");
        trace!("🗑️ clearing scroll context");
        let request = self.http.delete(url).json(&json!({ "scroll_id": scroll_id }));
        self.send_json(request, "clear scroll").await.map(|_| ())
    }

    /// ✍️ `POST /_bulk` with an NDJSON body. Returns the raw bulk response.
    pub async fn bulk(&self, ndjson: String) -> Result<Value> {
        let url = join_url(&self.config.url, "_bulk");
        trace!("📡 bulk request of {} bytes", ndjson.len());
        let request = self
            .http
            .post(url)
            .header("Content-Type", "application/x-ndjson")
            .body(ndjson);
        self.send_json(request, "bulk").await
    }
}

/// 📜 Follows one scroll context from first page to last. The scroll id is the continuation.
#[derive(Debug)]
pub(crate) struct ScrollPager {
    client: ElasticsearchClient,
    index: String,
    body: Value,
    ttl: String,
    page_size: usize,
    scroll_id: Option<String>,
    started: bool,
    exhausted: bool,
}

impl ScrollPager {
    pub(crate) fn new(
        client: ElasticsearchClient,
        index: String,
        body: Value,
        ttl: String,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            index,
            body,
            ttl,
            page_size,
            scroll_id: None,
            started: false,
            exhausted: false,
        }
    }
}

#[async_trait]
impl Pager for ScrollPager {
    async fn next_page(&mut self) -> Result<Option<Vec<Record>>> {
        if self.exhausted {
            return Ok(None);
        }

        let response = if !self.started {
            self.started = true;
            self.client
                .open_scroll(&self.index, &self.body, &self.ttl, self.page_size)
                .await
                .with_context(|| format!("💀 Could not open a scroll on index '{}'", self.index))?
        } else {
            let Some(scroll_id) = self.scroll_id.clone() else {
                // -- started, not exhausted, no token: the previous response never gave us one
                self.exhausted = true;
                return Ok(None);
            };
            let index = &self.index;
            self.client
                .continue_scroll(&scroll_id, &self.ttl)
                .await
                .with_context(|| format!("💀 The scroll on '{index}' fell over mid-stream"))?
        };

        // 🔄 the token can change between pages. always keep the latest.
        if let Some(next_id) = response.get("_scroll_id").and_then(Value::as_str) {
            self.scroll_id = Some(next_id.to_string());
        }

        let hits = extract_hits(response)?;
        if hits.is_empty() {
            debug!("✅ scroll on {} returned zero hits, done", self.index);
            self.exhausted = true;
            return Ok(None);
        }
        debug!("📦 scroll page from {}: {} hits", self.index, hits.len());
        Ok(Some(hits))
    }

    async fn release(&mut self) -> Result<()> {
        self.exhausted = true;
        if let Some(scroll_id) = self.scroll_id.take() {
            let index = &self.index;
            self.client
                .clear_scroll(&scroll_id)
                .await
                .with_context(|| format!("💀 Could not clear the scroll context on '{index}'"))?;
            debug!("🗑️ scroll context on {} cleared", self.index);
        }
        Ok(())
    }
}

fn extract_hits(mut response: Value) -> Result<Vec<Record>> {
    let hits = match response.pointer_mut("/hits/hits").map(Value::take) {
        Some(Value::Array(hits)) => hits,
        Some(other) => {
            return Err(BrokerError::MalformedResponse {
                backend: BackendKind::Elasticsearch,
                detail: format!("hits.hits is {}, expected an array", json_kind(&other)),
            }
            .into());
        }
        None => {
            return Err(BrokerError::MalformedResponse {
                backend: BackendKind::Elasticsearch,
                detail: "search response has no hits.hits".to_string(),
            }
            .into());
        }
    };

    hits.into_iter()
        .map(|hit| {
            Record::try_from(hit).map_err(|_| {
                anyhow::Error::from(BrokerError::MalformedResponse {
                    backend: BackendKind::Elasticsearch,
                    detail: "a hit was not a JSON object".to_string(),
                })
            })
        })
        .collect()
}

// -- one record, rendered as its two bulk lines. id pulled from the record when present.
fn bulk_lines(index: &str, mut record: Record, id_field: &str) -> Result<(Option<String>, String)> {
    let id = if id_field.starts_with('_') {
        // -- metadata fields are rejected inside _source, so they move to the action line
        record.remove(id_field)
    } else {
        record.get(id_field).cloned()
    };

    let id = match id {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(BrokerError::InvalidParameter {
                parameter: "id_field",
                reason: format!(
                    "'{id_field}' holds {}, expected a string or a number",
                    json_kind(&other)
                ),
            }
            .into());
        }
    };

    let mut action = json!({ "index": { "_index": index } });
    if let Some(ref id) = id {
        action["index"]["_id"] = json!(id);
    }

    let source = serde_json::to_string(&record).context("💀 A record refused to serialize")?;
    Ok((id, format!("{action}\n{source}\n")))
}

/// ✍️ Index every record into `index`, one `_bulk` request per `max_request_size_bytes`.
///
/// Repeated inserts with the same identity overwrite rather than duplicate. A non-2xx
/// response is an error; item-level rejections land in the summary.
pub(crate) async fn bulk_insert(
    client: &ElasticsearchClient,
    index: &str,
    records: Vec<Record>,
    id_field: &str,
    max_request_size_bytes: usize,
) -> Result<WriteSummary> {
    let mut summary = WriteSummary::empty(BackendKind::Elasticsearch);
    summary.submitted = records.len();
    if records.is_empty() {
        return Ok(summary);
    }

    let mut body = String::new();
    let mut ids: Vec<Option<String>> = Vec::new();
    let mut chunk_start = 0;

    for record in records {
        let (id, lines) = bulk_lines(index, record, id_field)?;
        if !body.is_empty() && body.len() + lines.len() > max_request_size_bytes {
            let chunk_len = ids.len();
            let chunk_ids = std::mem::take(&mut ids);
            submit_chunk(
                client,
                std::mem::take(&mut body),
                &chunk_ids,
                chunk_start,
                &mut summary,
            )
            .await?;
            chunk_start += chunk_len;
        }
        body.push_str(&lines);
        ids.push(id);
    }
    if !body.is_empty() {
        submit_chunk(client, body, &ids, chunk_start, &mut summary).await?;
    }

    debug!("✅ {} of {} documents indexed into {}", summary.written, summary.submitted, index);
    Ok(summary)
}

async fn submit_chunk(
    client: &ElasticsearchClient,
    body: String,
    ids: &[Option<String>],
    chunk_start: usize,
    summary: &mut WriteSummary,
) -> Result<()> {
    let bytes = body.len();
    let response = client
        .bulk(body)
        .await
        .context("💀 The bulk submission stumbled. The NDJSON was built with care, and something still went sideways.")?;

    let items = response
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| BrokerError::MalformedResponse {
            backend: BackendKind::Elasticsearch,
            detail: "bulk response has no items array".to_string(),
        })?;

    for (i, item) in items.iter().enumerate() {
        let outcome = item.get("index").unwrap_or(item);
        let status = outcome.get("status").and_then(Value::as_u64).unwrap_or(0);
        if (200..300).contains(&status) {
            summary.written += 1;
            continue;
        }
        let reason = match outcome.get("error") {
            Some(Value::Object(err)) => format!(
                "{}: {}",
                err.get("type").and_then(Value::as_str).unwrap_or("error"),
                err.get("reason").and_then(Value::as_str).unwrap_or("no reason given")
            ),
            Some(other) => other.to_string(),
            None => format!("status {status}"),
        };
        summary.failures.push(WriteFailure {
            position: Some(chunk_start + i),
            id: outcome
                .get("_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| ids.get(i).cloned().flatten()),
            reason,
        });
    }

    trace!("🚀 bulk request of {} bytes landed, {} items", bytes, items.len());
    Ok(())
}
