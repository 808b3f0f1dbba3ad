//! 🔎 The Splunk backend: submit a search job, wait for it, then page through its results.
//!
//! Splunk doesn't hand out cursors. It hands out *jobs*. You describe the search, it gives you
//! a `sid`, and then you get to ask "are we there yet?" until it says yes. Only then do the
//! results come out, `count` at a time, by offset.
//!
//! The adapter walks a small state machine and writes down every step:
//!
//! ```text
//! Created → Polling → Ready → Fetching → (Fetching while rows come back) → Done
//!    └──────────┴───────────────┴──→ Error
//! ```
//!
//! Status checks wait `poll_interval` between attempts and give up after `poll_timeout`.
//! The job is cancelled on release, whichever way the sequence ended.
//!
//! Splunk is read-only here. There is no bulk insert, and the dispatcher says so out loud.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::backends::{Pager, join_url};
use crate::common::{BackendKind, Record};
use crate::error::BrokerError;

/// 🔧 Connection block for the Splunk management port (usually `:8089`).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SplunkConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 Authentication token, sent as `Bearer`. Beats username/password when both are set.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

impl SplunkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            token: None,
            timeout_secs: default_timeout_secs(),
            accept_invalid_certs: false,
        }
    }
}

/// 🚦 Where a search job is in its life. See the module docs for the arrows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplunkJobState {
    Created,
    Polling,
    Ready,
    Fetching,
    Done,
    Error,
}

/// 📋 The bits of `GET /services/search/jobs/{sid}` we actually read.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub is_done: bool,
    pub dispatch_state: Option<String>,
    pub failure: Option<String>,
}

impl JobStatus {
    pub fn is_failed(&self) -> bool {
        self.dispatch_state.as_deref() == Some("FAILED")
    }
}

/// 📡 The native Splunk handle.
#[derive(Debug, Clone)]
pub struct SplunkClient {
    http: reqwest::Client,
    config: SplunkConfig,
}

impl SplunkClient {
    pub fn new(config: SplunkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("💀 Could not build the HTTP client for Splunk")?;
        Ok(Self { http, config })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref token) = self.config.token {
            request.bearer_auth(token)
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("💀 The {what} request never reached '{}'", self.url()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("💀 Splunk answered the {what} request with {status}. Body: '{body}'");
        }
        Ok(response)
    }

    async fn send_json(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        self.send(request, what)
            .await?
            .json::<Value>()
            .await
            .with_context(|| format!("💀 The {what} response was not JSON"))
    }

    /// 🚀 `POST /services/search/jobs`. Returns the job's `sid`.
    pub async fn create_job(
        &self,
        search: &str,
        count: usize,
        earliest_time: Option<&str>,
        latest_time: Option<&str>,
    ) -> Result<String> {
        let mut form = vec![
            ("search", search.to_string()),
            ("output_mode", "json".to_string()),
            ("count", count.to_string()),
        ];
        if let Some(earliest) = earliest_time {
            form.push(("earliest_time", earliest.to_string()));
        }
        if let Some(latest) = latest_time {
            form.push(("latest_time", latest.to_string()));
        }

        let url = join_url(&self.config.url, "services/search/jobs");
        trace!("📡 creating search job");
        let body = self.send_json(self.http.post(url).form(&form), "create job").await?;
        match body.get("sid").and_then(Value::as_str) {
            Some(sid) => Ok(sid.to_string()),
            None => Err(BrokerError::MalformedResponse {
                backend: BackendKind::Splunk,
                detail: "job creation response has no sid".to_string(),
            }
            .into()),
        }
    }

    /// 🔄 `GET /services/search/jobs/{sid}`.
    pub async fn job_status(&self, sid: &str) -> Result<JobStatus> {
        let url = join_url(&self.config.url, &format!("services/search/jobs/{sid}"));
        let body = self
            .send_json(self.http.get(url).query(&[("output_mode", "json")]), "job status")
            .await?;
        let content = body
            .pointer("/entry/0/content")
            .ok_or_else(|| BrokerError::MalformedResponse {
                backend: BackendKind::Splunk,
                detail: format!("status of job '{sid}' has no entry[0].content"),
            })?;

        let is_done = match content.get("isDone") {
            Some(Value::Bool(done)) => *done,
            Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            _ => false,
        };
        let failure = content
            .pointer("/messages/0/text")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(JobStatus {
            is_done,
            dispatch_state: content
                .get("dispatchState")
                .and_then(Value::as_str)
                .map(str::to_string),
            failure,
        })
    }

    /// 📦 `GET /services/search/jobs/{sid}/results?count&offset`. A row that isn't a JSON
    /// object fails the whole page with `MalformedResponse`.
    pub async fn results(&self, sid: &str, count: usize, offset: u64) -> Result<Vec<Record>> {
        let url = join_url(&self.config.url, &format!("services/search/jobs/{sid}/results"));
        let request = self.http.get(url).query(&[
            ("output_mode", "json".to_string()),
            ("count", count.to_string()),
            ("offset", offset.to_string()),
        ]);
        let mut body = self.send_json(request, "results").await?;
        let rows = match body.get_mut("results").map(Value::take) {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        };
        rows.into_iter()
            .enumerate()
            .map(|(i, row)| {
                Record::try_from(row).map_err(|_| {
                    anyhow::Error::from(BrokerError::MalformedResponse {
                        backend: BackendKind::Splunk,
                        detail: format!("result row {} is not a JSON object", offset + i as u64),
                    })
                })
            })
            .collect()
    }

    /// 🗑️ `DELETE /services/search/jobs/{sid}`.
    pub async fn cancel_job(&self, sid: &str) -> Result<()> {
        let url = join_url(&self.config.url, &format!("services/search/jobs/{sid}"));
        trace!("🗑️ cancelling search job {}", sid);
        self.send(self.http.delete(url).query(&[("output_mode", "json")]), "cancel job")
            .await
            .map(|_| ())
    }
}

/// 🔎 Search-job parameters beyond the search string.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SplunkJobOptions {
    pub page_size: usize,
    pub earliest_time: Option<String>,
    pub latest_time: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

/// 📄 One search job, driven from submission to the last results page.
#[derive(Debug)]
pub(crate) struct SplunkJobPager {
    client: SplunkClient,
    search: String,
    options: SplunkJobOptions,
    sid: Option<String>,
    offset: u64,
    history: Vec<SplunkJobState>,
    released: bool,
}

impl SplunkJobPager {
    pub(crate) fn new(client: SplunkClient, search: String, options: SplunkJobOptions) -> Self {
        Self {
            client,
            search,
            options,
            sid: None,
            offset: 0,
            history: Vec::new(),
            released: false,
        }
    }

    pub(crate) fn state(&self) -> Option<SplunkJobState> {
        self.history.last().copied()
    }

    pub(crate) fn history(&self) -> &[SplunkJobState] {
        &self.history
    }

    fn transition(&mut self, next: SplunkJobState) {
        debug!(
            "🚦 splunk job {}: {:?} -> {:?}",
            self.sid.as_deref().unwrap_or("(unsubmitted)"),
            self.state(),
            next
        );
        self.history.push(next);
    }

    async fn submit_and_wait(&mut self) -> Result<String> {
        self.transition(SplunkJobState::Created);
        let sid = self
            .client
            .create_job(
                &self.search,
                self.options.page_size,
                self.options.earliest_time.as_deref(),
                self.options.latest_time.as_deref(),
            )
            .await
            .context("💀 Splunk refused to create the search job")?;
        self.sid = Some(sid.clone());

        self.transition(SplunkJobState::Polling);
        let started = Instant::now();
        let mut checks = 0u32;
        loop {
            checks += 1;
            let status = self
                .client
                .job_status(&sid)
                .await
                .with_context(|| format!("💀 Status check {checks} on job '{sid}' failed"))?;
            trace!(
                "🔄 job {} check {}: done={} state={:?}",
                sid, checks, status.is_done, status.dispatch_state
            );

            if status.is_failed() {
                return Err(BrokerError::JobFailed {
                    sid,
                    reason: status.failure.unwrap_or_else(|| "dispatchState FAILED".to_string()),
                }
                .into());
            }
            if status.is_done {
                break;
            }

            let waited = started.elapsed();
            if waited >= self.options.poll_timeout {
                return Err(BrokerError::PollTimeout { sid, waited }.into());
            }
            let remaining = self.options.poll_timeout - waited;
            tokio::time::sleep(self.options.poll_interval.min(remaining)).await;
        }

        debug!("✅ job {} done after {} status checks", sid, checks);
        self.transition(SplunkJobState::Ready);
        Ok(sid)
    }

    async fn advance(&mut self) -> Result<Option<Vec<Record>>> {
        if self.released {
            return Ok(None);
        }
        let sid = match (self.state(), self.sid.clone()) {
            (Some(SplunkJobState::Done | SplunkJobState::Error), _) => return Ok(None),
            (None, _) => self.submit_and_wait().await?,
            (_, Some(sid)) => sid,
            (_, None) => return Ok(None),
        };

        self.transition(SplunkJobState::Fetching);
        let offset = self.offset;
        let rows = self
            .client
            .results(&sid, self.options.page_size, offset)
            .await
            .with_context(|| format!("💀 Results of job '{sid}' at offset {offset} failed"))?;

        if rows.is_empty() {
            self.transition(SplunkJobState::Done);
            return Ok(None);
        }
        self.offset += rows.len() as u64;
        debug!("📦 job {}: {} rows, offset now {}", sid, rows.len(), self.offset);
        Ok(Some(rows))
    }
}

#[async_trait]
impl Pager for SplunkJobPager {
    async fn next_page(&mut self) -> Result<Option<Vec<Record>>> {
        let page = self.advance().await;
        if page.is_err() {
            self.transition(SplunkJobState::Error);
        }
        page
    }

    async fn release(&mut self) -> Result<()> {
        // -- stopping early still ends the job. Error stays Error.
        if matches!(self.state(), Some(SplunkJobState::Ready | SplunkJobState::Fetching)) {
            self.transition(SplunkJobState::Done);
        }
        self.released = true;
        if let Some(sid) = self.sid.take() {
            self.client
                .cancel_job(&sid)
                .await
                .with_context(|| format!("💀 Could not cancel search job '{sid}'"))?;
            debug!("🗑️ splunk job {} cancelled", sid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use SplunkJobState::*;

    fn options(page_size: usize) -> SplunkJobOptions {
        SplunkJobOptions {
            page_size,
            earliest_time: None,
            latest_time: None,
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_secs(5),
        }
    }

    fn pager(server: &MockServer, options: SplunkJobOptions) -> SplunkJobPager {
        let client =
            SplunkClient::new(SplunkConfig::new(server.uri())).expect("💀 client builds offline");
        SplunkJobPager::new(client, "search index=main".into(), options)
    }

    fn status(done: bool, state: &str) -> Value {
        json!({"entry": [{"content": {"isDone": done, "dispatchState": state}}]})
    }

    async fn mount_create(server: &MockServer, sid: &str) {
        Mock::given(method("POST"))
            .and(path("/services/search/jobs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"sid": sid})))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn mount_cancel(server: &MockServer, sid: &str, times: u64) {
        Mock::given(method("DELETE"))
            .and(path(format!("/services/search/jobs/{sid}")))
            .respond_with(ResponseTemplate::new(200))
            .expect(times)
            .mount(server)
            .await;
    }

    async fn mount_results(server: &MockServer, sid: &str, offset: &str, rows: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/services/search/jobs/{sid}/results")))
            .and(query_param("offset", offset))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": rows})))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn the_one_where_the_job_walks_every_state_in_order() -> Result<()> {
        let server = MockServer::start().await;
        mount_create(&server, "42").await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/42"))
            .and(query_param("output_mode", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(status(false, "RUNNING")))
            .with_priority(1)
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(status(true, "DONE")))
            .expect(1)
            .mount(&server)
            .await;
        mount_results(&server, "42", "0", json!([{"host": "a"}, {"host": "b"}])).await;
        mount_results(&server, "42", "2", json!([{"host": "c"}])).await;
        mount_results(&server, "42", "3", json!([])).await;
        mount_cancel(&server, "42", 1).await;

        let mut pager = pager(&server, options(2));
        assert!(pager.history().is_empty(), "nothing happens before the first pull");

        let mut hosts = Vec::new();
        while let Some(page) = pager.next_page().await? {
            hosts.extend(page.into_iter().map(|r| r["host"].clone()));
        }
        assert_eq!(hosts, vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(pager.history(), &[Created, Polling, Ready, Fetching, Fetching, Fetching, Done]);

        pager.release().await?;
        pager.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_time_bounds_ride_along_with_the_job() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/search/jobs"))
            .and(body_string_contains("earliest_time=-1h"))
            .and(body_string_contains("latest_time=now"))
            .and(body_string_contains("output_mode=json"))
            .and(body_string_contains("count=5"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"sid": "7"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(status(true, "DONE")))
            .mount(&server)
            .await;
        mount_results(&server, "7", "0", json!([])).await;
        mount_cancel(&server, "7", 1).await;

        let mut opts = options(5);
        opts.earliest_time = Some("-1h".into());
        opts.latest_time = Some("now".into());
        let mut pager = pager(&server, opts);
        assert!(pager.next_page().await?.is_none());
        pager.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_dispatch_is_a_job_failure() -> Result<()> {
        let server = MockServer::start().await;
        mount_create(&server, "9").await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entry": [{"content": {"isDone": true, "dispatchState": "FAILED", "messages": [{"type": "FATAL", "text": "Unknown search command 'serach'"}]}}]
            })))
            .mount(&server)
            .await;
        mount_cancel(&server, "9", 1).await;

        let mut pager = pager(&server, options(10));
        let err = pager.next_page().await.unwrap_err();
        match err.downcast_ref::<BrokerError>() {
            Some(BrokerError::JobFailed { sid, reason }) => {
                assert_eq!(sid, "9");
                assert!(reason.contains("serach"));
            }
            other => panic!("💀 expected JobFailed, got {other:?}"),
        }
        assert_eq!(pager.history(), &[Created, Polling, Error]);
        assert!(pager.next_page().await?.is_none(), "an errored job stays finished");
        pager.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_polling_gives_up_instead_of_spinning_forever() -> Result<()> {
        let server = MockServer::start().await;
        mount_create(&server, "slow").await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/slow"))
            .respond_with(ResponseTemplate::new(200).set_body_json(status(false, "RUNNING")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/slow/results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [{"x": 1}]})))
            .expect(0)
            .mount(&server)
            .await;
        mount_cancel(&server, "slow", 1).await;

        let mut opts = options(10);
        opts.poll_interval = Duration::from_millis(10);
        opts.poll_timeout = Duration::from_millis(60);
        let mut pager = pager(&server, opts);

        let err = pager.next_page().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BrokerError>(),
            Some(BrokerError::PollTimeout { sid, .. }) if sid == "slow"
        ));
        assert!(!pager.history().contains(&Fetching), "never fetch while the job is not done");
        pager.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_junk_row_fails_the_page_instead_of_shifting_offsets() -> Result<()> {
        let server = MockServer::start().await;
        mount_create(&server, "j").await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/j"))
            .respond_with(ResponseTemplate::new(200).set_body_json(status(true, "DONE")))
            .mount(&server)
            .await;
        mount_results(&server, "j", "0", json!(["junk", {"n": 1}])).await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/j/results"))
            .and(query_param("offset", "1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": [{"n": 1}, {"n": 2}]})),
            )
            .expect(0)
            .mount(&server)
            .await;
        mount_cancel(&server, "j", 1).await;

        let mut pager = pager(&server, options(2));
        let err = pager.next_page().await.unwrap_err();
        match err.downcast_ref::<BrokerError>() {
            Some(BrokerError::MalformedResponse { backend, detail }) => {
                assert_eq!(*backend, BackendKind::Splunk);
                assert!(detail.contains("row 0"), "{detail}");
            }
            other => panic!("💀 expected MalformedResponse, got {other:?}"),
        }
        assert!(pager.next_page().await?.is_none(), "no re-fetch from a shifted offset");
        assert_eq!(pager.history(), &[Created, Polling, Ready, Fetching, Error]);
        pager.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_stopping_mid_job_still_lands_on_done() -> Result<()> {
        let server = MockServer::start().await;
        mount_create(&server, "half").await;
        Mock::given(method("GET"))
            .and(path("/services/search/jobs/half"))
            .respond_with(ResponseTemplate::new(200).set_body_json(status(true, "DONE")))
            .mount(&server)
            .await;
        mount_results(&server, "half", "0", json!([{"n": 1}, {"n": 2}])).await;
        mount_cancel(&server, "half", 1).await;

        let mut pager = pager(&server, options(2));
        assert_eq!(pager.next_page().await?.map(|page| page.len()), Some(2));
        pager.release().await?;
        pager.release().await?;
        assert_eq!(pager.history(), &[Created, Polling, Ready, Fetching, Done]);
        assert!(pager.next_page().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_rejected_submission_leaves_nothing_to_cancel() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/search/jobs"))
            .respond_with(ResponseTemplate::new(401).set_body_string("who are you"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut pager = pager(&server, options(10));
        let err = pager.next_page().await.unwrap_err();
        assert!(format!("{err:#}").contains("401"));
        assert_eq!(pager.history(), &[Created, Error]);
        pager.release().await?;
        Ok(())
    }
}
