//! 🚰 RecordStream: one lazy sequence of records, whatever backend is paging underneath.
//!
//! The stream pulls a page from its [`PagerBackend`] only when its buffer runs dry, hands
//! records out one at a time, and releases the backend's continuation state exactly once:
//! on exhaustion, on `max_results`, on error, on [`RecordStream::close`], or on drop.
//!
//! Drop can't `.await`, so a stream dropped mid-flight spawns its release onto the current
//! tokio runtime. Outside a runtime there is nowhere to run it, and we say so at `warn`.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use futures::Stream;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::backends::{Pager, PagerBackend, SplunkJobState};
use crate::common::{BackendKind, Record};

/// 🚰 The lazy record sequence returned by [`crate::query`].
#[derive(Debug)]
pub struct RecordStream {
    backend: BackendKind,
    pager: Option<PagerBackend>,
    buffer: VecDeque<Record>,
    yielded: u64,
    max_results: Option<u64>,
    finished: bool,
}

impl RecordStream {
    pub(crate) fn new(pager: PagerBackend, max_results: Option<u64>) -> Self {
        Self {
            backend: pager.kind(),
            pager: Some(pager),
            buffer: VecDeque::new(),
            yielded: 0,
            max_results,
            finished: false,
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// 📊 Records handed to the caller so far.
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 🚦 The Splunk job's state history. `None` for the other backends.
    pub fn splunk_history(&self) -> Option<&[SplunkJobState]> {
        match self.pager {
            Some(PagerBackend::Splunk(ref pager)) => Some(pager.history()),
            _ => None,
        }
    }

    /// 📡 The next record, or `None` once the backend has nothing more to say.
    ///
    /// After an error the stream is finished and its resources are already released.
    pub async fn next(&mut self) -> Option<Result<Record>> {
        loop {
            if self.finished {
                return None;
            }
            if self.max_results.is_some_and(|max| self.yielded >= max) {
                debug!("✂️ {} stream reached max_results={}", self.backend, self.yielded);
                self.buffer.clear();
                return self.release().await.err().map(Err);
            }
            if let Some(record) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(Ok(record));
            }

            let pager = self.pager.as_mut()?;
            match pager.next_page().await {
                Ok(Some(page)) => self.buffer.extend(page),
                Ok(None) => {
                    debug!("✅ {} stream exhausted after {} records", self.backend, self.yielded);
                    return self.release().await.err().map(Err);
                }
                Err(err) => {
                    if let Err(release_err) = self.release().await {
                        warn!(
                            "⚠️ {} stream failed, and releasing it failed too: {:#}",
                            self.backend, release_err
                        );
                    }
                    return Some(Err(err));
                }
            }
        }
    }

    // -- runs the pager's release at most once, whatever path got us here
    async fn release(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(pager) = self.pager.as_mut() {
            let backend = self.backend;
            pager
                .release()
                .await
                .with_context(|| format!("💀 Releasing the {backend} continuation state failed"))?;
        }
        Ok(())
    }

    /// 🗑️ Stop early and release now, with the error surfaced instead of logged.
    pub async fn close(mut self) -> Result<()> {
        self.buffer.clear();
        self.release().await
    }

    /// 📦 Drain everything into memory. Mind the size of what you asked for.
    pub async fn collect_all(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record?);
        }
        Ok(records)
    }

    /// 🔮 Adapt into a `futures::Stream` for `StreamExt` combinators.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }

    /// 🧱 The blocking variant. Each `Iterator::next` runs one pull to completion on `handle`.
    ///
    /// Must not be iterated from inside an async task; `Handle::block_on` panics there.
    pub fn blocking(self, handle: Handle) -> BlockingRecords {
        BlockingRecords {
            handle,
            stream: Some(self),
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let Some(mut pager) = self.pager.take() else {
            return;
        };
        let backend = self.backend;
        match Handle::try_current() {
            Ok(handle) => {
                debug!("🗑️ {} stream dropped early, releasing in the background", backend);
                handle.spawn(async move {
                    if let Err(err) = pager.release().await {
                        warn!(
                            "⚠️ background release of a dropped {} stream failed: {:#}",
                            backend, err
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    "⚠️ {} stream dropped outside a tokio runtime; its server-side state was not released",
                    backend
                );
            }
        }
    }
}

/// 🧱 Blocking iterator over a [`RecordStream`]. Closes the stream when dropped.
#[derive(Debug)]
pub struct BlockingRecords {
    handle: Handle,
    stream: Option<RecordStream>,
}

impl Iterator for BlockingRecords {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let stream = self.stream.as_mut()?;
        let item = self.handle.block_on(stream.next());
        if item.is_none() {
            self.stream = None;
        }
        item
    }
}

impl Drop for BlockingRecords {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            // -- can't block_on from inside a runtime. the stream's own Drop spawns the release.
            drop(stream);
        } else if let Err(err) = self.handle.block_on(stream.close()) {
            warn!("⚠️ closing a blocking record iterator failed: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::backends::elasticsearch::{ElasticsearchClient, ElasticsearchConfig, ScrollPager};
    use crate::backends::in_mem::{InMemoryMongo, InMemoryOdbc};
    use crate::backends::mongo::{FindOptions, MongoPager, Namespace};
    use crate::backends::odbc::{OdbcPager, PagingStrategy};

    async fn seeded_mongo(n: usize) -> (Arc<InMemoryMongo>, Namespace) {
        let mongo = Arc::new(InMemoryMongo::new());
        let ns = Namespace::new("t", "c");
        mongo
            .seed(&ns, (0..n).map(|i| Record::new().with("_id", i as u64)).collect())
            .await;
        (mongo, ns)
    }

    fn mongo_stream(
        mongo: &Arc<InMemoryMongo>,
        ns: &Namespace,
        batch: u32,
        max: Option<u64>,
    ) -> RecordStream {
        let pager = MongoPager::new(
            mongo.clone(),
            ns.clone(),
            json!({}),
            FindOptions { projection: None, batch_size: batch },
        );
        RecordStream::new(PagerBackend::Mongo(pager), max)
    }

    fn scroll_stream(server: &MockServer, max: Option<u64>) -> RecordStream {
        let client = ElasticsearchClient::new(ElasticsearchConfig::new(server.uri()))
            .expect("💀 client builds offline");
        let pager = ScrollPager::new(client, "logs".into(), json!({}), "2m".into(), 2);
        RecordStream::new(PagerBackend::Elasticsearch(pager), max)
    }

    fn hits(scroll_id: &str, n: usize) -> serde_json::Value {
        let hits: Vec<_> = (0..n).map(|i| json!({"_id": i.to_string(), "_source": {}})).collect();
        json!({"_scroll_id": scroll_id, "hits": {"hits": hits}})
    }

    async fn mount_clear(server: &MockServer, scroll_id: &str) {
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .and(body_partial_json(json!({"scroll_id": scroll_id})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"succeeded": true})))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn wait_for_delete(server: &MockServer) -> bool {
        for _ in 0..100 {
            let requests = server.received_requests().await.unwrap_or_default();
            if requests.iter().any(|r| r.method.as_str() == "DELETE") {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn the_one_where_records_flow_across_page_boundaries() -> Result<()> {
        let (mongo, ns) = seeded_mongo(5).await;
        let mut stream = mongo_stream(&mongo, &ns, 2, None);
        assert_eq!(mongo.stats().find_calls(), 0);

        let mut ids = Vec::new();
        while let Some(record) = stream.next().await {
            ids.push(record?["_id"].clone());
        }
        assert_eq!(ids, (0..5u64).map(|i| json!(i)).collect::<Vec<_>>());
        assert!(stream.is_finished());
        assert_eq!(stream.yielded(), 5);
        assert_eq!(mongo.stats().cursors_closed(), 1);

        assert!(stream.next().await.is_none(), "a finished stream stays finished");
        stream.close().await?;
        assert_eq!(mongo.stats().cursors_closed(), 1, "release runs once");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_max_results_stops_pulling_and_releases() -> Result<()> {
        let (mongo, ns) = seeded_mongo(10).await;
        let records = mongo_stream(&mongo, &ns, 2, Some(3)).collect_all().await?;
        assert_eq!(records.len(), 3);
        assert_eq!(mongo.stats().batches_served(), 2);
        assert_eq!(mongo.stats().cursors_closed(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_max_results_of_zero_never_touches_the_backend() -> Result<()> {
        let (mongo, ns) = seeded_mongo(3).await;
        let records = mongo_stream(&mongo, &ns, 2, Some(0)).collect_all().await?;
        assert!(records.is_empty());
        assert_eq!(mongo.stats().find_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_futures_adapter_sees_the_same_records() -> Result<()> {
        let (mongo, ns) = seeded_mongo(4).await;
        let items: Vec<Result<Record>> =
            mongo_stream(&mongo, &ns, 3, None).into_stream().collect().await;
        assert_eq!(items.len(), 4);
        assert!(items.iter().all(|r| r.is_ok()));
        assert_eq!(mongo.stats().cursors_closed(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_explicit_close_clears_the_scroll_once() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits("s1", 2)))
            .expect(1)
            .mount(&server)
            .await;
        mount_clear(&server, "s1").await;

        let mut stream = scroll_stream(&server, None);
        assert!(stream.next().await.is_some());
        stream.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_dropped_stream_still_clears_its_scroll() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits("s1", 2)))
            .mount(&server)
            .await;
        mount_clear(&server, "s1").await;

        let mut stream = scroll_stream(&server, None);
        assert!(stream.next().await.is_some());
        drop(stream);
        assert!(wait_for_delete(&server).await, "the background release never arrived");
    }

    #[tokio::test]
    async fn the_one_where_a_mid_stream_failure_still_cleans_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits("s1", 1)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(500).set_body_string("shard exploded"))
            .mount(&server)
            .await;
        mount_clear(&server, "s1").await;

        let mut stream = scroll_stream(&server, None);
        assert!(matches!(stream.next().await, Some(Ok(_))));
        let err = stream.next().await.expect("💀 the failure should surface").unwrap_err();
        assert!(format!("{err:#}").contains("shard exploded"));
        assert!(stream.next().await.is_none());
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn the_one_where_truncation_clears_the_scroll_without_another_page() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits("s1", 2)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits("s2", 2)))
            .expect(0)
            .mount(&server)
            .await;
        mount_clear(&server, "s1").await;

        let records = scroll_stream(&server, Some(2)).collect_all().await?;
        assert_eq!(records.len(), 2);
        Ok(())
    }

    #[test]
    fn the_one_where_the_blocking_iterator_walks_an_odbc_table() -> Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        let rows = (1..=7).map(|i| vec![json!(i)]).collect();
        let odbc = Arc::new(InMemoryOdbc::new(vec!["id".into()], rows));
        let pager = OdbcPager::new(
            odbc.clone(),
            "SELECT id FROM t".into(),
            PagingStrategy::LimitOffset,
            3,
            0,
        );
        let stream = RecordStream::new(PagerBackend::Odbc(pager), None);

        let ids: Vec<serde_json::Value> = stream
            .blocking(runtime.handle().clone())
            .map(|r| r.map(|record| record["id"].clone()))
            .collect::<Result<_>>()?;
        assert_eq!(ids.len(), 7);
        assert_eq!(ids[6], json!(7));
        assert_eq!(runtime.block_on(odbc.executed()).len(), 3);
        Ok(())
    }

    #[test]
    fn the_one_where_an_abandoned_blocking_iterator_closes_its_cursor() -> Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        let (mongo, ns) = runtime.block_on(seeded_mongo(6));
        let mut records = mongo_stream(&mongo, &ns, 2, None).blocking(runtime.handle().clone());
        assert!(records.next().is_some());
        drop(records);
        assert_eq!(mongo.stats().cursors_closed(), 1);
        Ok(())
    }
}
