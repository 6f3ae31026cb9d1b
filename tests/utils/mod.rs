// Copyright 2025 Cachefront Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared fixtures: a scripted origin, a collecting stream node and mock
//! gates for driving the reply engine end to end.

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cachefront::access::{Answer, ClearReason, Forward, HitAccess, IpCache, NeighborSink, ReplyAccess};
use cachefront::config::{ManualClock, ReplyConfig, TimeSource};
use cachefront::error::{Error, Result};
use cachefront::memory::MemStore;
use cachefront::message::{RequestHeader, ResponseHeader};
use cachefront::meta::{http_date, EntryMeta};
use cachefront::request::{ClientRequest, ConnHandle};
use cachefront::storage::Entry;
use cachefront::key::CacheKey;
use cachefront::{ReplyContext, StreamNode};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Leak a fresh store; Storage implementations hand out 'static references.
pub fn new_store() -> &'static MemStore {
    Box::leak(Box::new(MemStore::new()))
}

pub fn test_config() -> ReplyConfig {
    ReplyConfig::from_yaml("hostname: cache1.test").unwrap()
}

pub fn build_request(method: &str, uri: &str, headers: &[(&str, &str)]) -> ClientRequest {
    let mut req = RequestHeader::build(method, uri, Some(headers.len())).unwrap();
    for (k, v) in headers {
        req.append_header(*k, *v).unwrap();
    }
    ClientRequest::new(req, Some(ConnHandle::new(false)))
}

pub fn build_response(status: u16, headers: &[(&str, &str)]) -> ResponseHeader {
    let mut resp = ResponseHeader::build(status, Some(headers.len())).unwrap();
    for (k, v) in headers {
        resp.append_header(*k, *v).unwrap();
    }
    resp
}

/// Seed `store` with a finished object for `GET uri`.
pub fn seed_object(
    store: &MemStore,
    uri: &str,
    resp: &ResponseHeader,
    body: &[u8],
    admitted: SystemTime,
) -> Entry {
    let key = CacheKey::new(&Method::GET, uri);
    let meta = EntryMeta::from_response(resp, admitted, None);
    store.seed(&key, meta, body)
}

/// One canned origin exchange.
pub struct CannedReply {
    pub resp: ResponseHeader,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
    /// Abort the fetch instead of answering
    pub fail: bool,
}

impl CannedReply {
    pub fn new(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Self {
        CannedReply {
            resp: build_response(status, headers),
            body: body.to_vec(),
            delay: None,
            fail: false,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

/// A scripted origin: each started fetch consumes the next canned reply.
pub struct MockOrigin {
    replies: Mutex<VecDeque<CannedReply>>,
    fetches: AtomicUsize,
    /// The `lastmod` validator the engine put on outgoing requests
    pub seen_lastmod: Mutex<Vec<Option<SystemTime>>>,
    /// The `etag` validator the engine put on outgoing requests
    pub seen_etag: Mutex<Vec<Option<String>>>,
}

impl MockOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(MockOrigin {
            replies: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
            seen_lastmod: Mutex::new(Vec::new()),
            seen_etag: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: CannedReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Forward for MockOrigin {
    async fn start(&self, entry: &Entry, request: &ClientRequest) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.seen_lastmod.lock().push(request.lastmod);
        self.seen_etag.lock().push(
            request
                .etag
                .as_ref()
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
        );
        let canned = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| CannedReply::new(200, &[("content-length", "2")], b"ok"));
        let entry = entry.clone();
        tokio::spawn(async move {
            if let Some(delay) = canned.delay {
                tokio::time::sleep(delay).await;
            }
            let mut writer = entry.writer();
            if canned.fail {
                writer.abort();
                return;
            }
            writer.set_reply(EntryMeta::from_response(
                &canned.resp,
                SystemTime::now(),
                None,
            ));
            if !canned.body.is_empty() {
                writer.append(&canned.body);
            }
            writer.finish();
        });
        Ok(())
    }
}

/// The next stream node: collects everything the engine delivers and asserts
/// the header-before-body ordering as it goes.
#[derive(Default)]
pub struct CollectorNode {
    pub reply: Option<ResponseHeader>,
    pub body: Vec<u8>,
    pub eof: bool,
    pub errors: Vec<String>,
}

impl CollectorNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.reply.as_ref().map(|r| r.status.as_u16()).unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.reply
            .as_ref()?
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }

    pub fn header_all(&self, name: &str) -> Vec<String> {
        self.reply
            .as_ref()
            .map(|r| {
                r.headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .map(|v| v.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl StreamNode for CollectorNode {
    async fn send_headers(&mut self, reply: ResponseHeader) -> Result<()> {
        assert!(self.reply.is_none(), "headers delivered twice");
        assert!(self.body.is_empty(), "body arrived before headers");
        self.reply = Some(reply);
        Ok(())
    }

    async fn send_body(&mut self, data: Bytes, eof: bool) -> Result<()> {
        assert!(self.reply.is_some(), "body arrived before headers");
        assert!(!self.eof, "body after eof");
        self.body.extend_from_slice(&data);
        if eof {
            self.eof = true;
        }
        Ok(())
    }

    async fn send_error(&mut self, err: &Error) {
        self.errors.push(err.to_string());
    }
}

/// Records every neighbor invalidation broadcast.
#[derive(Default)]
pub struct NeighborRecorder {
    pub cleared: Mutex<Vec<(Option<String>, String, ClearReason)>>,
}

impl NeighborRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl NeighborSink for NeighborRecorder {
    fn htcp_clear(
        &self,
        entry: Option<&Entry>,
        _request: &ClientRequest,
        method: &Method,
        reason: ClearReason,
    ) {
        self.cleared.lock().push((
            entry.map(|e| e.store_id().to_string()),
            method.to_string(),
            reason,
        ));
    }
}

/// Records resolver-cache invalidations.
#[derive(Default)]
pub struct IpCacheRecorder {
    pub invalidated: Mutex<Vec<String>>,
    pub negative: Mutex<Vec<String>>,
}

impl IpCacheRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl IpCache for IpCacheRecorder {
    fn invalidate(&self, host: &str) {
        self.invalidated.lock().push(host.to_string());
    }

    fn invalidate_negative(&self, host: &str) {
        self.negative.lock().push(host.to_string());
    }
}

/// A reply gate that denies everything.
pub struct DenyAllReplies;

#[async_trait]
impl ReplyAccess for DenyAllReplies {
    async fn check(&self, _request: &ClientRequest, _reply: &ResponseHeader) -> Answer {
        Answer::Denied
    }
}

/// A send_hit gate that blocks every hit.
pub struct BlockAllHits;

impl HitAccess for BlockAllHits {
    fn fast_check(&self, _request: &ClientRequest, _reply: &ResponseHeader) -> Answer {
        Answer::Denied
    }
}

/// The standard engine assembly most scenarios use.
pub struct TestBench {
    pub store: &'static MemStore,
    pub origin: Arc<MockOrigin>,
    pub config: Arc<ReplyConfig>,
    pub clock: Arc<ManualClock>,
}

impl TestBench {
    pub fn new() -> Self {
        init_log();
        TestBench {
            store: new_store(),
            origin: MockOrigin::new(),
            config: Arc::new(test_config()),
            clock: Arc::new(ManualClock::new(SystemTime::now())),
        }
    }

    pub fn with_config(mut self, config: ReplyConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn context(&self, request: ClientRequest) -> ReplyContext {
        ReplyContext::new(request, self.store, self.origin.clone(), self.config.clone())
            .with_clock(self.clock.clone())
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// A 200 response fresh for an hour, with validators.
    pub fn fresh_response(&self, body_len: usize) -> ResponseHeader {
        build_response(
            200,
            &[
                ("cache-control", "max-age=3600"),
                ("content-length", &body_len.to_string()),
                ("date", &http_date(self.now())),
                ("last-modified", &http_date(self.now() - Duration::from_secs(9000))),
                ("etag", "\"v1\""),
            ],
        )
    }

    /// A 200 response that is already stale, with validators.
    pub fn stale_response(&self, body_len: usize) -> ResponseHeader {
        build_response(
            200,
            &[
                ("cache-control", "max-age=0"),
                ("content-length", &body_len.to_string()),
                ("date", &http_date(self.now() - Duration::from_secs(100))),
                ("last-modified", &http_date(self.now() - Duration::from_secs(9000))),
                ("etag", "\"v1\""),
            ],
        )
    }
}
