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

//! The client-side reply engine of an HTTP caching proxy.
//!
//! Given a parsed client request already admitted by the front end, a
//! [ReplyContext] decides whether the response is served from the shared
//! object cache, revalidated against the origin, fetched fresh, purged, or
//! denied, and then streams the finished response (with rewritten headers)
//! to the next node of the client-facing pipeline.
//!
//! The engine owns none of its collaborators: the store, the forwarding
//! subsystem, access checks, neighbor invalidation and the clock are all
//! injected at construction, so multiple engines can run side by side and
//! tests can assemble exactly the world they need.

#![allow(clippy::new_without_default)]

use http::{Method, StatusCode};
use log::debug;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::SystemTime;
use strum::IntoStaticStr;

/// The PURGE method, not a registered [http::Method] constant
pub static METHOD_PURGE: Lazy<Method> = Lazy::new(|| Method::from_bytes(b"PURGE").unwrap());

pub mod access;
pub mod conditional;
pub mod config;
pub mod error;
mod filters;
mod hit;
pub mod key;
mod lookup;
pub mod memory;
pub mod message;
pub mod meta;
mod miss;
mod pump;
mod purge;
pub mod request;
mod revalidate;
pub mod storage;
pub mod vary;

use access::{AuthDecorator, Forward, HitAccess, IpCache, NeighborSink, ReplyAccess};
use config::{ReplyConfig, SystemClock, TimeSource};
use error::Result;
use key::{CacheKey, HashBinary};
use message::ResponseHeader;
pub use pump::{StreamNode, StreamStatus};
use request::ClientRequest;
use storage::{Entry, Storage, Subscription};

/// How this transaction was (or is being) satisfied; one tag per transaction,
/// refined as the decision machine progresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    /// Nothing decided yet
    None,
    /// Served from cache
    Hit,
    /// Served from the memory-resident portion of the cache
    MemHit,
    /// Served a cached object because the proxy is offline
    OfflineHit,
    /// Served a negatively cached error reply
    NegativeHit,
    /// 304 answered from cache for an If-Modified-Since request
    ImsHit,
    /// 304 answered from cache for an If-None-Match request
    InmHit,
    /// Fetched from the origin
    Miss,
    /// Client forced a refetch with no-cache
    ClientRefreshMiss,
    /// The store failed to deliver a located object
    SwapfailMiss,
    /// A stale entry is being revalidated
    Refresh,
    /// Origin confirmed the stale entry is still fresh
    RefreshUnmodified,
    /// Origin sent a new body for the stale entry
    RefreshModified,
    /// Revalidation failed; the stale entry was served anyway
    RefreshFailOld,
    /// Revalidation failed; the origin error was forwarded
    RefreshFailErr,
    /// A predecided redirect was synthesized
    Redirect,
    /// The request was denied
    Denied,
    /// The reply was denied by the reply-direction gate
    DeniedReply,
}

impl Tag {
    /// Convert [Tag] as `str`, for logging and debugging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::None => "NONE",
            Tag::Hit => "TCP_HIT",
            Tag::MemHit => "TCP_MEM_HIT",
            Tag::OfflineHit => "TCP_OFFLINE_HIT",
            Tag::NegativeHit => "TCP_NEGATIVE_HIT",
            Tag::ImsHit => "TCP_IMS_HIT",
            Tag::InmHit => "TCP_INM_HIT",
            Tag::Miss => "TCP_MISS",
            Tag::ClientRefreshMiss => "TCP_CLIENT_REFRESH_MISS",
            Tag::SwapfailMiss => "TCP_SWAPFAIL_MISS",
            Tag::Refresh => "TCP_REFRESH",
            Tag::RefreshUnmodified => "TCP_REFRESH_UNMODIFIED",
            Tag::RefreshModified => "TCP_REFRESH_MODIFIED",
            Tag::RefreshFailOld => "TCP_REFRESH_FAIL_OLD",
            Tag::RefreshFailErr => "TCP_REFRESH_FAIL_ERR",
            Tag::Redirect => "TCP_REDIRECT",
            Tag::Denied => "TCP_DENIED",
            Tag::DeniedReply => "TCP_DENIED_REPLY",
        }
    }

    /// Whether the client was (or will be) answered out of the cache
    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            Tag::Hit
                | Tag::MemHit
                | Tag::OfflineHit
                | Tag::NegativeHit
                | Tag::ImsHit
                | Tag::InmHit
                | Tag::RefreshUnmodified
                | Tag::RefreshFailOld
        )
    }

    /// The hit-or-forward part of the Cache-Status header, when one applies
    pub fn cache_status_source(&self) -> Option<&'static str> {
        if self.is_hit() {
            return Some(";hit");
        }
        match self {
            Tag::Miss | Tag::SwapfailMiss => Some(";fwd=miss"),
            Tag::ClientRefreshMiss => Some(";fwd=request"),
            Tag::Refresh | Tag::RefreshModified | Tag::RefreshFailErr => Some(";fwd=stale"),
            _ => None,
        }
    }
}

/// The context's role in a collapsed revalidation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum CollapsedRole {
    /// Not part of a collapsed revalidation
    None,
    /// This context started the shared upstream fetch
    Initiator,
    /// This context consumes another initiator's fetch
    Slave,
}

#[derive(Debug, Default)]
pub(crate) struct ReplyFlags {
    /// The rewritten headers went to the next node; never unset afterwards
    pub headers_sent: bool,
    /// Identification is done, remaining work is copying bytes
    pub store_logic_complete: bool,
    /// The reply stream ended (cleanly or not)
    pub complete: bool,
    /// No (more) body bytes wanted, e.g. HEAD
    pub done_copying: bool,
}

// the store context saved aside while a revalidation is in flight
pub(crate) struct Shadow {
    pub entry: Entry,
    pub subscription: Option<Subscription>,
    pub lastmod: Option<SystemTime>,
    pub etag: Option<http::HeaderValue>,
    pub reqofs: u64,
    pub reqsize: u64,
}

/// The per-transaction reply state machine.
///
/// One [ReplyContext] exists per client HTTP transaction. The owning stream
/// head drives it with [Self::get_more_data()] and consults
/// [Self::reply_status()] to learn how the stream ended.
pub struct ReplyContext {
    pub(crate) request: ClientRequest,
    pub(crate) storage: &'static dyn Storage,
    pub(crate) forward: Arc<dyn Forward>,
    pub(crate) config: Arc<ReplyConfig>,
    pub(crate) clock: Arc<dyn TimeSource>,
    pub(crate) hit_access: Option<Arc<dyn HitAccess>>,
    pub(crate) reply_access: Option<Arc<dyn ReplyAccess>>,
    pub(crate) neighbors: Option<Arc<dyn NeighborSink>>,
    pub(crate) ip_cache: Option<Arc<dyn IpCache>>,
    pub(crate) auth: Option<Arc<dyn AuthDecorator>>,

    pub(crate) entry: Option<Entry>,
    pub(crate) subscription: Option<Subscription>,
    // the cloned outgoing reply, kept for the transaction's lifetime
    pub(crate) reply: Option<ResponseHeader>,
    // bytes copied from the store since the current entry was attached
    pub(crate) reqofs: u64,
    pub(crate) reqsize: u64,
    // body bytes delivered to the next node
    pub(crate) out_offset: u64,
    pub(crate) shadow: Option<Shadow>,
    pub(crate) flags: ReplyFlags,
    pub(crate) collapsed: CollapsedRole,
    // the key under which this initiator advertised its revalidation fetch
    pub(crate) reval_key: Option<CacheKey>,
    pub(crate) purge_status: Option<StatusCode>,
    pub(crate) first_lookup: Option<&'static str>,
    pub(crate) tag: Tag,
    pub(crate) deleting: bool,
    // vary re-query state
    pub(crate) vary_key: Option<HashBinary>,
    pub(crate) lookup_rounds: u8,
    pub(crate) qos_applied: bool,
    // the body overflowed the configured cap mid-stream
    pub(crate) too_big: bool,
    // the stale reply from the origin was ignored per RFC 9111 section 4
    pub(crate) ignored_stale_reply: bool,
}

impl ReplyContext {
    /// Create a context for one transaction.
    pub fn new(
        request: ClientRequest,
        storage: &'static dyn Storage,
        forward: Arc<dyn Forward>,
        config: Arc<ReplyConfig>,
    ) -> Self {
        ReplyContext {
            request,
            storage,
            forward,
            config,
            clock: Arc::new(SystemClock),
            hit_access: None,
            reply_access: None,
            neighbors: None,
            ip_cache: None,
            auth: None,
            entry: None,
            subscription: None,
            reply: None,
            reqofs: 0,
            reqsize: 0,
            out_offset: 0,
            shadow: None,
            flags: ReplyFlags::default(),
            collapsed: CollapsedRole::None,
            reval_key: None,
            purge_status: None,
            first_lookup: None,
            tag: Tag::None,
            deleting: false,
            vary_key: None,
            lookup_rounds: 0,
            qos_applied: false,
            too_big: false,
            ignored_stale_reply: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hit_access(mut self, gate: Arc<dyn HitAccess>) -> Self {
        self.hit_access = Some(gate);
        self
    }

    pub fn with_reply_access(mut self, gate: Arc<dyn ReplyAccess>) -> Self {
        self.reply_access = Some(gate);
        self
    }

    pub fn with_neighbors(mut self, sink: Arc<dyn NeighborSink>) -> Self {
        self.neighbors = Some(sink);
        self
    }

    pub fn with_ip_cache(mut self, cache: Arc<dyn IpCache>) -> Self {
        self.ip_cache = Some(cache);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthDecorator>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// The decision tag reached so far
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// This context's role in a collapsed revalidation
    pub fn collapsed_role(&self) -> CollapsedRole {
        self.collapsed
    }

    /// The first store lookup's classification ("match", "mismatch",
    /// "no-cache"); later internal lookups never overwrite it.
    pub fn first_lookup_detail(&self) -> Option<&'static str> {
        self.first_lookup
    }

    /// Whether the RFC 9111 most-recent-Date rule made the engine ignore an
    /// origin reply during revalidation (access-log detail).
    pub fn ignored_stale_reply(&self) -> bool {
        self.ignored_stale_reply
    }

    /// The request this context answers
    pub fn request(&self) -> &ClientRequest {
        &self.request
    }

    pub(crate) fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// The public cache key the current request addresses, including any
    /// variance learned from vary evaluation.
    pub(crate) fn public_key(&self) -> CacheKey {
        let mut key = CacheKey::new(self.request.method(), self.request.effective_uri());
        if let Some(variance) = self.vary_key {
            key.set_variance_key(variance);
        }
        key
    }

    /// Attach `entry` as the context's current object and subscribe to it.
    pub(crate) fn attach_entry(&mut self, entry: Entry) {
        // the old subscription must be gone before the new one registers
        self.subscription = None;
        self.subscription = Some(entry.subscribe());
        self.entry = Some(entry);
        self.reqofs = 0;
        self.reqsize = 0;
    }

    /// Drop the current entry and its subscription.
    pub(crate) fn detach_entry(&mut self) {
        self.subscription = None;
        self.entry = None;
    }

    /// The sole driver. Runs the transaction to quiescence: classification,
    /// the chosen decision path, and streaming of the finished reply into
    /// `next`.
    pub async fn get_more_data(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        if self.deleting {
            return Ok(());
        }
        if self.flags.store_logic_complete {
            // the object is identified; all that is left is copying bytes
            return self.pump_body(next).await;
        }
        if self.request.method() == &*METHOD_PURGE {
            return self.purge_request(next).await;
        }
        if self.request.method() == &Method::TRACE {
            if self.request.max_forwards() == Some(0) {
                return self.trace_reply(next).await;
            }
            // continue forwarding, not finished yet
            self.tag = Tag::Miss;
            return self.process_miss(next).await;
        }
        self.identify_store_object(next).await
    }

    /// Tear the context down. Pending deliveries are ignored from here on;
    /// all store references are released.
    pub fn detach(&mut self) {
        self.deleting = true;
        self.release_revalidation(false);
        self.detach_entry();
        self.shadow = None;
        self.reply = None;
    }

    /// Withdraw this initiator's revalidation advertisement, if one is live.
    pub(crate) fn release_revalidation(&mut self, promote: bool) {
        if let Some(key) = self.reval_key.take() {
            if let Some(entry) = self.entry.as_ref() {
                self.storage.finish_revalidation(&key, entry, promote);
            }
        }
    }

    /// Inject an engine-generated error response and stream it to `next`.
    ///
    /// The reply is written into a freshly created private entry which the
    /// context then reads back through the normal pump; no origin contact
    /// occurs.
    pub async fn set_reply_to_error(
        &mut self,
        status: StatusCode,
        next: &mut dyn StreamNode,
    ) -> Result<()> {
        if status == StatusCode::NOT_IMPLEMENTED {
            // prevent confusion over whether we default to persistent or not
            self.request.flags.proxy_keepalive = false;
        }
        self.install_error_reply(status, next).await
    }

    /// Inject a prebuilt engine-generated reply and stream it to `next`.
    pub async fn set_reply_to_reply(
        &mut self,
        reply: ResponseHeader,
        body: &[u8],
        next: &mut dyn StreamNode,
    ) -> Result<()> {
        self.install_local_reply(reply, body, None).await?;
        self.send_more_data(next).await
    }

    /// Build and install an error reply with the given status, then stream it.
    pub(crate) async fn install_error_reply(
        &mut self,
        status: StatusCode,
        next: &mut dyn StreamNode,
    ) -> Result<()> {
        let reply = filters::gen_error_response(status, self.now());
        self.install_local_reply(reply, b"", None).await?;
        self.send_more_data(next).await
    }

    /// Write an engine-generated reply into a fresh private entry and attach
    /// it, so the one streaming pump serves it like any cached object.
    pub(crate) async fn install_local_reply(
        &mut self,
        reply: ResponseHeader,
        body: &[u8],
        stored_at: Option<SystemTime>,
    ) -> Result<()> {
        // generated replies can only take over before any headers went out
        debug_assert!(!self.flags.headers_sent);
        self.detach_entry();
        // a generated reply replaces whatever was in flight
        self.reply = None;
        self.out_offset = 0;
        self.request.ignore_range("responding with a generated reply");
        let key = self.public_key();
        let entry = self.storage.create(&key, false).await?;
        let mut meta = meta::EntryMeta::from_response(&reply, self.now(), None);
        if let Some(ts) = stored_at {
            // keep the original object's clock so Age stays meaningful
            meta.internal.created = ts;
            meta.internal.updated = ts;
        }
        let mut writer = entry.writer();
        writer.set_reply(meta);
        if !body.is_empty() {
            writer.append(body);
        }
        writer.finish();
        self.attach_entry(entry);
        Ok(())
    }

    /// Answer TRACE with `Max-Forwards: 0` by echoing the request.
    pub(crate) async fn trace_reply(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        let body = filters::trace_echo_body(&self.request);
        let mut reply = ResponseHeader::build(StatusCode::OK, Some(3))?;
        reply.insert_header(http::header::CONTENT_TYPE, "message/http")?;
        reply.insert_header(http::header::CONTENT_LENGTH, body.len().to_string())?;
        reply.insert_header(http::header::DATE, meta::http_date(self.now()))?;
        self.install_local_reply(reply, &body, None).await?;
        self.send_more_data(next).await
    }

    /// Remember the very first store lookup classification, ignoring the rest.
    pub(crate) fn detail_store_lookup(&mut self, detail: &'static str) {
        if self.first_lookup.is_none() {
            debug!("first store lookup: {detail}");
            self.first_lookup = Some(detail);
        } else {
            debug!(
                "ignores store lookup detail {detail} after {}",
                self.first_lookup.unwrap()
            );
        }
    }

    pub(crate) fn apply_qos_marks(&mut self) {
        if self.qos_applied {
            return;
        }
        let qos = &self.config.qos;
        if !qos.any_active() {
            return;
        }
        let Some(conn) = self.request.conn() else {
            return;
        };
        let (tos, nfmark) = if self.tag.is_hit() {
            (qos.hit_tos, qos.hit_nfmark)
        } else {
            (qos.miss_tos, qos.miss_nfmark)
        };
        if let Some(tos) = tos {
            conn.set_tos(tos);
        }
        if let Some(mark) = nfmark {
            conn.set_nfmark(mark);
        }
        self.qos_applied = true;
    }
}

impl Drop for ReplyContext {
    fn drop(&mut self) {
        if !self.deleting {
            self.detach();
        }
    }
}
