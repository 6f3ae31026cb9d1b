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

//! The admitted client request as the reply engine sees it
//!
//! The front end has already parsed and admitted the request; this module is
//! the read-mostly view of it plus the per-request flags the engine flips
//! while deciding how to reply.

use http::header;
use http::Method;
use httpdate::parse_http_date;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::message::RequestHeader;

/// Per-request boolean state, named after what set it.
#[derive(Debug, Default, Clone)]
pub struct RequestFlags {
    /// Client sent `Cache-Control: no-cache` (or `Pragma: no-cache`)
    pub no_cache: bool,
    /// The front end rewrote a client no-cache into a conditional instead of
    /// honoring it (reload-into-ims); negative hits are still bypassed
    pub no_cache_hack: bool,
    /// Client sent `Cache-Control: only-if-cached`
    pub only_if_cached: bool,
    /// The request was generated by the proxy itself
    pub internal: bool,
    /// A stale entry is being refreshed for this request
    pub refresh: bool,
    /// Validation required; forwarding must use parents only to avoid
    /// sibling loops
    pub need_validation: bool,
    /// The reply to the client uses chunked transfer encoding
    pub chunked_reply: bool,
    /// Reverse-proxy (accelerated) request
    pub accelerated: bool,
    /// Transparently intercepted request
    pub intercepted: bool,
    /// The front end detected a forwarding loop
    pub loop_detected: bool,
    /// Forward origin validation errors instead of serving stale
    pub fail_on_validation_err: bool,
    /// Connection-oriented authentication is in progress
    pub connection_auth: bool,
    /// Client-side connection auth support is disabled
    pub connection_auth_disabled: bool,
    /// The reply must keep the client connection alive (connection auth)
    pub must_keepalive: bool,
    /// Client connection keep-alive after this reply
    pub proxy_keepalive: bool,
    /// The client connection was SSL-bumped
    pub ssl_bumped: bool,
    /// An error was streamed to the client mid-reply
    pub stream_error: bool,
    /// Serving stale is acceptable until revalidation says otherwise
    pub stale_if_hit: bool,
    /// The request asked for multiple ranges in one reply
    pub multipart_range: bool,
}

/// A redirect decided by an earlier processing step; the engine only
/// synthesizes the reply.
#[derive(Debug, Clone)]
pub struct Redirect {
    pub status: http::StatusCode,
    pub location: String,
}

/// Client connection state the engine consults while streaming.
pub struct ConnHandle {
    open: AtomicBool,
    pinned: AtomicBool,
    pinned_zero_reply: AtomicBool,
    // the listening port may close on reconfigure
    port_open: AtomicBool,
    act_as_origin: bool,
    tos: AtomicU8,
    nfmark: AtomicU32,
}

impl ConnHandle {
    pub fn new(act_as_origin: bool) -> Arc<Self> {
        Arc::new(ConnHandle {
            open: AtomicBool::new(true),
            pinned: AtomicBool::new(false),
            pinned_zero_reply: AtomicBool::new(false),
            port_open: AtomicBool::new(true),
            act_as_origin,
            tos: AtomicU8::new(0),
            nfmark: AtomicU32::new(0),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::SeqCst);
    }

    pub fn pinned_zero_reply(&self) -> bool {
        self.pinned_zero_reply.load(Ordering::SeqCst)
    }

    pub fn set_pinned_zero_reply(&self) {
        self.pinned_zero_reply.store(true, Ordering::SeqCst);
    }

    pub fn listening_port_open(&self) -> bool {
        self.port_open.load(Ordering::SeqCst)
    }

    pub fn close_listening_port(&self) {
        self.port_open.store(false, Ordering::SeqCst);
    }

    /// Whether the receiving port simulates an origin server
    pub fn act_as_origin(&self) -> bool {
        self.act_as_origin
    }

    /// Apply a TOS marking to the client connection
    pub fn set_tos(&self, tos: u8) {
        self.tos.store(tos, Ordering::SeqCst);
    }

    /// Apply a netfilter marking to the client connection
    pub fn set_nfmark(&self, mark: u32) {
        self.nfmark.store(mark, Ordering::SeqCst);
    }

    /// The applied TOS mark, 0 when none was applied
    pub fn tos(&self) -> u8 {
        self.tos.load(Ordering::SeqCst)
    }

    /// The applied netfilter mark, 0 when none was applied
    pub fn nfmark(&self) -> u32 {
        self.nfmark.load(Ordering::SeqCst)
    }
}

/// One client HTTP transaction, as admitted by the front end.
pub struct ClientRequest {
    header: RequestHeader,
    /// Engine-visible request state
    pub flags: RequestFlags,
    /// The vary specification recorded for this request ("name=value" list),
    /// filled in by vary evaluation
    pub vary_headers: Option<String>,
    /// Login directive configured for the chosen peer, e.g. `PASS`
    pub peer_login: Option<String>,
    /// A redirect decided before the engine ran
    pub redirect: Option<Redirect>,
    /// Outgoing validator: last-modified propagated from a stale entry
    pub lastmod: Option<SystemTime>,
    /// Outgoing validator: etag propagated from a stale entry
    pub etag: Option<http::HeaderValue>,
    conn: Option<Arc<ConnHandle>>,
}

impl ClientRequest {
    /// Wrap an admitted request. Cache-Control request directives and the
    /// conditional headers are digested into flags here.
    pub fn new(header: RequestHeader, conn: Option<Arc<ConnHandle>>) -> Self {
        let mut flags = RequestFlags {
            proxy_keepalive: true,
            ..Default::default()
        };
        for value in header.headers.get_all(header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for directive in value.split(',') {
                let directive = directive.trim();
                if directive.eq_ignore_ascii_case("no-cache") {
                    flags.no_cache = true;
                } else if directive.eq_ignore_ascii_case("only-if-cached") {
                    flags.only_if_cached = true;
                }
            }
        }
        if header.headers.get(header::PRAGMA).is_some_and(|v| {
            v.to_str()
                .map(|v| v.eq_ignore_ascii_case("no-cache"))
                .unwrap_or(false)
        }) {
            flags.no_cache = true;
        }
        ClientRequest {
            header,
            flags,
            vary_headers: None,
            peer_login: None,
            redirect: None,
            lastmod: None,
            etag: None,
            conn,
        }
    }

    pub fn method(&self) -> &Method {
        &self.header.method
    }

    pub fn version(&self) -> http::Version {
        self.header.version
    }

    pub fn headers(&self) -> &http::HeaderMap {
        &self.header.headers
    }

    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    /// The effective request URI; this is also the store id of the object the
    /// request addresses.
    pub fn effective_uri(&self) -> String {
        self.header.uri.to_string()
    }

    /// The host part of the request URI, for IP cache invalidation
    pub fn host(&self) -> Option<&str> {
        self.header.uri.host().or_else(|| {
            self.header
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
        })
    }

    /// Whether the request URI scheme supports revalidation here
    pub fn scheme_is_http(&self) -> bool {
        match self.header.uri.scheme_str() {
            Some("http") | Some("https") => true,
            // an origin-form URI on a proxy port is HTTP traffic
            None => true,
            _ => false,
        }
    }

    pub fn conn(&self) -> Option<&Arc<ConnHandle>> {
        self.conn.as_ref()
    }

    /// Whether the request carries any conditional header
    pub fn is_conditional(&self) -> bool {
        let h = &self.header.headers;
        h.contains_key(header::IF_MATCH)
            || h.contains_key(header::IF_NONE_MATCH)
            || h.contains_key(header::IF_MODIFIED_SINCE)
    }

    /// The parsed `If-Modified-Since` time, if present and valid
    pub fn if_modified_since(&self) -> Option<SystemTime> {
        let value = self.header.headers.get(header::IF_MODIFIED_SINCE)?;
        // tolerate the legacy ";length=n" extension after the date
        let date_part = value.to_str().ok()?.split(';').next()?.trim();
        parse_http_date(date_part).ok()
    }

    /// The legacy `If-Modified-Since;length=n` extension, if present
    pub fn ims_length(&self) -> Option<u64> {
        let value = self.header.headers.get(header::IF_MODIFIED_SINCE)?;
        let value = value.to_str().ok()?;
        let (_, len) = value.split_once(";length=")?;
        len.trim().parse().ok()
    }

    /// Drop the client's `If-Modified-Since`; If-None-Match takes precedence.
    pub fn ignore_ims(&mut self) {
        self.header.remove_header(&header::IF_MODIFIED_SINCE);
    }

    /// Drop any `Range` on engine-generated replies.
    pub fn ignore_range(&mut self, reason: &str) {
        if self.header.remove_header(&header::RANGE).is_some() {
            log::debug!("ignoring Range: {}", reason);
        }
        self.flags.multipart_range = false;
    }

    /// `Max-Forwards`, for TRACE handling
    pub fn max_forwards(&self) -> Option<u64> {
        self.header
            .headers
            .get(header::MAX_FORWARDS)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Whether the method is unsafe in the RFC sense and so invalidates
    /// sibling cached variants of the URL.
    pub fn unsafe_method(&self) -> bool {
        !matches!(
            *self.method(),
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        )
    }

    /// Whether the peer the reply came from is configured to pass
    /// authentication through (`login=PASS` / `login=PASSTHRU`).
    pub fn peer_passes_auth(&self) -> bool {
        matches!(self.peer_login.as_deref(), Some("PASS") | Some("PASSTHRU"))
    }
}
