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

//! Metadata of a cached object
//!
//! [EntryMeta] couples the stored reply header with the timestamps the engine
//! needs for freshness, conditional evaluation and revalidation: when the
//! object was admitted, what the origin said about `Date`, `Last-Modified`
//! and `Expires`, and until when the object counts as fresh.

use http::header;
use httpdate::{fmt_http_date, parse_http_date};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::error::{Error, ErrorType::*, OrErr, Result};
use crate::key::HashBinary;
use crate::message::ResponseHeader;

pub(crate) type InternalMeta = internal_meta::InternalMetaLatest;

mod internal_meta {
    use super::*;

    pub(crate) type InternalMetaLatest = InternalMetaV1;

    #[derive(Debug, Deserialize, Serialize, Clone)]
    pub(crate) struct InternalMetaV1 {
        pub(crate) version: u8,
        pub(crate) fresh_until: SystemTime,
        pub(crate) created: SystemTime,
        pub(crate) updated: SystemTime,
        pub(crate) date: Option<SystemTime>,
        pub(crate) last_modified: Option<SystemTime>,
        pub(crate) expires: Option<SystemTime>,
        pub(crate) negative: bool,
        // Only extended fields to be added below. One field at a time.
        // 1. serde default in order to accept an older schema without the field
        // 2. serde skip_serializing_if so older software can still decode it
        #[serde(default)]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub(crate) variance: Option<HashBinary>,
    }

    impl Default for InternalMetaV1 {
        fn default() -> Self {
            let epoch = SystemTime::UNIX_EPOCH;
            InternalMetaV1 {
                version: InternalMetaV1::VERSION,
                fresh_until: epoch,
                created: epoch,
                updated: epoch,
                date: None,
                last_modified: None,
                expires: None,
                negative: false,
                variance: None,
            }
        }
    }

    impl InternalMetaV1 {
        pub const VERSION: u8 = 1;

        pub fn serialize(&self) -> Result<Vec<u8>> {
            assert_eq!(self.version, Self::VERSION);
            rmp_serde::encode::to_vec(self).or_err(InternalError, "failed to encode entry meta")
        }

        fn deserialize(buf: &[u8]) -> Result<Self> {
            rmp_serde::decode::from_slice(buf)
                .or_err(InternalError, "failed to decode entry meta v1")
        }
    }

    // cross version decode
    pub(crate) fn deserialize(buf: &[u8]) -> Result<InternalMetaLatest> {
        const MIN_SIZE: usize = 10; // a small number to read the first few bytes
        if buf.len() < MIN_SIZE {
            return Error::e_explain(
                InternalError,
                format!("buf too short ({}) to be InternalMeta", buf.len()),
            );
        }
        let preread_buf = &mut &buf[..MIN_SIZE];
        // the struct is always packed as a fixed size array, version first
        rmp::decode::read_array_len(preread_buf)
            .or_err(InternalError, "failed to decode entry meta array size")?;
        // rmp will encode `version` < 128 into a fixint (one byte)
        let version = rmp::decode::read_pfix(preread_buf)
            .or_err(InternalError, "failed to decode meta version")?;
        match version {
            1 => InternalMetaV1::deserialize(buf),
            _ => Error::e_explain(
                InternalError,
                format!("unknown InternalMeta version {version}"),
            ),
        }
    }

}

/// The stored reply header and cache metadata of one entry
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub(crate) internal: InternalMeta,
    pub(crate) header: ResponseHeader,
}

impl EntryMeta {
    /// Create a new [EntryMeta] from the origin response header.
    ///
    /// `Date`, `Last-Modified` and `Expires` are parsed from the header, the
    /// freshness lifetime from `Cache-Control` (`s-maxage` over `max-age`)
    /// falling back to `Expires`, then to `fresh_sec_default`.
    pub fn from_response(
        resp: &ResponseHeader,
        now: SystemTime,
        fresh_sec_default: Option<u32>,
    ) -> Self {
        let date = header_time(resp, &header::DATE);
        let last_modified = header_time(resp, &header::LAST_MODIFIED);
        let expires = calculate_expires_header_time(resp);
        let fresh_until = calculate_fresh_until(now, resp, expires, fresh_sec_default);
        EntryMeta {
            internal: InternalMeta {
                version: InternalMeta::VERSION,
                fresh_until,
                created: now,
                updated: now, // created == updated for new meta
                date,
                last_modified,
                expires,
                negative: resp.status.is_client_error() || resp.status.is_server_error(),
                variance: None,
            },
            header: resp.clone(),
        }
    }

    /// When the asset was created/admitted to cache
    pub fn created(&self) -> SystemTime {
        self.internal.created
    }

    /// The last time the asset was revalidated
    ///
    /// This value will be the same as [Self::created()] if no revalidation ever happens
    pub fn updated(&self) -> SystemTime {
        self.internal.updated
    }

    /// The `Date` the origin stamped on the stored reply
    pub fn date(&self) -> Option<SystemTime> {
        self.internal.date
    }

    /// The `Last-Modified` time of the stored reply
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.internal.last_modified
    }

    /// The parsed `Expires` time of the stored reply
    pub fn expires(&self) -> Option<SystemTime> {
        self.internal.expires
    }

    /// Until when the asset is considered fresh
    pub fn fresh_until(&self) -> SystemTime {
        self.internal.fresh_until
    }

    /// Is the asset still valid at the given time
    pub fn is_fresh(&self, time: SystemTime) -> bool {
        // NOTE: HTTP cache time resolution is second
        self.internal.fresh_until >= time
    }

    /// How old the asset is at `now`, since its admission/revalidation
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.updated()).unwrap_or_default()
    }

    /// Whether this is a negatively cached error reply
    pub fn is_negative(&self) -> bool {
        self.internal.negative
    }

    /// Whether the stored object has been modified since the given time.
    ///
    /// An object without a known modification time counts as modified. When
    /// the conditional carried a length (legacy `IMS;length=n`), the lengths
    /// must match as well.
    pub fn modified_since(&self, ims: SystemTime, imslen: Option<u64>) -> bool {
        let Some(mod_time) = self.internal.last_modified else {
            return true;
        };
        if let Some(len) = imslen {
            if self.content_length() != Some(len) {
                return true;
            }
        }
        mod_time > ims
    }

    /// The stored reply's `ETag`, if any
    pub fn etag(&self) -> Option<&http::HeaderValue> {
        self.header.headers.get(header::ETAG)
    }

    /// The stored reply's `ETag` when it is a strong validator
    pub fn strong_etag(&self) -> Option<&http::HeaderValue> {
        self.etag()
            .filter(|v| !v.as_bytes().starts_with(b"W/"))
    }

    /// The declared `Content-Length` of the stored reply, if parsable
    pub fn content_length(&self) -> Option<u64> {
        self.header
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// The expected body size of the stored reply for the given method.
    ///
    /// `None` when the size cannot be known up front.
    pub fn expected_body_size(&self, method: &http::Method) -> Option<u64> {
        if *method == http::Method::HEAD {
            return Some(0);
        }
        // these status codes cannot have a body
        if matches!(self.header.status.as_u16(), 204 | 304) || self.header.status.is_informational()
        {
            return Some(0);
        }
        self.content_length()
    }

    /// Get the response header of this asset
    pub fn response_header(&self) -> &ResponseHeader {
        &self.header
    }

    /// Get a copy of the response header
    pub fn response_header_copy(&self) -> ResponseHeader {
        self.header.clone()
    }

    /// Get all the headers of this asset
    pub fn headers(&self) -> &http::HeaderMap {
        &self.header.headers
    }

    /// The `Vary` header of the stored reply, if any
    pub fn vary(&self) -> Option<&http::HeaderValue> {
        self.header.headers.get(header::VARY)
    }

    /// Get the variance hash of this asset
    pub fn variance(&self) -> Option<HashBinary> {
        self.internal.variance
    }

    /// Set the variance (hash) of this asset
    pub fn set_variance(&mut self, variance: HashBinary) {
        self.internal.variance = Some(variance)
    }

    /// Build a `304 Not Modified` reply from the stored reply header.
    pub fn make_304(&self) -> ResponseHeader {
        let mut resp = self.header.clone();
        crate::conditional::to_304(&mut resp);
        resp
    }

    /// Freshen this meta after a successful `304` revalidation.
    ///
    /// Per RFC 9111 section 4.3.4 the stored header fields are updated with
    /// the ones provided in the 304; the freshness lifetime restarts at
    /// `now`. `Vary` changes over 304 are ignored.
    pub fn update_on_not_modified(&mut self, fresh: &ResponseHeader, now: SystemTime) {
        for name in [
            header::CACHE_CONTROL,
            header::EXPIRES,
            header::ETAG,
            header::LAST_MODIFIED,
            header::DATE,
        ] {
            // TODO: multiple headers under one name
            if let Some(value) = fresh.headers.get(&name) {
                // values are already valid header values
                self.header.insert_header(name, value).unwrap();
            }
        }
        self.internal.updated = now;
        self.internal.date = header_time(&self.header, &header::DATE);
        self.internal.last_modified = header_time(&self.header, &header::LAST_MODIFIED);
        self.internal.expires = calculate_expires_header_time(&self.header);
        self.internal.fresh_until =
            calculate_fresh_until(now, &self.header, self.internal.expires, None);
    }

    /// Serialize the internal metadata record
    pub fn serialize_internal(&self) -> Result<Vec<u8>> {
        self.internal.serialize()
    }

    /// Rebuild an [EntryMeta] from a serialized internal record and the stored
    /// reply header.
    pub fn deserialize_internal(buf: &[u8], header: ResponseHeader) -> Result<Self> {
        let internal = internal_meta::deserialize(buf)?;
        Ok(EntryMeta { internal, header })
    }
}

/// Whether `new` is older than the stored reply by its `Date` header.
///
/// RFC 9111 section 4: "When more than one suitable response is stored, a
/// cache MUST use the most recent one (as determined by the Date header
/// field)."
pub fn response_older_than(new: &ResponseHeader, stored: &EntryMeta) -> bool {
    match (header_time(new, &header::DATE), stored.date()) {
        (Some(new_date), Some(stored_date)) => new_date < stored_date,
        // without two dates to compare, never prefer the stored copy
        _ => false,
    }
}

fn header_time(resp: &ResponseHeader, name: &header::HeaderName) -> Option<SystemTime> {
    let value = resp.headers.get(name)?;
    parse_http_date(value.to_str().ok()?).ok()
}

/// Calculate the expire time from the `Expires` header only.
///
/// According to RFC 7234 multiple `Expires` headers are invalid, and invalid
/// date formats must be treated as a time in the past.
pub fn calculate_expires_header_time(resp: &ResponseHeader) -> Option<SystemTime> {
    let mut expires_iter = resp.headers.get_all(header::EXPIRES).iter();
    let expires_header = expires_iter.next()?;
    if expires_iter.next().is_some() {
        return None;
    }
    let parsed = expires_header
        .to_str()
        .ok()
        .and_then(|v| parse_http_date(v).ok());
    if parsed.is_none() {
        warn!("invalid HttpDate in Expires: {:?}", expires_header);
    }
    parsed.or(Some(SystemTime::UNIX_EPOCH))
}

/// Calculate the [SystemTime] at which the asset expires.
///
/// `Cache-Control` (`s-maxage` over `max-age`) takes precedence over the
/// `Expires` header, then over the status default.
fn calculate_fresh_until(
    now: SystemTime,
    resp: &ResponseHeader,
    expires: Option<SystemTime>,
    fresh_sec_default: Option<u32>,
) -> SystemTime {
    fn freshness_ttl_to_time(now: SystemTime, fresh_sec: u32) -> SystemTime {
        if fresh_sec == 0 {
            // ensure that the response is treated as stale
            now.checked_sub(Duration::from_secs(1)).unwrap_or(now)
        } else {
            now.checked_add(Duration::from_secs(fresh_sec.into()))
                .unwrap_or(now)
        }
    }

    if let Some(ttl) = cache_control_fresh_sec(resp) {
        return freshness_ttl_to_time(now, ttl);
    }
    if let Some(expires) = expires {
        return expires;
    }
    freshness_ttl_to_time(now, fresh_sec_default.unwrap_or(0))
}

// The freshness lifetime granted by Cache-Control, s-maxage winning over
// max-age for a shared cache; no-cache and no-store force zero.
fn cache_control_fresh_sec(resp: &ResponseHeader) -> Option<u32> {
    let mut max_age = None;
    let mut s_maxage = None;
    for value in resp.headers.get_all(header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                None => (directive, None),
            };
            if name.eq_ignore_ascii_case("no-cache") || name.eq_ignore_ascii_case("no-store") {
                return Some(0);
            } else if name.eq_ignore_ascii_case("s-maxage") {
                s_maxage = arg.and_then(|a| a.parse().ok()).or(Some(0));
            } else if name.eq_ignore_ascii_case("max-age") {
                max_age = arg.and_then(|a| a.parse().ok()).or(Some(0));
            }
        }
    }
    s_maxage.or(max_age)
}

/// Format a [SystemTime] as an HTTP date header value.
pub fn http_date(time: SystemTime) -> String {
    fmt_http_date(time)
}
