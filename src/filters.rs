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

//! Outgoing reply header synthesis
//!
//! Filters out unwanted and hop-by-hop entries from the stored reply header,
//! adds what the proxy knows better than the origin (Age, Date, Via,
//! Cache-Status), and settles connection handling (keep-alive, chunking).

use http::header;
use http::{Method, StatusCode, Version};
use log::{debug, error};

use crate::access::AuthDecorator;
use crate::error::Result;
use crate::message::ResponseHeader;
use crate::meta::http_date;
use crate::request::ClientRequest;
use crate::{CollapsedRole, ReplyContext, Tag};

const VIA_PROTO: &str = "1.1";

/// Generate an error response with the given status code.
///
/// Zero `Content-Length` and `Cache-Control: private, no-store`, so nobody
/// caches the engine's error pages.
pub(crate) fn gen_error_response(code: StatusCode, now: std::time::SystemTime) -> ResponseHeader {
    let mut resp = ResponseHeader::build(code, Some(4)).unwrap();
    resp.insert_header(header::DATE, http_date(now)).unwrap();
    resp.insert_header(header::CONTENT_LENGTH, "0").unwrap();
    resp.insert_header(header::CACHE_CONTROL, "private, no-store")
        .unwrap();
    resp
}

/// The canned response to a purge request.
pub(crate) fn gen_purge_response(
    code: StatusCode,
    now: std::time::SystemTime,
) -> Result<ResponseHeader> {
    let mut resp = ResponseHeader::build(code, Some(3))?;
    resp.insert_header(header::DATE, http_date(now))?;
    resp.insert_header(header::CONTENT_LENGTH, "0")?;
    resp.insert_header(header::CACHE_CONTROL, "private, no-store")?;
    Ok(resp)
}

/// A redirect reply for a predecided redirect.
pub(crate) fn gen_redirect_response(code: StatusCode, location: &str) -> Result<ResponseHeader> {
    let mut resp = ResponseHeader::build(code, Some(2))?;
    resp.insert_header(header::LOCATION, location)?;
    resp.insert_header(header::CONTENT_LENGTH, "0")?;
    Ok(resp)
}

/// The body of a TRACE echo reply: the request as we received it.
pub(crate) fn trace_echo_body(request: &ClientRequest) -> Vec<u8> {
    let mut body = format!(
        "{} {} {:?}\r\n",
        request.method(),
        request.effective_uri(),
        request.version()
    )
    .into_bytes();
    for (name, value) in request.headers() {
        body.extend_from_slice(name.as_str().as_bytes());
        body.extend_from_slice(b": ");
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"\r\n");
    body
}

/// Responses with no body have no content-type, which breaks content-based
/// reply gates; never block these status codes.
pub(crate) fn always_allow_response(status: StatusCode) -> bool {
    matches!(status.as_u16(), 100 | 101 | 102 | 204 | 304)
}

/// The expected reply body size, `None` when it cannot be known up front.
pub(crate) fn reply_body_size(reply: &ResponseHeader, method: &Method) -> Option<u64> {
    if *method == Method::HEAD {
        return Some(0);
    }
    if reply.status.is_informational() || matches!(reply.status.as_u16(), 204 | 304) {
        return Some(0);
    }
    reply
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

// whether the upstream reply was willing to keep its connection open;
// evaluated before the hop-by-hop strip removes the evidence
fn reply_persistent(reply: &ResponseHeader) -> bool {
    let connection = reply
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();
    if reply.version >= Version::HTTP_11 {
        !connection.iter().any(|t| t == "close")
    } else {
        connection.iter().any(|t| t == "keep-alive")
    }
}

// remove Connection-listed entries plus the standard hop-by-hop set
fn remove_hop_by_hop_entries(reply: &mut ResponseHeader) {
    let listed: Vec<String> = reply
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for name in listed {
        reply.remove_header(name.as_str());
    }
    reply.remove_header(&header::CONNECTION);
    reply.remove_header("keep-alive");
    reply.remove_header("proxy-connection");
    reply.remove_header(&header::TE);
    reply.remove_header(&header::TRAILER);
    reply.remove_header(&header::TRANSFER_ENCODING);
    reply.remove_header(&header::UPGRADE);
}

// these status codes can carry no body, any Content-Length on them is noise
fn remove_irrelevant_content_length(reply: &mut ResponseHeader) {
    if reply.status.is_informational() || matches!(reply.status.as_u16(), 204 | 304) {
        reply.remove_header(&header::CONTENT_LENGTH);
    }
}

// NTLM, Negotiate and Kerberos authenticate the connection, not the request
fn connection_oriented_auth_scheme(value: &[u8]) -> bool {
    for scheme in [&b"NTLM"[..], &b"Negotiate"[..], &b"Kerberos"[..]] {
        if value.len() >= scheme.len() && value[..scheme.len()].eq_ignore_ascii_case(scheme) {
            match value.get(scheme.len()) {
                None | Some(b' ') => return true,
                _ => {}
            }
        }
    }
    false
}

fn append_via(reply: &mut ResponseHeader, hostname: &str) {
    let item = format!("{VIA_PROTO} {hostname}");
    let value = match reply.headers.get(header::VIA).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {item}"),
        None => item,
    };
    // hostname is validated at config load
    reply.insert_header(header::VIA, value).unwrap();
}

impl ReplyContext {
    /// Generate the reply headers sent to the client.
    ///
    /// Runs exactly once per transaction, on the cloned outgoing reply.
    pub(crate) fn build_reply_header(&mut self, reply: &mut ResponseHeader) {
        let now = self.now();
        let is_hit = self.tag.is_hit();

        if is_hit || self.collapsed == CollapsedRole::Slave {
            reply.remove_header(&header::SET_COOKIE);
        }

        // without a peer configured to pass authentication through, the
        // Proxy-Authenticate of the origin is of no use to our client
        if !self.request.peer_passes_auth() {
            reply.remove_header(&header::PROXY_AUTHENTICATE);
        }

        let upstream_persistent = reply_persistent(reply);
        remove_hop_by_hop_entries(reply);
        remove_irrelevant_content_length(reply);

        let meta = self.entry.as_ref().and_then(|e| e.meta());
        let stored_ts = meta
            .as_ref()
            .map(|m| m.date().unwrap_or_else(|| m.updated()));

        // add an estimated Age header on cache hits; any Age sent by
        // upstream caches is passed along unmodified on misses
        if is_hit {
            reply.remove_header(&header::AGE);
            let special = self.entry.as_ref().map(|e| e.is_special()).unwrap_or(false);
            let act_as_origin = self
                .request
                .conn()
                .map(|c| c.act_as_origin())
                .unwrap_or(false);
            if special {
                reply.remove_header(&header::DATE);
                reply.insert_header(header::DATE, http_date(now)).unwrap();
            } else if act_as_origin {
                // swap Date to the current time when simulating an origin,
                // preserving what the real origin said
                if let Some(date) = reply.remove_header(&header::DATE) {
                    reply.insert_header("x-origin-date", date).unwrap();
                }
                reply.insert_header(header::DATE, http_date(now)).unwrap();
                if let Some(expires) = reply.remove_header(&header::EXPIRES) {
                    reply.insert_header("x-origin-expires", expires).unwrap();
                    let remaining = meta
                        .as_ref()
                        .and_then(|m| m.expires())
                        .zip(stored_ts)
                        .and_then(|(exp, ts)| exp.duration_since(ts).ok());
                    if let Some(left) = remaining {
                        reply
                            .insert_header(header::EXPIRES, http_date(now + left))
                            .unwrap();
                    }
                }
                if let Some(ts) = stored_ts {
                    if let Ok(age) = now.duration_since(ts) {
                        // X-Cache-Age instead of Age
                        reply
                            .insert_header("x-cache-age", age.as_secs().to_string())
                            .unwrap();
                    }
                }
            } else if let Some(ts) = stored_ts {
                if let Ok(age) = now.duration_since(ts) {
                    reply
                        .insert_header(header::AGE, age.as_secs().to_string())
                        .unwrap();
                }
            }
        }

        // RFC 9110 6.6.1: add a Date header if missing; we have a clock and
        // are therefore required to amend any shortcoming of servers
        if !reply.headers.contains_key(header::DATE) {
            match stored_ts {
                Some(ts) => reply.insert_header(header::DATE, http_date(ts)).unwrap(),
                None => {
                    error!("HTTP reply without Date: {:?}", self.entry);
                    reply.insert_header(header::DATE, http_date(now)).unwrap();
                }
            }
        }

        // filter unproxyable authentication types
        if self.tag != Tag::Denied && reply.headers.contains_key(header::WWW_AUTHENTICATE) {
            let mut kept: Vec<http::HeaderValue> = Vec::new();
            let mut blocked = false;
            let mut connection_oriented = false;
            for value in reply.headers.get_all(header::WWW_AUTHENTICATE) {
                if connection_oriented_auth_scheme(value.as_bytes()) {
                    if self.request.flags.connection_auth_disabled {
                        blocked = true;
                        continue;
                    }
                    connection_oriented = true;
                }
                kept.push(value.clone());
            }
            if blocked {
                reply.remove_header(&header::WWW_AUTHENTICATE);
                for value in kept {
                    reply.append_header(header::WWW_AUTHENTICATE, value).unwrap();
                }
            }
            if connection_oriented {
                self.request.flags.must_keepalive = true;
                if !self.request.flags.accelerated && !self.request.flags.intercepted {
                    reply
                        .insert_header("proxy-support", "Session-Based-Authentication")
                        .unwrap();
                    // mark Proxy-Support hop-by-hop for intermediaries that
                    // do not understand its semantics
                    reply
                        .append_header(header::CONNECTION, "Proxy-support")
                        .unwrap();
                }
            }
        }

        // authentication scheme headers
        if let Some(auth) = self.auth.clone() {
            let status = reply.status;
            if self.tag == Tag::Denied
                && (status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
                    || status == StatusCode::UNAUTHORIZED)
            {
                auth.add_reply_auth_header(reply, &self.request, true);
            } else if auth.request_authenticated(&self.request) {
                auth.add_reply_auth_header(reply, &self.request, false);
            }
        }

        // Cache-Status: <host>;<hit-or-fwd>[;detail=<first lookup>]
        let mut cache_status = self.config.hostname.clone();
        if let Some(hit_or_fwd) = self.tag.cache_status_source() {
            cache_status.push_str(hit_or_fwd);
        }
        if let Some(detail) = self.first_lookup {
            cache_status.push_str(";detail=");
            cache_status.push_str(detail);
        }
        reply.insert_header("cache-status", cache_status).unwrap();

        let may_send_chunked_reply =
            !self.request.flags.multipart_range && self.request.version() >= Version::HTTP_11;
        let body_size = reply_body_size(reply, self.request.method());

        // check whether we should send keep-alive
        let status = reply.status;
        let pinned = self.request.conn().is_some_and(|c| c.is_pinned());
        let port_closed = self.request.conn().is_some_and(|c| !c.listening_port_open());
        let flags = &mut self.request.flags;
        if !self.config.error_pconns && status.as_u16() >= 400 && !flags.must_keepalive {
            debug!("error, don't keep-alive");
            flags.proxy_keepalive = false;
        } else if !self.config.client_pconns && !flags.must_keepalive {
            debug!("keep-alive not requested by admin or client");
            flags.proxy_keepalive = false;
        } else if flags.proxy_keepalive && self.config.shutting_down() {
            debug!("shutting down, don't keep-alive");
            flags.proxy_keepalive = false;
        } else if flags.connection_auth && !upstream_persistent {
            debug!("connection oriented auth but server side non-persistent");
            flags.proxy_keepalive = false;
        } else if body_size.is_none() && !may_send_chunked_reply {
            debug!("can't keep-alive, unknown body size");
            flags.proxy_keepalive = false;
        } else if self.config.fd_usage_high() && !flags.must_keepalive {
            debug!("not many unused FDs, can't keep-alive");
            flags.proxy_keepalive = false;
        } else if flags.ssl_bumped && !upstream_persistent {
            // we do not really have to close, but we pretend to be a tunnel
            debug!("bumped reply forces close");
            flags.proxy_keepalive = false;
        } else if pinned && !upstream_persistent {
            // the peer wants to close the pinned connection
            debug!("pinned reply forces close");
            flags.proxy_keepalive = false;
        } else if port_closed {
            // the listening port closed because of a reconfigure
            debug!("listening port closed");
            flags.proxy_keepalive = false;
        }

        // decide if we send a chunked reply
        if may_send_chunked_reply && body_size.is_none() {
            debug!("chunked reply");
            self.request.flags.chunked_reply = true;
            reply
                .insert_header(header::TRANSFER_ENCODING, "chunked")
                .unwrap();
        }

        append_via(reply, &self.config.hostname);

        // signal keep-alive or close explicitly
        let ka = if self.request.flags.proxy_keepalive {
            "keep-alive"
        } else {
            "close"
        };
        reply.append_header(header::CONNECTION, ka).unwrap();

        // Surrogate-Control requires Surrogate-Capability from upstream to
        // pass on
        if reply.headers.contains_key("surrogate-control")
            && !self.request.headers().contains_key("surrogate-capability")
        {
            reply.remove_header("surrogate-control");
        }

        // configured reply-direction header removals
        for name in &self.config.deny_reply_headers {
            reply.remove_header(name.as_str());
        }
    }
}
