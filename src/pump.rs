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

//! The streaming pump: couple the store read side to the client write side.
//!
//! The first delivery of a transaction rewrites and sends the reply header
//! (after the reply-access gate); every later delivery pushes body bytes to
//! the next stream node until the transfer is done.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, Version};
use log::debug;
use strum::IntoStaticStr;

use crate::access::ReplyAccess;
use crate::error::{BError, Error, ErrorType, Result};
use crate::filters;
use crate::message::ResponseHeader;
use crate::storage::StoreStatus;
use crate::{ReplyContext, Tag};

/// How the reply stream stands, as published to the owning stream head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum StreamStatus {
    /// More data is still expected
    None,
    /// Clean termination
    Complete,
    /// The transfer ended, but not the way the headers promised
    UnplannedComplete,
    /// The stream is broken
    Failed,
}

/// The next node of the client-facing delivery pipeline.
///
/// For every transaction the engine calls `send_headers` exactly once before
/// any `send_body`; `send_body` with `eof` marks the clean end of the reply.
#[async_trait]
pub trait StreamNode: Send {
    async fn send_headers(&mut self, reply: ResponseHeader) -> Result<()>;
    async fn send_body(&mut self, data: Bytes, eof: bool) -> Result<()>;
    async fn send_error(&mut self, err: &Error);
}

impl ReplyContext {
    /// Stream the attached entry to `next`: headers first (built and gated
    /// once), then body bytes until transfer-done.
    pub(crate) async fn send_more_data(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        if self.deleting {
            return Ok(());
        }
        if let Some(conn) = self.request.conn() {
            if !conn.is_open() {
                debug!("not sending more data to closing connection");
                return Ok(());
            }
            if conn.pinned_zero_reply() {
                debug!("not sending more data after a pinned zero reply");
                return Ok(());
            }
        }
        if self.reqofs == 0 {
            self.apply_qos_marks();
        }
        // we've got the final data source to start pushing
        self.flags.store_logic_complete = true;

        while !self.flags.headers_sent {
            // the first delivery carries the stored reply; for a pending
            // entry this waits until the writer produced it
            let meta = {
                let sub = self
                    .subscription
                    .as_mut()
                    .expect("sending without a subscription");
                match sub.wait_reply().await {
                    Ok(meta) => meta,
                    Err(e) => return self.send_stream_error(next, e).await,
                }
            };
            if self.deleting {
                return Ok(());
            }

            let mut reply = meta.response_header_copy();
            // RFC 9110 requires us to advertise our version
            reply.set_version(Version::HTTP_11);
            self.build_reply_header(&mut reply);

            // refuse replies the headers already promise to be oversized
            let cap = self.config.max_reply_body_size;
            let expected = meta.expected_body_size(self.request.method());
            if cap > 0 && expected.is_some_and(|l| l > cap) {
                debug!("reply body too large");
                self.tag = Tag::DeniedReply;
                let errpage = filters::gen_error_response(StatusCode::FORBIDDEN, self.now());
                self.install_local_reply(errpage, b"", None).await?;
                continue;
            }

            // the reply-direction gate
            if !self.reply_allowed(&reply).await {
                debug!(
                    "the reply for {} {} is denied",
                    self.request.method(),
                    self.request.effective_uri()
                );
                self.tag = Tag::DeniedReply;
                let errpage = filters::gen_error_response(StatusCode::FORBIDDEN, self.now());
                self.install_local_reply(errpage, b"", None).await?;
                continue;
            }

            self.flags.headers_sent = true;
            self.reply = Some(reply.clone());
            next.send_headers(reply).await?;

            if self.request.method() == &Method::HEAD {
                // do not forward a body for HEAD replies
                self.flags.done_copying = true;
                self.flags.complete = true;
                return next.send_body(Bytes::new(), true).await;
            }
        }
        self.pump_body(next).await
    }

    async fn reply_allowed(&mut self, reply: &ResponseHeader) -> bool {
        // don't block our own responses or HTTP status messages
        if matches!(self.tag, Tag::Denied | Tag::DeniedReply)
            || filters::always_allow_response(reply.status)
        {
            return true;
        }
        let Some(gate) = self.reply_access.clone() else {
            // absent access controls permit by default
            return true;
        };
        gate.check(&self.request, reply).await.allowed()
    }

    /// Copy body bytes from the store to the next node until the entry runs
    /// dry, the transfer limit trips, or the client goes away.
    pub(crate) async fn pump_body(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        loop {
            if self.deleting {
                return Ok(());
            }
            if let Some(conn) = self.request.conn() {
                if !conn.is_open() {
                    debug!("client connection closed mid-stream");
                    self.flags.complete = true;
                    return Ok(());
                }
            }
            let Some(sub) = self.subscription.as_mut() else {
                return Ok(());
            };
            match sub.read_body().await {
                Ok(Some(data)) => {
                    self.reqofs += data.len() as u64;
                    self.reqsize = self.reqofs;
                    let cap = self.config.max_reply_body_size;
                    if cap > 0 && self.reqofs > cap {
                        self.too_big = true;
                        let err = Error::explain(
                            ErrorType::ResponseTooLarge,
                            "reply body overflowed the configured cap",
                        );
                        return self.send_stream_error(next, err).await;
                    }
                    self.out_offset += data.len() as u64;
                    next.send_body(data, false).await?;
                }
                Ok(None) => {
                    // a clean end from the store can still be a truncated
                    // object; the client must not mistake it for a finished
                    // reply
                    if self.entry.as_ref().is_some_and(|e| e.has_bad_length()) {
                        let err = Error::explain(
                            ErrorType::BadLength,
                            "stored body does not match its declared length",
                        );
                        return self.send_stream_error(next, err).await;
                    }
                    self.flags.complete = true;
                    return next.send_body(Bytes::new(), true).await;
                }
                Err(e) => return self.send_stream_error(next, e).await,
            }
        }
    }

    /// A stream error ends the reply without pretending it was clean.
    pub(crate) async fn send_stream_error(
        &mut self,
        next: &mut dyn StreamNode,
        err: BError,
    ) -> Result<()> {
        debug!("a stream error has occurred, marking as complete and sending no data");
        self.flags.complete = true;
        self.request.flags.stream_error = true;
        next.send_error(&err).await;
        Ok(())
    }

    // whether we are done receiving data from the store for this reply
    fn check_transfer_done(&self) -> bool {
        let Some(entry) = self.entry.as_ref() else {
            return false;
        };
        // done_copying covers the special cases like HEAD
        if self.flags.done_copying {
            return true;
        }
        if self.request.flags.chunked_reply && !self.flags.complete {
            // last-chunk was not sent
            return false;
        }
        match entry.status() {
            StoreStatus::Ok => self.out_offset >= entry.object_len() as u64,
            StoreStatus::Pending => {
                let Some(meta) = entry.meta() else {
                    // haven't seen the headers yet
                    return false;
                };
                // without a declared size we must wait for the store to
                // finish the object
                let Some(expected) = meta.expected_body_size(self.request.method()) else {
                    return false;
                };
                self.out_offset >= expected
            }
        }
    }

    /// How the reply stream stands; the stream head polls this to learn when
    /// and how the transaction ended.
    pub fn reply_status(&self) -> StreamStatus {
        let Some(entry) = self.entry.as_ref() else {
            debug!("no store entry");
            return StreamStatus::Failed;
        };

        if entry.is_aborted() {
            debug!("aborted store entry");
            return StreamStatus::Failed;
        }

        if self.too_big {
            debug!("reply body was too large");
            return StreamStatus::Failed;
        }

        let done = self.check_transfer_done();
        if done || self.flags.complete {
            // ok, we're finished, but how?
            if entry.has_bad_length() {
                debug!("truncated response body");
                return StreamStatus::UnplannedComplete;
            }
            if !done {
                debug!("closing, but the transfer never finished");
                return StreamStatus::Failed;
            }
            let expected = entry
                .meta()
                .and_then(|m| m.expected_body_size(self.request.method()));
            if let Some(expected) = expected {
                if self.out_offset < expected {
                    debug!("client didn't get all it expected");
                    return StreamStatus::UnplannedComplete;
                }
            }
            debug!(
                "stream complete; keepalive={}",
                self.request.flags.proxy_keepalive
            );
            return StreamStatus::Complete;
        }

        StreamStatus::None
    }
}
