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

//! The hit path: decide whether a located entry may be served.

use http::{Method, StatusCode};
use log::{debug, warn};

use crate::access::HitAccess;
use crate::conditional;
use crate::error::Result;
use crate::lookup::IdentifyOutcome;
use crate::meta::EntryMeta;
use crate::pump::StreamNode;
use crate::vary::{self, VaryVerdict};
use crate::{ReplyContext, Tag, METHOD_PURGE};

impl ReplyContext {
    /// Process a possible cache HIT. The entry is attached and subscribed;
    /// the first delivery (the stored reply) decides where we go from here.
    pub(crate) async fn cache_hit(
        &mut self,
        next: &mut dyn StreamNode,
    ) -> Result<IdentifyOutcome> {
        use IdentifyOutcome::*;

        let meta = {
            let sub = self
                .subscription
                .as_mut()
                .expect("hit path without subscription");
            match sub.wait_reply().await {
                Ok(meta) => meta,
                Err(e) => {
                    // swap-in failure, treat as a miss
                    debug!("swap-in failure: {e}");
                    self.tag = Tag::SwapfailMiss;
                    self.process_miss(next).await?;
                    return Ok(Done);
                }
            }
        };
        // the HIT object may be under deletion, ignore it then
        if self.deleting {
            debug!("HIT object being deleted. Ignore the HIT.");
            return Ok(Done);
        }
        let entry = self.entry.clone().expect("hit path without entry");

        // The previously identified hit suddenly became unshareable. This is
        // common for collapsed forwarding slaves but might also happen to
        // regular hits because we are resumed asynchronously.
        if !entry.may_start_hitting() {
            debug!("unshareable {entry:?}. MISS");
            self.tag = Tag::Miss;
            self.process_miss(next).await?;
            return Ok(Done);
        }

        self.reqsize = self.reqofs;

        if self.request.effective_uri() != entry.store_id() {
            warn!(
                "URL mismatch, '{}' != '{}'",
                entry.store_id(),
                self.request.effective_uri()
            );
            self.tag = Tag::Miss; // we lack a more precise miss code
            self.process_miss(next).await?;
            return Ok(Done);
        }

        match vary::evaluate_match(&meta, self.request.headers()) {
            VaryVerdict::NoVary => {
                // no variance detected, continue as normal
            }
            VaryVerdict::Match => {
                debug!("vary MATCH");
            }
            VaryVerdict::Other(variance, description) => {
                // This is not the correct variant for this request; requery
                // the cache. The recorded vary information makes sure we only
                // get here once per transaction.
                if self.lookup_rounds >= 1 {
                    warn!("vary object loop!");
                    self.tag = Tag::Miss;
                    self.process_miss(next).await?;
                    return Ok(Done);
                }
                debug!("vary detected, requerying");
                self.lookup_rounds += 1;
                self.vary_key = Some(variance);
                self.request.vary_headers = Some(description);
                self.detach_entry();
                return Ok(Requery);
            }
            VaryVerdict::Cancel => {
                warn!("vary object loop!");
                self.tag = Tag::Miss;
                self.process_miss(next).await?;
                return Ok(Done);
            }
        }

        if self.request.method() == &*METHOD_PURGE {
            debug!("PURGE gets a HIT");
            self.detach_entry();
            self.purge_request(next).await?;
            return Ok(Done);
        }

        if meta.is_negative() && !self.request.flags.no_cache_hack {
            debug!("negative-HIT");
            self.tag = Tag::NegativeHit;
            self.send_more_data(next).await?;
            return Ok(Done);
        }
        if self.blocked_hit(&meta) {
            debug!("send_hit forces a MISS");
            self.tag = Tag::Miss;
            self.process_miss(next).await?;
            return Ok(Done);
        }
        if !self.request.flags.internal && self.needs_refresh(&meta) {
            // We hold a stale copy; it needs to be validated. The validation
            // request goes to parents only, otherwise two siblings with stale
            // copies of the object could generate a loop.
            self.request.flags.need_validation = true;

            if meta.last_modified().is_none() {
                // cannot revalidate entries without a modification time
                debug!("validate HIT object? NO. Can't tell when it changed. Do MISS.");
                self.tag = Tag::Miss;
                self.process_miss(next).await?;
            } else if self.request.flags.no_cache {
                // no refresh pattern overrides no-cache, honor the client
                debug!("validate HIT object? NO. Client sent CC:no-cache.");
                self.tag = Tag::ClientRefreshMiss;
                self.process_miss(next).await?;
            } else if self.request.scheme_is_http() {
                debug!("validate HIT object? YES.");
                self.process_expired(next).await?;
            } else {
                // we don't know how to revalidate other protocols, handle
                // them as if the object has expired
                debug!("validate HIT object? NO. Non-HTTP protocol. Do MISS.");
                self.tag = Tag::Miss;
                self.process_miss(next).await?;
            }
            return Ok(Done);
        }
        if self.request.is_conditional() {
            debug!("conditional HIT");
            if self.process_conditional(&meta, next).await? {
                return Ok(Done);
            }
        }

        // plain ol' cache hit
        debug!("plain old HIT");
        if self.config.offline {
            self.tag = Tag::OfflineHit;
        } else if entry.is_mem_resident() {
            self.tag = Tag::MemHit;
        }
        self.send_more_data(next).await?;
        Ok(Done)
    }

    // whether the stale-check says this entry must be revalidated first
    fn needs_refresh(&self, meta: &EntryMeta) -> bool {
        if self.config.offline {
            return false;
        }
        !meta.is_fresh(self.now())
    }

    /// Whether the send_hit gate prevents us from serving this hit.
    fn blocked_hit(&self, meta: &EntryMeta) -> bool {
        let Some(gate) = self.hit_access.as_ref() else {
            return false; // hits are not blocked by default
        };
        if self.request.flags.internal {
            return false; // internal content "hits" cannot be blocked
        }
        // when in doubt, block
        !gate
            .fast_check(&self.request, meta.response_header())
            .allowed()
    }

    /// Process a conditional request from the client against the stored
    /// reply. Returns true when the request was answered here.
    async fn process_conditional(
        &mut self,
        meta: &EntryMeta,
        next: &mut dyn StreamNode,
    ) -> Result<bool> {
        let stored_status = meta.response_header().status;
        if stored_status != StatusCode::OK {
            debug!("conditional miss because {stored_status} != 200");
            self.tag = Tag::Miss;
            self.process_miss(next).await?;
            return Ok(true);
        }

        if self.request.headers().contains_key(http::header::IF_MATCH)
            && !conditional::has_if_match_etag(&self.request, meta)
        {
            // reply with 412 Precondition Failed if If-Match did not match
            self.send_precondition_failed(next).await?;
            return Ok(true);
        }

        if self
            .request
            .headers()
            .contains_key(http::header::IF_NONE_MATCH)
        {
            // RFC 7232: If-None-Match recipient MUST ignore IMS
            self.request.ignore_ims();

            if conditional::has_if_none_match_etag(&self.request, meta) {
                self.send_not_modified_or_precondition_failed(next).await?;
                return Ok(true);
            }

            // None-Match is true (no ETag matched); treat as an
            // unconditional hit
            return Ok(false);
        }

        if let Some(ims) = self.request.if_modified_since() {
            if meta.modified_since(ims, self.request.ims_length()) {
                // Modified-Since is true; treat as an unconditional hit
                return Ok(false);
            }
            self.send_not_modified(Tag::ImsHit, next).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Send a 304 (Not Modified) answered from the cache.
    async fn send_not_modified(&mut self, tag: Tag, next: &mut dyn StreamNode) -> Result<()> {
        let entry = self.entry.as_ref().expect("not-modified without entry");
        let meta = entry.meta().expect("not-modified without stored reply");
        let stored_at = meta.date().unwrap_or_else(|| meta.updated());
        let reply = meta.make_304();
        self.tag = tag;
        // keep the original object's timestamp so the 304 carries a
        // meaningful Age
        self.install_local_reply(reply, b"", Some(stored_at)).await?;
        self.send_more_data(next).await
    }

    /// Send a 412 (Precondition Failed).
    async fn send_precondition_failed(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        self.tag = Tag::Hit;
        self.install_error_reply(StatusCode::PRECONDITION_FAILED, next)
            .await
    }

    /// 304 or 412 depending on the request method.
    async fn send_not_modified_or_precondition_failed(
        &mut self,
        next: &mut dyn StreamNode,
    ) -> Result<()> {
        if matches!(*self.request.method(), Method::GET | Method::HEAD) {
            self.send_not_modified(Tag::InmHit, next).await
        } else {
            self.send_precondition_failed(next).await
        }
    }
}
