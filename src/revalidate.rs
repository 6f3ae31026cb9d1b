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

//! Stale revalidation: confirm freshness with the origin before serving,
//! sharing one upstream fetch across parallel revalidators of the same key.

use http::StatusCode;
use log::{debug, warn};

use crate::access::Forward;
use crate::error::Result;
use crate::meta::response_older_than;
use crate::pump::StreamNode;
use crate::storage::{Entry, LookupKind, Storage};
use crate::{CollapsedRole, ReplyContext, Shadow, Tag};

impl ReplyContext {
    /// Save the current store context aside; only the revalidation path may
    /// do this, and only once.
    fn save_state(&mut self) {
        assert!(self.shadow.is_none());
        debug!("saving store context");
        self.shadow = Some(Shadow {
            entry: self.entry.take().expect("nothing to save"),
            subscription: self.subscription.take(),
            lastmod: self.request.lastmod.take(),
            etag: self.request.etag.take(),
            reqofs: self.reqofs,
            reqsize: self.reqsize,
        });
        self.reqofs = 0;
        self.reqsize = 0;
    }

    /// Bring the saved store context back; the revalidation entry and its
    /// subscription are dropped first so no late delivery of theirs can
    /// reach the client.
    fn restore_state(&mut self) {
        debug!("restoring store context");
        let shadow = self.shadow.take().expect("nothing to restore");
        self.detach_entry();
        self.entry = Some(shadow.entry);
        self.subscription = shadow.subscription;
        self.reqofs = shadow.reqofs;
        self.reqsize = shadow.reqsize;
        self.request.lastmod = shadow.lastmod;
        self.request.etag = shadow.etag;
    }

    // drop the shadow for good; the new entry is what the client gets
    fn discard_shadow(&mut self) {
        self.shadow = None;
    }

    /// There is an expired entry in the store; perform an IMS fetch to the
    /// origin, collapsing onto an in-flight revalidation when allowed.
    pub(crate) async fn process_expired(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        debug!("revalidating '{}'", self.request.effective_uri());

        if self.request.flags.only_if_cached {
            return self.process_only_if_cached_miss(next).await;
        }

        self.tag = Tag::Refresh;
        self.request.flags.refresh = true;

        let old_meta = self
            .entry
            .as_ref()
            .and_then(|e| e.meta())
            .expect("revalidating an entry without a stored reply");
        let lastmod = old_meta.last_modified();
        debug_assert!(lastmod.is_some());
        let strong_etag = old_meta.strong_etag().cloned();

        // prepare to make a new temporary request
        self.save_state();

        // TODO: support collapsed revalidation for Vary-controlled entries
        let mut collapsing_allowed = self.config.collapsed_forwarding
            && !self.storage.smp_aware()
            && self.request.vary_headers.is_none();

        let key = self.public_key();
        let mut entry: Option<Entry> = None;
        if collapsing_allowed {
            if let Some(e) = self.storage.lookup(&key, LookupKind::Revalidation).await? {
                if e.hitting_requires_collapsing() && e.may_start_hitting() {
                    debug!("collapsed on existing revalidation entry: {e:?}");
                    self.collapsed = CollapsedRole::Slave;
                    entry = Some(e);
                } else {
                    // assume advertising our own fetch would fail too
                    collapsing_allowed = false;
                }
            }
        }

        let entry = match entry {
            Some(e) => e,
            None => {
                let e = Entry::new(self.request.effective_uri());
                if collapsing_allowed {
                    if self.storage.allow_collapsing(&key, &e) {
                        debug!("allow other revalidation requests to collapse on {e:?}");
                        self.collapsed = CollapsedRole::Initiator;
                        self.reval_key = Some(key.clone());
                        e
                    } else if let Some(shared) =
                        self.storage.lookup(&key, LookupKind::Revalidation).await?
                    {
                        // another initiator won the advertisement race
                        debug!("collapsed on racing revalidation entry: {shared:?}");
                        self.collapsed = CollapsedRole::Slave;
                        shared
                    } else {
                        self.collapsed = CollapsedRole::None;
                        e
                    }
                } else {
                    self.collapsed = CollapsedRole::None;
                    e
                }
            }
        };

        // propagate the validators of the stale copy into the outgoing
        // request
        self.request.lastmod = lastmod;
        if !self
            .request
            .headers()
            .contains_key(http::header::IF_NONE_MATCH)
        {
            if let Some(etag) = strong_etag {
                self.request.etag = Some(etag);
            }
        }

        self.attach_entry(entry.clone());

        if self.collapsed != CollapsedRole::Slave {
            if let Err(e) = self.forward.start(&entry, &self.request).await {
                warn!("failed to start revalidation fetch: {e}");
                entry.abort();
            }
        }

        self.handle_ims_reply(next).await
    }

    /// The origin (or the collapsed initiator's fetch) answered our IMS
    /// request; decide what the client gets.
    pub(crate) async fn handle_ims_reply(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        if self.deleting {
            return Ok(());
        }

        let reply_meta = {
            let sub = self
                .subscription
                .as_mut()
                .expect("revalidation without subscription");
            sub.wait_reply().await.ok()
        };
        let entry = self.entry.clone().expect("revalidation without entry");

        if self.collapsed == CollapsedRole::Slave && !entry.may_start_hitting() {
            debug!("CF slave hit private non-shareable {entry:?}. MISS");
            // restore context to meet process_miss() expectations
            self.restore_state();
            self.collapsed = CollapsedRole::None;
            self.tag = Tag::Miss;
            return self.process_miss(next).await;
        }

        // request to origin was aborted
        if entry.is_aborted() || reply_meta.is_none() {
            debug!("request to origin aborted, sending old entry to client");
            self.tag = Tag::RefreshFailOld;
            return self.send_client_old_entry(next).await;
        }
        let new_meta = reply_meta.expect("checked above");
        let status = new_meta.response_header().status;

        // origin replied 304
        if status == StatusCode::NOT_MODIFIED {
            self.tag = Tag::RefreshUnmodified;
            // the old entry is no longer stale
            self.request.flags.stale_if_hit = false;

            let old_entry = self.shadow.as_ref().expect("shadow while revalidating");
            let old_entry = old_entry.entry.clone();
            let now = self.now();
            if let Err(e) = self
                .storage
                .update_on_not_modified(&old_entry, new_meta.response_header(), now)
                .await
            {
                warn!("update_on_not_modified failed: {e}");
            }

            // if the client itself sent a still-valid conditional, forward
            // the 304 from the origin
            if let Some(ims) = self.request.if_modified_since() {
                let unmodified = old_entry
                    .meta()
                    .map(|m| !m.modified_since(ims, self.request.ims_length()))
                    .unwrap_or(false);
                if unmodified {
                    debug!("origin replied 304, forwarding 304 to client");
                    return self.send_client_upstream_response(next).await;
                }
            }

            // send the existing entry, it's still valid
            debug!("origin replied 304, revalidated existing entry and sending it");
            return self.send_client_old_entry(next).await;
        }

        // origin replied with a non-error code
        if status.as_u16() < 500 {
            // RFC 9111 section 4: "When more than one suitable response is
            // stored, a cache MUST use the most recent one (as determined by
            // the Date header field)."
            let older = self
                .shadow
                .as_ref()
                .and_then(|s| s.entry.meta())
                .map(|om| response_older_than(new_meta.response_header(), &om))
                .unwrap_or(false);
            if older {
                self.ignored_stale_reply = true;
                debug!("origin replied {status} but with an older date header, sending old entry");
                return self.send_client_old_entry(next).await;
            }

            self.tag = Tag::RefreshModified;
            debug!("origin replied {status}, forwarding to client");
            return self.send_client_upstream_response(next).await;
        }

        // origin replied with an error
        if self.request.flags.fail_on_validation_err {
            self.tag = Tag::RefreshFailErr;
            debug!("origin replied with error {status}, forwarding to client");
            return self.send_client_upstream_response(next).await;
        }

        // ignore and let the client have the old entry
        self.tag = Tag::RefreshFailOld;
        debug!("origin replied with error {status}, sending old entry to client");
        self.send_client_old_entry(next).await
    }

    /// The data to send is what the revalidation fetch just produced.
    async fn send_client_upstream_response(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        self.discard_shadow();
        // a 304 we merely forward must not replace the cached object; a new
        // body must
        let promote = self.tag == Tag::RefreshModified;
        self.release_revalidation(promote);
        // send_more_data tracks the offset as well, force it back to zero
        self.reqofs = 0;
        debug_assert!(!self.entry.as_ref().is_some_and(|e| e.is_aborted()));
        self.send_more_data(next).await
    }

    /// The data to send is the saved stale entry.
    async fn send_client_old_entry(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        // withdraw the advertisement before letting go of the new entry
        self.release_revalidation(false);
        self.restore_state();
        debug_assert!(!self.entry.as_ref().is_some_and(|e| e.is_aborted()));
        self.reqofs = 0;
        self.send_more_data(next).await
    }
}
