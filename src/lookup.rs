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

//! Lookup and first classification: request -> store entry -> initial verdict.

use log::{debug, warn};

use crate::access::IpCache;
use crate::error::Result;
use crate::pump::StreamNode;
use crate::storage::{Entry, LookupKind, Storage};
use crate::{ReplyContext, Tag};

// the wording the Cache-Status detail uses for lookup outcomes
fn store_lookup_string(found: bool) -> &'static str {
    if found {
        "match"
    } else {
        "mismatch"
    }
}

/// Whether the identified object settled the transaction or vary evaluation
/// asks for another store query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdentifyOutcome {
    Done,
    Requery,
}

impl ReplyContext {
    /// Query the store for the request and classify the outcome. A vary
    /// mismatch re-queries with updated vary bookkeeping, which also makes
    /// sure we only loop once.
    pub(crate) async fn identify_store_object(
        &mut self,
        next: &mut dyn StreamNode,
    ) -> Result<()> {
        loop {
            // client sent CC:no-cache or some other condition has been
            // encountered which prevents delivering a public/cached object
            let outcome = if !self.request.flags.no_cache || self.request.flags.internal {
                let key = self.public_key();
                let entry = match self.storage.lookup(&key, LookupKind::Public).await {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("store lookup failed: {e}");
                        None
                    }
                };
                let detail = store_lookup_string(entry.is_some());
                self.identify_found_object(entry, detail, next).await?
            } else {
                // "external" no-cache requests skip store lookups
                self.identify_found_object(None, "no-cache", next).await?
            };
            if outcome == IdentifyOutcome::Done {
                return Ok(());
            }
        }
    }

    /// Check the state of the located entry to see if we can determine the
    /// final status of the request.
    async fn identify_found_object(
        &mut self,
        entry: Option<Entry>,
        detail: &'static str,
        next: &mut dyn StreamNode,
    ) -> Result<IdentifyOutcome> {
        self.detail_store_lookup(detail);

        // release negative resolver entries on reload, also when the reload
        // was rewritten into a conditional
        if self.request.flags.no_cache || self.request.flags.no_cache_hack {
            if let (Some(ip_cache), Some(host)) = (self.ip_cache.as_ref(), self.request.host()) {
                ip_cache.invalidate_negative(host);
            }
        }

        let Some(entry) = entry else {
            debug!("no entry - MISS");
            self.tag = Tag::Miss;
            return self.do_get_more_data(None, next).await;
        };

        if self.config.offline {
            // offline mode serves whatever we have
            debug!("offline HIT {entry:?}");
            self.tag = Tag::Hit;
            return self.do_get_more_data(Some(entry), next).await;
        }

        if self.request.redirect.is_some() {
            // no body on 3xx responses, the entry is of no use
            debug!("REDIRECT status forces MISS {entry:?}");
            self.tag = Tag::Redirect;
            return self.do_get_more_data(None, next).await;
        }

        if !entry.is_valid_to_send() {
            debug!("entry not valid to send - MISS {entry:?}");
            self.tag = Tag::Miss;
            return self.do_get_more_data(None, next).await;
        }

        if entry.is_special() {
            // special entries are always hits, no matter what the client says
            debug!("SPECIAL HIT {entry:?}");
            self.tag = Tag::Hit;
            return self.do_get_more_data(Some(entry), next).await;
        }

        if self.request.flags.no_cache {
            debug!("no-cache REFRESH MISS {entry:?}");
            self.tag = Tag::ClientRefreshMiss;
            return self.do_get_more_data(None, next).await;
        }

        if entry.hitting_requires_collapsing() && !self.may_collapse_on(&entry) {
            debug!("prohibited CF MISS {entry:?}");
            self.tag = Tag::Miss;
            return self.do_get_more_data(None, next).await;
        }

        debug!("default HIT {entry:?}");
        self.tag = Tag::Hit;
        self.do_get_more_data(Some(entry), next).await
    }

    // whether this context may join an in-flight fetch instead of starting
    // its own
    fn may_collapse_on(&self, entry: &Entry) -> bool {
        if !self.config.collapsed_forwarding {
            return false;
        }
        if !entry.may_start_hitting() {
            return false;
        }
        matches!(
            *self.request.method(),
            http::Method::GET | http::Method::HEAD
        )
    }

    /// Proceed with the classified object: hit processing when an entry was
    /// kept, the miss path otherwise.
    async fn do_get_more_data(
        &mut self,
        entry: Option<Entry>,
        next: &mut dyn StreamNode,
    ) -> Result<IdentifyOutcome> {
        match entry {
            Some(entry) => {
                // someone found the object in the cache for us
                self.attach_entry(entry);
                self.apply_qos_marks();
                self.cache_hit(next).await
            }
            None => {
                // MISS case, the tag is already set
                self.process_miss(next).await?;
                Ok(IdentifyOutcome::Done)
            }
        }
    }
}
