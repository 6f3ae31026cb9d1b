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

//! The purge path: explicit PURGE requests and unsafe-method invalidation.

use http::{Method, StatusCode};
use log::debug;

use crate::access::{ClearReason, IpCache, NeighborSink};
use crate::error::Result;
use crate::filters;
use crate::key::CacheKey;
use crate::pump::StreamNode;
use crate::storage::{Entry, LookupKind, Storage};
use crate::{ReplyContext, Tag};

impl ReplyContext {
    /// Action a PURGE request.
    pub(crate) async fn purge_request(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        debug!("enable_purge = {}", self.config.enable_purge);
        if !self.config.enable_purge {
            self.tag = Tag::Denied;
            return self.install_error_reply(StatusCode::FORBIDDEN, next).await;
        }

        // release the resolver cache for the host as well
        if let (Some(ip_cache), Some(host)) = (self.ip_cache.as_ref(), self.request.host()) {
            ip_cache.invalidate(host);
        }

        self.purge_do_purge(next).await
    }

    async fn purge_do_purge(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        let uri = self.request.effective_uri();
        let mut first_found = false;

        // the variant the request addresses, when vary evaluation keyed it
        let variance = self.vary_key;
        let variant_uri = uri.clone();
        let variant_key = move |method: &Method| {
            let mut key = CacheKey::new(method, variant_uri.clone());
            if let Some(variance) = variance {
                key.set_variance_key(variance);
            }
            key
        };

        let get_key = variant_key(&Method::GET);
        if let Some(entry) = self.storage.lookup(&get_key, LookupKind::Public).await? {
            // special entries are only GET entries without variance
            if entry.is_special() {
                self.tag = Tag::Denied;
                return self.install_error_reply(StatusCode::FORBIDDEN, next).await;
            }
            first_found = true;
            self.purge_entry(entry, &get_key, "").await?;
        }

        self.detail_store_lookup(if first_found { "match" } else { "mismatch" });

        let head_key = variant_key(&Method::HEAD);
        if let Some(entry) = self.storage.lookup(&head_key, LookupKind::Public).await? {
            self.purge_entry(entry, &head_key, "").await?;
        }

        // for Vary, release the base URI if none of the headers was included
        // in the request
        let vary_keyed = self
            .request
            .vary_headers
            .as_deref()
            .is_some_and(|v| v.contains('='));
        if vary_keyed {
            let get_key = CacheKey::new(&Method::GET, uri.clone());
            if let Some(entry) = self.storage.lookup(&get_key, LookupKind::Public).await? {
                self.purge_entry(entry, &get_key, "Vary ").await?;
            }
            let head_key = CacheKey::new(&Method::HEAD, uri.clone());
            if let Some(entry) = self.storage.lookup(&head_key, LookupKind::Public).await? {
                self.purge_entry(entry, &head_key, "Vary ").await?;
            }
        }

        let status = self.purge_status.unwrap_or(StatusCode::NOT_FOUND);

        // make a new entry to hold the reply to be written to the client
        let reply = filters::gen_purge_response(status, self.now())?;
        self.install_local_reply(reply, b"", None).await?;
        self.send_more_data(next).await
    }

    async fn purge_entry(
        &mut self,
        entry: Entry,
        key: &CacheKey,
        description_prefix: &str,
    ) -> Result<()> {
        debug!(
            "{}{} '{}'",
            description_prefix,
            key.method(),
            entry.store_id()
        );
        if let Some(neighbors) = self.neighbors.as_ref() {
            let method = Method::from_bytes(key.method().as_bytes()).unwrap();
            neighbors.htcp_clear(Some(&entry), &self.request, &method, ClearReason::Purge);
        }
        self.storage.evict_if_found(&key.to_compact()).await?;
        self.purge_status = Some(StatusCode::OK);
        Ok(())
    }

    /// Purge every potentially cached variant of the request URL; used when
    /// an unsafe method invalidates its siblings.
    pub(crate) async fn purge_all_cached(&mut self) {
        let uri = self.request.effective_uri();
        for method in [Method::GET, Method::HEAD] {
            if let Some(neighbors) = self.neighbors.as_ref() {
                neighbors.htcp_clear(None, &self.request, &method, ClearReason::Invalidation);
            }
            let key = CacheKey::new(&method, uri.clone());
            // eviction failures only cost an extra origin fetch later
            let _ = self.storage.evict_if_found(&key.to_compact()).await;
        }
    }
}
