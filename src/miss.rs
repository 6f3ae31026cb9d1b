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

//! The miss path: no usable hit, fetch the object or synthesize the reply.

use http::{Method, StatusCode};
use log::{debug, error, warn};

use crate::access::Forward;
use crate::error::Result;
use crate::filters;
use crate::pump::StreamNode;
use crate::storage::Storage;
use crate::{ReplyContext, Tag, METHOD_PURGE};

impl ReplyContext {
    /// Prepare to fetch the object as it's a cache miss of some kind.
    pub(crate) async fn process_miss(&mut self, next: &mut dyn StreamNode) -> Result<()> {
        debug!(
            "{} {}",
            self.request.method(),
            self.request.effective_uri()
        );

        // we might have a left-over entry from a failed cache hit or IMS
        // request
        if self.entry.as_ref().is_some_and(|e| e.is_special()) {
            error!(
                "miss on a special object ({}), log_type = {}",
                self.request.effective_uri(),
                self.tag.as_str()
            );
        }
        self.detach_entry();

        if self.request.method() == &*METHOD_PURGE {
            return self.purge_request(next).await;
        }

        // unsafe methods invalidate all cached variants of the URL
        if self.request.unsafe_method() {
            self.purge_all_cached().await;
        }

        if self.request.flags.only_if_cached {
            return self.process_only_if_cached_miss(next).await;
        }

        // deny loops
        if self.request.flags.loop_detected {
            self.tag = Tag::Denied;
            return self.install_error_reply(StatusCode::FORBIDDEN, next).await;
        }

        if let Some(redirect) = self.request.redirect.clone() {
            self.tag = Tag::Redirect;
            let reply = filters::gen_redirect_response(redirect.status, &redirect.location)?;
            self.install_local_reply(reply, b"", None).await?;
            return self.send_more_data(next).await;
        }

        // create the entry the fetch will fill and start forwarding to get
        // the new object from the network
        let key = self.public_key();
        let public = self.cachable_miss();
        let entry = self.storage.create(&key, public).await?;
        self.attach_entry(entry.clone());
        if let Err(e) = self.forward.start(&entry, &self.request).await {
            warn!("failed to start forwarding: {e}");
            entry.abort();
        }
        self.send_more_data(next).await
    }

    // whether the fetched object may become the public object for the key,
    // letting later requests collapse onto the fetch
    fn cachable_miss(&self) -> bool {
        matches!(*self.request.method(), Method::GET | Method::HEAD)
            && !self.request.flags.need_validation
            && !self.request.flags.no_cache
    }

    /// The client insisted on `only-if-cached` and we have nothing to serve
    /// without contacting other servers: answer 504 as RFC 9111 suggests.
    pub(crate) async fn process_only_if_cached_miss(
        &mut self,
        next: &mut dyn StreamNode,
    ) -> Result<()> {
        debug!(
            "{} {}",
            self.request.method(),
            self.request.effective_uri()
        );
        self.detach_entry();
        self.install_error_reply(StatusCode::GATEWAY_TIMEOUT, next)
            .await
    }
}
