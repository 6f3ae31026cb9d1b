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

//! Interfaces to the engine's external collaborators
//!
//! Access-control evaluation, origin forwarding, neighbor invalidation, the
//! IP cache and authentication decoration all live outside the reply engine.
//! The engine only knows these trait shapes; callers inject implementations
//! at context construction.

use async_trait::async_trait;
use http::Method;

use crate::error::Result;
use crate::message::ResponseHeader;
use crate::request::ClientRequest;
use crate::storage::Entry;

/// The outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Allowed,
    Denied,
}

impl Answer {
    pub fn allowed(&self) -> bool {
        matches!(self, Answer::Allowed)
    }
}

/// The `send_hit` style gate: may this located hit be served from cache?
///
/// Evaluated synchronously on the hot path; when in doubt, deny (the request
/// then falls through to the miss path, it is not refused).
pub trait HitAccess: Send + Sync {
    fn fast_check(&self, request: &ClientRequest, reply: &ResponseHeader) -> Answer;
}

/// The reply-direction access gate, evaluated once per transaction right
/// before the headers go out. The reply view is read-only.
#[async_trait]
pub trait ReplyAccess: Send + Sync {
    async fn check(&self, request: &ClientRequest, reply: &ResponseHeader) -> Answer;
}

/// Starts an origin fetch that populates the given entry.
///
/// The fetch runs detached; its progress is observable through the entry.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn start(&self, entry: &Entry, request: &ClientRequest) -> Result<()>;
}

/// Why a neighbor invalidation is being broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// An explicit PURGE request
    Purge,
    /// An unsafe method invalidated cached variants
    Invalidation,
}

/// Broadcasts cache invalidations to neighbor caches (HTCP CLR).
pub trait NeighborSink: Send + Sync {
    fn htcp_clear(
        &self,
        entry: Option<&Entry>,
        request: &ClientRequest,
        method: &Method,
        reason: ClearReason,
    );
}

/// The resolver cache; reloads and purges drop its entries for a host.
pub trait IpCache: Send + Sync {
    /// Forget everything cached for the host
    fn invalidate(&self, host: &str);
    /// Forget only negatively cached resolutions for the host
    fn invalidate_negative(&self, host: &str);
}

/// Appends authentication scheme headers to outgoing replies.
pub trait AuthDecorator: Send + Sync {
    /// `denied` is true when decorating a 401/407 deny reply.
    fn add_reply_auth_header(
        &self,
        reply: &mut ResponseHeader,
        request: &ClientRequest,
        denied: bool,
    );

    /// Whether an authenticated exchange is in progress for this request
    fn request_authenticated(&self, request: &ClientRequest) -> bool;
}
