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

//! Cache storage abstraction
//!
//! The engine talks to the store through three handles:
//! - [Entry]: a reference-counted cached object. Cloning the handle keeps the
//!   object alive (the lock); dropping it releases it (the unlock).
//! - [Subscription]: a read registration on one entry, delivering the stored
//!   reply first and then body bytes in order. Unregisters on drop.
//! - [EntryWriter]: the write side used by forwarding (and by the engine for
//!   synthesized replies). Dropping a writer without finishing aborts the
//!   entry so readers do not hang.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;

use crate::error::{Error, ErrorType, Result};
use crate::key::{CacheKey, CompactCacheKey};
use crate::message::ResponseHeader;
use crate::meta::EntryMeta;

/// Which table a lookup addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// The public cached object for the key
    Public,
    /// An in-flight revalidation fetch advertised for the key
    Revalidation,
}

/// The state of an entry's object in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// Still being written by its writer
    Pending,
    /// Fully stored, object length is final
    Ok,
}

// entry flag bits
const FLAG_SPECIAL: u8 = 0b0001;
const FLAG_ABORTED: u8 = 0b0010;
const FLAG_BAD_LENGTH: u8 = 0b0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Streaming(usize),
    Complete(usize),
}

struct EntryInner {
    store_id: String,
    flags: AtomicU8,
    // false once the entry can no longer be shared with new readers
    shareable: AtomicBool,
    // whether the body is fully resident in the store's memory tier
    mem_resident: AtomicBool,
    writer_taken: AtomicBool,
    meta: RwLock<Option<EntryMeta>>,
    body: RwLock<Vec<u8>>,
    // progress pulses: meta arrival, body growth, completion, abort
    state: watch::Sender<WriteState>,
    readers: AtomicUsize,
}

/// A reference-counted handle to one cached object.
#[derive(Clone)]
pub struct Entry {
    inner: Arc<EntryInner>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("store_id", &self.inner.store_id)
            .field("status", &self.status())
            .field("readers", &self.readers())
            .finish()
    }
}

impl Entry {
    /// Create a new pending entry for the given store id (the effective URI).
    pub fn new(store_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(WriteState::Streaming(0));
        Entry {
            inner: Arc::new(EntryInner {
                store_id: store_id.into(),
                flags: AtomicU8::new(0),
                shareable: AtomicBool::new(true),
                mem_resident: AtomicBool::new(false),
                writer_taken: AtomicBool::new(false),
                meta: RwLock::new(None),
                body: RwLock::new(Vec::new()),
                state: tx,
                readers: AtomicUsize::new(0),
            }),
        }
    }

    /// The store id (effective URI) this entry was created under.
    pub fn store_id(&self) -> &str {
        &self.inner.store_id
    }

    fn flag(&self, bit: u8) -> bool {
        self.inner.flags.load(Ordering::SeqCst) & bit != 0
    }

    fn set_flag(&self, bit: u8) {
        self.inner.flags.fetch_or(bit, Ordering::SeqCst);
    }

    /// Whether this is an engine-internal (SPECIAL) object
    pub fn is_special(&self) -> bool {
        self.flag(FLAG_SPECIAL)
    }

    pub fn set_special(&self) {
        self.set_flag(FLAG_SPECIAL);
    }

    /// Whether the writer gave up on this entry
    pub fn is_aborted(&self) -> bool {
        self.flag(FLAG_ABORTED)
    }

    /// Whether the stored body did not match its declared length
    pub fn has_bad_length(&self) -> bool {
        self.flag(FLAG_BAD_LENGTH)
    }

    /// Whether new readers may still start consuming this entry.
    ///
    /// Independent of [Self::is_aborted()]: an aborted shared fetch is still
    /// "shared", which decides how its consumers fail over.
    pub fn may_start_hitting(&self) -> bool {
        self.inner.shareable.load(Ordering::SeqCst)
    }

    /// Stop sharing this entry with new readers (existing readers keep going).
    pub fn clear_shareable(&self) {
        self.inner.shareable.store(false, Ordering::SeqCst);
    }

    /// Whether the object is served out of the store's memory tier
    pub fn is_mem_resident(&self) -> bool {
        self.inner.mem_resident.load(Ordering::SeqCst)
    }

    /// Mark the object as fully memory resident (set by store backends)
    pub fn set_mem_resident(&self) {
        self.inner.mem_resident.store(true, Ordering::SeqCst);
    }

    /// Whether the entry can be sent to a client at all
    pub fn is_valid_to_send(&self) -> bool {
        !self.is_aborted()
    }

    /// Whether hitting this entry means joining an in-flight fetch
    pub fn hitting_requires_collapsing(&self) -> bool {
        self.status() == StoreStatus::Pending
    }

    pub fn status(&self) -> StoreStatus {
        match *self.inner.state.borrow() {
            WriteState::Streaming(_) => StoreStatus::Pending,
            WriteState::Complete(_) => StoreStatus::Ok,
        }
    }

    /// The stored body length so far (final once status is [StoreStatus::Ok])
    pub fn object_len(&self) -> usize {
        match *self.inner.state.borrow() {
            WriteState::Streaming(n) | WriteState::Complete(n) => n,
        }
    }

    /// A copy of the entry's metadata, when the stored reply has arrived
    pub fn meta(&self) -> Option<EntryMeta> {
        self.inner.meta.read().clone()
    }

    /// Number of currently registered readers
    pub fn readers(&self) -> usize {
        self.inner.readers.load(Ordering::SeqCst)
    }

    /// Register a reader on this entry.
    pub fn subscribe(&self) -> Subscription {
        self.inner.readers.fetch_add(1, Ordering::SeqCst);
        Subscription {
            entry: self.clone(),
            state: self.inner.state.subscribe(),
            bytes_read: 0,
        }
    }

    /// Take the single writer for this entry.
    ///
    /// # Panic
    /// Panics when the writer was already taken; an entry has exactly one
    /// producer.
    pub fn writer(&self) -> EntryWriter {
        if self.inner.writer_taken.swap(true, Ordering::SeqCst) {
            panic!("entry writer already taken for {}", self.inner.store_id);
        }
        EntryWriter {
            entry: self.clone(),
            finished: false,
        }
    }

    /// Merge freshened header fields into the stored meta after a 304.
    pub fn freshen(&self, fresh: &ResponseHeader, now: SystemTime) -> bool {
        let mut meta = self.inner.meta.write();
        match meta.as_mut() {
            Some(m) => {
                m.update_on_not_modified(fresh, now);
                true
            }
            None => false,
        }
    }

    fn pulse(&self) {
        // nudge readers without changing the byte count
        let current = *self.inner.state.borrow();
        self.inner.state.send_replace(current);
    }

    /// Abort this entry: readers observe the aborted flag on their next poll.
    pub fn abort(&self) {
        self.set_flag(FLAG_ABORTED);
        self.pulse();
    }
}

/// A read registration between one reply context and one entry.
pub struct Subscription {
    entry: Entry,
    state: watch::Receiver<WriteState>,
    bytes_read: usize,
}

impl Subscription {
    /// The entry this subscription reads from
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Wait until the stored reply (the headers) is available.
    ///
    /// This is always the first delivery for a transaction.
    pub async fn wait_reply(&mut self) -> Result<EntryMeta> {
        loop {
            if let Some(meta) = self.entry.meta() {
                return Ok(meta);
            }
            if self.entry.is_aborted() {
                return Error::e_explain(ErrorType::EntryAborted, "while waiting for reply");
            }
            if self.state.changed().await.is_err() {
                // writer side fully gone; abort flag decides how bad it is
                if let Some(meta) = self.entry.meta() {
                    return Ok(meta);
                }
                return Error::e_explain(ErrorType::EntryAborted, "entry writer disappeared");
            }
        }
    }

    /// Read the next in-order chunk of body bytes.
    ///
    /// `Ok(None)` on a clean end of body.
    pub async fn read_body(&mut self) -> Result<Option<Bytes>> {
        loop {
            let state = *self.state.borrow_and_update();
            let bytes_end = match state {
                WriteState::Streaming(n) => n,
                WriteState::Complete(c) => {
                    if c == self.bytes_read {
                        // no more data will arrive
                        return Ok(None);
                    }
                    c
                }
            };
            if self.entry.is_aborted() {
                return Error::e_explain(ErrorType::EntryAborted, "while reading body");
            }
            debug_assert!(bytes_end >= self.bytes_read);

            // more data available to read
            if bytes_end > self.bytes_read {
                let new_bytes = Bytes::copy_from_slice(
                    &self.entry.inner.body.read()[self.bytes_read..bytes_end],
                );
                self.bytes_read = bytes_end;
                return Ok(Some(new_bytes));
            }

            // wait for more data
            if self.state.changed().await.is_err() {
                return Error::e_explain(ErrorType::EntryAborted, "entry writer disappeared");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.entry.inner.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The write side of one entry.
pub struct EntryWriter {
    entry: Entry,
    finished: bool,
}

impl EntryWriter {
    /// Install the stored reply (header + timestamps). Must precede any body
    /// bytes.
    pub fn set_reply(&self, meta: EntryMeta) {
        {
            let mut slot = self.entry.inner.meta.write();
            *slot = Some(meta);
        }
        self.entry.pulse();
    }

    /// Append body bytes.
    pub fn append(&mut self, data: &[u8]) {
        let written = {
            let mut body = self.entry.inner.body.write();
            body.extend_from_slice(data);
            body.len()
        };
        self.entry.inner.state.send_replace(WriteState::Streaming(written));
    }

    /// Finish the object. The entry transitions to [StoreStatus::Ok]; a body
    /// shorter or longer than the declared `Content-Length` marks the entry
    /// BAD_LENGTH.
    pub fn finish(mut self) {
        self.finished = true;
        let written = self.entry.inner.body.read().len();
        let declared = self
            .entry
            .meta()
            .and_then(|m| m.content_length());
        if let Some(declared) = declared {
            if written as u64 != declared {
                self.entry.set_flag(FLAG_BAD_LENGTH);
            }
        }
        self.entry
            .inner
            .state
            .send_replace(WriteState::Complete(written));
    }

    /// Give up on this entry.
    pub fn abort(mut self) {
        self.finished = true;
        self.entry.abort();
    }

    /// The entry this writer populates
    pub fn entry(&self) -> &Entry {
        &self.entry
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        // Writer exited without finishing: readers must not hang on a body
        // that will never complete.
        if !self.finished {
            self.entry.abort();
        }
    }
}

/// Cache storage interface
#[async_trait]
pub trait Storage: Sync {
    /// Look up the entry for the given key.
    async fn lookup(&'static self, key: &CacheKey, kind: LookupKind) -> Result<Option<Entry>>;

    /// Create a new pending entry for the key.
    ///
    /// A `public` entry immediately becomes the object later lookups find (so
    /// they may collapse onto it while it is pending); a private entry is
    /// reachable only through the returned handle.
    async fn create(&'static self, key: &CacheKey, public: bool) -> Result<Entry>;

    /// Advertise `entry` as the in-flight revalidation fetch for `key` so
    /// that later revalidators may collapse onto it.
    ///
    /// Returns false when the store refuses (e.g. one is already registered).
    fn allow_collapsing(&'static self, key: &CacheKey, entry: &Entry) -> bool;

    /// Withdraw a revalidation advertisement. With `promote`, `entry`
    /// replaces the public object under `key` (the origin sent a new body).
    fn finish_revalidation(&'static self, key: &CacheKey, entry: &Entry, promote: bool);

    /// Delete the cached object for the given key, if any.
    async fn evict_if_found(&'static self, key: &CompactCacheKey) -> Result<bool>;

    /// Merge the freshened metadata of a 304 into the stored `old` entry.
    async fn update_on_not_modified(
        &'static self,
        old: &Entry,
        fresh: &ResponseHeader,
        now: SystemTime,
    ) -> Result<bool>;

    /// Whether this store is shared across SMP workers.
    ///
    /// Collapsed revalidation is disabled on SMP-aware stores.
    fn smp_aware(&self) -> bool {
        false
    }
}
