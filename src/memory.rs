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

//! Hash map based in memory cache
//!
//! For testing only, not for production use

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;

use crate::error::Result;
use crate::key::{CacheKey, CompactCacheKey};
use crate::message::ResponseHeader;
use crate::storage::{Entry, LookupKind, Storage};

/// Hash map based in memory cache
///
/// For testing only, not for production use.
pub struct MemStore {
    objects: RwLock<HashMap<String, Entry>>,
    // in-flight revalidation fetches advertised for collapsing
    revalidating: RwLock<HashMap<String, Entry>>,
}

impl MemStore {
    /// Create a new [MemStore]
    pub fn new() -> Self {
        MemStore {
            objects: RwLock::new(HashMap::new()),
            revalidating: RwLock::new(HashMap::new()),
        }
    }

    /// Install a finished object directly, bypassing the write path.
    ///
    /// Test setup helper.
    pub fn seed(&self, key: &CacheKey, meta: crate::meta::EntryMeta, body: &[u8]) -> Entry {
        let entry = Entry::new(key.uri());
        let mut writer = entry.writer();
        writer.set_reply(meta);
        writer.append(body);
        writer.finish();
        self.objects.write().insert(key.combined(), entry.clone());
        entry
    }

    /// Number of stored objects, for test assertions
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemStore {
    async fn lookup(&'static self, key: &CacheKey, kind: LookupKind) -> Result<Option<Entry>> {
        let hash = key.combined();
        let table = match kind {
            LookupKind::Public => &self.objects,
            LookupKind::Revalidation => &self.revalidating,
        };
        Ok(table.read().get(&hash).cloned())
    }

    async fn create(&'static self, key: &CacheKey, public: bool) -> Result<Entry> {
        let entry = Entry::new(key.uri());
        if public {
            self.objects.write().insert(key.combined(), entry.clone());
        }
        Ok(entry)
    }

    fn allow_collapsing(&'static self, key: &CacheKey, entry: &Entry) -> bool {
        let hash = key.combined();
        let mut table = self.revalidating.write();
        if table.contains_key(&hash) {
            return false;
        }
        table.insert(hash, entry.clone());
        true
    }

    fn finish_revalidation(&'static self, key: &CacheKey, entry: &Entry, promote: bool) {
        let hash = key.combined();
        self.revalidating.write().remove(&hash);
        if promote {
            self.objects.write().insert(hash, entry.clone());
        }
    }

    async fn evict_if_found(&'static self, key: &CompactCacheKey) -> Result<bool> {
        let hash = key.combined();
        let removed = self.objects.write().remove(&hash).is_some();
        Ok(removed)
    }

    async fn update_on_not_modified(
        &'static self,
        old: &Entry,
        fresh: &ResponseHeader,
        now: SystemTime,
    ) -> Result<bool> {
        Ok(old.freshen(fresh, now))
    }
}
