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

//! Cache keys
//!
//! A cached object is addressed by request method + effective URI. When the
//! stored reply carries `Vary`, a variance hash folded on top of that
//! address distinguishes the variants.

use blake2::{Blake2b, Digest};
use http::Method;
use serde::{Deserialize, Serialize};

// 16-byte / 128-bit digests, large enough to avoid collisions
const KEY_SIZE: usize = 16;

/// An 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

// Blake2 digests are stable across machines, which in-memory hashers do not
// guarantee; hashing here is not performance critical.
pub(crate) type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

// fold the variance on top of the address hash; an unvaried object lives
// under its bare address hash
fn fold_variance(address: HashBinary, variance: Option<HashBinary>) -> HashBinary {
    match variance {
        Some(variance) => {
            let mut hasher = Blake2b128::new();
            hasher.update(address);
            hasher.update(variance);
            hasher.finalize().into()
        }
        None => address,
    }
}

/// The address of one cached object: method + effective URI, plus the
/// variance of the variant being addressed, if any.
#[derive(Debug, Clone)]
pub struct CacheKey {
    method: String,
    // the effective request URI, which is also the entry's store id
    uri: String,
    variance: Option<HashBinary>,
}

impl CacheKey {
    /// Create a [CacheKey] for the given method and effective URI.
    pub fn new(method: &Method, uri: impl Into<String>) -> Self {
        CacheKey {
            method: method.as_str().to_string(),
            uri: uri.into(),
            variance: None,
        }
    }

    /// The store id this key addresses, i.e. the effective URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The request method this key addresses.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Set the value of the variance hash
    pub fn set_variance_key(&mut self, key: HashBinary) {
        self.variance = Some(key)
    }

    /// Get the value of the variance hash
    pub fn get_variance_key(&self) -> Option<&HashBinary> {
        self.variance.as_ref()
    }

    /// Removes the variance from this cache key
    pub fn remove_variance_key(&mut self) {
        self.variance = None
    }

    /// The hash of method + effective URI, ignoring any variance.
    ///
    /// This is the primary slot every variant of the URL shares.
    pub fn address_bin(&self) -> HashBinary {
        let mut hasher = Blake2b128::new();
        hasher.update(&self.method);
        hasher.update(b" ");
        hasher.update(&self.uri);
        hasher.finalize().into()
    }

    /// The full hash the store files this key under: the address hash with
    /// the variance folded in.
    pub fn combined_bin(&self) -> HashBinary {
        fold_variance(self.address_bin(), self.variance)
    }

    /// The hex string of [Self::combined_bin()]
    pub fn combined(&self) -> String {
        hex::encode(self.combined_bin())
    }

    /// Reduce this key to its hashes, the form kept in memory or on disk.
    pub fn to_compact(&self) -> CompactCacheKey {
        CompactCacheKey {
            address: self.address_bin(),
            variance: self.variance.map(Box::new),
        }
    }
}

/// Storage optimized form of a [CacheKey]: only the hashes survive.
#[derive(Debug, Deserialize, Serialize, Clone, Hash, PartialEq, Eq)]
pub struct CompactCacheKey {
    pub address: HashBinary,
    // save 8 bytes for non-variance but waste 8 bytes for variance vs. flat
    // 16 bytes
    pub variance: Option<Box<HashBinary>>,
}

impl CompactCacheKey {
    /// The full hash the store files this key under
    pub fn combined_bin(&self) -> HashBinary {
        fold_variance(self.address, self.variance.as_deref().copied())
    }

    /// The hex string of [Self::combined_bin()]
    pub fn combined(&self) -> String {
        hex::encode(self.combined_bin())
    }
}
