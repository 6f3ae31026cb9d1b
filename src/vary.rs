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

//! Vary handling
//!
//! A stored reply that carries `Vary` only matches requests whose named
//! headers hash to the same variance as the stored variant. The primary slot
//! under a cache key holds one variant; other variants live in secondary
//! slots keyed by primary + variance.

use blake2::Digest;
use http::HeaderMap;
use std::{borrow::Cow, collections::BTreeMap};

use crate::key::{Blake2b128, HashBinary};
use crate::meta::EntryMeta;

/// A builder for variance keys, used for distinguishing multiple cached
/// assets at the same URL.
pub struct VarianceBuilder<'a> {
    values: BTreeMap<Cow<'a, str>, Cow<'a, [u8]>>,
}

impl<'a> VarianceBuilder<'a> {
    /// Create an empty variance key. Has no variance by default; add some
    /// using [`Self::add_value`].
    pub fn new() -> Self {
        VarianceBuilder {
            values: BTreeMap::new(),
        }
    }

    /// Add a byte string to the variance key. Not sensitive to insertion
    /// order.
    pub fn add_value(&mut self, name: &'a str, value: &'a (impl AsRef<[u8]> + ?Sized)) {
        self.values
            .insert(name.into(), Cow::Borrowed(value.as_ref()));
    }

    /// Move a byte string to the variance key. Not sensitive to insertion
    /// order.
    pub fn add_owned_value(&mut self, name: &'a str, value: Vec<u8>) {
        self.values.insert(name.into(), Cow::Owned(value));
    }

    /// Check whether this variance key actually has variance, or just refers
    /// to the root asset
    pub fn has_variance(&self) -> bool {
        !self.values.is_empty()
    }

    /// Hash this variance key. Returns [`None`] if [`Self::has_variance`] is
    /// false.
    pub fn finalize(self) -> Option<HashBinary> {
        const SALT: &[u8; 1] = &[0u8; 1];
        if self.has_variance() {
            let mut hash = Blake2b128::new();
            for (name, value) in self.values.iter() {
                hash.update(name.as_bytes());
                hash.update(SALT);
                hash.update(value);
                hash.update(SALT);
            }
            Some(hash.finalize().into())
        } else {
            None
        }
    }
}

impl<'a> Default for VarianceBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of matching a request against a stored variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaryVerdict {
    /// The stored reply does not vary
    NoVary,
    /// This is the variant the request asks for
    Match,
    /// A different variant is wanted; re-query with the returned variance.
    /// The second field is the "name=value" record for the request.
    Other(HashBinary, String),
    /// The variance cannot be resolved (`Vary: *` or a detected loop)
    Cancel,
}

/// Compute the variance of `request_headers` under the stored reply's `Vary`.
///
/// Returns the hash and the "name=value" list describing it, or `None` for
/// `Vary: *` and unusable vary specifications.
pub fn request_variance(
    vary_value: &str,
    request_headers: &HeaderMap,
) -> Option<(Option<HashBinary>, String)> {
    let mut collected: Vec<(String, Vec<u8>)> = Vec::new();
    for name in vary_value.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if name == "*" {
            return None;
        }
        let lower = name.to_ascii_lowercase();
        let mut combined: Vec<u8> = Vec::new();
        for value in request_headers.get_all(lower.as_str()) {
            if !combined.is_empty() {
                combined.extend_from_slice(b", ");
            }
            combined.extend_from_slice(value.as_bytes());
        }
        collected.push((lower, combined));
    }

    let mut builder = VarianceBuilder::new();
    let mut description = String::new();
    for (name, value) in &collected {
        if !description.is_empty() {
            description.push(' ');
        }
        description.push_str(name);
        if !value.is_empty() {
            description.push('=');
            description.push('"');
            description.push_str(&String::from_utf8_lossy(value));
            description.push('"');
        }
        builder.add_value(name, value);
    }
    Some((builder.finalize(), description))
}

/// Match the request against the stored variant's variance.
pub fn evaluate_match(meta: &EntryMeta, request_headers: &HeaderMap) -> VaryVerdict {
    let Some(vary) = meta.vary() else {
        return VaryVerdict::NoVary;
    };
    let Ok(vary) = vary.to_str() else {
        return VaryVerdict::Cancel;
    };
    let Some((variance, description)) = request_variance(vary, request_headers) else {
        // Vary: * can never match
        return VaryVerdict::Cancel;
    };
    match (variance, meta.variance()) {
        (None, None) => VaryVerdict::Match,
        (Some(v), Some(stored)) if v == stored => VaryVerdict::Match,
        (Some(v), _) => VaryVerdict::Other(v, description),
        // the request lacks every vary header; hash the empty variant
        (None, Some(_)) => {
            let mut builder = VarianceBuilder::new();
            builder.add_value("", "");
            let v = builder.finalize().unwrap();
            VaryVerdict::Other(v, description)
        }
    }
}
