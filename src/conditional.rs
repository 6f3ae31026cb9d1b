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

//! Conditional request utilities: ETag comparison and 304 conversion.

use http::header::*;
use http::StatusCode;

use crate::message::ResponseHeader;
use crate::meta::EntryMeta;
use crate::request::ClientRequest;

// Trim ASCII whitespace bytes from the start of the slice.
fn trim_ascii_start(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

/// Search for an ETag matching `target_etag` in the input header, using
/// [weak comparison](https://datatracker.ietf.org/doc/html/rfc9110#section-8.8.3.2).
/// Multiple ETags can exist in the header as a comma-separated list.
///
/// Returns true if a matching ETag exists.
pub fn weak_validate_etag(input_etag_header: &[u8], target_etag: &[u8]) -> bool {
    fn strip_weak_prefix(etag: &[u8]) -> &[u8] {
        etag.strip_prefix(b"W/").unwrap_or(etag)
    }
    if input_etag_header == b"*" {
        return true;
    }

    // The RFC requires ETags to be wrapped in double quotes, though some
    // legacy origins or clients don't adhere to this. To handle both, walk
    // the header doing a substring comparison at each comma divider,
    // looking for an exact match of the ETag followed by EOF or a comma.
    //
    // XXX: an unquoted target that contains commas can falsely match inside
    // a quoted list member; quoted RFC-compliant ETags compare exactly.
    let target_etag = strip_weak_prefix(target_etag);
    let mut remaining = strip_weak_prefix(input_etag_header);
    while let Some(search_slice) = remaining.get(0..target_etag.len()) {
        if search_slice == target_etag {
            remaining = &remaining[target_etag.len()..];
            // check if there's any content after the matched substring
            remaining = trim_ascii_start(remaining);
            if matches!(remaining.first(), None | Some(b',')) {
                // at the end of the header or at a comma delimiter: a match
                return true;
            }
        }
        // find the next delimiter (ignore the rest of the non-matching etag)
        let Some(next_delimiter_pos) = remaining.iter().position(|&b| b == b',') else {
            break;
        };
        remaining = &remaining[next_delimiter_pos..];
        // find the next etag slice to compare, skipping extraneous
        // delimiters and whitespace
        let Some(next_etag_pos) = remaining
            .iter()
            .position(|&b| !b.is_ascii_whitespace() && b != b',')
        else {
            break;
        };
        remaining = &remaining[next_etag_pos..];
        remaining = strip_weak_prefix(remaining);
    }
    // remaining length < target etag length
    false
}

/// Search for an ETag matching `target_etag` using
/// [strong comparison](https://datatracker.ietf.org/doc/html/rfc9110#section-8.8.3.2):
/// weak validators never match.
pub fn strong_validate_etag(input_etag_header: &[u8], target_etag: &[u8]) -> bool {
    if input_etag_header == b"*" {
        return true;
    }
    if target_etag.starts_with(b"W/") {
        return false;
    }
    for member in input_etag_header.split(|&b| b == b',') {
        let member = trim_ascii_start(member);
        let member = match member.iter().rposition(|b| !b.is_ascii_whitespace()) {
            Some(last) => &member[..=last],
            None => continue,
        };
        if member.starts_with(b"W/") {
            continue;
        }
        if member == target_etag {
            return true;
        }
    }
    false
}

/// Whether any `If-Match` member strongly matches the stored reply's ETag.
pub fn has_if_match_etag(request: &ClientRequest, meta: &EntryMeta) -> bool {
    let Some(etag) = meta.etag() else {
        return false;
    };
    for cond in request.headers().get_all(IF_MATCH) {
        if strong_validate_etag(cond.as_bytes(), etag.as_bytes()) {
            return true;
        }
    }
    false
}

/// Whether any `If-None-Match` member weakly matches the stored reply's ETag.
pub fn has_if_none_match_etag(request: &ClientRequest, meta: &EntryMeta) -> bool {
    let Some(etag) = meta.etag() else {
        return false;
    };
    for cond in request.headers().get_all(IF_NONE_MATCH) {
        if weak_validate_etag(cond.as_bytes(), etag.as_bytes()) {
            return true;
        }
    }
    false
}

/// Convert the input response header to a `304 Not Modified` response.
pub fn to_304(resp: &mut ResponseHeader) {
    // https://datatracker.ietf.org/doc/html/rfc9110#name-304-not-modified
    // A server may send content-length in 304, but no common web server does
    // it, so drop both content-length and content-type for less surprise.
    resp.set_status(StatusCode::NOT_MODIFIED).unwrap();
    resp.remove_header(&CONTENT_LENGTH);
    resp.remove_header(&CONTENT_TYPE);
    // "SHOULD NOT generate representation metadata other than the above
    // listed fields unless said metadata exists for the purpose of guiding
    // cache updates"
    resp.remove_header(&TRANSFER_ENCODING);
    resp.remove_header(&CONTENT_ENCODING);
    resp.remove_header(&ACCEPT_RANGES);
}
