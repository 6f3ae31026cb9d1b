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

//! Request and response header objects.
//!
//! Thin wrappers over [http::request::Parts] and [http::response::Parts] with
//! fallible builders and header mutation helpers, so the engine never touches
//! the raw builder API at its call sites.

use http::header::{AsHeaderName, HeaderName, HeaderValue};
use http::request::Builder as ReqBuilder;
use http::request::Parts as ReqParts;
use http::response::Builder as RespBuilder;
use http::response::Parts as RespParts;
use http::uri::Uri;
use std::ops::Deref;

use crate::error::{ErrorType::*, OrErr, Result};

pub use http::method::Method;
pub use http::status::StatusCode;
pub use http::version::Version;
pub use http::HeaderMap as HMap;

// 8 headers should cover the synthesized replies, the rest grow on demand
fn header_map_upper_bound(size_hint: Option<usize>) -> usize {
    const INIT_HEADER_SIZE: usize = 8;
    const MAX_HEADER_COUNT: usize = 4096;
    std::cmp::min(size_hint.unwrap_or(INIT_HEADER_SIZE), MAX_HEADER_COUNT)
}

/// The HTTP request header type.
#[derive(Debug)]
pub struct RequestHeader {
    base: ReqParts,
}

impl AsRef<ReqParts> for RequestHeader {
    fn as_ref(&self) -> &ReqParts {
        &self.base
    }
}

impl Deref for RequestHeader {
    type Target = ReqParts;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl RequestHeader {
    /// Create a new [RequestHeader] with the given method and path.
    pub fn build(
        method: impl TryInto<Method>,
        path: &str,
        size_hint: Option<usize>,
    ) -> Result<Self> {
        let mut base = ReqBuilder::new().body(()).unwrap().into_parts().0;
        base.headers.reserve(header_map_upper_bound(size_hint));
        base.method = method
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid method")?;
        // both the origin-form ("/a") and the effective absolute URI work
        let uri =
            Uri::try_from(path).explain_err(InvalidHTTPHeader, |_| format!("invalid uri {}", path))?;
        base.uri = uri;
        Ok(RequestHeader { base })
    }

    /// Append the header name and value to `self`.
    ///
    /// If there are already some headers under the same name, a new value will
    /// be added without any others being removed.
    pub fn append_header(
        &mut self,
        name: impl TryInto<HeaderName>,
        value: impl TryInto<HeaderValue>,
    ) -> Result<()> {
        let (name, value) = try_into_name_value(name, value)?;
        self.base.headers.append(name, value);
        Ok(())
    }

    /// Insert the header name and value to `self`, replacing any existing ones
    /// under the same name.
    pub fn insert_header(
        &mut self,
        name: impl TryInto<HeaderName>,
        value: impl TryInto<HeaderValue>,
    ) -> Result<()> {
        let (name, value) = try_into_name_value(name, value)?;
        self.base.headers.insert(name, value);
        Ok(())
    }

    /// Remove all headers under the name
    pub fn remove_header<'a, N: ?Sized>(&mut self, name: &'a N) -> Option<HeaderValue>
    where
        &'a N: 'a + AsHeaderName,
    {
        self.base.headers.remove(name)
    }

    /// Set the request method
    pub fn set_method(&mut self, method: Method) {
        self.base.method = method;
    }

    /// Set the request URI
    pub fn set_uri(&mut self, uri: Uri) {
        self.base.uri = uri;
    }

    /// Set http version
    pub fn set_version(&mut self, version: Version) {
        self.base.version = version;
    }
}

impl Clone for RequestHeader {
    fn clone(&self) -> Self {
        RequestHeader {
            base: clone_req_parts(&self.base),
        }
    }
}

/// The HTTP response header type.
#[derive(Debug)]
pub struct ResponseHeader {
    base: RespParts,
}

impl AsRef<RespParts> for ResponseHeader {
    fn as_ref(&self) -> &RespParts {
        &self.base
    }
}

impl Deref for ResponseHeader {
    type Target = RespParts;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl ResponseHeader {
    /// Create a new [ResponseHeader] with the given status code.
    pub fn build(code: impl TryInto<StatusCode>, size_hint: Option<usize>) -> Result<Self> {
        let mut base = RespBuilder::new().body(()).unwrap().into_parts().0;
        base.headers.reserve(header_map_upper_bound(size_hint));
        base.status = code
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid status")?;
        Ok(ResponseHeader { base })
    }

    /// Append the header name and value to `self`.
    ///
    /// If there are already some headers under the same name, a new value will
    /// be added without any others being removed.
    pub fn append_header(
        &mut self,
        name: impl TryInto<HeaderName>,
        value: impl TryInto<HeaderValue>,
    ) -> Result<()> {
        let (name, value) = try_into_name_value(name, value)?;
        self.base.headers.append(name, value);
        Ok(())
    }

    /// Insert the header name and value to `self`, replacing any existing ones
    /// under the same name.
    pub fn insert_header(
        &mut self,
        name: impl TryInto<HeaderName>,
        value: impl TryInto<HeaderValue>,
    ) -> Result<()> {
        let (name, value) = try_into_name_value(name, value)?;
        self.base.headers.insert(name, value);
        Ok(())
    }

    /// Remove all headers under the name
    pub fn remove_header<'a, N: ?Sized>(&mut self, name: &'a N) -> Option<HeaderValue>
    where
        &'a N: 'a + AsHeaderName,
    {
        self.base.headers.remove(name)
    }

    /// Set the response status code
    pub fn set_status(&mut self, status: impl TryInto<StatusCode>) -> Result<()> {
        self.base.status = status
            .try_into()
            .explain_err(InvalidHTTPHeader, |_| "invalid status")?;
        Ok(())
    }

    /// Set the response http version
    pub fn set_version(&mut self, version: Version) {
        self.base.version = version;
    }
}

impl Clone for ResponseHeader {
    fn clone(&self) -> Self {
        ResponseHeader {
            base: clone_resp_parts(&self.base),
        }
    }
}

fn try_into_name_value(
    name: impl TryInto<HeaderName>,
    value: impl TryInto<HeaderValue>,
) -> Result<(HeaderName, HeaderValue)> {
    let name = name
        .try_into()
        .explain_err(InvalidHTTPHeader, |_| "invalid header name")?;
    let value = value
        .try_into()
        .explain_err(InvalidHTTPHeader, |_| "invalid header value")?;
    Ok((name, value))
}

fn clone_req_parts(me: &ReqParts) -> ReqParts {
    let mut parts = ReqBuilder::new()
        .method(me.method.clone())
        .uri(me.uri.clone())
        .version(me.version)
        .body(())
        .unwrap()
        .into_parts()
        .0;
    parts.headers = me.headers.clone();
    parts
}

fn clone_resp_parts(me: &RespParts) -> RespParts {
    let mut parts = RespBuilder::new()
        .status(me.status)
        .version(me.version)
        .body(())
        .unwrap()
        .into_parts()
        .0;
    parts.headers = me.headers.clone();
    parts
}
