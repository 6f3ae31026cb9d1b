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

//! Engine configuration
//!
//! All tunables the reply engine consults, passed in explicitly at context
//! construction instead of living in ambient globals. A config is usually
//! deserialized once at startup and shared behind an `Arc`.

use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{ErrorType::*, OrErr, Result};

/// QoS markings applied to the client connection per decision outcome.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub hit_tos: Option<u8>,
    pub miss_tos: Option<u8>,
    pub hit_nfmark: Option<u32>,
    pub miss_nfmark: Option<u32>,
}

impl QosConfig {
    pub fn any_active(&self) -> bool {
        self.hit_tos.is_some()
            || self.miss_tos.is_some()
            || self.hit_nfmark.is_some()
            || self.miss_nfmark.is_some()
    }
}

/// The reply engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// The hostname advertised in Via and Cache-Status
    pub hostname: String,
    /// Serve every located entry as a hit regardless of freshness
    pub offline: bool,
    /// Whether PURGE requests are honored
    pub enable_purge: bool,
    /// Whether parallel revalidations of one key share a single fetch
    pub collapsed_forwarding: bool,
    /// Seconds a collapsed slave waits on the initiator before giving up
    pub collapsed_forwarding_timeout: u64,
    /// Keep client connections alive after replies with status >= 400
    pub error_pconns: bool,
    /// Keep client connections alive at all
    pub client_pconns: bool,
    /// Reply bodies larger than this are refused with 403 (0 = unlimited)
    pub max_reply_body_size: u64,
    /// Default freshness seconds for replies without explicit expiry
    pub default_fresh_sec: Option<u32>,
    /// QoS markings per hit/miss
    pub qos: QosConfig,
    /// Reply-direction header removals ("mangling"), by header name
    pub deny_reply_headers: Vec<String>,
    #[serde(skip)]
    shutting_down: Arc<AtomicBool>,
    #[serde(skip)]
    fd_pressure: Arc<AtomicBool>,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        ReplyConfig {
            hostname: "localhost".to_string(),
            offline: false,
            enable_purge: false,
            collapsed_forwarding: true,
            collapsed_forwarding_timeout: 30,
            error_pconns: true,
            client_pconns: true,
            max_reply_body_size: 0,
            default_fresh_sec: None,
            qos: QosConfig::default(),
            deny_reply_headers: vec![],
            shutting_down: Arc::new(AtomicBool::new(false)),
            fd_pressure: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ReplyConfig {
    /// Build the config from a YAML document.
    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        debug!("Read conf file: {conf_str}");
        let conf: ReplyConfig = serde_yaml::from_str(conf_str)
            .or_err_with(InternalError, || "invalid reply engine conf")?;
        conf.validate()
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }

    /// Sanity-check the settings.
    pub fn validate(self) -> Result<Self> {
        if self.hostname.is_empty() {
            return crate::error::Error::e_explain(InternalError, "hostname must not be empty");
        }
        // the hostname ends up in Via and Cache-Status header values
        if http::HeaderValue::try_from(self.hostname.as_str()).is_err() {
            return crate::error::Error::e_explain(InternalError, "hostname not header safe");
        }
        Ok(self)
    }

    /// Whether the process is shutting down (keep-alive is then pointless)
    pub fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    /// Whether file descriptors are running out
    pub fn fd_usage_high(&self) -> bool {
        self.fd_pressure.load(Ordering::Relaxed)
    }

    pub fn set_fd_pressure(&self, high: bool) {
        self.fd_pressure.store(high, Ordering::Relaxed);
    }
}

/// Where the engine reads the current time from.
///
/// Injected so that freshness and Age arithmetic are testable without
/// sleeping.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A settable clock for tests.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<parking_lot::RwLock<SystemTime>>,
}

impl ManualClock {
    pub fn new(now: SystemTime) -> Self {
        ManualClock {
            now: Arc::new(parking_lot::RwLock::new(now)),
        }
    }

    pub fn set(&self, now: SystemTime) {
        *self.now.write() = now;
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.read()
    }
}
