//! Response cache for idempotent authority reads.
//!
//! Keyed by SHA-256 over the endpoint path and the serialized request body.
//! Only endpoints whose [`Endpoint::is_cacheable`] holds are ever stored;
//! ticket grants, last-voucher queries and submissions always go to the wire.
//! Expired entries are pruned lazily on lookup and insert.

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::transport::Endpoint;

/// TTLs per cacheable endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub voucher_lookup: Duration,
    pub service_status: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            voucher_lookup: Duration::from_secs(600),
            service_status: Duration::from_secs(30),
        }
    }
}

impl CachePolicy {
    pub fn ttl_for(&self, endpoint: Endpoint) -> Option<Duration> {
        match endpoint {
            Endpoint::VoucherLookup => Some(self.voucher_lookup),
            Endpoint::ServiceStatus => Some(self.service_status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: Value,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    policy: CachePolicy,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(policy: CachePolicy) -> Self {
        ResponseCache {
            entries: Mutex::new(HashMap::new()),
            policy,
            enabled: true,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        ResponseCache {
            entries: Mutex::new(HashMap::new()),
            policy: CachePolicy::default(),
            enabled: false,
        }
    }

    /// Hex SHA-256 of endpoint path and body.
    pub fn key(endpoint: Endpoint, body: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(endpoint.path().as_bytes());
        hasher.update(b"\n");
        hasher.update(body.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, endpoint: Endpoint, body: &Value) -> Option<Value> {
        if !self.enabled || !endpoint.is_cacheable() {
            return None;
        }

        let key = Self::key(endpoint, body);
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(&key) {
            Some(entry) if entry.expires_at > now => {
                trace!(endpoint = %endpoint, "Response cache hit");
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Stores a successful response if the endpoint is cacheable.
    pub fn put(&self, endpoint: Endpoint, body: &Value, response: &Value) {
        if !self.enabled {
            return;
        }
        let Some(ttl) = self.policy.ttl_for(endpoint) else {
            return;
        };

        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            Self::key(endpoint, body),
            CacheEntry {
                response: response.clone(),
                expires_at: now + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
