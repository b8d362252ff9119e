//! In-memory object cache keyed by the request hash.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::http::Response;
use crate::value::parse_http_time;

/// Datacenter code reported when none is configured.
pub const DEFAULT_DATACENTER: &str = "LOCAL";

/// `server.hostname`.
pub const NODE_NAME: &str = "cache-localsimulator";

/// Default TTL when the origin gives no freshness information.
pub const DEFAULT_TTL_SECS: i64 = 120;

const CACHEABLE_STATUS: [u16; 7] = [200, 203, 300, 301, 302, 404, 410];

#[derive(Clone, Debug)]
pub struct CacheItem {
    pub response: Response,
    pub expires: DateTime<Utc>,
    pub entry_time: DateTime<Utc>,
    pub hits: i64,
    /// Time between the two most recent lookups.
    pub last_used: Duration,
    requested_time: DateTime<Utc>,
}

impl CacheItem {
    pub fn new(response: Response, entry_time: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            response,
            expires: entry_time + ttl,
            entry_time,
            hits: 0,
            last_used: Duration::zero(),
            requested_time: entry_time,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_seconds().max(0)
    }

    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        self.expires - now
    }
}

#[derive(Debug, Default)]
pub struct Cache {
    storage: Mutex<HashMap<String, CacheItem>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, hash: &str, item: CacheItem) {
        if let Ok(mut storage) = self.storage.lock() {
            storage.insert(hash.to_string(), item);
        }
    }

    pub fn get(&self, hash: &str) -> Option<CacheItem> {
        self.get_at(hash, Utc::now())
    }

    /// Lookup at `now`: expired entries are dropped, live ones count a hit.
    pub fn get_at(&self, hash: &str, now: DateTime<Utc>) -> Option<CacheItem> {
        let mut storage = self.storage.lock().ok()?;
        let item = storage.get_mut(hash)?;
        if now > item.expires {
            storage.remove(hash);
            return None;
        }
        item.hits += 1;
        item.last_used = now - item.requested_time;
        item.requested_time = now;
        Some(item.clone())
    }

    /// Re-arms the expiry of a live entry, as `set obj.ttl` in `vcl_hit` does.
    pub fn update_ttl(&self, hash: &str, now: DateTime<Utc>, ttl: Duration) {
        if let Ok(mut storage) = self.storage.lock() {
            if let Some(item) = storage.get_mut(hash) {
                item.expires = now + ttl;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.storage.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `X-Served-By` / `server.identity` for a datacenter.
pub fn served_by(datacenter: &str) -> String {
    format!("cache-{datacenter}-EDGESIM")
}

pub fn is_cacheable_status(status: u16) -> bool {
    CACHEABLE_STATUS.contains(&status)
}

fn directive_seconds(value: &str, name: &str) -> Option<i64> {
    value.split(',').find_map(|part| {
        let (key, secs) = part.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            secs.trim().trim_matches('"').parse::<i64>().ok()
        } else {
            None
        }
    })
}

/// Freshness lifetime of an origin response, in seconds.
pub fn determine_ttl(resp: &Response, now: DateTime<Utc>) -> i64 {
    if let Some(ttl) = resp
        .header
        .get_raw("Surrogate-Control")
        .and_then(|v| directive_seconds(&v, "max-age"))
    {
        return ttl;
    }
    if let Some(cc) = resp.header.get_raw("Cache-Control") {
        if let Some(ttl) = directive_seconds(&cc, "s-maxage") {
            return ttl;
        }
        if let Some(ttl) = directive_seconds(&cc, "max-age") {
            return ttl;
        }
    }
    if let Some(expires) = resp.header.get_raw("Expires").and_then(|v| parse_http_time(&v)) {
        return (expires - now).num_seconds();
    }
    DEFAULT_TTL_SECS
}
