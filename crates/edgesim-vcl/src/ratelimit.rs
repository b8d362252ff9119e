//! Ratecounters and penaltyboxes. Both live for the lifetime of the
//! process and are shared by every request.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Entries older than this are dropped on the next access.
const RETENTION: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
struct RateEntry {
    count: i64,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct Ratecount {
    entries: Vec<RateEntry>,
    increments: Vec<RateEntry>,
}

impl Ratecount {
    fn sweep(&mut self, now: Instant) {
        let fresh = |entry: &RateEntry| now.saturating_duration_since(entry.created_at) <= RETENTION;
        self.entries.retain(fresh);
        self.increments.retain(fresh);
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.increments.is_empty()
    }

    fn bucket(&self, window: Duration, now: Instant) -> i64 {
        self.entries
            .iter()
            .chain(self.increments.iter())
            .filter(|entry| now.saturating_duration_since(entry.created_at) <= window)
            .map(|entry| entry.count)
            .sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
pub struct Ratecounter {
    pub name: String,
    clients: Mutex<HashMap<String, Ratecount>>,
}

impl Ratecounter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Sweeps every client, drops the ones left empty, then records `event`.
    fn record(&self, entry: &str, now: Instant, event: impl FnOnce(&mut Ratecount)) {
        let mut clients = lock(&self.clients);
        clients.retain(|_, client| {
            client.sweep(now);
            !client.is_empty()
        });
        event(clients.entry(entry.to_string()).or_default());
    }

    /// Records one access.
    pub fn count(&self, entry: &str) {
        self.count_at(entry, Instant::now());
    }

    pub fn count_at(&self, entry: &str, now: Instant) {
        self.record(entry, now, |c| {
            c.entries.push(RateEntry {
                count: 1,
                created_at: now,
            })
        });
    }

    /// Manual increment from `ratelimit.ratecounter_increment`.
    pub fn increment(&self, entry: &str, delta: i64) {
        self.increment_at(entry, delta, Instant::now());
    }

    pub fn increment_at(&self, entry: &str, delta: i64, now: Instant) {
        self.record(entry, now, |c| {
            c.increments.push(RateEntry {
                count: delta,
                created_at: now,
            })
        });
    }

    pub fn bucket(&self, entry: &str, window: Duration) -> i64 {
        self.bucket_at(entry, window, Instant::now())
    }

    /// Reads never create a client record.
    pub fn bucket_at(&self, entry: &str, window: Duration, now: Instant) -> i64 {
        let mut clients = lock(&self.clients);
        let Some(client) = clients.get_mut(entry) else {
            return 0;
        };
        client.sweep(now);
        let bucket = client.bucket(window, now);
        if client.is_empty() {
            clients.remove(entry);
        }
        bucket
    }

    /// Accesses per second over `window`.
    pub fn rate(&self, entry: &str, window: Duration) -> f64 {
        self.rate_at(entry, window, Instant::now())
    }

    pub fn rate_at(&self, entry: &str, window: Duration, now: Instant) -> f64 {
        let bucket = self.bucket_at(entry, window, now);
        if bucket == 0 || window.is_zero() {
            return 0.0;
        }
        bucket as f64 / window.as_secs_f64()
    }
}

/// Expiry of a penaltybox entry; `None` outlives any `Instant`.
type Expiry = Option<Instant>;

fn unexpired(expires: &Expiry, now: Instant) -> bool {
    expires.is_none_or(|at| at >= now)
}

#[derive(Debug)]
pub struct Penaltybox {
    pub name: String,
    clients: Mutex<HashMap<String, Expiry>>,
}

impl Penaltybox {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, entry: &str, ttl: Duration) {
        self.add_at(entry, ttl, Instant::now());
    }

    /// Adds `entry` and drops every entry that has already expired.
    pub fn add_at(&self, entry: &str, ttl: Duration, now: Instant) {
        let mut clients = lock(&self.clients);
        clients.retain(|_, expires| unexpired(expires, now));
        clients.insert(entry.to_string(), now.checked_add(ttl));
    }

    pub fn has(&self, entry: &str) -> bool {
        self.has_at(entry, Instant::now())
    }

    /// True while the entry is unexpired; expired entries are removed.
    pub fn has_at(&self, entry: &str, now: Instant) -> bool {
        let mut clients = lock(&self.clients);
        match clients.get(entry) {
            Some(expires) if unexpired(expires, now) => true,
            Some(_) => {
                clients.remove(entry);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{Penaltybox, Ratecounter, lock};

    #[test]
    fn bucket_counts_events_inside_window() {
        let rc = Ratecounter::new("rc");
        let start = Instant::now();
        for offset in [0u64, 10, 20, 50, 65] {
            rc.count_at("client", start + Duration::from_secs(offset));
        }
        let now = start + Duration::from_secs(70);
        assert_eq!(rc.bucket_at("client", Duration::from_secs(60), now), 4);
        assert_eq!(rc.bucket_at("client", Duration::from_secs(10), now), 1);
        assert_eq!(rc.bucket_at("other", Duration::from_secs(60), now), 0);
    }

    #[test]
    fn manual_increments_join_the_bucket() {
        let rc = Ratecounter::new("rc");
        let now = Instant::now();
        rc.count_at("c", now);
        rc.increment_at("c", 9, now);
        assert_eq!(rc.bucket_at("c", Duration::from_secs(10), now), 10);
        assert_eq!(rc.rate_at("c", Duration::from_secs(10), now), 1.0);
    }

    #[test]
    fn old_entries_are_swept() {
        let rc = Ratecounter::new("rc");
        let start = Instant::now();
        rc.count_at("c", start);
        let later = start + Duration::from_secs(61);
        assert_eq!(rc.bucket_at("c", Duration::from_secs(3600), later), 0);
    }

    #[test]
    fn penaltybox_entries_expire() {
        let pb = Penaltybox::new("pb");
        let now = Instant::now();
        pb.add_at("bad", Duration::from_secs(5), now);
        assert!(pb.has_at("bad", now + Duration::from_secs(5)));
        assert!(!pb.has_at("bad", now + Duration::from_secs(6)));
        assert!(!pb.has_at("bad", now));
    }

    #[test]
    fn reads_do_not_track_new_clients() {
        let rc = Ratecounter::new("rc");
        let now = Instant::now();
        for idx in 0..50 {
            assert_eq!(rc.bucket_at(&format!("10.0.0.{idx}"), Duration::from_secs(60), now), 0);
            assert_eq!(rc.rate_at(&format!("10.0.1.{idx}"), Duration::from_secs(10), now), 0.0);
        }
        assert!(lock(&rc.clients).is_empty());
    }

    #[test]
    fn idle_clients_are_dropped_after_the_retention_window() {
        let rc = Ratecounter::new("rc");
        let start = Instant::now();
        for idx in 0..20 {
            rc.count_at(&format!("client-{idx}"), start);
        }
        rc.increment_at("busy", 3, start);
        assert_eq!(lock(&rc.clients).len(), 21);

        let later = start + Duration::from_secs(61);
        rc.count_at("fresh", later);
        assert_eq!(lock(&rc.clients).len(), 1);

        assert_eq!(rc.bucket_at("fresh", Duration::from_secs(60), later + Duration::from_secs(61)), 0);
        assert!(lock(&rc.clients).is_empty());
    }

    #[test]
    fn penaltybox_add_drops_expired_entries() {
        let pb = Penaltybox::new("pb");
        let now = Instant::now();
        for idx in 0..10 {
            pb.add_at(&format!("bad-{idx}"), Duration::from_secs(1), now);
        }
        pb.add_at("worse", Duration::from_secs(60), now + Duration::from_secs(2));
        assert_eq!(lock(&pb.clients).len(), 1);
        assert!(pb.has_at("worse", now + Duration::from_secs(30)));
    }
}
