//! Sliding-window-log state.
//!
//! Each `(client, policy)` pair owns a [`WindowRecord`]: the timestamps of its
//! admissions still inside the window, oldest first. The in-process
//! [`WindowStore`] holds one record per pair behind its own mutex.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::WindowBackend;
use super::key::ClientKey;
use super::policy::Policy;
use crate::error::Result;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub admitted: bool,
    /// Admissions left in the current window after this one
    pub remaining: u64,
    /// Milliseconds until a retry can succeed; 0 when admitted
    pub retry_after_ms: u64,
}

impl Decision {
    pub fn admit(remaining: u64) -> Self {
        Self {
            admitted: true,
            remaining,
            retry_after_ms: 0,
        }
    }

    pub fn deny(retry_after_ms: u64) -> Self {
        Self {
            admitted: false,
            remaining: 0,
            retry_after_ms,
        }
    }
}

/// Identifies one window: a client under one policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub client: ClientKey,
    pub policy: String,
}

impl WindowKey {
    pub fn new(client: ClientKey, policy: &str) -> Self {
        Self {
            client,
            policy: policy.to_string(),
        }
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.policy, self.client)
    }
}

/// Admission timestamps for one window, in non-decreasing order.
#[derive(Debug, Default)]
pub struct WindowRecord {
    timestamps: VecDeque<u64>,
    /// Latest `now` observed by this record
    last_seen_ms: u64,
    /// Set when the sweeper has unlinked this record from the store
    retired: bool,
}

impl WindowRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one sliding-window check, appending `now_ms` on admission.
    ///
    /// A `now_ms` earlier than one already seen is treated as the latest seen
    /// instant, so timestamps stay ordered and nothing underflows.
    pub fn admit(&mut self, policy: &Policy, now_ms: u64) -> Decision {
        let now = if now_ms < self.last_seen_ms {
            debug!(
                policy = %policy.name,
                now_ms,
                last_seen_ms = self.last_seen_ms,
                "Clock moved backwards; using last seen time"
            );
            self.last_seen_ms
        } else {
            now_ms
        };
        self.last_seen_ms = now;

        self.prune(now, policy.window_ms);

        let count = self.timestamps.len() as u64;
        if count < policy.limit {
            self.timestamps.push_back(now);
            return Decision::admit(policy.limit - count - 1);
        }

        // Measured from the caller's clock, not the clamped one.
        let oldest = self.timestamps.front().copied().unwrap_or(now);
        Decision::deny(oldest.saturating_add(policy.window_ms).saturating_sub(now_ms))
    }

    /// Drop timestamps at or before `now - window_ms`.
    fn prune(&mut self, now: u64, window_ms: u64) {
        // Before the first full window nothing can have expired.
        let Some(window_start) = now.checked_sub(window_ms) else {
            return;
        };
        while self.timestamps.front().is_some_and(|&t| t <= window_start) {
            self.timestamps.pop_front();
        }
    }

    /// Admissions currently recorded.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn newest(&self) -> Option<u64> {
        self.timestamps.back().copied()
    }

    /// True when no admission is newer than `cutoff_ms`.
    fn is_idle(&self, cutoff_ms: u64) -> bool {
        self.newest().map_or(true, |t| t <= cutoff_ms)
    }
}

/// In-process window store.
///
/// The map is consulted only to find a record; the check itself runs under
/// that record's own lock, so unrelated windows do not contend.
#[derive(Debug, Default)]
pub struct WindowStore {
    records: DashMap<WindowKey, Arc<Mutex<WindowRecord>>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically prune, check and record one request.
    pub fn admit(&self, key: &WindowKey, policy: &Policy, now_ms: u64) -> Decision {
        loop {
            let record = self.record(key);
            let mut record = record.lock();

            // Swept between lookup and lock: fetch the replacement.
            if record.retired {
                continue;
            }

            let decision = record.admit(policy, now_ms);
            trace!(
                key = %key,
                admitted = decision.admitted,
                remaining = decision.remaining,
                retry_after_ms = decision.retry_after_ms,
                "Window checked"
            );
            return decision;
        }
    }

    fn record(&self, key: &WindowKey) -> Arc<Mutex<WindowRecord>> {
        let existing = self.records.get(key).map(|r| Arc::clone(r.value()));
        match existing {
            Some(record) => record,
            None => {
                let entry = self.records.entry(key.clone()).or_insert_with(|| {
                    debug!(key = %key, "Creating window record");
                    Arc::new(Mutex::new(WindowRecord::new()))
                });
                Arc::clone(entry.value())
            }
        }
    }

    /// Remove windows with no admission newer than `now_ms - horizon_ms`.
    ///
    /// Returns the number of windows removed.
    pub fn sweep(&self, now_ms: u64, horizon_ms: u64) -> usize {
        let Some(cutoff) = now_ms.checked_sub(horizon_ms) else {
            return 0;
        };

        let before = self.records.len();
        self.records.retain(|_, record| {
            let mut record = record.lock();
            if record.is_idle(cutoff) {
                record.retired = true;
                false
            } else {
                true
            }
        });
        let removed = before.saturating_sub(self.records.len());

        debug!(
            removed,
            remaining = self.records.len(),
            "Window sweep complete"
        );
        removed
    }

    /// Admissions currently recorded for `key`, if it has a window.
    pub fn occupancy(&self, key: &WindowKey) -> Option<usize> {
        self.records.get(key).map(|r| r.value().lock().len())
    }

    /// Number of windows held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every window.
    pub fn clear(&self) {
        self.records.retain(|_, record| {
            record.lock().retired = true;
            false
        });
    }
}

#[async_trait]
impl WindowBackend for WindowStore {
    async fn admit(&self, key: &WindowKey, policy: &Policy, now_ms: u64) -> Result<Decision> {
        Ok(WindowStore::admit(self, key, policy, now_ms))
    }

    async fn sweep(&self, now_ms: u64, horizon_ms: u64) -> usize {
        WindowStore::sweep(self, now_ms, horizon_ms)
    }

    fn tracked_windows(&self) -> Option<usize> {
        Some(self.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(client: &str) -> WindowKey {
        WindowKey::new(ClientKey::principal(client), "test")
    }

    #[test]
    fn test_record_admits_up_to_limit() {
        let policy = Policy::new("test", 3, 1_000);
        let mut record = WindowRecord::new();

        assert_eq!(record.admit(&policy, 10), Decision::admit(2));
        assert_eq!(record.admit(&policy, 20), Decision::admit(1));
        assert_eq!(record.admit(&policy, 30), Decision::admit(0));

        let denied = record.admit(&policy, 40);
        assert_eq!(denied, Decision::deny(970));
        assert_eq!(record.len(), 3, "denials are not recorded");
    }

    #[test]
    fn test_expiry_is_exclusive_of_boundary() {
        let policy = Policy::new("test", 1, 1_000);
        let mut record = WindowRecord::new();

        assert!(record.admit(&policy, 5_000).admitted);
        // One millisecond short of a full window: still counted.
        assert_eq!(record.admit(&policy, 5_999), Decision::deny(1));
        // Exactly one window old: expired.
        assert!(record.admit(&policy, 6_000).admitted);
    }

    #[test]
    fn test_early_timestamps_not_pruned_before_first_window() {
        let policy = Policy::new("test", 1, 60_000);
        let mut record = WindowRecord::new();

        assert!(record.admit(&policy, 0).admitted);
        assert_eq!(record.admit(&policy, 1_000), Decision::deny(59_000));
    }

    #[test]
    fn test_backward_clock_does_not_reorder_or_underflow() {
        let policy = Policy::new("test", 2, 1_000);
        let mut record = WindowRecord::new();

        assert!(record.admit(&policy, 10_000).admitted);
        // Clock jumps back well before the window start.
        let decision = record.admit(&policy, 100);
        assert!(decision.admitted);
        assert_eq!(record.newest(), Some(10_000));

        let denied = record.admit(&policy, 50);
        assert!(!denied.admitted);
        assert_eq!(denied.retry_after_ms, 10_950);
        assert!(record.admit(&policy, 50 + denied.retry_after_ms).admitted);
    }

    #[test]
    fn test_store_keys_are_independent() {
        let store = WindowStore::new();
        let policy = Policy::new("test", 1, 1_000);

        assert!(store.admit(&key("a"), &policy, 0).admitted);
        assert!(!store.admit(&key("a"), &policy, 1).admitted);
        assert!(store.admit(&key("b"), &policy, 1).admitted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sweep_removes_idle_windows() {
        let store = WindowStore::new();
        let policy = Policy::new("test", 5, 1_000);

        store.admit(&key("stale"), &policy, 1_000);
        store.admit(&key("fresh"), &policy, 9_500);

        let removed = store.sweep(10_000, 1_000);
        assert_eq!(removed, 1);
        assert_eq!(store.occupancy(&key("stale")), None);
        assert_eq!(store.occupancy(&key("fresh")), Some(1));
    }

    #[test]
    fn test_sweep_before_first_horizon_is_noop() {
        let store = WindowStore::new();
        let policy = Policy::new("test", 5, 1_000);
        store.admit(&key("a"), &policy, 0);

        assert_eq!(store.sweep(500, 1_000), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_admit_after_sweep_starts_fresh_window() {
        let store = WindowStore::new();
        let policy = Policy::new("test", 1, 1_000);

        assert!(store.admit(&key("a"), &policy, 0).admitted);
        store.sweep(2_000, 1_000);
        assert!(store.admit(&key("a"), &policy, 2_000).admitted);
        assert_eq!(store.occupancy(&key("a")), Some(1));
    }

    #[test]
    fn test_swept_record_is_retired_and_replaced() {
        let store = WindowStore::new();
        let policy = Policy::new("test", 2, 1_000);
        store.admit(&key("a"), &policy, 0);

        let old = store.record(&key("a"));
        assert_eq!(store.sweep(5_000, 1_000), 1);
        assert!(old.lock().retired);

        assert_eq!(store.admit(&key("a"), &policy, 5_000), Decision::admit(1));
        assert_eq!(old.lock().len(), 1);
        assert_eq!(store.occupancy(&key("a")), Some(1));
        assert!(!Arc::ptr_eq(&old, &store.record(&key("a"))));
    }

    #[test]
    fn test_admit_retries_when_record_retired_under_it() {
        let store = Arc::new(WindowStore::new());
        let policy = Policy::new("test", 2, 1_000);
        store.admit(&key("a"), &policy, 0);

        let old = store.record(&key("a"));
        let mut guard = old.lock();

        let checker = {
            let store = Arc::clone(&store);
            let policy = policy.clone();
            std::thread::spawn(move || store.admit(&key("a"), &policy, 5_000))
        };

        // Map, this test and the checker each hold the record.
        while Arc::strong_count(&old) < 3 {
            std::thread::yield_now();
        }

        // What a sweep does under the record lock.
        guard.retired = true;
        store.records.remove(&key("a"));
        drop(guard);

        assert_eq!(checker.join().unwrap(), Decision::admit(1));
        assert_eq!(old.lock().len(), 1);
        assert_eq!(store.occupancy(&key("a")), Some(1));
    }

    #[test]
    fn test_clear() {
        let store = WindowStore::new();
        let policy = Policy::new("test", 1, 1_000);
        store.admit(&key("a"), &policy, 0);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_backend_impl_delegates_to_store() {
        let store = WindowStore::new();
        let backend: &dyn WindowBackend = &store;
        let policy = Policy::new("test", 1, 1_000);

        let decision = tokio_test::block_on(backend.admit(&key("a"), &policy, 0)).unwrap();
        assert_eq!(decision, Decision::admit(0));
        assert_eq!(backend.tracked_windows(), Some(1));
        assert_eq!(backend.name(), "memory");

        assert_eq!(tokio_test::block_on(backend.sweep(5_000, 1_000)), 1);
        assert_eq!(backend.tracked_windows(), Some(0));
    }

    #[test]
    fn test_window_key_display() {
        let key = WindowKey::new(ClientKey::principal("u1"), "ai");
        assert_eq!(key.to_string(), "ai|user:u1");
    }

    #[test]
    fn test_decision_serializes_camel_case() {
        let json = serde_json::to_value(Decision::deny(55_000)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"admitted": false, "remaining": 0, "retryAfterMs": 55_000})
        );
    }
}
