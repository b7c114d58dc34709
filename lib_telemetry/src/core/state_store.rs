//! # Device State Store
//!
//! The single source of truth for device telemetry. It owns the latest decoded
//! value of every tracked field and an append-only, retention-bounded history
//! of point-in-time snapshots.
//!
//! ## Core Design Principles:
//!
//! 1.  **One Synchronization Boundary**: A single `Mutex` guards both the latest
//!     value map and the history. A field write and the snapshot it triggers are
//!     published together inside one critical section, so readers never see an
//!     event half applied.
//!
//! 2.  **Copy-Out Reads**: `read` returns an owned copy of the state and
//!     `read_history` returns `Arc` handles to immutable snapshots. Nothing a
//!     caller receives can reach back into the store.
//!
//! 3.  **Primary Trigger Field**: Only updates of the configured primary field
//!     append a snapshot. Updates of other fields land in the latest-value map
//!     and show up in the next snapshot.
//!
//! 4.  **Bounded History**: Every append enforces the [`RetentionPolicy`], by
//!     count and/or by age, so a long-running process keeps a fixed footprint.
//!
//! 5.  **Monotonic Timestamps**: Capture time is clamped to the previous
//!     snapshot's time, so history stays ordered even if the wall clock steps
//!     backwards.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::configs::ConfigurationError;
use crate::core::decoder::{FieldName, FieldUpdate, FieldValue};

/// # Device State
///
/// Last-known value per field. A field absent from the map has not been
/// observed yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceState {
    fields: BTreeMap<FieldName, FieldValue>,
}

impl DeviceState {
    /// The last value recorded for `field`, or `None` while unset.
    pub fn get(&self, field: FieldName) -> Option<FieldValue> {
        self.fields.get(&field).copied()
    }

    /// Convenience accessor for numeric fields.
    pub fn number(&self, field: FieldName) -> Option<f64> {
        self.get(field).and_then(|v| v.as_number())
    }

    /// Convenience accessor for boolean fields.
    pub fn flag(&self, field: FieldName) -> Option<bool> {
        self.get(field).and_then(|v| v.as_flag())
    }

    /// Whether no field has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over the observed fields in [`FieldName`] order.
    pub fn iter(&self) -> impl Iterator<Item = (FieldName, FieldValue)> + '_ {
        self.fields.iter().map(|(k, v)| (*k, *v))
    }

    fn set(&mut self, field: FieldName, value: FieldValue) {
        self.fields.insert(field, value);
    }
}

/// # Snapshot
///
/// Immutable copy of the full [`DeviceState`] taken when the primary field was
/// updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Position in the history. Strictly increasing, never reused, survives
    /// eviction of older entries.
    pub seq: u64,
    /// Capture time. Non-decreasing along the history.
    pub captured_at: DateTime<Utc>,
    /// Full state at capture time.
    pub state: DeviceState,
}

/// Where a history read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryCursor {
    /// Every retained snapshot.
    #[default]
    Start,
    /// Snapshots whose `seq` is at or after the given value.
    Sequence(u64),
    /// Snapshots captured at or after the given instant.
    Since(DateTime<Utc>),
}

impl HistoryCursor {
    fn admits(&self, snapshot: &Snapshot) -> bool {
        match self {
            HistoryCursor::Start => true,
            HistoryCursor::Sequence(seq) => snapshot.seq >= *seq,
            HistoryCursor::Since(at) => snapshot.captured_at >= *at,
        }
    }
}

/// # Retention Policy
///
/// Bounds the history by count, by age, or both. A policy always has at least
/// one bound and a count bound is never zero, so every append keeps at least
/// the snapshot it just captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_snapshots: Option<NonZeroUsize>,
    max_age: Option<Duration>,
}

impl RetentionPolicy {
    /// Builds a policy from optional bounds.
    ///
    /// Fails with [`ConfigurationError::UnboundedRetention`] when neither bound
    /// is set and with [`ConfigurationError::InvalidSetting`] for a zero count.
    pub fn new(
        max_snapshots: Option<usize>,
        max_age: Option<Duration>,
    ) -> Result<Self, ConfigurationError> {
        let max_snapshots = match max_snapshots {
            Some(n) => Some(NonZeroUsize::new(n).ok_or(ConfigurationError::InvalidSetting {
                name: "retention.maxSnapshots",
                reason: "must be non-zero".to_string(),
            })?),
            None => None,
        };
        if max_snapshots.is_none() && max_age.is_none() {
            return Err(ConfigurationError::UnboundedRetention);
        }
        Ok(Self {
            max_snapshots,
            max_age,
        })
    }

    /// Count-bounded retention. Fails for zero.
    pub fn max_count(max_snapshots: usize) -> Result<Self, ConfigurationError> {
        Self::new(Some(max_snapshots), None)
    }

    /// Time-windowed retention, measured back from the newest capture.
    pub fn max_age(max_age: Duration) -> Self {
        Self {
            max_snapshots: None,
            max_age: Some(max_age),
        }
    }

    /// Most snapshots kept, if bounded by count.
    pub fn count_limit(&self) -> Option<usize> {
        self.max_snapshots.map(NonZeroUsize::get)
    }

    /// Oldest snapshot age kept, if bounded by age.
    pub fn age_limit(&self) -> Option<Duration> {
        self.max_age
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_snapshots: NonZeroUsize::new(10_000),
            max_age: None,
        }
    }
}

struct StoreInner {
    state: DeviceState,
    history: VecDeque<Arc<Snapshot>>,
    next_seq: u64,
    last_captured_at: Option<DateTime<Utc>>,
}

/// # Device State Store
///
/// Thread-safe owner of [`DeviceState`] and its snapshot history. Share it
/// behind an `Arc`; writers go through [`record`](Self::record) and readers
/// through [`read`](Self::read) / [`read_history`](Self::read_history).
pub struct DeviceStateStore {
    primary_field: FieldName,
    retention: RetentionPolicy,
    inner: Mutex<StoreInner>,
}

impl DeviceStateStore {
    /// Creates an empty store whose snapshots are triggered by `primary_field`.
    pub fn new(primary_field: FieldName, retention: RetentionPolicy) -> Self {
        Self {
            primary_field,
            retention,
            inner: Mutex::new(StoreInner {
                state: DeviceState::default(),
                history: VecDeque::new(),
                next_seq: 0,
                last_captured_at: None,
            }),
        }
    }

    /// The field whose updates append snapshots.
    pub fn primary_field(&self) -> FieldName {
        self.primary_field
    }

    // A panic while holding the lock cannot leave the state half written (every
    // mutation is a single insert or push), so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Overwrites the latest value of `field`.
    pub fn apply(&self, field: FieldName, value: FieldValue) {
        self.lock().state.set(field, value);
    }

    /// Appends a snapshot if `trigger` is the primary field.
    ///
    /// Returns the sequence number of the new snapshot, if one was taken.
    pub fn maybe_snapshot(&self, trigger: FieldName) -> Option<u64> {
        if trigger != self.primary_field {
            return None;
        }
        let mut inner = self.lock();
        Some(self.append_snapshot(&mut inner, Utc::now()))
    }

    /// Applies a decoded update and, for the primary field, captures the
    /// resulting snapshot, both under one lock acquisition.
    pub fn record(&self, update: FieldUpdate) -> Option<u64> {
        let mut inner = self.lock();
        inner.state.set(update.field, update.value);
        (update.field == self.primary_field)
            .then(|| self.append_snapshot(&mut inner, Utc::now()))
    }

    /// Returns a copy of the current latest-value map.
    pub fn read(&self) -> DeviceState {
        self.lock().state.clone()
    }

    /// Returns retained snapshots admitted by `cursor`, oldest first.
    pub fn read_history(&self, cursor: HistoryCursor) -> Vec<Arc<Snapshot>> {
        let inner = self.lock();
        // History is sorted by both seq and time, so skip the prefix.
        let start = inner.history.partition_point(|s| !cursor.admits(s));
        inner.history.range(start..).cloned().collect()
    }

    /// The most recent snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.lock().history.back().cloned()
    }

    /// Number of snapshots currently retained.
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    fn append_snapshot(&self, inner: &mut StoreInner, now: DateTime<Utc>) -> u64 {
        let captured_at = match inner.last_captured_at {
            Some(last) if now < last => last,
            _ => now,
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.last_captured_at = Some(captured_at);
        inner.history.push_back(Arc::new(Snapshot {
            seq,
            captured_at,
            state: inner.state.clone(),
        }));
        self.enforce_retention(inner, captured_at);
        seq
    }

    fn enforce_retention(&self, inner: &mut StoreInner, newest: DateTime<Utc>) {
        if let Some(max) = self.retention.count_limit() {
            while inner.history.len() > max {
                inner.history.pop_front();
            }
        }
        if let Some(max_age) = self.retention.age_limit() {
            // An out-of-range age keeps everything rather than nothing.
            let Ok(window) = chrono::Duration::from_std(max_age) else {
                return;
            };
            let Some(cutoff) = newest.checked_sub_signed(window) else {
                return;
            };
            while inner.history.front().is_some_and(|s| s.captured_at < cutoff) {
                inner.history.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn temp(v: f64) -> FieldUpdate {
        FieldUpdate {
            field: FieldName::Temperature,
            value: FieldValue::Number(v),
        }
    }

    fn motor(on: bool) -> FieldUpdate {
        FieldUpdate {
            field: FieldName::MotorActive,
            value: FieldValue::Flag(on),
        }
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = DeviceStateStore::new(FieldName::Temperature, RetentionPolicy::default());
        assert!(store.read().is_empty());
        assert!(store.read_history(HistoryCursor::Start).is_empty());
        assert!(store.latest_snapshot().is_none());
    }

    #[test]
    fn test_only_primary_field_appends_snapshots() {
        let store = DeviceStateStore::new(FieldName::Temperature, RetentionPolicy::default());

        assert_eq!(store.record(temp(23.5)), Some(0));
        assert_eq!(store.record(motor(true)), None);
        assert_eq!(store.record(temp(24.0)), Some(1));

        let state = store.read();
        assert_eq!(state.number(FieldName::Temperature), Some(24.0));
        assert_eq!(state.flag(FieldName::MotorActive), Some(true));
        assert_eq!(state.get(FieldName::ServoActive), None);

        let history = store.read_history(HistoryCursor::Start);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state.flag(FieldName::MotorActive), None);
        assert_eq!(history[1].state.flag(FieldName::MotorActive), Some(true));
        assert!(history[0].captured_at <= history[1].captured_at);
    }

    #[test]
    fn test_apply_then_maybe_snapshot() {
        let store = DeviceStateStore::new(FieldName::Luminosity, RetentionPolicy::default());
        store.apply(FieldName::Temperature, FieldValue::Number(20.0));
        assert_eq!(store.maybe_snapshot(FieldName::Temperature), None);
        store.apply(FieldName::Luminosity, FieldValue::Number(80.0));
        assert_eq!(store.maybe_snapshot(FieldName::Luminosity), Some(0));
        assert_eq!(store.history_len(), 1);
    }

    #[test]
    fn test_timestamps_clamped_when_clock_steps_back() {
        let store = DeviceStateStore::new(FieldName::Temperature, RetentionPolicy::default());
        let t0 = Utc::now();
        {
            let mut inner = store.lock();
            store.append_snapshot(&mut inner, t0);
            store.append_snapshot(&mut inner, t0 - chrono::Duration::seconds(30));
            store.append_snapshot(&mut inner, t0 + chrono::Duration::seconds(1));
        }
        let history = store.read_history(HistoryCursor::Start);
        assert_eq!(history[1].captured_at, t0);
        assert!(history.windows(2).all(|w| w[0].captured_at <= w[1].captured_at));
    }

    #[test]
    fn test_count_retention_keeps_newest() {
        let retention = RetentionPolicy::max_count(3).unwrap();
        let store = DeviceStateStore::new(FieldName::Temperature, retention);
        for i in 0..5 {
            store.record(temp(i as f64));
        }
        let seqs: Vec<u64> = store
            .read_history(HistoryCursor::Start)
            .iter()
            .map(|s| s.seq)
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn test_age_retention_drops_old_entries() {
        let store = DeviceStateStore::new(
            FieldName::Temperature,
            RetentionPolicy::max_age(Duration::from_secs(60)),
        );
        let t0 = Utc::now();
        {
            let mut inner = store.lock();
            store.append_snapshot(&mut inner, t0);
            store.append_snapshot(&mut inner, t0 + chrono::Duration::seconds(30));
            store.append_snapshot(&mut inner, t0 + chrono::Duration::seconds(90));
        }
        let seqs: Vec<u64> = store
            .read_history(HistoryCursor::Start)
            .iter()
            .map(|s| s.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_retention_policy_requires_a_bound() {
        assert!(matches!(
            RetentionPolicy::new(None, None),
            Err(ConfigurationError::UnboundedRetention)
        ));
        assert!(matches!(
            RetentionPolicy::max_count(0),
            Err(ConfigurationError::InvalidSetting { name: "retention.maxSnapshots", .. })
        ));
        assert!(RetentionPolicy::new(Some(0), Some(Duration::from_secs(60))).is_err());

        let both = RetentionPolicy::new(Some(5), Some(Duration::from_secs(60))).unwrap();
        assert_eq!(both.count_limit(), Some(5));
        assert_eq!(both.age_limit(), Some(Duration::from_secs(60)));
        assert_eq!(RetentionPolicy::default().count_limit(), Some(10_000));
    }

    #[test]
    fn test_smallest_policies_keep_the_snapshot_just_taken() {
        for policy in [
            RetentionPolicy::max_count(1).unwrap(),
            RetentionPolicy::max_age(Duration::ZERO),
        ] {
            let store = DeviceStateStore::new(FieldName::Temperature, policy);
            for i in 0..3 {
                let seq = store.record(temp(i as f64));
                let latest = store.latest_snapshot().map(|s| s.seq);
                assert_eq!(latest, seq, "policy {policy:?}");
            }
            assert!(store.history_len() >= 1);
        }
    }

    #[test]
    fn test_cursor_reads_are_restartable() {
        let store = DeviceStateStore::new(FieldName::Temperature, RetentionPolicy::default());
        store.record(temp(1.0));
        store.record(temp(2.0));

        let first = store.read_history(HistoryCursor::Sequence(1));
        assert_eq!(first.len(), 1);

        store.record(temp(3.0));
        let second = store.read_history(HistoryCursor::Sequence(1));
        assert_eq!(second.len(), 2);
        assert_eq!(second[0], first[0]);

        let since = store.read_history(HistoryCursor::Since(second[1].captured_at));
        assert_eq!(since.last().map(|s| s.seq), Some(2));
    }

    #[test]
    fn test_concurrent_writers_never_tear_values() {
        let store = Arc::new(DeviceStateStore::new(
            FieldName::Temperature,
            RetentionPolicy::max_count(64).unwrap(),
        ));
        let written: Vec<f64> = (0..4)
            .flat_map(|w| (0..500).map(move |i| (w * 1000 + i) as f64))
            .collect();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..500 {
                        store.record(temp((w * 1000 + i) as f64));
                        store.record(motor(i % 2 == 0));
                    }
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            let written = written.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    if let Some(v) = store.read().number(FieldName::Temperature) {
                        assert!(written.contains(&v));
                    }
                    let history = store.read_history(HistoryCursor::Start);
                    assert!(history.windows(2).all(|w| w[0].seq < w[1].seq
                        && w[0].captured_at <= w[1].captured_at));
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(store.history_len(), 64);
        assert_eq!(store.latest_snapshot().map(|s| s.seq), Some(1999));
    }

    #[test]
    fn test_state_serializes_with_camel_case_names() {
        let store = DeviceStateStore::new(FieldName::Temperature, RetentionPolicy::default());
        store.record(temp(21.5));
        store.record(FieldUpdate {
            field: FieldName::AlarmDisabled,
            value: FieldValue::Flag(false),
        });
        let json = serde_json::to_value(store.read()).unwrap();
        assert_eq!(json, serde_json::json!({ "temperature": 21.5, "alarmDisabled": false }));
    }
}
