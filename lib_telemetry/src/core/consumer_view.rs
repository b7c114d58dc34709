//! # Consumer View
//!
//! Narrow, read-only facade over the [`DeviceStateStore`] for the presentation
//! layer. It delegates to the store's synchronized reads and never blocks on
//! network I/O, so a UI refresh tick always returns immediately with whatever
//! is currently known.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;

use chrono::Utc;

use crate::core::state_store::{DeviceState, DeviceStateStore, HistoryCursor, Snapshot};

/// Cheap to clone; every clone observes the same store.
#[derive(Clone)]
pub struct ConsumerView {
    store: Arc<DeviceStateStore>,
}

impl ConsumerView {
    /// Wraps a shared store.
    pub fn new(store: Arc<DeviceStateStore>) -> Self {
        Self { store }
    }

    /// Latest known value of every observed field.
    pub fn current_state(&self) -> DeviceState {
        self.store.read()
    }

    /// Retained snapshots at or after `cursor`, oldest first.
    pub fn history_since(&self, cursor: HistoryCursor) -> Vec<Arc<Snapshot>> {
        self.store.read_history(cursor)
    }

    /// The newest snapshot, if any has been captured.
    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.store.latest_snapshot()
    }

    /// Number of snapshots currently retained.
    pub fn history_len(&self) -> usize {
        self.store.history_len()
    }

    /// Time elapsed since the newest snapshot was captured.
    ///
    /// `None` means no data yet. Callers use this to render a stale or waiting
    /// indicator; the engine itself never reports staleness as an error.
    pub fn last_snapshot_age(&self) -> Option<chrono::Duration> {
        self.store
            .latest_snapshot()
            .map(|s| (Utc::now() - s.captured_at).max(chrono::Duration::zero()))
    }
}
