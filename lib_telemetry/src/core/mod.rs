//! # Core Engine Module
//!
//! The state-aggregation half of the engine: everything that turns a raw
//! `(channel, payload)` pair into a consistent, queryable device state.
//!
//! ## Core Components:
//!
//! - **`decoder`**: The static routing table from bus channel to typed field,
//!   plus the payload decoders (numeric literal, `"1"`-is-true flag).
//!
//! - **`state_store`**: The single owner of the latest-value map and the
//!   retention-bounded snapshot history, behind one mutex.
//!
//! - **`consumer_view`**: The read-only facade handed to the presentation layer.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Channel routing and payload decoding.
pub mod decoder;
/// Latest-value map and snapshot history.
pub mod state_store;
/// Read-only query surface for consumers.
pub mod consumer_view;

// --- Public API Re-exports ---
pub use consumer_view::ConsumerView;
pub use decoder::{
    ChannelBinding, ChannelDecoder, DecodeError, FieldName, FieldUpdate, FieldValue, PayloadKind,
};
pub use state_store::{DeviceState, DeviceStateStore, HistoryCursor, RetentionPolicy, Snapshot};
