//! User-facing Rust SDK for the HostDB key/value service.
//!
//! The crate is organized by transport surface:
//! - `storage`: HTTP client for CRUD-style operations on named records.
//! - `realtime`: websocket channel that authenticates, tracks the
//!   server-assigned session, and publishes change notifications.
//! - `bus`: synchronous in-process publish/subscribe dispatcher.
//! - `session`: session identity shared between the realtime channel and
//!   storage requests.
//! - `retry`: opt-in retry utilities.

/// Synchronous publish/subscribe event bus.
pub mod bus;
/// Realtime websocket channel, protocol frames, and classification.
pub mod realtime;
/// Retry helpers used by the storage client when retries are enabled.
pub mod retry;
/// Shared session identity state.
pub mod session;
/// Storage client and request payload types.
pub mod storage;
