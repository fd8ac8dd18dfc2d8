//! Realtime subscription modules.
//!
//! - `channel`: websocket connection state machine, credential handshake,
//!   and the background worker that classifies inbound frames.
//! - `proto`: wire frame shapes and classification rules shared with the
//!   subscription endpoint.

/// Websocket channel and connection lifecycle.
pub mod channel;
/// Protocol frames and inbound classification.
pub mod proto;
