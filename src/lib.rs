//! wirechat: real-time chat message fan-out and delivery-state engine.
//!
//! Clients hold one persistent WebSocket each; every frame in either
//! direction is a JSON object of the form `{"event": ..., "data": ...}`.
//! The engine validates inbound operations, persists them through a
//! pluggable store, and fans the results out to chat rooms with
//! per-recipient delivery tracking (sent, delivered, read), chunked file
//! uploads and two-tier message deletion.
//!
//! - [`shared`]: the wire data model and event enums.
//! - [`backend`]: the engine and its collaborators (registry, storage,
//!   blob store, upload assembler, reconciler, HTTP/WS server).

pub mod backend;
pub mod shared;
