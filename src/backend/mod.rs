//! Server-side engine: connection registry, persistence pipeline, chunked
//! upload assembly, broadcast layer and the status/deletion reconciler.

pub mod auth;
pub mod blob;
pub mod engine;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod server;
pub mod storage;
pub mod upload;

pub use engine::{ChatEngine, EngineConfig};
pub use error::EngineError;
