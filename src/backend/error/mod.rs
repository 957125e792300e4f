//! Engine Error Types
//!
//! Error taxonomy for the fan-out engine, mirroring the propagation policy:
//! validation, authorization, not-found and capacity errors are terminal and
//! reported to the initiating connection only; dependency errors from the
//! critical path abort the operation; dependency errors from the non-critical
//! path (push notifications, presence writes) are caught and logged by the
//! caller and never surface here.

/// Error enum and helpers
pub mod types;

pub use types::EngineError;
