//! Shared Module
//!
//! Types and data structures shared between the engine and its clients.
//! Everything here is serializable and matches the wire format the clients
//! speak over the persistent connection.

/// Core data model (messages, delivery status, summaries)
pub mod types;

/// Wire event enums for the bidirectional channel
pub mod event;

/// Re-export commonly used types for convenience
pub use event::{ClientEvent, ServerEvent};
pub use types::{
    Attachment, ChatSummary, ChatType, DeliveryState, HydratedMessage, MessageType, OnlineUser,
    ReplySummary, StatusRow, UserSummary,
};
