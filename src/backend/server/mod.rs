//! HTTP/WebSocket server surface.

pub mod config;
pub mod init;
pub mod state;
pub mod ws;

pub use config::ServerConfig;
pub use init::create_app;
