//! Transport infrastructure: the reference WebSocket server.

pub mod ws_server;

pub use ws_server::{run_server, serve, BackendFactory};
