//! # Lattice hyper adapter
//!
//! Binds the Lattice routing layer and WebSocket subsystem to a raw hyper
//! 1.x server. The engine hands each request over by value and may reclaim
//! it after an upgrade, so this adapter leans on the pre-upgrade pipeline
//! to extract everything a WebSocket connection will need.

mod context;
mod server;
mod websocket;

pub use context::HyperContext;
pub use server::HyperServer;
pub use websocket::TungsteniteTransport;
