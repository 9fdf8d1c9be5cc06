//! # Lattice axum adapter
//!
//! Binds the Lattice routing layer and WebSocket subsystem to axum. The
//! engine pools and owns each request for the duration of its handler, so
//! the adapter captures the full request surface up front and commits the
//! staged response when the chain returns.

mod context;
mod server;
mod websocket;

pub use context::AxumContext;
pub use server::AxumServer;
pub use websocket::AxumTransport;
