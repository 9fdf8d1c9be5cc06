//! # Lattice WebSocket
//!
//! The WebSocket subsystem of the Lattice web toolkit: the pre-upgrade hook
//! pipeline, the per-connection read/write pumps with ping/pong keepalive,
//! and the concurrent multi-room broadcast hub with presence tracking and
//! admission control.
//!
//! ## Architecture
//!
//! ```text
//! Router ── GET /ws (WsEndpoint extension)
//!    │
//! adapter spots the endpoint, runs the pre-upgrade pipeline,
//! performs the engine handshake, then:
//!    │
//! run_connection ──┬── read pump  (deadline, ping/pong, dispatch)
//!                  └── write pump (queue drain, ping ticker, close)
//!    │
//! WsContext ── registered with the Hub ── Rooms (broadcast fan-out)
//! ```
//!
//! Everything above the [`WsTransport`] seam is engine-independent; the two
//! engine adapters each contribute a transport wrapper and the handshake.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lattice_ws::{Hub, RouterWsExt, WsConfig};
//!
//! let hub = Hub::new();
//! let lobby = hub.create_room("lobby", "Lobby", RoomConfig::new())?;
//!
//! router.websocket("/ws", WsConfig::new(), hub.handler())?;
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod message;
pub mod pump;
pub mod room;
pub mod upgrade;

pub use client::WsClient;
pub use config::{
    ConnectFn, DisconnectFn, MessageFn, PreUpgradeFn, SlowClientPolicy, WsConfig, WsHandler,
    ws_handler,
};
pub use context::WsContext;
pub use error::{HubError, HubResult, WsError, WsResult};
pub use hub::{ClientHook, Hub, HubConfig, HubStats};
pub use message::{
    BoxWsSink, BoxWsSource, CloseFrame, WsMessage, WsSink, WsSource, WsTransport, close_code,
};
pub use pump::run_connection;
pub use room::{Room, RoomConfig, RoomInfo};
pub use upgrade::{RouterWsExt, WsEndpoint, authorize, check_origin};
