//! The process-wide WebSocket hub: owns rooms and clients, fans out
//! hub-level broadcasts, and plugs into a WebSocket route via
//! [`Hub::handler`].
//!
//! Ownership is arena-style: the hub's two maps are the only owners of
//! `Arc<Room>` and `Arc<WsClient>`; rooms refer to clients by connection id
//! and resolve them through the hub, so the reference graph stays acyclic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::WsClient;
use crate::config::{SlowClientPolicy, WsHandler, ws_handler};
use crate::context::WsContext;
use crate::error::{HubError, HubResult, WsError};
use crate::message::{WsMessage, close_code};
use crate::room::{Room, RoomConfig, RoomInfo};

// =============================================================================
// Config, hooks, stats
// =============================================================================

/// Hub-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Behavior when a broadcast hits a full outbound queue.
    pub slow_client_policy: SlowClientPolicy,
}

/// Lifecycle hook run when a client registers or unregisters.
pub type ClientHook = Arc<dyn Fn(&Arc<WsClient>) + Send + Sync>;

/// Aggregate hub counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    /// Rooms currently registered.
    pub total_rooms: usize,
    /// Rooms with at least one member.
    pub active_rooms: usize,
    /// Connected clients.
    pub clients: usize,
    /// Room counts keyed by room type.
    pub by_type: BTreeMap<String, usize>,
}

// =============================================================================
// Shared state
// =============================================================================

/// State shared between the hub handle, rooms, and connection tasks.
pub(crate) struct HubShared {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    clients: RwLock<HashMap<String, Arc<WsClient>>>,
    connect_hooks: RwLock<Vec<ClientHook>>,
    disconnect_hooks: RwLock<Vec<ClientHook>>,
    slow_client_policy: SlowClientPolicy,
    closed: AtomicBool,
}

impl HubShared {
    pub(crate) fn client(&self, id: &str) -> Option<Arc<WsClient>> {
        self.clients.read().get(id).cloned()
    }

    pub(crate) fn remove_room(&self, id: &str) {
        self.rooms.write().remove(id);
    }

    pub(crate) fn slow_client_policy(&self) -> SlowClientPolicy {
        self.slow_client_policy
    }
}

// =============================================================================
// Hub
// =============================================================================

/// Handle to the hub; clones share the same state.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    /// Creates a hub with the default configuration.
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Creates a hub with an explicit configuration.
    pub fn with_config(config: HubConfig) -> Self {
        Self {
            shared: Arc::new(HubShared {
                rooms: RwLock::new(HashMap::new()),
                clients: RwLock::new(HashMap::new()),
                connect_hooks: RwLock::new(Vec::new()),
                disconnect_hooks: RwLock::new(Vec::new()),
                slow_client_policy: config.slow_client_policy,
                closed: AtomicBool::new(false),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Rooms
    // -------------------------------------------------------------------------

    /// Creates a room; fails with [`HubError::RoomExists`] on a duplicate id.
    pub fn create_room(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        config: RoomConfig,
    ) -> HubResult<Arc<Room>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(HubError::HubClosed);
        }
        let id = id.into();
        let mut rooms = self.shared.rooms.write();
        if rooms.contains_key(&id) {
            return Err(HubError::RoomExists { id });
        }
        let room = Room::new(id.clone(), name, config, Arc::downgrade(&self.shared));
        rooms.insert(id.clone(), room.clone());
        info!(room = %id, "room created");
        Ok(room)
    }

    /// Looks up a room by id.
    pub fn room(&self, id: &str) -> HubResult<Arc<Room>> {
        self.shared
            .rooms
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::RoomNotFound { id: id.to_string() })
    }

    /// Info snapshots for all non-private rooms.
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms: Vec<Arc<Room>> = self.shared.rooms.read().values().cloned().collect();
        let mut infos = Vec::with_capacity(rooms.len());
        for room in rooms {
            let snapshot = room.info().await;
            if !snapshot.private {
                infos.push(snapshot);
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Aggregate counters over all rooms and clients.
    pub async fn stats(&self) -> HubStats {
        let rooms: Vec<Arc<Room>> = self.shared.rooms.read().values().cloned().collect();
        let mut stats = HubStats {
            total_rooms: rooms.len(),
            active_rooms: 0,
            clients: self.shared.clients.read().len(),
            by_type: BTreeMap::new(),
        };
        for room in rooms {
            let snapshot = room.info().await;
            if snapshot.client_count > 0 {
                stats.active_rooms += 1;
            }
            *stats.by_type.entry(snapshot.room_type).or_insert(0) += 1;
        }
        stats
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    /// All connected clients.
    pub fn clients(&self) -> Vec<Arc<WsClient>> {
        self.shared.clients.read().values().cloned().collect()
    }

    /// Looks up a client by connection id.
    pub fn client(&self, id: &str) -> HubResult<Arc<WsClient>> {
        self.shared
            .client(id)
            .ok_or_else(|| HubError::ClientNotFound { id: id.to_string() })
    }

    /// Registers a connection as a hub client and runs the connect hooks.
    pub fn register(&self, ctx: Arc<WsContext>) -> HubResult<Arc<WsClient>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(HubError::HubClosed);
        }
        let client = Arc::new(WsClient::new(ctx));
        self.shared
            .clients
            .write()
            .insert(client.id().to_string(), client.clone());
        debug!(connection = %client.id(), "client registered");
        for hook in self.shared.connect_hooks.read().iter() {
            hook(&client);
        }
        Ok(client)
    }

    /// Removes a client from every room it joined and from the hub, then
    /// runs the disconnect hooks.
    pub async fn unregister(&self, connection_id: &str) {
        let Some(client) = self.shared.clients.write().remove(connection_id) else {
            return;
        };
        let never = CancellationToken::new();
        for room_id in client.joined_rooms() {
            if let Ok(room) = self.room(&room_id) {
                // NotMember here just means the room cleaned up first.
                let _ = room.remove_client(&never, &client).await;
            }
        }
        debug!(connection = %connection_id, "client unregistered");
        for hook in self.shared.disconnect_hooks.read().iter() {
            hook(&client);
        }
    }

    /// Registers a connect hook.
    pub fn on_connect(&self, hook: impl Fn(&Arc<WsClient>) + Send + Sync + 'static) {
        self.shared.connect_hooks.write().push(Arc::new(hook));
    }

    /// Registers a disconnect hook.
    pub fn on_disconnect(&self, hook: impl Fn(&Arc<WsClient>) + Send + Sync + 'static) {
        self.shared.disconnect_hooks.write().push(Arc::new(hook));
    }

    // -------------------------------------------------------------------------
    // Broadcast
    // -------------------------------------------------------------------------

    /// Sends `payload` to every connected client as a Text frame.
    ///
    /// No ordering guarantee exists between hub-level broadcasts and
    /// room-level broadcasts.
    pub fn broadcast_json<T: Serialize>(&self, payload: &T) -> HubResult<()> {
        let text =
            serde_json::to_string(payload).map_err(|e| HubError::Serialize(e.to_string()))?;
        for client in self.clients() {
            match client.try_send(WsMessage::Text(text.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => match self.shared.slow_client_policy {
                    SlowClientPolicy::DropMessage => {
                        let dropped = client.record_dropped();
                        warn!(connection = %client.id(), dropped, "outbound queue full, dropped broadcast");
                    }
                    SlowClientPolicy::CloseClient => {
                        warn!(connection = %client.id(), "outbound queue full, closing slow client");
                        client.context().close_signal().cancel();
                    }
                },
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Route handler
    // -------------------------------------------------------------------------

    /// A WebSocket handler that registers every connection with this hub and
    /// keeps it registered until the connection ends.
    pub fn handler(&self) -> WsHandler {
        let hub = self.clone();
        ws_handler(move |ctx: Arc<WsContext>| {
            let hub = hub.clone();
            async move {
                let client = hub.register(ctx.clone())?;
                loop {
                    match ctx.read_message().await {
                        Ok(message) => {
                            trace!(connection = %client.id(), kind = message.kind(), "hub frame");
                        }
                        Err(WsError::ConnectionClosed) => break,
                        Err(err) => {
                            warn!(connection = %client.id(), error = %err, "hub read error");
                            break;
                        }
                    }
                }
                hub.unregister(client.id()).await;
                Ok(())
            }
        })
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Tears the hub down: every room is closed first (emitting 1001 Close
    /// frames to members), then every remaining client connection.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let rooms: Vec<Arc<Room>> = self.shared.rooms.write().drain().map(|(_, r)| r).collect();
        for room in rooms {
            room.close().await;
        }
        let clients: Vec<Arc<WsClient>> = self
            .shared
            .clients
            .write()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for client in clients {
            let _ = client
                .context()
                .close_with_status(close_code::GOING_AWAY, "server shutting down")
                .await;
        }
        info!("hub closed");
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("rooms", &self.shared.rooms.read().len())
            .field("clients", &self.shared.clients.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::UpgradeData;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::mpsc;

    /// Builds a client whose outbound queue is observable from the test.
    fn test_client(hub: &Hub, id: &str, queue: usize) -> (Arc<WsClient>, mpsc::Receiver<WsMessage>) {
        let (out_tx, out_rx) = mpsc::channel(queue);
        let (_in_tx, in_rx) = mpsc::channel(1);
        let ctx = Arc::new(WsContext::new(
            id.to_string(),
            out_tx,
            in_rx,
            Arc::new(UpgradeData::new()),
            StdHashMap::new(),
            CancellationToken::new(),
        ));
        let client = hub.register(ctx).unwrap();
        (client, out_rx)
    }

    #[tokio::test]
    async fn create_get_and_duplicate_room() {
        let hub = Hub::new();
        hub.create_room("lobby", "Lobby", RoomConfig::new()).unwrap();
        assert!(hub.room("lobby").is_ok());
        assert_eq!(
            hub.create_room("lobby", "Lobby", RoomConfig::new())
                .unwrap_err(),
            HubError::RoomExists { id: "lobby".into() }
        );
        assert_eq!(
            hub.room("nope").unwrap_err(),
            HubError::RoomNotFound { id: "nope".into() }
        );
    }

    #[tokio::test]
    async fn capacity_admits_exactly_max_clients() {
        let hub = Hub::new();
        let room = hub
            .create_room("small", "Small", RoomConfig::new().with_max_clients(2))
            .unwrap();

        let clients: Vec<_> = (0..3)
            .map(|i| test_client(&hub, &format!("c{i}"), 8).0)
            .collect();

        let cancel = CancellationToken::new();
        let results = futures::future::join_all(
            clients
                .iter()
                .map(|client| room.add_client(&cancel, client)),
        )
        .await;

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(HubError::RoomFull { .. })))
            .count();
        assert_eq!((ok, full), (2, 1));
        assert_eq!(room.client_count().await, 2);
    }

    #[tokio::test]
    async fn duplicate_join_and_cancelled_admission() {
        let hub = Hub::new();
        let room = hub.create_room("r", "R", RoomConfig::new()).unwrap();
        let (client, _rx) = test_client(&hub, "c1", 8);

        let cancel = CancellationToken::new();
        room.add_client(&cancel, &client).await.unwrap();
        assert!(matches!(
            room.add_client(&cancel, &client).await,
            Err(HubError::AlreadyMember { .. })
        ));

        let fired = CancellationToken::new();
        fired.cancel();
        let (other, _rx2) = test_client(&hub, "c2", 8);
        assert_eq!(
            room.add_client(&fired, &other).await,
            Err(HubError::Canceled)
        );
    }

    #[tokio::test]
    async fn destroy_when_empty_is_atomic_for_racers() {
        let hub = Hub::new();
        let room = hub
            .create_room(
                "ephemeral",
                "Ephemeral",
                RoomConfig::new().with_destroy_when_empty(true),
            )
            .unwrap();
        let (client, _rx) = test_client(&hub, "c1", 8);
        let cancel = CancellationToken::new();
        room.add_client(&cancel, &client).await.unwrap();
        room.remove_client(&cancel, &client).await.unwrap();

        // After the last leave: gone from the hub, id reusable, stale handle dead.
        assert_eq!(
            hub.room("ephemeral").unwrap_err(),
            HubError::RoomNotFound {
                id: "ephemeral".into()
            }
        );
        hub.create_room("ephemeral", "Again", RoomConfig::new())
            .unwrap();
        assert!(matches!(
            room.add_client(&cancel, &client).await,
            Err(HubError::RoomNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_the_same_order_everywhere() {
        let hub = Hub::new();
        let room = hub.create_room("lobby", "Lobby", RoomConfig::new()).unwrap();
        let cancel = CancellationToken::new();

        let (a, mut a_rx) = test_client(&hub, "a", 64);
        let (b, mut b_rx) = test_client(&hub, "b", 64);
        room.add_client(&cancel, &a).await.unwrap();
        room.add_client(&cancel, &b).await.unwrap();

        // Two concurrent producers, ten broadcasts each.
        let r1 = room.clone();
        let r2 = room.clone();
        let p1 = tokio::spawn(async move {
            for i in 0..10 {
                r1.emit("tick", serde_json::json!({"producer": 1, "seq": i}))
                    .await
                    .unwrap();
            }
        });
        let p2 = tokio::spawn(async move {
            for i in 0..10 {
                r2.emit("tick", serde_json::json!({"producer": 2, "seq": i}))
                    .await
                    .unwrap();
            }
        });
        p1.await.unwrap();
        p2.await.unwrap();

        let drain = |rx: &mut mpsc::Receiver<WsMessage>| {
            let mut seen = Vec::new();
            while let Ok(message) = rx.try_recv() {
                if let WsMessage::Text(text) = message {
                    seen.push(text);
                }
            }
            seen
        };
        let at_a = drain(&mut a_rx);
        let at_b = drain(&mut b_rx);
        assert_eq!(at_a.len(), 20);
        assert_eq!(at_a, at_b);
    }

    #[tokio::test]
    async fn presence_tracks_join_and_leave() {
        let hub = Hub::new();
        let room = hub
            .create_room("p", "P", RoomConfig::new().with_track_presence(true))
            .unwrap();
        let cancel = CancellationToken::new();
        let (client, _rx) = test_client(&hub, "c1", 8);
        client.set_state("presence", serde_json::json!({"status": "online"}));

        room.add_client(&cancel, &client).await.unwrap();
        let presence = room.presence().await;
        assert_eq!(presence["c1"]["status"], "online");

        room.remove_client(&cancel, &client).await.unwrap();
        assert!(room.presence().await.is_empty());
    }

    #[tokio::test]
    async fn drop_policy_counts_instead_of_closing() {
        let hub = Hub::with_config(HubConfig {
            slow_client_policy: SlowClientPolicy::DropMessage,
        });
        let room = hub.create_room("r", "R", RoomConfig::new()).unwrap();
        let cancel = CancellationToken::new();
        // Queue of one: the second broadcast must be dropped.
        let (client, mut rx) = test_client(&hub, "slow", 1);
        room.add_client(&cancel, &client).await.unwrap();

        room.emit("e", serde_json::json!(1)).await.unwrap();
        room.emit("e", serde_json::json!(2)).await.unwrap();

        assert_eq!(client.dropped_messages(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(client.context().is_open());
    }

    #[tokio::test]
    async fn unregister_leaves_all_rooms_and_fires_hooks() {
        let hub = Hub::new();
        let joined = Arc::new(AtomicBool::new(false));
        let left = Arc::new(AtomicBool::new(false));
        let joined_flag = joined.clone();
        let left_flag = left.clone();
        hub.on_connect(move |_| joined_flag.store(true, Ordering::SeqCst));
        hub.on_disconnect(move |_| left_flag.store(true, Ordering::SeqCst));

        let r1 = hub.create_room("r1", "R1", RoomConfig::new()).unwrap();
        let r2 = hub.create_room("r2", "R2", RoomConfig::new()).unwrap();
        let cancel = CancellationToken::new();
        let (client, _rx) = test_client(&hub, "c1", 8);
        assert!(joined.load(Ordering::SeqCst));

        r1.add_client(&cancel, &client).await.unwrap();
        r2.add_client(&cancel, &client).await.unwrap();
        hub.unregister("c1").await;

        assert!(left.load(Ordering::SeqCst));
        assert_eq!(r1.client_count().await, 0);
        assert_eq!(r2.client_count().await, 0);
        assert!(hub.client("c1").is_err());
    }

    #[tokio::test]
    async fn stats_aggregate_by_type() {
        let hub = Hub::new();
        hub.create_room("a", "A", RoomConfig::new().with_room_type("chat"))
            .unwrap();
        hub.create_room("b", "B", RoomConfig::new().with_room_type("chat"))
            .unwrap();
        let room = hub
            .create_room("c", "C", RoomConfig::new().with_room_type("game"))
            .unwrap();
        let cancel = CancellationToken::new();
        let (client, _rx) = test_client(&hub, "c1", 8);
        room.add_client(&cancel, &client).await.unwrap();

        let stats = hub.stats().await;
        assert_eq!(stats.total_rooms, 3);
        assert_eq!(stats.active_rooms, 1);
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.by_type["chat"], 2);
        assert_eq!(stats.by_type["game"], 1);
    }

    #[tokio::test]
    async fn close_tears_down_rooms_then_clients() {
        let hub = Hub::new();
        let room = hub.create_room("r", "R", RoomConfig::new()).unwrap();
        let cancel = CancellationToken::new();
        let (client, mut rx) = test_client(&hub, "c1", 8);
        room.add_client(&cancel, &client).await.unwrap();

        hub.close().await;

        // Room close queued a 1001 Close frame.
        match rx.try_recv().unwrap() {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, close_code::GOING_AWAY),
            other => panic!("unexpected {other:?}"),
        }
        assert!(hub.room("r").is_err());
        assert!(hub.clients().is_empty());
        assert!(matches!(
            hub.create_room("r", "R", RoomConfig::new()),
            Err(HubError::HubClosed)
        ));
    }
}
