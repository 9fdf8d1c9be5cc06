//! Rooms: membership, presence, and ordered broadcast fan-out.
//!
//! All membership mutation is serialized by the room's async mutex, which is
//! also what makes two broadcasts arrive in the same relative order at every
//! member: the fan-out loop runs under the lock, and each member's outbound
//! queue is FIFO. Rooms hold connection ids only — client objects resolve
//! through the hub's map, keeping the Room⇄Hub⇄Client graph acyclic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::WsClient;
use crate::config::SlowClientPolicy;
use crate::error::{HubError, HubResult};
use crate::hub::HubShared;
use crate::message::{CloseFrame, WsMessage, close_code};

// =============================================================================
// Config
// =============================================================================

/// Per-room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum member count; `0` means unlimited.
    pub max_clients: usize,
    /// Remove the room from the hub when the last member leaves.
    pub destroy_when_empty: bool,
    /// Record a presence value per member.
    pub track_presence: bool,
    /// Hidden from public room listings.
    pub private: bool,
    /// Free-form type tag, aggregated in hub stats.
    pub room_type: String,
    /// Free-form labels.
    pub tags: Vec<String>,
    /// Initial metadata entries.
    pub metadata: BTreeMap<String, Value>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_clients: 0,
            destroy_when_empty: false,
            track_presence: false,
            private: false,
            room_type: "default".to_string(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl RoomConfig {
    /// Creates the default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the member count.
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Destroys the room when it empties.
    pub fn with_destroy_when_empty(mut self, destroy: bool) -> Self {
        self.destroy_when_empty = destroy;
        self
    }

    /// Tracks member presence.
    pub fn with_track_presence(mut self, track: bool) -> Self {
        self.track_presence = track;
        self
    }

    /// Hides the room from listings.
    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Sets the room type tag.
    pub fn with_room_type(mut self, room_type: impl Into<String>) -> Self {
        self.room_type = room_type.into();
        self
    }

    /// Sets the label list.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

// =============================================================================
// Info snapshot
// =============================================================================

/// Point-in-time view of a room.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    /// Room id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Current member count.
    pub client_count: usize,
    /// Configured capacity (`0` = unlimited).
    pub max_clients: usize,
    /// Room type tag.
    pub room_type: String,
    /// Whether the room is hidden from listings.
    pub private: bool,
    /// Labels.
    pub tags: Vec<String>,
    /// Current metadata.
    pub metadata: BTreeMap<String, Value>,
}

// =============================================================================
// Room
// =============================================================================

struct RoomState {
    members: BTreeSet<String>,
    presence: BTreeMap<String, Value>,
    metadata: BTreeMap<String, Value>,
}

/// A named subscription group within the hub.
pub struct Room {
    id: String,
    name: String,
    config: RoomConfig,
    hub: Weak<HubShared>,
    state: Mutex<RoomState>,
    /// Tombstone: set under the state lock when the room is destroyed, so
    /// holders of stale `Arc<Room>` handles observe the removal.
    closed: AtomicBool,
}

impl Room {
    pub(crate) fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        config: RoomConfig,
        hub: Weak<HubShared>,
    ) -> Arc<Self> {
        let metadata = config.metadata.clone();
        Arc::new(Self {
            id: id.into(),
            name: name.into(),
            config,
            hub,
            state: Mutex::new(RoomState {
                members: BTreeSet::new(),
                presence: BTreeMap::new(),
                metadata,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Room id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this room was created with.
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Whether the room has been destroyed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Admits `client`, serialized with every other membership operation.
    ///
    /// Fails with [`HubError::RoomFull`] at capacity,
    /// [`HubError::AlreadyMember`] on a duplicate join, and
    /// [`HubError::Canceled`] when `cancel` fires before admission.
    pub async fn add_client(
        &self,
        cancel: &CancellationToken,
        client: &Arc<WsClient>,
    ) -> HubResult<()> {
        let mut state = tokio::select! {
            () = cancel.cancelled() => return Err(HubError::Canceled),
            guard = self.state.lock() => guard,
        };
        if self.is_closed() {
            return Err(HubError::RoomNotFound {
                id: self.id.clone(),
            });
        }
        let conn_id = client.id().to_string();
        if state.members.contains(&conn_id) {
            return Err(HubError::AlreadyMember {
                room: self.id.clone(),
                connection: conn_id,
            });
        }
        if self.config.max_clients > 0 && state.members.len() >= self.config.max_clients {
            return Err(HubError::RoomFull {
                id: self.id.clone(),
                max: self.config.max_clients,
            });
        }
        if self.config.track_presence {
            state.presence.insert(conn_id.clone(), client.presence_value());
        }
        state.members.insert(conn_id.clone());
        client.record_join(&self.id);
        debug!(room = %self.id, connection = %conn_id, members = state.members.len(), "client joined room");
        Ok(())
    }

    /// Removes `client`; destroys the room if it empties and the config asks
    /// for it. The tombstone flag and the hub-map removal both happen under
    /// the state lock, so a concurrent `Hub::room` either finds a live room
    /// or nothing — never a half-destroyed one.
    pub async fn remove_client(
        &self,
        cancel: &CancellationToken,
        client: &Arc<WsClient>,
    ) -> HubResult<()> {
        let mut state = tokio::select! {
            () = cancel.cancelled() => return Err(HubError::Canceled),
            guard = self.state.lock() => guard,
        };
        let conn_id = client.id();
        if !state.members.remove(conn_id) {
            return Err(HubError::NotMember {
                room: self.id.clone(),
                connection: conn_id.to_string(),
            });
        }
        state.presence.remove(conn_id);
        client.record_leave(&self.id);
        debug!(room = %self.id, connection = %conn_id, members = state.members.len(), "client left room");

        if state.members.is_empty()
            && self.config.destroy_when_empty
            && !self.closed.swap(true, Ordering::AcqRel)
        {
            if let Some(hub) = self.hub.upgrade() {
                hub.remove_room(&self.id);
            }
            debug!(room = %self.id, "empty room destroyed");
        }
        Ok(())
    }

    /// Current member count.
    pub async fn client_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Ids of the current members.
    pub async fn member_ids(&self) -> Vec<String> {
        self.state.lock().await.members.iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Broadcast
    // -------------------------------------------------------------------------

    /// Fans an event out to every member, the sender included.
    ///
    /// The wire shape is `{"type": event, "roomId": id, "payload": payload}`.
    /// Fan-out runs under the membership lock, which gives every member the
    /// same relative order for any two broadcasts to this room.
    pub async fn emit(&self, event: &str, payload: Value) -> HubResult<()> {
        let state = self.state.lock().await;
        if self.is_closed() {
            return Err(HubError::RoomNotFound {
                id: self.id.clone(),
            });
        }
        let hub = self.hub.upgrade().ok_or(HubError::HubClosed)?;
        let envelope = json!({
            "type": event,
            "roomId": self.id,
            "payload": payload,
        })
        .to_string();

        let mut slow = Vec::new();
        for conn_id in &state.members {
            let Some(client) = hub.client(conn_id) else {
                continue;
            };
            match client.try_send(WsMessage::Text(envelope.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => match hub.slow_client_policy() {
                    SlowClientPolicy::DropMessage => {
                        let dropped = client.record_dropped();
                        warn!(
                            room = %self.id,
                            connection = %conn_id,
                            dropped,
                            "outbound queue full, dropped broadcast"
                        );
                    }
                    SlowClientPolicy::CloseClient => {
                        warn!(
                            room = %self.id,
                            connection = %conn_id,
                            "outbound queue full, closing slow client"
                        );
                        slow.push(client);
                    }
                },
                // Client is tearing down; its disconnect path cleans up.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        drop(state);

        for client in slow {
            let _ = client
                .context()
                .close_with_status(close_code::POLICY_VIOLATION, "slow consumer")
                .await;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Presence and metadata
    // -------------------------------------------------------------------------

    /// Internally consistent snapshot of the presence map.
    pub async fn presence(&self) -> BTreeMap<String, Value> {
        self.state.lock().await.presence.clone()
    }

    /// Sets a metadata entry.
    pub async fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.state.lock().await.metadata.insert(key.into(), value);
    }

    /// Point-in-time info snapshot.
    pub async fn info(&self) -> RoomInfo {
        let state = self.state.lock().await;
        RoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            client_count: state.members.len(),
            max_clients: self.config.max_clients,
            room_type: self.config.room_type.clone(),
            private: self.config.private,
            tags: self.config.tags.clone(),
            metadata: state.metadata.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Tears the room down: 1001 Close to every member, membership cleared.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        self.closed.store(true, Ordering::Release);
        if let Some(hub) = self.hub.upgrade() {
            for conn_id in &state.members {
                if let Some(client) = hub.client(conn_id) {
                    let _ = client.try_send(WsMessage::Close(Some(CloseFrame::going_away())));
                    client.record_leave(&self.id);
                }
            }
        }
        state.members.clear();
        state.presence.clear();
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
