//! Live-client notifications.
//!
//! Delivery is best effort and at most once. Nothing here is persisted or
//! replayed, and a failed emit never affects the state change that caused it.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use serde_with::skip_serializing_none;
use tokio::sync::broadcast;

use crate::model::{ConnectionId, LocationMark, LocationType, Scope, TransferChoices, UserId};

pub trait Broadcast: Send + Sync {
    fn emit_to_connection_room(
        &self,
        connection_id: ConnectionId,
        event_name: &str,
        payload: Value,
    ) -> Result<()>;
}

pub fn room_name(connection_id: ConnectionId) -> String {
    format!("connection:{}", connection_id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomMessage {
    pub event: String,
    pub payload: Value,
}

/// In-process fan-out to subscribed clients, one bounded channel per room.
/// Slow subscribers lose the oldest messages; rooms without subscribers are
/// dropped on the next emit.
pub struct RoomHub {
    capacity: usize,
    rooms: Mutex<HashMap<String, broadcast::Sender<RoomMessage>>>,
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, connection_id: ConnectionId) -> broadcast::Receiver<RoomMessage> {
        let mut rooms = self.rooms.lock();
        rooms
            .entry(room_name(connection_id))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }
}

impl Broadcast for RoomHub {
    fn emit_to_connection_room(
        &self,
        connection_id: ConnectionId,
        event_name: &str,
        payload: Value,
    ) -> Result<()> {
        let room = room_name(connection_id);
        let mut rooms = self.rooms.lock();

        let Some(sender) = rooms.get(&room) else {
            debug!("📭 no subscribers in {}, dropping {}", room, event_name);
            return Ok(());
        };

        let message = RoomMessage {
            event: event_name.to_string(),
            payload,
        };
        if sender.send(message).is_err() {
            // every receiver is gone
            rooms.remove(&room);
            debug!("📭 room {} closed, dropping {}", room, event_name);
        }
        Ok(())
    }
}

/// Rewrites image references to server-relative identifiers.
/// `http(s)` URLs and paths already under `prefix` pass through; anything
/// else (device URIs, absolute device paths, bare file names) keeps only its
/// file name under `prefix`.
pub fn normalize_image_ref(image: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let is_remote = image.starts_with("http://") || image.starts_with("https://");
    let is_server_relative = image
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'));
    if is_remote || is_server_relative {
        return image.to_string();
    }
    let filename = image.rsplit('/').next().unwrap_or_default();
    format!("{}/{}", prefix, filename)
}

pub fn normalize_mark_images(mark: &LocationMark, prefix: &str) -> LocationMark {
    let mut normalized = mark.clone();
    let place = normalized.payload.place_mut();
    place.images = place
        .images
        .iter()
        .map(|image| normalize_image_ref(image, prefix))
        .collect();
    normalized
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Marked,
    Updated,
    Removed,
}

impl ChangeAction {
    pub fn event_name(&self) -> &'static str {
        match self {
            ChangeAction::Marked => "locationMarked",
            ChangeAction::Updated => "locationUpdated",
            ChangeAction::Removed => "locationRemoved",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationChanged {
    pub connection_id: ConnectionId,
    #[serde(rename = "type")]
    pub location_type: LocationType,
    pub scope: Scope,
    pub user_id: UserId,
    pub action: ChangeAction,
    pub location: Option<LocationMark>,
    pub timestamp: DateTime<Utc>,
}

pub const OWNERSHIP_TRANSFERRED: &str = "ownershipTransferred";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipTransferred {
    pub connection_id: ConnectionId,
    pub previous_owner_id: UserId,
    pub new_owner_id: UserId,
    pub choices: TransferChoices,
    pub timestamp: DateTime<Utc>,
}
