use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::model::{
    CachedLocation, Connection, ConnectionId, LocationMark, LocationType, TypeSlots, UserId,
};
use crate::store::{LocationStore, TransferPlan};

#[derive(Debug, Default, Clone)]
struct MemberRecord {
    personal_locations: TypeSlots<LocationMark>,
    active_locations: TypeSlots<CachedLocation>,
}

#[derive(Debug, Default)]
struct MemoryState {
    connections: HashMap<ConnectionId, Connection>,
    members: HashMap<(ConnectionId, UserId), MemberRecord>,
    pending: HashMap<ConnectionId, u64>,
    next_ticket: u64,
}

impl MemoryState {
    fn queue_resync(&mut self, connection_id: ConnectionId) {
        if !self.pending.contains_key(&connection_id) {
            self.next_ticket += 1;
            self.pending.insert(connection_id, self.next_ticket);
        }
    }

    fn connection_mut(&mut self, connection_id: ConnectionId) -> Result<&mut Connection> {
        self.connections
            .get_mut(&connection_id)
            .ok_or_else(|| anyhow!("connection {} does not exist", connection_id))
    }

    fn member_mut(&mut self, connection_id: ConnectionId, user_id: UserId) -> Result<&mut MemberRecord> {
        self.members
            .get_mut(&(connection_id, user_id))
            .ok_or_else(|| anyhow!("user {} is not a member of connection {}", user_id, connection_id))
    }
}

/// Process-local store. Used for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a connection and its member records. The membership provider
    /// owns connection lifecycles; the core only calls this from tests and
    /// fixtures.
    pub fn insert_connection(&self, connection: Connection) {
        let mut state = self.state.write();
        for member in &connection.members {
            state
                .members
                .entry((connection.id, member.user_id))
                .or_default();
        }
        state.connections.insert(connection.id, connection);
    }
}

#[async_trait]
impl LocationStore for MemoryStore {
    async fn connection(&self, connection_id: ConnectionId) -> Result<Option<Connection>> {
        Ok(self.state.read().connections.get(&connection_id).cloned())
    }

    async fn set_group_mark(
        &self,
        connection_id: ConnectionId,
        location_type: LocationType,
        mark: Option<LocationMark>,
    ) -> Result<Option<LocationMark>> {
        let mut state = self.state.write();
        let connection = state.connection_mut(connection_id)?;
        Ok(connection.group_locations.set(location_type, mark))
    }

    async fn personal_mark(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        location_type: LocationType,
    ) -> Result<Option<LocationMark>> {
        let state = self.state.read();
        Ok(state
            .members
            .get(&(connection_id, user_id))
            .and_then(|record| record.personal_locations.get(location_type).cloned()))
    }

    async fn personal_marks(
        &self,
        connection_id: ConnectionId,
    ) -> Result<HashMap<UserId, TypeSlots<LocationMark>>> {
        let state = self.state.read();
        Ok(state
            .members
            .iter()
            .filter(|((id, _), record)| *id == connection_id && !record.personal_locations.is_empty())
            .map(|((_, user_id), record)| (*user_id, record.personal_locations.clone()))
            .collect())
    }

    async fn set_personal_mark(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        location_type: LocationType,
        mark: Option<LocationMark>,
    ) -> Result<Option<LocationMark>> {
        let mut state = self.state.write();
        let record = state.member_mut(connection_id, user_id)?;
        Ok(record.personal_locations.set(location_type, mark))
    }

    async fn write_cache(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        entry: CachedLocation,
    ) -> Result<()> {
        let mut state = self.state.write();
        let record = state.member_mut(connection_id, user_id)?;
        record
            .active_locations
            .set(entry.location.location_type, Some(entry));
        Ok(())
    }

    async fn cached_locations(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Result<TypeSlots<CachedLocation>> {
        let state = self.state.read();
        Ok(state
            .members
            .get(&(connection_id, user_id))
            .map(|record| record.active_locations.clone())
            .unwrap_or_default())
    }

    async fn commit_transfer(&self, connection_id: ConnectionId, plan: &TransferPlan) -> Result<()> {
        let mut state = self.state.write();

        // validate everything before touching anything
        let mut connection = state
            .connections
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| anyhow!("connection {} does not exist", connection_id))?;
        connection.swap_owner(plan.from, plan.to)?;
        for user_id in &plan.clear_personal_for {
            if !state.members.contains_key(&(connection_id, *user_id)) {
                bail!("user {} is not a member of connection {}", user_id, connection_id);
            }
        }

        connection.group_locations = plan.group_locations.clone();
        connection.last_transfer = Some(plan.record.clone());
        state.connections.insert(connection_id, connection);
        for user_id in &plan.clear_personal_for {
            if let Some(record) = state.members.get_mut(&(connection_id, *user_id)) {
                record.personal_locations = TypeSlots::default();
            }
        }
        state.queue_resync(connection_id);
        Ok(())
    }

    async fn enqueue_resync(&self, connection_id: ConnectionId) -> Result<()> {
        self.state.write().queue_resync(connection_id);
        Ok(())
    }

    async fn pending_resyncs(&self) -> Result<Vec<ConnectionId>> {
        let state = self.state.read();
        let mut pending: Vec<_> = state.pending.iter().map(|(id, ticket)| (*ticket, *id)).collect();
        pending.sort();
        Ok(pending.into_iter().map(|(_, id)| id).collect())
    }

    async fn clear_resync(&self, connection_id: ConnectionId) -> Result<()> {
        self.state.write().pending.remove(&connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::model::{
        ActiveLocation, Coordinates, LocationPayload, Member, PlaceFields, Role, TransferChoice,
        TransferChoices, TransferRecord,
    };

    fn bus(name: &str, by: UserId) -> LocationMark {
        LocationMark::new(
            LocationPayload::Bus(PlaceFields {
                name: name.to_string(),
                coordinates: Coordinates::new(48.85, 2.35),
                comment: None,
                images: vec![],
            }),
            by,
            Utc::now(),
        )
    }

    fn seeded() -> (MemoryStore, ConnectionId, UserId, UserId) {
        let store = MemoryStore::new();
        let connection_id = ConnectionId::new();
        let owner = UserId::new();
        let member = UserId::new();
        store.insert_connection(Connection::new(
            connection_id,
            vec![Member::new(owner, Role::Owner), Member::new(member, Role::Member)],
        ));
        (store, connection_id, owner, member)
    }

    #[tokio::test]
    async fn group_mark_replaces_and_returns_previous() {
        let (store, connection_id, owner, _) = seeded();
        let first = bus("North Gate", owner);
        let second = bus("South Gate", owner);

        let previous = store
            .set_group_mark(connection_id, LocationType::Bus, Some(first.clone()))
            .await
            .unwrap();
        assert!(previous.is_none());

        let previous = store
            .set_group_mark(connection_id, LocationType::Bus, Some(second.clone()))
            .await
            .unwrap();
        assert_eq!(previous, Some(first));

        let connection = store.connection(connection_id).await.unwrap().unwrap();
        assert_eq!(connection.group_locations.get(LocationType::Bus), Some(&second));
    }

    #[tokio::test]
    async fn personal_marks_lists_only_holders() {
        let (store, connection_id, _, member) = seeded();
        assert!(store.personal_marks(connection_id).await.unwrap().is_empty());

        store
            .set_personal_mark(connection_id, member, LocationType::Bus, Some(bus("Side Stop", member)))
            .await
            .unwrap();

        let marks = store.personal_marks(connection_id).await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[&member].get(LocationType::Bus).unwrap().payload.place().name, "Side Stop");
    }

    #[tokio::test]
    async fn writes_for_unknown_members_fail() {
        let (store, connection_id, _, _) = seeded();
        let stranger = UserId::new();
        let entry = CachedLocation::new(connection_id, ActiveLocation::unmarked(LocationType::Bus), Utc::now());

        assert!(store.write_cache(connection_id, stranger, entry).await.is_err());
        assert!(store
            .set_personal_mark(connection_id, stranger, LocationType::Bus, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn failed_transfer_commit_changes_nothing() {
        let (store, connection_id, owner, member) = seeded();
        let plan = TransferPlan {
            // wrong direction: the member is not the owner
            from: member,
            to: owner,
            group_locations: TypeSlots::default(),
            clear_personal_for: vec![member, owner],
            record: TransferRecord {
                from: member,
                to: owner,
                choices: TransferChoices {
                    bus: TransferChoice::Keep,
                    hotel: TransferChoice::Keep,
                },
                at: Utc::now(),
            },
        };
        let before = store.connection(connection_id).await.unwrap();

        assert!(store.commit_transfer(connection_id, &plan).await.is_err());

        assert_eq!(store.connection(connection_id).await.unwrap(), before);
        assert!(store.pending_resyncs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resync_queue_is_deduplicated_and_ordered() {
        let store = MemoryStore::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();

        store.enqueue_resync(first).await.unwrap();
        store.enqueue_resync(second).await.unwrap();
        store.enqueue_resync(first).await.unwrap();

        assert_eq!(store.pending_resyncs().await.unwrap(), vec![first, second]);

        store.clear_resync(first).await.unwrap();
        assert_eq!(store.pending_resyncs().await.unwrap(), vec![second]);
    }
}
