use std::sync::Arc;

use anyhow::{anyhow, bail};
use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;

use crate::broadcast::{normalize_mark_images, Broadcast, ChangeAction, LocationChanged};
use crate::error::{LocationError, LocationResult};
use crate::locks::ConnectionLocks;
use crate::model::{
    ActiveLocations, CachedLocation, Connection, ConnectionId, LocationMark, LocationPatch,
    LocationPayload, LocationType, Member, Role, Scope, UserId, ViewScope,
};
use crate::resolver::resolve;
use crate::store::LocationStore;

/// Which members a recomputation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FanOut {
    All,
    /// Members without a personal mark of the type, plus the owner.
    WithoutPersonal(LocationType),
    Only(UserId),
}

impl FanOut {
    fn after_write(scope: Scope, location_type: LocationType, actor: UserId) -> Self {
        match scope {
            Scope::Group => FanOut::WithoutPersonal(location_type),
            Scope::Personal => FanOut::Only(actor),
        }
    }
}

/// Writes marks to the store and keeps every member's active-location cache
/// equal to what the resolver derives from the source records.
///
/// Mutations on one connection run one at a time. A write is committed once
/// the store accepts it; if the cache fan-out that follows fails, the
/// connection is queued for [`CacheSyncEngine::resync_connection`] instead of
/// failing the caller.
pub struct CacheSyncEngine {
    store: Arc<dyn LocationStore>,
    broadcast: Arc<dyn Broadcast>,
    locks: ConnectionLocks,
    uploads_prefix: String,
}

impl CacheSyncEngine {
    pub fn new(
        store: Arc<dyn LocationStore>,
        broadcast: Arc<dyn Broadcast>,
        uploads_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broadcast,
            locks: ConnectionLocks::new(),
            uploads_prefix: uploads_prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LocationStore> {
        &self.store
    }

    pub(crate) fn locks(&self) -> &ConnectionLocks {
        &self.locks
    }

    pub async fn mark(
        &self,
        actor: UserId,
        connection_id: ConnectionId,
        location_type: LocationType,
        scope: Scope,
        payload: LocationPayload,
    ) -> LocationResult<LocationMark> {
        payload.validate_for(location_type)?;

        let _guard = self.locks.lock(connection_id).await;
        let connection = self.load_connection(connection_id).await?;
        authorize(&connection, actor, scope)?;

        // re-marking identical content keeps the existing mark untouched
        let mark = match self.current_mark(&connection, actor, location_type, scope).await? {
            Some(existing) if existing.payload == payload => existing,
            _ => LocationMark::new(payload, actor, Utc::now()),
        };
        self.write_mark(connection_id, actor, location_type, scope, Some(mark.clone()))
            .await?;
        info!(
            "📍 {} {} location marked in {} by {}",
            scope, location_type, connection_id, actor
        );

        self.fan_out(
            connection_id,
            location_type,
            FanOut::after_write(scope, location_type, actor),
        )
        .await?;
        self.announce_change(connection_id, location_type, scope, actor, ChangeAction::Marked, Some(&mark));

        Ok(mark)
    }

    pub async fn update(
        &self,
        actor: UserId,
        connection_id: ConnectionId,
        location_type: LocationType,
        scope: Scope,
        patch: LocationPatch,
    ) -> LocationResult<LocationMark> {
        patch.validate_for(location_type)?;

        let _guard = self.locks.lock(connection_id).await;
        let connection = self.load_connection(connection_id).await?;
        authorize(&connection, actor, scope)?;

        let existing = self
            .current_mark(&connection, actor, location_type, scope)
            .await?;
        let mut mark = existing.ok_or_else(|| {
            LocationError::NotFound(format!("no {} {} location to update", scope, location_type))
        })?;

        patch.apply_to(&mut mark.payload)?;
        mark.updated_at = Utc::now();
        if scope == Scope::Group {
            mark.marked_by = actor;
        }

        self.write_mark(connection_id, actor, location_type, scope, Some(mark.clone()))
            .await?;
        info!(
            "✏️ {} {} location updated in {} by {}",
            scope, location_type, connection_id, actor
        );

        self.fan_out(
            connection_id,
            location_type,
            FanOut::after_write(scope, location_type, actor),
        )
        .await?;
        self.announce_change(connection_id, location_type, scope, actor, ChangeAction::Updated, Some(&mark));

        Ok(mark)
    }

    /// Clears a mark. Removing a mark that does not exist is a no-op.
    pub async fn remove(
        &self,
        actor: UserId,
        connection_id: ConnectionId,
        location_type: LocationType,
        scope: Scope,
    ) -> LocationResult<()> {
        let _guard = self.locks.lock(connection_id).await;
        let connection = self.load_connection(connection_id).await?;
        authorize(&connection, actor, scope)?;

        let previous = self
            .write_mark(connection_id, actor, location_type, scope, None)
            .await?;
        if previous.is_none() {
            debug!(
                "no {} {} location in {} to remove for {}",
                scope, location_type, connection_id, actor
            );
            return Ok(());
        }
        info!(
            "🗑️ {} {} location removed in {} by {}",
            scope, location_type, connection_id, actor
        );

        // a personal removal re-resolves against the group mark as stored now
        let targets = match scope {
            Scope::Group => FanOut::All,
            Scope::Personal => FanOut::Only(actor),
        };
        self.fan_out(connection_id, location_type, targets).await?;
        self.announce_change(connection_id, location_type, scope, actor, ChangeAction::Removed, None);

        Ok(())
    }

    /// Reads the caller's view without taking the connection lock, so it may
    /// trail an in-flight fan-out briefly.
    pub async fn get_active(
        &self,
        actor: UserId,
        connection_id: ConnectionId,
        view: ViewScope,
    ) -> LocationResult<ActiveLocations> {
        let connection = self.load_connection(connection_id).await?;
        let member = connection.active_member(actor).ok_or_else(not_a_member)?;

        let (bus, hotel) = match view {
            ViewScope::Group => (
                group_view(&connection, LocationType::Bus),
                group_view(&connection, LocationType::Hotel),
            ),
            ViewScope::Own => {
                let cached = self.store.cached_locations(connection_id, actor).await?;
                let bus = match cached.bus {
                    Some(entry) if entry.connection_id == connection_id => entry,
                    _ => self.resolve_uncached(&connection, member, LocationType::Bus).await?,
                };
                let hotel = match cached.hotel {
                    Some(entry) if entry.connection_id == connection_id => entry,
                    _ => self.resolve_uncached(&connection, member, LocationType::Hotel).await?,
                };
                (bus, hotel)
            }
        };

        Ok(ActiveLocations {
            scope: view,
            role: member.role,
            bus,
            hotel,
        })
    }

    /// Recomputes every active member's cache from the source records.
    /// Safe to run any number of times.
    pub async fn resync_connection(&self, connection_id: ConnectionId) -> LocationResult<usize> {
        let _guard = self.locks.lock(connection_id).await;
        self.resync_locked(connection_id).await
    }

    /// Full resync for callers already holding the connection lock.
    pub(crate) async fn resync_locked(&self, connection_id: ConnectionId) -> LocationResult<usize> {
        self.load_connection(connection_id).await?;

        match self.recompute(connection_id, &LocationType::ALL, FanOut::All).await {
            Ok(written) => {
                self.store.clear_resync(connection_id).await?;
                info!("🔄 resynced {} cache entries in {}", written, connection_id);
                Ok(written)
            }
            Err(err) => {
                self.store.enqueue_resync(connection_id).await?;
                Err(LocationError::Internal(
                    err.context(format!("resync of {} incomplete", connection_id)),
                ))
            }
        }
    }

    pub(crate) async fn load_connection(&self, connection_id: ConnectionId) -> LocationResult<Connection> {
        self.store
            .connection(connection_id)
            .await?
            .ok_or_else(|| LocationError::NotFound(format!("connection {} not found", connection_id)))
    }

    async fn current_mark(
        &self,
        connection: &Connection,
        actor: UserId,
        location_type: LocationType,
        scope: Scope,
    ) -> LocationResult<Option<LocationMark>> {
        let mark = match scope {
            Scope::Group => connection.group_locations.get(location_type).cloned(),
            Scope::Personal => {
                self.store
                    .personal_mark(connection.id, actor, location_type)
                    .await?
            }
        };
        Ok(mark)
    }

    async fn write_mark(
        &self,
        connection_id: ConnectionId,
        actor: UserId,
        location_type: LocationType,
        scope: Scope,
        mark: Option<LocationMark>,
    ) -> LocationResult<Option<LocationMark>> {
        let previous = match scope {
            Scope::Group => {
                self.store
                    .set_group_mark(connection_id, location_type, mark)
                    .await?
            }
            Scope::Personal => {
                self.store
                    .set_personal_mark(connection_id, actor, location_type, mark)
                    .await?
            }
        };
        Ok(previous)
    }

    /// Runs after a committed write. The operation only completes once the
    /// caches are written or the connection is queued for repair.
    async fn fan_out(
        &self,
        connection_id: ConnectionId,
        location_type: LocationType,
        targets: FanOut,
    ) -> LocationResult<()> {
        match self.recompute(connection_id, &[location_type], targets).await {
            Ok(written) => {
                debug!("cache fan-out wrote {} entries in {}", written, connection_id);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "⚠️ cache fan-out in {} incomplete, queued for resync: {:#}",
                    connection_id, err
                );
                self.store.enqueue_resync(connection_id).await.map_err(|queue_err| {
                    LocationError::Internal(queue_err.context(format!(
                        "could not queue resync for {} after failed fan-out",
                        connection_id
                    )))
                })?;
                Ok(())
            }
        }
    }

    async fn recompute(
        &self,
        connection_id: ConnectionId,
        types: &[LocationType],
        targets: FanOut,
    ) -> anyhow::Result<usize> {
        let connection = self
            .store
            .connection(connection_id)
            .await?
            .ok_or_else(|| anyhow!("connection {} disappeared during fan-out", connection_id))?;
        let personal = self.store.personal_marks(connection_id).await?;
        let now = Utc::now();
        let store = self.store.as_ref();

        let mut writes = Vec::new();
        for member in connection.active_members() {
            let member_personal = personal.get(&member.user_id);
            for &location_type in types {
                let personal_mark = member_personal.and_then(|slots| slots.get(location_type));
                let selected = match targets {
                    FanOut::All => true,
                    FanOut::WithoutPersonal(skip_type) => {
                        member.role == Role::Owner
                            || member_personal
                                .and_then(|slots| slots.get(skip_type))
                                .is_none()
                    }
                    FanOut::Only(user_id) => member.user_id == user_id,
                };
                if !selected {
                    continue;
                }

                let location = resolve(
                    location_type,
                    member.role,
                    personal_mark,
                    connection.group_locations.get(location_type),
                );
                let entry = CachedLocation::new(connection_id, location, now);
                let user_id = member.user_id;
                writes.push(async move {
                    (user_id, store.write_cache(connection_id, user_id, entry).await)
                });
            }
        }

        let total = writes.len();
        let failures: Vec<_> = join_all(writes)
            .await
            .into_iter()
            .filter_map(|(user_id, result)| result.err().map(|err| (user_id, err)))
            .collect();

        for (user_id, err) in &failures {
            warn!("   ❌ cache write for {} in {} failed: {:#}", user_id, connection_id, err);
        }
        if !failures.is_empty() {
            bail!("{} of {} cache writes failed", failures.len(), total);
        }
        Ok(total)
    }

    async fn resolve_uncached(
        &self,
        connection: &Connection,
        member: &Member,
        location_type: LocationType,
    ) -> LocationResult<CachedLocation> {
        debug!(
            "cache miss for {} {} in {}, resolving from source",
            member.user_id, location_type, connection.id
        );
        let personal = self
            .store
            .personal_mark(connection.id, member.user_id, location_type)
            .await?;
        let location = resolve(
            location_type,
            member.role,
            personal.as_ref(),
            connection.group_locations.get(location_type),
        );
        Ok(CachedLocation::new(connection.id, location, Utc::now()))
    }

    fn announce_change(
        &self,
        connection_id: ConnectionId,
        location_type: LocationType,
        scope: Scope,
        actor: UserId,
        action: ChangeAction,
        mark: Option<&LocationMark>,
    ) {
        let event = LocationChanged {
            connection_id,
            location_type,
            scope,
            user_id: actor,
            action,
            location: mark.map(|mark| normalize_mark_images(mark, &self.uploads_prefix)),
            timestamp: Utc::now(),
        };
        self.announce(connection_id, action.event_name(), &event);
    }

    /// Fire and forget; failures are logged only.
    pub(crate) fn announce<T: Serialize>(&self, connection_id: ConnectionId, event_name: &str, event: &T) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("📡 could not encode {} event: {}", event_name, err);
                return;
            }
        };
        if let Err(err) = self
            .broadcast
            .emit_to_connection_room(connection_id, event_name, payload)
        {
            warn!("📡 broadcast of {} to {} failed: {:#}", event_name, connection_id, err);
        }
    }
}

fn not_a_member() -> LocationError {
    LocationError::Forbidden("user is not an active member of this connection".to_string())
}

/// Owners write group scope, members write personal scope.
fn authorize(connection: &Connection, actor: UserId, scope: Scope) -> LocationResult<Role> {
    let member = connection.active_member(actor).ok_or_else(not_a_member)?;
    match (scope, member.role) {
        (Scope::Group, Role::Member) => Err(LocationError::Forbidden(
            "only the owner can change group locations".to_string(),
        )),
        (Scope::Personal, Role::Owner) => Err(LocationError::Forbidden(
            "owner cannot hold personal locations, use group scope instead".to_string(),
        )),
        (_, role) => Ok(role),
    }
}

fn group_view(connection: &Connection, location_type: LocationType) -> CachedLocation {
    let group = connection.group_locations.get(location_type);
    let last_updated = group.map(|mark| mark.updated_at).unwrap_or_else(Utc::now);
    // resolving as the owner yields exactly the group mark
    CachedLocation::new(
        connection.id,
        resolve(location_type, Role::Owner, None, group),
        last_updated,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    use crate::broadcast::RoomHub;
    use crate::memory_store::MemoryStore;
    use crate::model::{ActiveSource, Coordinates, HotelFields, PlaceFields, TypeSlots};
    use crate::store::TransferPlan;

    /// Delegates to a [`MemoryStore`] and fails selected writes.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing_cache_users: Mutex<HashSet<UserId>>,
        fail_group_writes: Mutex<bool>,
    }

    #[async_trait]
    impl LocationStore for FlakyStore {
        async fn connection(&self, connection_id: ConnectionId) -> Result<Option<Connection>> {
            self.inner.connection(connection_id).await
        }

        async fn set_group_mark(
            &self,
            connection_id: ConnectionId,
            location_type: LocationType,
            mark: Option<LocationMark>,
        ) -> Result<Option<LocationMark>> {
            if *self.fail_group_writes.lock() {
                bail!("disk full");
            }
            self.inner.set_group_mark(connection_id, location_type, mark).await
        }

        async fn personal_mark(
            &self,
            connection_id: ConnectionId,
            user_id: UserId,
            location_type: LocationType,
        ) -> Result<Option<LocationMark>> {
            self.inner.personal_mark(connection_id, user_id, location_type).await
        }

        async fn personal_marks(
            &self,
            connection_id: ConnectionId,
        ) -> Result<HashMap<UserId, TypeSlots<LocationMark>>> {
            self.inner.personal_marks(connection_id).await
        }

        async fn set_personal_mark(
            &self,
            connection_id: ConnectionId,
            user_id: UserId,
            location_type: LocationType,
            mark: Option<LocationMark>,
        ) -> Result<Option<LocationMark>> {
            self.inner
                .set_personal_mark(connection_id, user_id, location_type, mark)
                .await
        }

        async fn write_cache(
            &self,
            connection_id: ConnectionId,
            user_id: UserId,
            entry: CachedLocation,
        ) -> Result<()> {
            if self.failing_cache_users.lock().contains(&user_id) {
                bail!("cache shard for {} unavailable", user_id);
            }
            self.inner.write_cache(connection_id, user_id, entry).await
        }

        async fn cached_locations(
            &self,
            connection_id: ConnectionId,
            user_id: UserId,
        ) -> Result<TypeSlots<CachedLocation>> {
            self.inner.cached_locations(connection_id, user_id).await
        }

        async fn commit_transfer(&self, connection_id: ConnectionId, plan: &TransferPlan) -> Result<()> {
            self.inner.commit_transfer(connection_id, plan).await
        }

        async fn enqueue_resync(&self, connection_id: ConnectionId) -> Result<()> {
            self.inner.enqueue_resync(connection_id).await
        }

        async fn pending_resyncs(&self) -> Result<Vec<ConnectionId>> {
            self.inner.pending_resyncs().await
        }

        async fn clear_resync(&self, connection_id: ConnectionId) -> Result<()> {
            self.inner.clear_resync(connection_id).await
        }
    }

    struct BrokenBroadcast;

    impl Broadcast for BrokenBroadcast {
        fn emit_to_connection_room(&self, _: ConnectionId, _: &str, _: Value) -> Result<()> {
            bail!("socket server unreachable")
        }
    }

    struct Fixture {
        store: Arc<FlakyStore>,
        engine: CacheSyncEngine,
        connection_id: ConnectionId,
        owner: UserId,
        member: UserId,
        other: UserId,
    }

    fn fixture(broadcast: Arc<dyn Broadcast>) -> Fixture {
        let store = Arc::new(FlakyStore::default());
        let connection_id = ConnectionId::new();
        let owner = UserId::new();
        let member = UserId::new();
        let other = UserId::new();
        store.inner.insert_connection(Connection::new(
            connection_id,
            vec![
                Member::new(owner, Role::Owner),
                Member::new(member, Role::Member),
                Member::new(other, Role::Member),
            ],
        ));
        let engine = CacheSyncEngine::new(store.clone(), broadcast, "/uploads");
        Fixture {
            store,
            engine,
            connection_id,
            owner,
            member,
            other,
        }
    }

    fn hotel(name: &str) -> LocationPayload {
        LocationPayload::Hotel(HotelFields {
            place: PlaceFields {
                name: name.to_string(),
                coordinates: Coordinates::new(34.69, 135.50),
                comment: None,
                images: vec!["file:///sdcard/DCIM/lobby.jpg".to_string()],
            },
            room_number: None,
        })
    }

    async fn cached(fixture: &Fixture, user_id: UserId, location_type: LocationType) -> Option<CachedLocation> {
        fixture
            .store
            .cached_locations(fixture.connection_id, user_id)
            .await
            .unwrap()
            .get(location_type)
            .cloned()
    }

    #[tokio::test]
    async fn partial_fan_out_succeeds_and_queues_resync() {
        let f = fixture(Arc::new(RoomHub::new(8)));
        f.store.failing_cache_users.lock().insert(f.other);

        let mark = f
            .engine
            .mark(f.owner, f.connection_id, LocationType::Hotel, Scope::Group, hotel("Umeda Stay"))
            .await
            .unwrap();

        let member_view = cached(&f, f.member, LocationType::Hotel).await.unwrap();
        assert_eq!(member_view.location.origin_mark_id, Some(mark.id));
        assert!(cached(&f, f.other, LocationType::Hotel).await.is_none());
        assert_eq!(f.store.pending_resyncs().await.unwrap(), vec![f.connection_id]);

        // repair once the member's cache is writable again
        f.store.failing_cache_users.lock().clear();
        f.engine.resync_connection(f.connection_id).await.unwrap();

        let other_view = cached(&f, f.other, LocationType::Hotel).await.unwrap();
        assert_eq!(other_view.location.source, ActiveSource::Group);
        assert!(f.store.pending_resyncs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_resync_stays_queued() {
        let f = fixture(Arc::new(RoomHub::new(8)));
        f.store.failing_cache_users.lock().insert(f.member);

        let result = f.engine.resync_connection(f.connection_id).await;

        assert!(matches!(result, Err(LocationError::Internal(_))));
        assert_eq!(f.store.pending_resyncs().await.unwrap(), vec![f.connection_id]);
    }

    #[tokio::test]
    async fn store_failure_skips_fan_out() {
        let f = fixture(Arc::new(RoomHub::new(8)));
        *f.store.fail_group_writes.lock() = true;

        let result = f
            .engine
            .mark(f.owner, f.connection_id, LocationType::Hotel, Scope::Group, hotel("Umeda Stay"))
            .await;

        assert!(matches!(result, Err(LocationError::Internal(_))));
        assert!(cached(&f, f.member, LocationType::Hotel).await.is_none());
        assert!(f.store.pending_resyncs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_failure_does_not_roll_back() {
        let f = fixture(Arc::new(BrokenBroadcast));

        let mark = f
            .engine
            .mark(f.owner, f.connection_id, LocationType::Hotel, Scope::Group, hotel("Umeda Stay"))
            .await
            .unwrap();

        let connection = f.store.connection(f.connection_id).await.unwrap().unwrap();
        assert_eq!(connection.group_locations.get(LocationType::Hotel), Some(&mark));
    }

    #[tokio::test]
    async fn broadcast_carries_normalized_images() {
        let hub = Arc::new(RoomHub::new(8));
        let f = fixture(hub.clone());
        let mut receiver = hub.subscribe(f.connection_id);

        let mark = f
            .engine
            .mark(f.owner, f.connection_id, LocationType::Hotel, Scope::Group, hotel("Umeda Stay"))
            .await
            .unwrap();

        let message = receiver.recv().await.unwrap();
        assert_eq!(message.event, "locationMarked");
        assert_eq!(message.payload["scope"], "group");
        assert_eq!(message.payload["type"], "hotel");
        assert_eq!(
            message.payload["location"]["payload"]["images"][0],
            "/uploads/lobby.jpg"
        );
        // the stored mark keeps the original reference
        assert_eq!(mark.payload.place().images[0], "file:///sdcard/DCIM/lobby.jpg");
    }

    #[tokio::test]
    async fn removing_nothing_emits_nothing() {
        let hub = Arc::new(RoomHub::new(8));
        let f = fixture(hub.clone());
        let mut receiver = hub.subscribe(f.connection_id);

        f.engine
            .remove(f.member, f.connection_id, LocationType::Bus, Scope::Personal)
            .await
            .unwrap();

        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn cache_miss_resolves_from_source() {
        let f = fixture(Arc::new(RoomHub::new(8)));
        f.store.failing_cache_users.lock().insert(f.member);
        let mark = f
            .engine
            .mark(f.owner, f.connection_id, LocationType::Hotel, Scope::Group, hotel("Umeda Stay"))
            .await
            .unwrap();
        f.store.failing_cache_users.lock().clear();

        let view = f
            .engine
            .get_active(f.member, f.connection_id, ViewScope::Own)
            .await
            .unwrap();

        assert_eq!(view.hotel.location.origin_mark_id, Some(mark.id));
        assert_eq!(view.bus.location.source, ActiveSource::Unmarked);
    }
}
