use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{
    CachedLocation, Connection, ConnectionId, LocationMark, LocationType, TransferRecord, TypeSlots,
    UserId,
};

/// Source-of-truth access for one deployment.
///
/// Every write is atomic per aggregate. `commit_transfer` is the only
/// multi-aggregate write and must apply all of its parts or none.
#[async_trait]
pub trait LocationStore: Send + Sync {
    async fn connection(&self, connection_id: ConnectionId) -> Result<Option<Connection>>;

    /// Replaces the group mark for one type. Returns the previous mark.
    async fn set_group_mark(
        &self,
        connection_id: ConnectionId,
        location_type: LocationType,
        mark: Option<LocationMark>,
    ) -> Result<Option<LocationMark>>;

    async fn personal_mark(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        location_type: LocationType,
    ) -> Result<Option<LocationMark>>;

    /// Personal marks of every member of the connection that holds at least one.
    async fn personal_marks(
        &self,
        connection_id: ConnectionId,
    ) -> Result<HashMap<UserId, TypeSlots<LocationMark>>>;

    /// Replaces a member's personal mark for one type. Returns the previous mark.
    async fn set_personal_mark(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        location_type: LocationType,
        mark: Option<LocationMark>,
    ) -> Result<Option<LocationMark>>;

    /// Overwrites one cache entry; the type is taken from the entry.
    async fn write_cache(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        entry: CachedLocation,
    ) -> Result<()>;

    async fn cached_locations(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Result<TypeSlots<CachedLocation>>;

    /// Applies a planned ownership transfer and queues a resync for the
    /// connection in the same unit of work.
    async fn commit_transfer(&self, connection_id: ConnectionId, plan: &TransferPlan) -> Result<()>;

    async fn enqueue_resync(&self, connection_id: ConnectionId) -> Result<()>;

    /// Queued connections, oldest first.
    async fn pending_resyncs(&self) -> Result<Vec<ConnectionId>>;

    async fn clear_resync(&self, connection_id: ConnectionId) -> Result<()>;
}

/// Everything an ownership transfer changes in the source records.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    pub from: UserId,
    pub to: UserId,
    /// Group marks after the transfer, both types written wholesale.
    pub group_locations: TypeSlots<LocationMark>,
    /// Members whose personal marks in this connection are dropped.
    pub clear_personal_for: Vec<UserId>,
    pub record: TransferRecord,
}
