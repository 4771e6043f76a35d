use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::broadcast::{OwnershipTransferred, OWNERSHIP_TRANSFERRED};
use crate::error::{LocationError, LocationResult};
use crate::model::{
    Connection, ConnectionId, LocationMark, LocationType, Role, TransferChoice, TransferChoices,
    TransferRecord, TypeSlots, UserId,
};
use crate::store::TransferPlan;
use crate::sync::CacheSyncEngine;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub connection_id: ConnectionId,
    pub previous_owner_id: UserId,
    pub new_owner_id: UserId,
    pub choices: TransferChoices,
    pub group_locations: TypeSlots<LocationMark>,
    /// True when this call was a retry of a transfer that had already committed.
    pub already_applied: bool,
}

/// Hands the owner role to another active member and settles what happens to
/// the group marks the new owner inherits.
pub struct OwnershipTransferCoordinator {
    engine: Arc<CacheSyncEngine>,
}

impl OwnershipTransferCoordinator {
    pub fn new(engine: Arc<CacheSyncEngine>) -> Self {
        Self { engine }
    }

    pub async fn transfer_ownership(
        &self,
        actor: UserId,
        connection_id: ConnectionId,
        new_owner: UserId,
        choices: TransferChoices,
    ) -> LocationResult<TransferOutcome> {
        if actor == new_owner {
            return Err(LocationError::InvalidInput(
                "cannot transfer ownership to yourself".to_string(),
            ));
        }

        let _guard = self.engine.locks().lock(connection_id).await;
        let connection = self.engine.load_connection(connection_id).await?;
        if connection.active_member(actor).is_none() {
            return Err(LocationError::Forbidden(
                "user is not an active member of this connection".to_string(),
            ));
        }

        if is_committed_retry(&connection, actor, new_owner, choices) {
            info!(
                "↩️ transfer of {} to {} already applied, resyncing",
                connection_id, new_owner
            );
            self.engine.resync_locked(connection_id).await?;
            return Ok(TransferOutcome {
                connection_id,
                previous_owner_id: actor,
                new_owner_id: new_owner,
                choices,
                group_locations: connection.group_locations,
                already_applied: true,
            });
        }

        if connection.owner().map(|owner| owner.user_id) != Some(actor) {
            return Err(LocationError::Forbidden(
                "only the owner can transfer ownership".to_string(),
            ));
        }
        if connection.active_member(new_owner).is_none() {
            return Err(LocationError::NotFound(format!(
                "user {} is not an active member of this connection",
                new_owner
            )));
        }

        let inherited = self
            .engine
            .store()
            .personal_marks(connection_id)
            .await?
            .remove(&new_owner)
            .unwrap_or_default();
        let now = Utc::now();
        let plan = plan_transfer(&connection, actor, new_owner, choices, &inherited, now);

        self.engine.store().commit_transfer(connection_id, &plan).await?;
        info!(
            "👑 ownership of {} moved from {} to {} (bus: {:?}, hotel: {:?})",
            connection_id, actor, new_owner, choices.bus, choices.hotel
        );

        // the commit queued a resync, so the reconciler finishes this if it fails
        if let Err(err) = self.engine.resync_locked(connection_id).await {
            warn!("⚠️ resync after transfer of {} failed: {}", connection_id, err);
        }

        self.engine.announce(
            connection_id,
            OWNERSHIP_TRANSFERRED,
            &OwnershipTransferred {
                connection_id,
                previous_owner_id: actor,
                new_owner_id: new_owner,
                choices,
                timestamp: now,
            },
        );

        Ok(TransferOutcome {
            connection_id,
            previous_owner_id: actor,
            new_owner_id: new_owner,
            choices,
            group_locations: plan.group_locations,
            already_applied: false,
        })
    }
}

fn is_committed_retry(
    connection: &Connection,
    actor: UserId,
    new_owner: UserId,
    choices: TransferChoices,
) -> bool {
    connection.last_transfer.as_ref().is_some_and(|record| {
        record.from == actor
            && record.to == new_owner
            && record.choices == choices
            && connection.role_of(new_owner) == Some(Role::Owner)
    })
}

/// Computes the post-transfer source records.
///
/// `replace` promotes the new owner's personal mark to the group mark and
/// leaves the group mark alone when there is nothing to promote. `keep`
/// leaves the content as is and credits the new owner. Both owners end up
/// without personal marks.
pub fn plan_transfer(
    connection: &Connection,
    from: UserId,
    to: UserId,
    choices: TransferChoices,
    inherited: &TypeSlots<LocationMark>,
    now: DateTime<Utc>,
) -> TransferPlan {
    let mut group_locations = TypeSlots::default();
    for location_type in LocationType::ALL {
        let current = connection.group_locations.get(location_type);
        let next = match (choices.get(location_type), inherited.get(location_type)) {
            (TransferChoice::Replace, Some(personal)) => {
                let mut promoted = personal.clone();
                promoted.marked_by = to;
                promoted.updated_at = now;
                Some(promoted)
            }
            (TransferChoice::Replace, None) => current.cloned(),
            (TransferChoice::Keep, _) => current.cloned().map(|mut kept| {
                kept.marked_by = to;
                kept
            }),
        };
        group_locations.set(location_type, next);
    }

    TransferPlan {
        from,
        to,
        group_locations,
        clear_personal_for: vec![from, to],
        record: TransferRecord {
            from,
            to,
            choices,
            at: now,
        },
    }
}
