use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::ConnectionId;

/// Serializes mutations per connection.
///
/// Slots nobody holds or waits on are pruned whenever a lock is taken, so the
/// registry only tracks connections with work in flight.
///
/// The registry is process-local. A deployment runs exactly one server
/// instance per store; two instances sharing one Postgres database do not
/// serialize against each other.
#[derive(Default)]
pub struct ConnectionLocks {
    slots: Mutex<HashMap<ConnectionId, Arc<AsyncMutex<()>>>>,
}

impl ConnectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, connection_id: ConnectionId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock();
            slots.retain(|id, slot| *id == connection_id || Arc::strong_count(slot) > 1);
            slots.entry(connection_id).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub fn tracked(&self) -> usize {
        self.slots.lock().len()
    }
}
