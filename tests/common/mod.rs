#![allow(dead_code)]

use std::sync::Arc;

use group_locations::broadcast::RoomHub;
use group_locations::memory_store::MemoryStore;
use group_locations::model::{
    ActiveLocations, Connection, ConnectionId, Coordinates, HotelFields, LocationPayload,
    LocationType, Member, PlaceFields, Role, UserId, ViewScope,
};
use group_locations::resolver::resolve;
use group_locations::store::LocationStore;
use group_locations::sync::CacheSyncEngine;

pub struct Group {
    pub store: Arc<MemoryStore>,
    pub hub: Arc<RoomHub>,
    pub engine: Arc<CacheSyncEngine>,
    pub connection_id: ConnectionId,
    pub owner: UserId,
    pub members: Vec<UserId>,
}

impl Group {
    pub fn member(&self, index: usize) -> UserId {
        self.members[index]
    }

    pub async fn view(&self, user_id: UserId) -> ActiveLocations {
        self.engine
            .get_active(user_id, self.connection_id, ViewScope::Own)
            .await
            .unwrap()
    }

    pub async fn connection(&self) -> Connection {
        self.store.connection(self.connection_id).await.unwrap().unwrap()
    }
}

/// An owner plus `member_count` plain members, all active.
pub fn group(member_count: usize) -> Group {
    group_with(member_count, |_| {})
}

pub fn group_with(member_count: usize, adjust: impl FnOnce(&mut Connection)) -> Group {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RoomHub::new(32));
    let connection_id = ConnectionId::new();
    let owner = UserId::new();
    let members: Vec<UserId> = (0..member_count).map(|_| UserId::new()).collect();

    let mut roster = vec![Member::new(owner, Role::Owner)];
    roster.extend(members.iter().map(|id| Member::new(*id, Role::Member)));
    let mut connection = Connection::new(connection_id, roster);
    adjust(&mut connection);
    store.insert_connection(connection);

    let engine = Arc::new(CacheSyncEngine::new(store.clone(), hub.clone(), "/uploads"));
    Group {
        store,
        hub,
        engine,
        connection_id,
        owner,
        members,
    }
}

pub fn bus(name: &str) -> LocationPayload {
    LocationPayload::Bus(PlaceFields {
        name: name.to_string(),
        coordinates: Coordinates::new(35.68, 139.76),
        comment: None,
        images: vec![],
    })
}

pub fn hotel(name: &str, room: Option<&str>) -> LocationPayload {
    LocationPayload::Hotel(HotelFields {
        place: PlaceFields {
            name: name.to_string(),
            coordinates: Coordinates::new(35.66, 139.70),
            comment: Some("check-in after 3pm".to_string()),
            images: vec![],
        },
        room_number: room.map(str::to_string),
    })
}

/// Every active member's cache matches what the resolver derives from the
/// source records. Entries never written must resolve to unmarked.
pub async fn assert_resolution_invariant(group: &Group) {
    let connection = group.connection().await;
    let personal = group.store.personal_marks(group.connection_id).await.unwrap();

    for member in connection.active_members() {
        let cached = group
            .store
            .cached_locations(group.connection_id, member.user_id)
            .await
            .unwrap();
        for location_type in LocationType::ALL {
            let expected = resolve(
                location_type,
                member.role,
                personal.get(&member.user_id).and_then(|slots| slots.get(location_type)),
                connection.group_locations.get(location_type),
            );
            match cached.get(location_type) {
                Some(entry) => assert_eq!(
                    entry.location, expected,
                    "{} cache of {} diverged",
                    location_type, member.user_id
                ),
                None => assert!(
                    !expected.is_marked(),
                    "{} cache of {} missing",
                    location_type,
                    member.user_id
                ),
            }
        }
    }
}

pub async fn assert_single_owner(group: &Group) -> UserId {
    let connection = group.connection().await;
    let owners: Vec<_> = connection
        .active_members()
        .filter(|member| member.role == Role::Owner)
        .map(|member| member.user_id)
        .collect();
    assert_eq!(owners.len(), 1, "expected exactly one owner, got {:?}", owners);
    assert_eq!(connection.owner().map(|owner| owner.user_id), Some(owners[0]));
    owners[0]
}
