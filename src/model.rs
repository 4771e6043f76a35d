use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::error::LocationError;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(UserId);
id_type!(ConnectionId);
id_type!(MarkId);

/// The two well-known location kinds a group can mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    Bus,
    Hotel,
}

impl LocationType {
    pub const ALL: [LocationType; 2] = [LocationType::Bus, LocationType::Hotel];

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::Bus => "bus",
            LocationType::Hotel => "hotel",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationType {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bus" => Ok(LocationType::Bus),
            "hotel" => Ok(LocationType::Hotel),
            other => Err(LocationError::InvalidInput(format!(
                "type must be bus or hotel (got '{}')",
                other
            ))),
        }
    }
}

/// Whose mark a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Personal,
    Group,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Personal => "personal",
            Scope::Group => "group",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which view `get_active` returns: the caller's own resolved view, or the
/// raw group marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewScope {
    #[default]
    #[serde(rename = "self")]
    Own,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Member => "member",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "member" => Ok(Role::Member),
            other => Err(anyhow::anyhow!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Left,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Active => "active",
            MemberStatus::Left => "left",
        }
    }
}

impl FromStr for MemberStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MemberStatus::Active),
            "left" => Ok(MemberStatus::Left),
            other => Err(anyhow::anyhow!("unknown member status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn validate(&self) -> Result<(), LocationError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(LocationError::InvalidInput(format!(
                "latitude must be between -90 and 90 (got {})",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(LocationError::InvalidInput(format!(
                "longitude must be between -180 and 180 (got {})",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Fields shared by every location kind.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceFields {
    pub name: String,
    pub coordinates: Coordinates,
    pub comment: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl PlaceFields {
    fn validate(&self) -> Result<(), LocationError> {
        if self.name.trim().is_empty() {
            return Err(LocationError::InvalidInput("name is required".to_string()));
        }
        self.coordinates.validate()
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotelFields {
    #[serde(flatten)]
    pub place: PlaceFields,
    pub room_number: Option<String>,
}

/// Location data, tagged by kind. Only hotels carry a room number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LocationPayload {
    Bus(PlaceFields),
    Hotel(HotelFields),
}

impl LocationPayload {
    pub fn location_type(&self) -> LocationType {
        match self {
            LocationPayload::Bus(_) => LocationType::Bus,
            LocationPayload::Hotel(_) => LocationType::Hotel,
        }
    }

    pub fn place(&self) -> &PlaceFields {
        match self {
            LocationPayload::Bus(place) => place,
            LocationPayload::Hotel(hotel) => &hotel.place,
        }
    }

    pub fn place_mut(&mut self) -> &mut PlaceFields {
        match self {
            LocationPayload::Bus(place) => place,
            LocationPayload::Hotel(hotel) => &mut hotel.place,
        }
    }

    pub fn room_number(&self) -> Option<&str> {
        match self {
            LocationPayload::Bus(_) => None,
            LocationPayload::Hotel(hotel) => hotel.room_number.as_deref(),
        }
    }

    pub fn validate(&self) -> Result<(), LocationError> {
        self.place().validate()
    }

    /// Checks the payload is well formed and of the expected kind.
    pub fn validate_for(&self, location_type: LocationType) -> Result<(), LocationError> {
        if self.location_type() != location_type {
            return Err(LocationError::InvalidInput(format!(
                "payload is a {} location but type {} was requested",
                self.location_type(),
                location_type
            )));
        }
        self.validate()
    }
}

/// Partial changes to the shared fields. `comment` distinguishes an absent
/// key (keep) from an explicit `null` (clear).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub comment: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl PlacePatch {
    fn validate(&self) -> Result<(), LocationError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(LocationError::InvalidInput("name cannot be empty".to_string()));
            }
        }
        if let Some(coordinates) = &self.coordinates {
            coordinates.validate()?;
        }
        Ok(())
    }

    fn apply(&self, place: &mut PlaceFields) {
        if let Some(name) = &self.name {
            place.name = name.clone();
        }
        if let Some(coordinates) = self.coordinates {
            place.coordinates = coordinates;
        }
        if let Some(comment) = &self.comment {
            place.comment = comment.clone();
        }
        if let Some(images) = &self.images {
            place.images = images.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotelPatch {
    #[serde(flatten)]
    pub place: PlacePatch,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub room_number: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LocationPatch {
    Bus(PlacePatch),
    Hotel(HotelPatch),
}

impl LocationPatch {
    pub fn location_type(&self) -> LocationType {
        match self {
            LocationPatch::Bus(_) => LocationType::Bus,
            LocationPatch::Hotel(_) => LocationType::Hotel,
        }
    }

    pub fn validate_for(&self, location_type: LocationType) -> Result<(), LocationError> {
        if self.location_type() != location_type {
            return Err(LocationError::InvalidInput(format!(
                "patch is for a {} location but type {} was requested",
                self.location_type(),
                location_type
            )));
        }
        match self {
            LocationPatch::Bus(place) => place.validate(),
            LocationPatch::Hotel(hotel) => hotel.place.validate(),
        }
    }

    pub fn apply_to(&self, payload: &mut LocationPayload) -> Result<(), LocationError> {
        match (self, payload) {
            (LocationPatch::Bus(patch), LocationPayload::Bus(place)) => {
                patch.apply(place);
                Ok(())
            }
            (LocationPatch::Hotel(patch), LocationPayload::Hotel(hotel)) => {
                patch.place.apply(&mut hotel.place);
                if let Some(room_number) = &patch.room_number {
                    hotel.room_number = room_number.clone();
                }
                Ok(())
            }
            (patch, payload) => Err(LocationError::InvalidInput(format!(
                "cannot apply a {} patch to a {} location",
                patch.location_type(),
                payload.location_type()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationMark {
    pub id: MarkId,
    pub payload: LocationPayload,
    pub marked_by: UserId,
    pub marked_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

impl LocationMark {
    pub fn new(payload: LocationPayload, marked_by: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: MarkId::new(),
            payload,
            marked_by,
            marked_at: now,
            updated_at: now,
            is_active: true,
        }
    }

    pub fn location_type(&self) -> LocationType {
        self.payload.location_type()
    }
}

/// One optional value per location type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSlots<T> {
    pub bus: Option<T>,
    pub hotel: Option<T>,
}

impl<T> Default for TypeSlots<T> {
    fn default() -> Self {
        Self { bus: None, hotel: None }
    }
}

impl<T> TypeSlots<T> {
    pub fn get(&self, location_type: LocationType) -> Option<&T> {
        match location_type {
            LocationType::Bus => self.bus.as_ref(),
            LocationType::Hotel => self.hotel.as_ref(),
        }
    }

    fn slot_mut(&mut self, location_type: LocationType) -> &mut Option<T> {
        match location_type {
            LocationType::Bus => &mut self.bus,
            LocationType::Hotel => &mut self.hotel,
        }
    }

    /// Replaces the slot, returning what was there.
    pub fn set(&mut self, location_type: LocationType, value: Option<T>) -> Option<T> {
        std::mem::replace(self.slot_mut(location_type), value)
    }

    pub fn is_empty(&self) -> bool {
        self.bus.is_none() && self.hotel.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: UserId,
    pub role: Role,
    pub status: MemberStatus,
}

impl Member {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self {
            user_id,
            role,
            status: MemberStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferChoice {
    /// Promote the new owner's personal mark to the group mark.
    Replace,
    /// Keep the current group mark, reassigning its provenance.
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChoices {
    pub bus: TransferChoice,
    pub hotel: TransferChoice,
}

impl TransferChoices {
    pub fn get(&self, location_type: LocationType) -> TransferChoice {
        match location_type {
            LocationType::Bus => self.bus,
            LocationType::Hotel => self.hotel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub from: UserId,
    pub to: UserId,
    pub choices: TransferChoices,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub members: Vec<Member>,
    #[serde(default)]
    pub group_locations: TypeSlots<LocationMark>,
    #[serde(default)]
    pub last_transfer: Option<TransferRecord>,
}

impl Connection {
    pub fn new(id: ConnectionId, members: Vec<Member>) -> Self {
        Self {
            id,
            members,
            group_locations: TypeSlots::default(),
            last_transfer: None,
        }
    }

    pub fn active_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|member| member.is_active())
    }

    pub fn active_member(&self, user_id: UserId) -> Option<&Member> {
        self.active_members().find(|member| member.user_id == user_id)
    }

    pub fn owner(&self) -> Option<&Member> {
        self.active_members().find(|member| member.role == Role::Owner)
    }

    pub fn role_of(&self, user_id: UserId) -> Option<Role> {
        self.active_member(user_id).map(|member| member.role)
    }

    /// Demotes `from` and promotes `to`. Both must be active, `from` must
    /// currently be the owner.
    pub fn swap_owner(&mut self, from: UserId, to: UserId) -> anyhow::Result<()> {
        if self.role_of(from) != Some(Role::Owner) {
            anyhow::bail!("user {} is not the owner of connection {}", from, self.id);
        }
        if self.active_member(to).is_none() {
            anyhow::bail!("user {} is not an active member of connection {}", to, self.id);
        }
        for member in self.members.iter_mut() {
            if member.user_id == from {
                member.role = Role::Member;
            } else if member.user_id == to {
                member.role = Role::Owner;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveSource {
    Personal,
    Group,
    Unmarked,
}

pub const UNMARKED_NAME: &str = "Unmarked";

/// The resolved view of one location type for one member.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveLocation {
    #[serde(rename = "type")]
    pub location_type: LocationType,
    pub name: String,
    pub coordinates: Option<Coordinates>,
    pub room_number: Option<String>,
    pub source: ActiveSource,
    pub origin_mark_id: Option<MarkId>,
}

impl ActiveLocation {
    pub fn unmarked(location_type: LocationType) -> Self {
        Self {
            location_type,
            name: UNMARKED_NAME.to_string(),
            coordinates: None,
            room_number: None,
            source: ActiveSource::Unmarked,
            origin_mark_id: None,
        }
    }

    pub fn from_mark(mark: &LocationMark, source: ActiveSource) -> Self {
        let place = mark.payload.place();
        Self {
            location_type: mark.location_type(),
            name: place.name.clone(),
            coordinates: Some(place.coordinates),
            room_number: mark.payload.room_number().map(str::to_string),
            source,
            origin_mark_id: Some(mark.id),
        }
    }

    pub fn is_marked(&self) -> bool {
        self.source != ActiveSource::Unmarked
    }
}

/// A cache entry: the resolved view plus where and when it was computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedLocation {
    pub connection_id: ConnectionId,
    #[serde(flatten)]
    pub location: ActiveLocation,
    pub last_updated: DateTime<Utc>,
}

impl CachedLocation {
    pub fn new(connection_id: ConnectionId, location: ActiveLocation, now: DateTime<Utc>) -> Self {
        Self {
            connection_id,
            location,
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveLocations {
    pub scope: ViewScope,
    pub role: Role,
    pub bus: CachedLocation,
    pub hotel: CachedLocation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hotel_payload() -> LocationPayload {
        LocationPayload::Hotel(HotelFields {
            place: PlaceFields {
                name: "Harbor Inn".to_string(),
                coordinates: Coordinates::new(35.1, 129.0),
                comment: Some("near the pier".to_string()),
                images: vec![],
            },
            room_number: Some("1204".to_string()),
        })
    }

    #[test]
    fn payload_uses_type_tag() {
        let payload: LocationPayload = serde_json::from_value(json!({
            "type": "hotel",
            "name": "Harbor Inn",
            "coordinates": { "latitude": 35.1, "longitude": 129.0 },
            "comment": "near the pier",
            "roomNumber": "1204"
        }))
        .unwrap();
        assert_eq!(payload, hotel_payload());

        let bus: LocationPayload = serde_json::from_value(json!({
            "type": "bus",
            "name": "Terminal 2",
            "coordinates": { "latitude": 35.0, "longitude": 129.1 }
        }))
        .unwrap();
        assert_eq!(bus.location_type(), LocationType::Bus);
        assert_eq!(bus.room_number(), None);
        assert!(bus.place().images.is_empty());
    }

    #[test]
    fn coordinates_out_of_range_are_rejected() {
        assert!(Coordinates::new(90.0, 180.0).validate().is_ok());
        assert!(Coordinates::new(-90.0, -180.0).validate().is_ok());
        assert!(matches!(
            Coordinates::new(90.5, 0.0).validate(),
            Err(LocationError::InvalidInput(_))
        ));
        assert!(matches!(
            Coordinates::new(0.0, -180.01).validate(),
            Err(LocationError::InvalidInput(_))
        ));
        assert!(Coordinates::new(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn payload_type_must_match_request() {
        let payload = hotel_payload();
        assert!(payload.validate_for(LocationType::Hotel).is_ok());
        assert!(matches!(
            payload.validate_for(LocationType::Bus),
            Err(LocationError::InvalidInput(_))
        ));
    }

    #[test]
    fn patch_keeps_absent_fields_and_clears_explicit_nulls() {
        let patch: LocationPatch = serde_json::from_value(json!({
            "type": "hotel",
            "name": "Harbor Inn Annex",
            "comment": null
        }))
        .unwrap();

        let mut payload = hotel_payload();
        patch.apply_to(&mut payload).unwrap();

        assert_eq!(payload.place().name, "Harbor Inn Annex");
        assert_eq!(payload.place().comment, None);
        assert_eq!(payload.place().coordinates, Coordinates::new(35.1, 129.0));
        assert_eq!(payload.room_number(), Some("1204"));
    }

    #[test]
    fn patch_of_other_kind_is_rejected() {
        let patch = LocationPatch::Bus(PlacePatch::default());
        let mut payload = hotel_payload();
        assert!(patch.apply_to(&mut payload).is_err());
        assert!(patch.validate_for(LocationType::Hotel).is_err());
    }

    #[test]
    fn swap_owner_flips_exactly_two_roles() {
        let owner = UserId::new();
        let member = UserId::new();
        let bystander = UserId::new();
        let mut connection = Connection::new(
            ConnectionId::new(),
            vec![
                Member::new(owner, Role::Owner),
                Member::new(member, Role::Member),
                Member::new(bystander, Role::Member),
            ],
        );

        connection.swap_owner(owner, member).unwrap();

        assert_eq!(connection.role_of(owner), Some(Role::Member));
        assert_eq!(connection.role_of(member), Some(Role::Owner));
        assert_eq!(connection.role_of(bystander), Some(Role::Member));
        assert!(connection.swap_owner(owner, bystander).is_err());
    }

    #[test]
    fn left_members_are_not_active() {
        let user = UserId::new();
        let mut member = Member::new(user, Role::Member);
        member.status = MemberStatus::Left;
        let connection = Connection::new(ConnectionId::new(), vec![member]);
        assert!(connection.active_member(user).is_none());
        assert_eq!(connection.role_of(user), None);
    }
}
