//! Picks the active location a member sees for one location type.
//!
//! Owners always follow the group mark. Members see their personal mark when
//! they have one, the group mark otherwise, and `Unmarked` when neither exists.
//! Timestamps never take part in the decision.

use crate::model::{ActiveLocation, ActiveSource, LocationMark, LocationType, Role, TypeSlots};

pub fn resolve(
    location_type: LocationType,
    role: Role,
    personal: Option<&LocationMark>,
    group: Option<&LocationMark>,
) -> ActiveLocation {
    let chosen = match role {
        Role::Owner => group.map(|mark| (mark, ActiveSource::Group)),
        Role::Member => personal
            .map(|mark| (mark, ActiveSource::Personal))
            .or_else(|| group.map(|mark| (mark, ActiveSource::Group))),
    };

    match chosen {
        Some((mark, source)) => ActiveLocation::from_mark(mark, source),
        None => ActiveLocation::unmarked(location_type),
    }
}

/// Resolves both location types at once.
pub fn resolve_all(
    role: Role,
    personal: Option<&TypeSlots<LocationMark>>,
    group: &TypeSlots<LocationMark>,
) -> TypeSlots<ActiveLocation> {
    let mut resolved = TypeSlots::default();
    for location_type in LocationType::ALL {
        let personal_mark = personal.and_then(|slots| slots.get(location_type));
        resolved.set(
            location_type,
            Some(resolve(location_type, role, personal_mark, group.get(location_type))),
        );
    }
    resolved
}
