//! Characteristic resolution over a [`ServiceMap`]
//!
//! Peripherals may reuse a UUID for several characteristics in one service,
//! so lookups run two passes: first a match that also has the capability the
//! operation needs, then a UUID-only fallback.

use crate::radio::NotifyKind;
use crate::types::{
    Capabilities, CharacteristicDescriptor, CharacteristicId, ServiceId, ServiceMap, WriteMode,
};

fn candidates<'a>(
    services: &'a ServiceMap,
    service: &ServiceId,
    characteristic: CharacteristicId,
) -> impl Iterator<Item = &'a CharacteristicDescriptor> + Clone + use<'a> {
    services
        .service(service)
        .into_iter()
        .flat_map(|s| s.characteristics.iter())
        .filter(move |c| c.uuid == characteristic)
}

fn with_fallback<'a>(
    services: &'a ServiceMap,
    service: &ServiceId,
    characteristic: &CharacteristicId,
    wanted: Capabilities,
) -> Option<&'a CharacteristicDescriptor> {
    let mut matching = candidates(services, service, *characteristic);
    matching
        .clone()
        .find(|c| c.capabilities.contains(wanted))
        .or_else(|| matching.next())
}

pub fn find_writable<'a>(
    services: &'a ServiceMap,
    service: &ServiceId,
    characteristic: &CharacteristicId,
    mode: WriteMode,
) -> Option<&'a CharacteristicDescriptor> {
    with_fallback(services, service, characteristic, mode.required_capability())
}

pub fn find_readable<'a>(
    services: &'a ServiceMap,
    service: &ServiceId,
    characteristic: &CharacteristicId,
) -> Option<&'a CharacteristicDescriptor> {
    with_fallback(services, service, characteristic, Capabilities::READ)
}

/// Notify wins over Indicate; first-declared wins among equals.
/// No UUID-only fallback: a characteristic that can do neither is not a match.
pub fn find_notifiable<'a>(
    services: &'a ServiceMap,
    service: &ServiceId,
    characteristic: &CharacteristicId,
) -> Option<(&'a CharacteristicDescriptor, NotifyKind)> {
    let matching = candidates(services, service, *characteristic);
    matching
        .clone()
        .find(|c| c.capabilities.contains(Capabilities::NOTIFY))
        .map(|c| (c, NotifyKind::Notification))
        .or_else(|| {
            matching
                .clone()
                .find(|c| c.capabilities.contains(Capabilities::INDICATE))
                .map(|c| (c, NotifyKind::Indication))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GattService;
    use blecentral_proto::uuids::from_u16;

    fn ch(uuid: u16, handle: u16, caps: Capabilities) -> CharacteristicDescriptor {
        CharacteristicDescriptor {
            service: from_u16(0x180d),
            uuid: from_u16(uuid),
            handle,
            capabilities: caps,
            permissions: 0,
            descriptors: Vec::new(),
        }
    }

    fn map(chars: Vec<CharacteristicDescriptor>) -> ServiceMap {
        ServiceMap::new(vec![GattService { uuid: from_u16(0x180d), characteristics: chars }])
    }

    #[test]
    fn write_prefers_capability_then_falls_back() {
        let services = map(vec![
            ch(0x2a39, 1, Capabilities::READ),
            ch(0x2a39, 2, Capabilities::WRITE),
        ]);
        let id = from_u16(0x2a39);

        let hit = find_writable(&services, &from_u16(0x180d), &id, WriteMode::WithResponse);
        assert_eq!(hit.map(|c| c.handle), Some(2));

        // Nothing advertises WriteWithoutResponse; first UUID match wins
        let hit = find_writable(&services, &from_u16(0x180d), &id, WriteMode::WithoutResponse);
        assert_eq!(hit.map(|c| c.handle), Some(1));
    }

    #[test]
    fn unknown_uuid_or_service_is_none() {
        let services = map(vec![ch(0x2a39, 1, Capabilities::WRITE)]);
        let id = from_u16(0x2a37);
        assert!(find_writable(&services, &from_u16(0x180d), &id, WriteMode::WithResponse).is_none());

        let id = from_u16(0x2a39);
        assert!(find_readable(&services, &from_u16(0x180f), &id).is_none());
    }

    #[test]
    fn notify_beats_indicate_regardless_of_order() {
        let services = map(vec![
            ch(0x2a37, 1, Capabilities::INDICATE),
            ch(0x2a37, 2, Capabilities::NOTIFY),
            ch(0x2a37, 3, Capabilities::NOTIFY),
        ]);
        let (c, kind) = find_notifiable(&services, &from_u16(0x180d), &from_u16(0x2a37)).unwrap();
        assert_eq!((c.handle, kind), (2, NotifyKind::Notification));

        let services = map(vec![ch(0x2a37, 7, Capabilities::INDICATE | Capabilities::READ)]);
        let (c, kind) = find_notifiable(&services, &from_u16(0x180d), &from_u16(0x2a37)).unwrap();
        assert_eq!((c.handle, kind), (7, NotifyKind::Indication));
    }

    #[test]
    fn notify_needs_a_capable_characteristic() {
        let services = map(vec![ch(0x2a37, 1, Capabilities::READ | Capabilities::WRITE)]);
        assert!(find_notifiable(&services, &from_u16(0x180d), &from_u16(0x2a37)).is_none());
    }
}
