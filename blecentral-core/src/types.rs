//! Data model shared by the state machine, the coordinator and radio drivers

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Platform identifier of a physical peripheral (MAC-like).
///
/// Normalized to upper case so `aa:bb:..` and `AA:BB:..` correlate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: &str) -> Self {
        Self(address.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

pub type ServiceId = Uuid;
pub type CharacteristicId = Uuid;

/// Characteristic property bits, same values as the GATT properties field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const BROADCAST: Capabilities = Capabilities(0x01);
    pub const READ: Capabilities = Capabilities(0x02);
    pub const WRITE_NO_RESPONSE: Capabilities = Capabilities(0x04);
    pub const WRITE: Capabilities = Capabilities(0x08);
    pub const NOTIFY: Capabilities = Capabilities(0x10);
    pub const INDICATE: Capabilities = Capabilities(0x20);
    pub const SIGNED_WRITE: Capabilities = Capabilities(0x40);
    pub const EXTENDED_PROPERTIES: Capabilities = Capabilities(0x80);

    const NAMES: [(Capabilities, &'static str); 8] = [
        (Self::BROADCAST, "Broadcast"),
        (Self::READ, "Read"),
        (Self::WRITE_NO_RESPONSE, "WriteWithoutResponse"),
        (Self::WRITE, "Write"),
        (Self::NOTIFY, "Notify"),
        (Self::INDICATE, "Indicate"),
        (Self::SIGNED_WRITE, "AuthenticatedSignedWrites"),
        (Self::EXTENDED_PROPERTIES, "ExtendedProperties"),
    ];

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Capabilities(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self {
        Capabilities(self.0 | rhs.0)
    }
}

/// Attribute permission bits as reported by the platform stack
pub fn permission_names(permissions: u16) -> Vec<&'static str> {
    const NAMES: [(u16, &str); 8] = [
        (0x0001, "Read"),
        (0x0002, "ReadEncrypted"),
        (0x0004, "ReadEncryptedMITM"),
        (0x0010, "Write"),
        (0x0020, "WriteEncrypted"),
        (0x0040, "WriteEncryptedMITM"),
        (0x0080, "WriteSigned"),
        (0x0100, "WriteSignedMITM"),
    ];
    NAMES
        .iter()
        .filter(|(bit, _)| permissions & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// A discovered characteristic. `handle` distinguishes characteristics
/// that share a UUID inside one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub service: ServiceId,
    pub uuid: CharacteristicId,
    pub handle: u16,
    pub capabilities: Capabilities,
    pub permissions: u16,
    pub descriptors: Vec<Uuid>,
}

/// One service with its characteristics in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: ServiceId,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

/// Services of a connected peripheral, in discovery order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMap {
    services: Vec<GattService>,
}

impl ServiceMap {
    pub fn new(services: Vec<GattService>) -> Self {
        Self { services }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    /// First service with this UUID
    pub fn service(&self, uuid: &ServiceId) -> Option<&GattService> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &CharacteristicDescriptor> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    pub fn by_handle(&self, handle: u16) -> Option<&CharacteristicDescriptor> {
        self.characteristics().find(|c| c.handle == handle)
    }
}

/// Immutable record of one advertisement report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementSnapshot {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub payload: Vec<u8>,
    /// Logical discovery sequence number, increasing per coordinator
    pub discovered_at: u64,
}

/// What a radio driver reports for a discovered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub payload: Vec<u8>,
}

/// Success payload of a connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCatalogue {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertising: Vec<u8>,
    pub services: ServiceMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl WriteMode {
    /// Capability a characteristic should advertise for this mode
    pub fn required_capability(self) -> Capabilities {
        match self {
            WriteMode::WithResponse => Capabilities::WRITE,
            WriteMode::WithoutResponse => Capabilities::WRITE_NO_RESPONSE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnecting,
    Disconnected,
}

/// A characteristic value change delivered on a standing subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub service: ServiceId,
    pub characteristic: CharacteristicId,
    pub value: Vec<u8>,
}

/// Standing delivery of notifications; ends when the peripheral disconnects
pub type NotificationStream = mpsc::UnboundedReceiver<Notification>;

/// Standing delivery of scan results; ends when the scan is stopped
pub type ScanStream = mpsc::UnboundedReceiver<AdvertisementSnapshot>;

/// Success payload of any command
#[derive(Debug)]
pub enum CommandOutput {
    Empty,
    Catalogue(ServiceCatalogue),
    Value(Vec<u8>),
    Notifications(NotificationStream),
}

/// Point-in-time view of one tracked peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub address: DeviceAddress,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub subscriptions: usize,
}
