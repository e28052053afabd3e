//! GATT constants used verbatim on the wire, plus bridge action names

use uuid::Uuid;

use crate::uuids::from_u16;

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: Uuid = from_u16(0x2902);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// GATT operation status codes reported by radio drivers
pub mod status {
    pub const GATT_SUCCESS: u16 = 0;

    /// Generic stack error; in practice reported when the link is lost
    /// while an operation is in flight.
    pub const GATT_ERROR: u16 = 133;

    /// Operation refused or failed with the link still up
    pub const GATT_FAILURE: u16 = 0x101;
}

/// Host bridge action names
pub mod actions {
    pub const START_SCAN: &str = "startScan";
    pub const SCAN: &str = "scan";
    pub const STOP_SCAN: &str = "stopScan";
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const WRITE: &str = "write";
    pub const WRITE_WITHOUT_RESPONSE: &str = "writeWithoutResponse";
    pub const READ: &str = "read";
    /// Register for characteristic notifications
    pub const START_NOTIFICATION: &str = "startNotification";
    pub const ENABLE: &str = "enable";
    /// Connection state and reconnect count of one peripheral
    pub const PERIPHERAL_INFO: &str = "peripheralInfo";
}
