//! Error taxonomy
//!
//! Every command resolves exactly once with either a success payload or a
//! [`BleError`]. None of these are fatal to the coordinator.

/// Classified command failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BleError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("service discovery failed")]
    ServiceDiscoveryError,
    #[error("characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: String, characteristic: String },
    #[error("write failed with GATT status {0}")]
    WriteFailed(u16),
    #[error("read failed with GATT status {0}")]
    ReadFailed(u16),
    #[error("enabling notifications failed with GATT status {0}")]
    SubscribeFailed(u16),
    #[error("peripheral disconnected unexpectedly")]
    UnexpectedDisconnect,
    #[error("another operation is already in progress")]
    OperationInProgress,
    #[error("not connected")]
    NotConnected,
    #[error("radio rejected the request: {0}")]
    Radio(String),
    #[error("coordinator is no longer running")]
    CoordinatorStopped,
    #[error("internal error: {0}")]
    Internal(String),
}

impl BleError {
    /// Stable machine-readable code for bridge responses
    pub fn code(&self) -> &'static str {
        match self {
            BleError::DeviceNotFound(_) => "device_not_found",
            BleError::ServiceDiscoveryError => "service_discovery_error",
            BleError::CharacteristicNotFound { .. } => "characteristic_not_found",
            BleError::WriteFailed(_) => "write_failed",
            BleError::ReadFailed(_) => "read_failed",
            BleError::SubscribeFailed(_) => "subscribe_failed",
            BleError::UnexpectedDisconnect => "unexpected_disconnect",
            BleError::OperationInProgress => "operation_in_progress",
            BleError::NotConnected => "not_connected",
            BleError::Radio(_) => "radio_error",
            BleError::CoordinatorStopped => "coordinator_stopped",
            BleError::Internal(_) => "internal_error",
        }
    }
}

/// Synchronous rejection of a request by a radio driver
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("no such session")]
    UnknownSession,
    #[error("no such characteristic handle {0}")]
    UnknownCharacteristic(u16),
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("{0}")]
    Rejected(String),
}

impl From<RadioError> for BleError {
    fn from(e: RadioError) -> Self {
        match e {
            RadioError::UnknownDevice(address) => BleError::DeviceNotFound(address),
            other => BleError::Radio(other.to_string()),
        }
    }
}
