//! Radio driver capability consumed by the coordinator
//!
//! Requests are fire-and-forget: a driver either rejects a request right away
//! with a [`RadioError`] or accepts it and later reports the outcome as a
//! [`RadioEvent`] on the channel returned by [`event_channel`].

use tokio::sync::mpsc;
use uuid::Uuid;

use blecentral_proto::gatt::{ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE};

use crate::error::RadioError;
use crate::types::{Advertisement, DeviceAddress, GattService, WriteMode};

/// Radio-level session with one peripheral.
///
/// Deliberately neither `Clone` nor `Copy`: [`Radio::close`] consumes it, so a
/// session is released at most once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Which client characteristic configuration value to write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Notification,
    Indication,
}

impl NotifyKind {
    pub fn cccd_value(self) -> [u8; 2] {
        match self {
            NotifyKind::Notification => ENABLE_NOTIFICATION_VALUE,
            NotifyKind::Indication => ENABLE_INDICATION_VALUE,
        }
    }
}

/// Everything a driver reports back. GATT status codes pass through
/// uninterpreted; `0` is success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    LinkStateChanged {
        address: DeviceAddress,
        state: LinkState,
        status: u16,
    },
    ServicesDiscovered {
        address: DeviceAddress,
        result: Result<Vec<GattService>, u16>,
    },
    WriteComplete {
        address: DeviceAddress,
        handle: u16,
        status: u16,
    },
    ReadComplete {
        address: DeviceAddress,
        handle: u16,
        result: Result<Vec<u8>, u16>,
    },
    DescriptorWriteComplete {
        address: DeviceAddress,
        handle: u16,
        descriptor: Uuid,
        status: u16,
    },
    CharacteristicChanged {
        address: DeviceAddress,
        handle: u16,
        value: Vec<u8>,
    },
    DeviceDiscovered(Advertisement),
}

impl RadioEvent {
    /// Peripheral the event concerns, if any
    pub fn address(&self) -> &DeviceAddress {
        match self {
            RadioEvent::LinkStateChanged { address, .. }
            | RadioEvent::ServicesDiscovered { address, .. }
            | RadioEvent::WriteComplete { address, .. }
            | RadioEvent::ReadComplete { address, .. }
            | RadioEvent::DescriptorWriteComplete { address, .. }
            | RadioEvent::CharacteristicChanged { address, .. } => address,
            RadioEvent::DeviceDiscovered(adv) => &adv.address,
        }
    }
}

pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;
pub type RadioEventReceiver = mpsc::UnboundedReceiver<RadioEvent>;

pub fn event_channel() -> (RadioEventSender, RadioEventReceiver) {
    mpsc::unbounded_channel()
}

/// Radio driver. Calls must not block; outcomes arrive as [`RadioEvent`]s.
pub trait Radio: Send + Sync {
    fn request_connect(&self, address: &DeviceAddress) -> Result<SessionHandle, RadioError>;

    fn request_disconnect(&self, session: &SessionHandle) -> Result<(), RadioError>;

    fn request_service_discovery(&self, session: &SessionHandle) -> Result<(), RadioError>;

    fn request_write(
        &self,
        session: &SessionHandle,
        handle: u16,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), RadioError>;

    fn request_read(&self, session: &SessionHandle, handle: u16) -> Result<(), RadioError>;

    /// Enable local delivery for `handle` and write `kind.cccd_value()` to its
    /// client characteristic configuration descriptor.
    fn request_notify_enable(
        &self,
        session: &SessionHandle,
        handle: u16,
        kind: NotifyKind,
    ) -> Result<(), RadioError>;

    fn request_scan_start(&self, services: &[Uuid]) -> Result<(), RadioError>;

    fn request_scan_stop(&self) -> Result<(), RadioError>;

    /// Release everything held for the session
    fn close(&self, session: SessionHandle);
}
