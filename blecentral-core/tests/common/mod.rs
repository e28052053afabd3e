//! Scripted radio for driving the coordinator in tests
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use uuid::Uuid;

use blecentral_core::{
    Advertisement, Capabilities, Central, CentralConfig, CentralHandle, CharacteristicDescriptor,
    DeviceAddress, GattService, LinkState, NotifyKind, Radio, RadioError, RadioEvent,
    RadioEventSender, ServiceCatalogue, SessionHandle, WriteMode, event_channel,
};
use blecentral_proto::uuids::from_u16;

/// Every request the coordinator made, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(DeviceAddress),
    Disconnect(u64),
    DiscoverServices(u64),
    Write { session: u64, handle: u16, value: Vec<u8>, mode: WriteMode },
    Read { session: u64, handle: u16 },
    NotifyEnable { session: u64, handle: u16, cccd: [u8; 2] },
    ScanStart(Vec<Uuid>),
    ScanStop,
    Close(u64),
}

pub struct FakeRadio {
    calls: Mutex<Vec<Call>>,
    changed: Notify,
    events: RadioEventSender,
    next_session: AtomicU64,
    unknown: Mutex<HashSet<DeviceAddress>>,
    reject_discovery: AtomicBool,
}

impl FakeRadio {
    pub fn new(events: RadioEventSender) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            changed: Notify::new(),
            events,
            next_session: AtomicU64::new(1),
            unknown: Mutex::new(HashSet::new()),
            reject_discovery: AtomicBool::new(false),
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
        self.changed.notify_waiters();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    /// Wait until the coordinator has made the `nth` (1-based) matching call
    pub async fn wait_for_nth(&self, nth: usize, pred: impl Fn(&Call) -> bool) -> Call {
        loop {
            let changed = self.changed.notified();
            if let Some(call) = self.calls.lock().unwrap().iter().filter(|c| pred(c)).nth(nth - 1) {
                return call.clone();
            }
            changed.await;
        }
    }

    pub async fn wait_for(&self, pred: impl Fn(&Call) -> bool) -> Call {
        self.wait_for_nth(1, pred).await
    }

    pub fn forget(&self, address: &str) {
        self.unknown.lock().unwrap().insert(DeviceAddress::new(address));
    }

    pub fn reject_discovery(&self) {
        self.reject_discovery.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, event: RadioEvent) {
        self.events.send(event).unwrap();
    }

    pub fn link(&self, address: &str, state: LinkState) {
        self.emit(RadioEvent::LinkStateChanged { address: DeviceAddress::new(address), state, status: 0 });
    }

    pub fn services_discovered(&self, address: &str, services: Vec<GattService>) {
        self.emit(RadioEvent::ServicesDiscovered { address: DeviceAddress::new(address), result: Ok(services) });
    }

    pub fn advertise(&self, address: &str, rssi: i16) {
        self.emit(RadioEvent::DeviceDiscovered(Advertisement {
            address: DeviceAddress::new(address),
            name: None,
            rssi,
            payload: vec![0x02, 0x01, 0x06],
        }));
    }
}

impl Radio for FakeRadio {
    fn request_connect(&self, address: &DeviceAddress) -> Result<SessionHandle, RadioError> {
        if self.unknown.lock().unwrap().contains(address) {
            return Err(RadioError::UnknownDevice(address.to_string()));
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.record(Call::Connect(address.clone()));
        Ok(SessionHandle::new(id))
    }

    fn request_disconnect(&self, session: &SessionHandle) -> Result<(), RadioError> {
        self.record(Call::Disconnect(session.id()));
        Ok(())
    }

    fn request_service_discovery(&self, session: &SessionHandle) -> Result<(), RadioError> {
        if self.reject_discovery.load(Ordering::SeqCst) {
            return Err(RadioError::Rejected("discovery refused".into()));
        }
        self.record(Call::DiscoverServices(session.id()));
        Ok(())
    }

    fn request_write(
        &self,
        session: &SessionHandle,
        handle: u16,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), RadioError> {
        self.record(Call::Write { session: session.id(), handle, value: value.to_vec(), mode });
        Ok(())
    }

    fn request_read(&self, session: &SessionHandle, handle: u16) -> Result<(), RadioError> {
        self.record(Call::Read { session: session.id(), handle });
        Ok(())
    }

    fn request_notify_enable(
        &self,
        session: &SessionHandle,
        handle: u16,
        kind: NotifyKind,
    ) -> Result<(), RadioError> {
        self.record(Call::NotifyEnable { session: session.id(), handle, cccd: kind.cccd_value() });
        Ok(())
    }

    fn request_scan_start(&self, services: &[Uuid]) -> Result<(), RadioError> {
        self.record(Call::ScanStart(services.to_vec()));
        Ok(())
    }

    fn request_scan_stop(&self) -> Result<(), RadioError> {
        self.record(Call::ScanStop);
        Ok(())
    }

    fn close(&self, session: SessionHandle) {
        self.record(Call::Close(session.id()));
    }
}

pub const ADDR_A: &str = "AA:AA:AA:AA:AA:01";
pub const ADDR_B: &str = "BB:BB:BB:BB:BB:02";
pub const ADDR_C: &str = "CC:CC:CC:CC:CC:03";

pub fn start() -> (Arc<FakeRadio>, CentralHandle) {
    start_with(CentralConfig::default())
}

pub fn start_with(config: CentralConfig) -> (Arc<FakeRadio>, CentralHandle) {
    let (tx, rx) = event_channel();
    let radio = Arc::new(FakeRadio::new(tx));
    let central = Central::spawn(radio.clone(), rx, config);
    (radio, central)
}

pub fn characteristic(service: u16, uuid: u16, handle: u16, capabilities: Capabilities) -> CharacteristicDescriptor {
    CharacteristicDescriptor {
        service: from_u16(service),
        uuid: from_u16(uuid),
        handle,
        capabilities,
        permissions: 0,
        descriptors: vec![from_u16(0x2902)],
    }
}

pub fn service(uuid: u16, characteristics: Vec<CharacteristicDescriptor>) -> GattService {
    GattService { uuid: from_u16(uuid), characteristics }
}

/// S1 (0x180d) with C1 (0x2a37, Notify) and a writable 0x2a39
pub fn heart_rate() -> Vec<GattService> {
    vec![service(
        0x180d,
        vec![
            characteristic(0x180d, 0x2a37, 0x10, Capabilities::NOTIFY),
            characteristic(0x180d, 0x2a39, 0x20, Capabilities::WRITE | Capabilities::READ),
        ],
    )]
}

/// Walk a connect through link-established and service discovery
pub async fn connect_ready(
    radio: &FakeRadio,
    central: &CentralHandle,
    address: &str,
    services: Vec<GattService>,
) -> ServiceCatalogue {
    let task = tokio::spawn({
        let central = central.clone();
        let address = DeviceAddress::new(address);
        async move { central.connect(address).await }
    });
    let target = DeviceAddress::new(address);
    let connects = radio.count(|c| *c == Call::Connect(target.clone()));
    radio.wait_for_nth(connects + 1, |c| *c == Call::Connect(target.clone())).await;
    radio.link(address, LinkState::Connected);
    let discoveries = radio.count(|c| matches!(c, Call::DiscoverServices(_)));
    radio.wait_for_nth(discoveries + 1, |c| matches!(c, Call::DiscoverServices(_))).await;
    radio.services_discovered(address, services);
    task.await.unwrap().unwrap()
}
