//! [`Radio`] implementation over btleplug
//!
//! Every request is turned into a spawned btleplug call whose outcome comes
//! back as a [`RadioEvent`]. btleplug failures carry no GATT status: a failure
//! that left the peripheral disconnected is reported as `GATT_ERROR`, any
//! other as `GATT_FAILURE`.
//!
//! btleplug 0.11 tags notifications with the characteristic UUID only, so two
//! characteristics sharing a UUID cannot both be subscribed on one session;
//! the second request is refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use btleplug::api::{
    Central as _, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{BoxStream, StreamExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use blecentral_core::{
    Advertisement, Capabilities, CharacteristicDescriptor, DeviceAddress, GattService, LinkState,
    NotifyKind, Radio, RadioError, RadioEvent, RadioEventReceiver, RadioEventSender,
    SessionHandle, WriteMode, event_channel,
};
use blecentral_proto::gatt::CLIENT_CHARACTERISTIC_CONFIGURATION_UUID;
use blecentral_proto::gatt::status::{GATT_ERROR, GATT_FAILURE, GATT_SUCCESS};

use crate::advertising;

struct Session {
    address: DeviceAddress,
    peripheral: Peripheral,
    /// Filled by service discovery; handles are assigned in discovery order
    characteristics: HashMap<u16, Characteristic>,
    /// Handles with notifications enabled
    subscribed: Vec<(u16, Uuid)>,
    notify_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    known: Mutex<HashMap<DeviceAddress, Peripheral>>,
    sessions: Mutex<HashMap<u64, Session>>,
    scanning: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct BtleplugRadio {
    adapter: Adapter,
    runtime: Handle,
    events: RadioEventSender,
    shared: Arc<Shared>,
    next_session: AtomicU64,
    event_pump: JoinHandle<()>,
}

impl BtleplugRadio {
    /// Open the `adapter_index`th adapter and start translating its events.
    /// Must be called from within a tokio runtime.
    pub async fn new(adapter_index: usize) -> Result<(Arc<Self>, RadioEventReceiver), RadioError> {
        let manager = Manager::new().await.map_err(rejected)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(rejected)?
            .into_iter()
            .nth(adapter_index)
            .ok_or(RadioError::NoAdapter)?;
        if let Ok(info) = adapter.adapter_info().await {
            log::info!("using adapter {}", info);
        }

        let shared = Arc::new(Shared::default());
        for peripheral in adapter.peripherals().await.map_err(rejected)? {
            let address = DeviceAddress::new(&peripheral.address().to_string());
            lock(&shared.known).insert(address, peripheral);
        }

        let central_events = adapter.events().await.map_err(rejected)?;
        let (events, rx) = event_channel();
        let event_pump = tokio::spawn(pump_central_events(
            adapter.clone(),
            central_events,
            shared.clone(),
            events.clone(),
        ));

        let radio = Arc::new(Self {
            adapter,
            runtime: Handle::current(),
            events,
            shared,
            next_session: AtomicU64::new(1),
            event_pump,
        });
        Ok((radio, rx))
    }

    fn session_peripheral(&self, session: &SessionHandle) -> Result<(DeviceAddress, Peripheral), RadioError> {
        let sessions = lock(&self.shared.sessions);
        let entry = sessions.get(&session.id()).ok_or(RadioError::UnknownSession)?;
        Ok((entry.address.clone(), entry.peripheral.clone()))
    }

    fn session_characteristic(
        &self,
        session: &SessionHandle,
        handle: u16,
    ) -> Result<(DeviceAddress, Peripheral, Characteristic), RadioError> {
        let sessions = lock(&self.shared.sessions);
        let entry = sessions.get(&session.id()).ok_or(RadioError::UnknownSession)?;
        let characteristic = entry
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or(RadioError::UnknownCharacteristic(handle))?;
        Ok((entry.address.clone(), entry.peripheral.clone(), characteristic))
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.event_pump.abort();
        for (_, session) in lock(&self.shared.sessions).drain() {
            if let Some(task) = session.notify_task {
                task.abort();
            }
        }
    }
}

fn rejected(e: btleplug::Error) -> RadioError {
    RadioError::Rejected(e.to_string())
}

fn emit(events: &RadioEventSender, event: RadioEvent) {
    if events.send(event).is_err() {
        log::trace!("radio event dropped, coordinator gone");
    }
}

/// Another handle already receives notifications tagged with `uuid`
fn uuid_taken(subscribed: &[(u16, Uuid)], handle: u16, uuid: Uuid) -> bool {
    subscribed.iter().any(|(h, u)| *h != handle && *u == uuid)
}

/// Status for a failed GATT operation, telling link loss from plain refusal
async fn failure_status(peripheral: &Peripheral) -> u16 {
    match peripheral.is_connected().await {
        Ok(true) => GATT_FAILURE,
        _ => GATT_ERROR,
    }
}

fn link(address: DeviceAddress, state: LinkState, status: u16) -> RadioEvent {
    RadioEvent::LinkStateChanged { address, state, status }
}

/// Services of a freshly discovered peripheral with handles assigned
fn catalogue(peripheral: &Peripheral) -> (Vec<GattService>, HashMap<u16, Characteristic>) {
    let mut next_handle = 1u16;
    let mut by_handle = HashMap::new();
    let services = peripheral
        .services()
        .into_iter()
        .map(|service| {
            let characteristics = service
                .characteristics
                .into_iter()
                .map(|characteristic| {
                    let handle = next_handle;
                    next_handle = next_handle.wrapping_add(1);
                    let descriptor = CharacteristicDescriptor {
                        service: service.uuid,
                        uuid: characteristic.uuid,
                        handle,
                        capabilities: Capabilities::from_bits(characteristic.properties.bits()),
                        // Not exposed by btleplug
                        permissions: 0,
                        descriptors: characteristic.descriptors.iter().map(|d| d.uuid).collect(),
                    };
                    by_handle.insert(handle, characteristic);
                    descriptor
                })
                .collect();
            GattService { uuid: service.uuid, characteristics }
        })
        .collect();
    (services, by_handle)
}

impl Radio for BtleplugRadio {
    fn request_connect(&self, address: &DeviceAddress) -> Result<SessionHandle, RadioError> {
        let peripheral = lock(&self.shared.known)
            .get(address)
            .cloned()
            .ok_or_else(|| RadioError::UnknownDevice(address.to_string()))?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.sessions).insert(
            id,
            Session {
                address: address.clone(),
                peripheral: peripheral.clone(),
                characteristics: HashMap::new(),
                subscribed: Vec::new(),
                notify_task: None,
            },
        );

        let events = self.events.clone();
        let address = address.clone();
        self.runtime.spawn(async move {
            emit(&events, link(address.clone(), LinkState::Connecting, GATT_SUCCESS));
            match peripheral.connect().await {
                Ok(()) => emit(&events, link(address, LinkState::Connected, GATT_SUCCESS)),
                Err(e) => {
                    log::warn!("{}: connect failed: {}", address, e);
                    emit(&events, link(address, LinkState::Disconnected, GATT_ERROR));
                }
            }
        });
        Ok(SessionHandle::new(id))
    }

    fn request_disconnect(&self, session: &SessionHandle) -> Result<(), RadioError> {
        let (address, peripheral) = self.session_peripheral(session)?;
        let events = self.events.clone();
        self.runtime.spawn(async move {
            emit(&events, link(address.clone(), LinkState::Disconnecting, GATT_SUCCESS));
            let status = match peripheral.disconnect().await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    log::warn!("{}: disconnect failed: {}", address, e);
                    GATT_ERROR
                }
            };
            emit(&events, link(address, LinkState::Disconnected, status));
        });
        Ok(())
    }

    fn request_service_discovery(&self, session: &SessionHandle) -> Result<(), RadioError> {
        let (address, peripheral) = self.session_peripheral(session)?;
        let events = self.events.clone();
        let shared = self.shared.clone();
        let id = session.id();
        self.runtime.spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let (services, by_handle) = catalogue(&peripheral);
                    if let Some(entry) = lock(&shared.sessions).get_mut(&id) {
                        entry.characteristics = by_handle;
                    }
                    Ok(services)
                }
                Err(e) => {
                    log::warn!("{}: service discovery failed: {}", address, e);
                    Err(failure_status(&peripheral).await)
                }
            };
            emit(&events, RadioEvent::ServicesDiscovered { address, result });
        });
        Ok(())
    }

    fn request_write(
        &self,
        session: &SessionHandle,
        handle: u16,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), RadioError> {
        let (address, peripheral, characteristic) = self.session_characteristic(session, handle)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        let value = value.to_vec();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let status = match peripheral.write(&characteristic, &value, write_type).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    log::warn!("{}: write to {} failed: {}", address, characteristic.uuid, e);
                    failure_status(&peripheral).await
                }
            };
            emit(&events, RadioEvent::WriteComplete { address, handle, status });
        });
        Ok(())
    }

    fn request_read(&self, session: &SessionHandle, handle: u16) -> Result<(), RadioError> {
        let (address, peripheral, characteristic) = self.session_characteristic(session, handle)?;
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let result = match peripheral.read(&characteristic).await {
                Ok(value) => Ok(value),
                Err(e) => {
                    log::warn!("{}: read of {} failed: {}", address, characteristic.uuid, e);
                    Err(failure_status(&peripheral).await)
                }
            };
            emit(&events, RadioEvent::ReadComplete { address, handle, result });
        });
        Ok(())
    }

    fn request_notify_enable(
        &self,
        session: &SessionHandle,
        handle: u16,
        kind: NotifyKind,
    ) -> Result<(), RadioError> {
        let (address, peripheral, characteristic) = self.session_characteristic(session, handle)?;
        let id = session.id();
        {
            let mut sessions = lock(&self.shared.sessions);
            let entry = sessions.get_mut(&id).ok_or(RadioError::UnknownSession)?;
            if uuid_taken(&entry.subscribed, handle, characteristic.uuid) {
                return Err(RadioError::Rejected(format!(
                    "{} is already subscribed through another characteristic",
                    characteristic.uuid
                )));
            }
            entry.subscribed.retain(|(h, _)| *h != handle);
            entry.subscribed.push((handle, characteristic.uuid));
        }
        let events = self.events.clone();
        let shared = self.shared.clone();
        // btleplug picks notify or indicate from the characteristic itself
        log::debug!("{}: enabling {:?} on handle {}", address, kind, handle);

        self.runtime.spawn(async move {
            let status = match enable_notifications(id, &peripheral, &characteristic, &shared, &events).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    log::warn!("{}: subscribe to {} failed: {}", address, characteristic.uuid, e);
                    if let Some(entry) = lock(&shared.sessions).get_mut(&id) {
                        entry.subscribed.retain(|(h, _)| *h != handle);
                    }
                    failure_status(&peripheral).await
                }
            };
            emit(&events, descriptor_written(address, handle, status));
        });
        Ok(())
    }

    fn request_scan_start(&self, services: &[Uuid]) -> Result<(), RadioError> {
        self.shared.scanning.store(true, Ordering::SeqCst);
        let adapter = self.adapter.clone();
        let filter = ScanFilter { services: services.to_vec() };
        self.runtime.spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                log::warn!("start scan failed: {}", e);
            }
        });
        Ok(())
    }

    fn request_scan_stop(&self) -> Result<(), RadioError> {
        self.shared.scanning.store(false, Ordering::SeqCst);
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                log::warn!("stop scan failed: {}", e);
            }
        });
        Ok(())
    }

    fn close(&self, session: SessionHandle) {
        if let Some(entry) = lock(&self.shared.sessions).remove(&session.id()) {
            log::debug!("{}: session {} closed", entry.address, session.id());
            if let Some(task) = entry.notify_task {
                task.abort();
            }
        }
    }
}

/// Start the session's notification pump if needed, then subscribe
async fn enable_notifications(
    id: u64,
    peripheral: &Peripheral,
    characteristic: &Characteristic,
    shared: &Arc<Shared>,
    events: &RadioEventSender,
) -> Result<(), btleplug::Error> {
    let needs_pump = lock(&shared.sessions).get(&id).is_some_and(|entry| entry.notify_task.is_none());
    if needs_pump {
        let stream = peripheral.notifications().await?;
        let task = tokio::spawn(pump_notifications(id, stream, shared.clone(), events.clone()));
        match lock(&shared.sessions).get_mut(&id) {
            Some(entry) if entry.notify_task.is_none() => entry.notify_task = Some(task),
            _ => task.abort(),
        }
    }
    peripheral.subscribe(characteristic).await
}

fn descriptor_written(address: DeviceAddress, handle: u16, status: u16) -> RadioEvent {
    RadioEvent::DescriptorWriteComplete {
        address,
        handle,
        descriptor: CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
        status,
    }
}

async fn pump_notifications(
    id: u64,
    mut stream: BoxStream<'static, ValueNotification>,
    shared: Arc<Shared>,
    events: RadioEventSender,
) {
    while let Some(notification) = stream.next().await {
        let routed = {
            let sessions = lock(&shared.sessions);
            sessions.get(&id).map(|entry| {
                let handle = entry
                    .subscribed
                    .iter()
                    .find(|(_, uuid)| *uuid == notification.uuid)
                    .map(|(h, _)| *h);
                (entry.address.clone(), handle)
            })
        };
        match routed {
            Some((address, Some(handle))) => emit(
                &events,
                RadioEvent::CharacteristicChanged { address, handle, value: notification.value },
            ),
            Some((address, None)) => {
                log::trace!("{}: notification for unsubscribed {}", address, notification.uuid);
            }
            None => break,
        }
    }
}

async fn address_of(adapter: &Adapter, id: &PeripheralId) -> Option<(DeviceAddress, Peripheral)> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let address = DeviceAddress::new(&peripheral.address().to_string());
    Some((address, peripheral))
}

async fn pump_central_events(
    adapter: Adapter,
    mut central_events: BoxStream<'static, CentralEvent>,
    shared: Arc<Shared>,
    events: RadioEventSender,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Some((address, peripheral)) = address_of(&adapter, &id).await else {
                    continue;
                };
                lock(&shared.known).insert(address.clone(), peripheral.clone());
                if !shared.scanning.load(Ordering::SeqCst) {
                    continue;
                }
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                emit(
                    &events,
                    RadioEvent::DeviceDiscovered(Advertisement {
                        address,
                        name: props.local_name.clone(),
                        rssi: props.rssi.unwrap_or(0),
                        payload: advertising::encode(&props),
                    }),
                );
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Some((address, _)) = address_of(&adapter, &id).await {
                    log::debug!("{}: adapter reports disconnect", address);
                    emit(&events, link(address, LinkState::Disconnected, GATT_SUCCESS));
                }
            }
            other => log::trace!("adapter event: {:?}", other),
        }
    }
    log::warn!("adapter event stream ended");
}
