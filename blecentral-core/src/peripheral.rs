//! Per-peripheral connection state machine
//!
//! A [`PeripheralConnection`] gives every radio callback an unambiguous
//! meaning based on the current [`ConnectionState`] and guarantees that each
//! command it accepts is resolved exactly once, including when the link drops
//! mid-operation. It never reads the clock: a lost link yields
//! [`Effect::ArmSettleTimer`] and the owner calls [`PeripheralConnection::settle`]
//! when the timer fires.

use std::collections::HashMap;

use tokio::sync::mpsc;

use blecentral_proto::gatt::status::{GATT_ERROR, GATT_SUCCESS};
use blecentral_proto::uuid_to_string;

use crate::error::{BleError, RadioError};
use crate::matching::{find_notifiable, find_readable, find_writable};
use crate::pending::{
    CommandResult, NotifyRoute, OperationKind, PendingOperation, PendingSubscribe, ResultSink,
};
use crate::radio::{LinkState, Radio, RadioEvent, SessionHandle};
use crate::types::{
    AdvertisementSnapshot, CharacteristicId, CommandOutput, ConnectionState, DeviceAddress,
    GattService, Notification, PeripheralInfo, ServiceCatalogue, ServiceId, ServiceMap, WriteMode,
};

/// Side effect requested from the owner after handling an input
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Call `settle()` once the disconnect settling delay has elapsed
    ArmSettleTimer,
}

pub struct PeripheralConnection {
    address: DeviceAddress,
    /// Distinguishes this instance from earlier ones for the same address
    instance: u64,
    state: ConnectionState,
    session: Option<SessionHandle>,
    services: ServiceMap,
    /// Connect, Disconnect, Write or Read; at most one at a time
    pending: Option<PendingOperation>,
    /// Subscribe awaiting its descriptor write
    subscribe: Option<PendingSubscribe>,
    /// Failed subscribes pushed out of the command slot by a disconnect
    lost_subscribes: Vec<ResultSink>,
    /// Standing notification routes keyed by characteristic handle
    routes: HashMap<u16, NotifyRoute>,
    expect_disconnect: bool,
    reconnect_attempts: u32,
    /// Link lost, waiting for the settle timer
    settling: bool,
    advertisement: Option<AdvertisementSnapshot>,
}

impl PeripheralConnection {
    pub fn new(address: DeviceAddress, instance: u64, reconnect_attempts: u32) -> Self {
        Self {
            address,
            instance,
            state: ConnectionState::Idle,
            session: None,
            services: ServiceMap::default(),
            pending: None,
            subscribe: None,
            lost_subscribes: Vec::new(),
            routes: HashMap::new(),
            expect_disconnect: false,
            reconnect_attempts,
            settling: false,
            advertisement: None,
        }
    }

    /// Most recent scan snapshot, reported back in the connect catalogue
    pub fn with_advertisement(mut self, snapshot: Option<AdvertisementSnapshot>) -> Self {
        self.advertisement = snapshot;
        self
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn services(&self) -> &ServiceMap {
        &self.services
    }

    pub fn expects_disconnect(&self) -> bool {
        self.expect_disconnect
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_settling(&self) -> bool {
        self.settling
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Nothing outstanding and no radio session: safe to discard
    pub fn is_dormant(&self) -> bool {
        self.session.is_none()
            && self.pending.is_none()
            && self.subscribe.is_none()
            && self.lost_subscribes.is_empty()
    }

    pub fn has_pending_command(&self) -> bool {
        self.pending.is_some()
    }

    pub fn info(&self) -> PeripheralInfo {
        PeripheralInfo {
            address: self.address.clone(),
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            subscriptions: self.routes.len(),
        }
    }

    pub fn catalogue(&self) -> ServiceCatalogue {
        let adv = self.advertisement.as_ref();
        ServiceCatalogue {
            address: self.address.clone(),
            name: adv.and_then(|a| a.name.clone()),
            rssi: adv.map(|a| a.rssi),
            advertising: adv.map(|a| a.payload.clone()).unwrap_or_default(),
            services: self.services.clone(),
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("{}: {:?} -> {:?}", self.address, self.state, next);
            self.state = next;
        }
    }

    fn take_pending(&mut self, kind: OperationKind, handle: Option<u16>) -> Option<PendingOperation> {
        self.pending
            .take_if(|op| op.kind == kind && (handle.is_none() || op.handle == handle))
    }

    fn resolve_pending(&mut self, kind: OperationKind, handle: Option<u16>, result: CommandResult) {
        match self.take_pending(kind, handle) {
            Some(mut op) => {
                if let Err(e) = &result {
                    log::warn!("{}: {:?} failed: {}", self.address, kind, e);
                }
                op.sink.resolve(result);
            }
            None => log::debug!("{}: no pending {:?} for completion, ignoring", self.address, kind),
        }
    }

    fn check_ready(&self) -> Result<(), BleError> {
        if self.session.is_some() && self.state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(BleError::NotConnected)
        }
    }

    /// Issue a request on the current session
    fn on_session<F>(&self, radio: &dyn Radio, request: F) -> Result<(), RadioError>
    where
        F: FnOnce(&dyn Radio, &SessionHandle) -> Result<(), RadioError>,
    {
        match &self.session {
            Some(session) => request(radio, session),
            None => Err(RadioError::UnknownSession),
        }
    }

    fn not_found(service: &ServiceId, characteristic: &CharacteristicId) -> BleError {
        BleError::CharacteristicNotFound {
            service: uuid_to_string(service),
            characteristic: uuid_to_string(characteristic),
        }
    }

    pub fn connect(&mut self, radio: &dyn Radio, mut sink: ResultSink) {
        if self.state != ConnectionState::Idle || self.pending.is_some() {
            sink.resolve(Err(BleError::OperationInProgress));
            return;
        }
        self.expect_disconnect = false;

        log::info!("{}: connecting ({} previous unexpected drops)", self.address, self.reconnect_attempts);
        match radio.request_connect(&self.address) {
            Ok(session) => {
                self.session = Some(session);
                self.pending = Some(PendingOperation::new(OperationKind::Connect, sink));
                self.transition(ConnectionState::Connecting);
            }
            Err(e) => {
                let err = BleError::from(e);
                log::warn!("{}: connect rejected: {}", self.address, err);
                sink.resolve(Err(err));
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    pub fn write(
        &mut self,
        radio: &dyn Radio,
        service: &ServiceId,
        characteristic: &CharacteristicId,
        value: &[u8],
        mode: WriteMode,
        mut sink: ResultSink,
    ) {
        if self.pending.is_some() {
            sink.resolve(Err(BleError::OperationInProgress));
            return;
        }
        if let Err(e) = self.check_ready() {
            sink.resolve(Err(e));
            return;
        }
        self.expect_disconnect = false;

        let Some(handle) = find_writable(&self.services, service, characteristic, mode).map(|c| c.handle)
        else {
            sink.resolve(Err(Self::not_found(service, characteristic)));
            return;
        };

        log::info!("{}: write {} bytes to {} ({:?})", self.address, value.len(), uuid_to_string(characteristic), mode);
        self.pending = Some(PendingOperation::on_handle(OperationKind::Write, handle, sink));
        if let Err(e) = self.on_session(radio, |r, s| r.request_write(s, handle, value, mode)) {
            self.resolve_pending(OperationKind::Write, Some(handle), Err(e.into()));
        }
    }

    pub fn read(
        &mut self,
        radio: &dyn Radio,
        service: &ServiceId,
        characteristic: &CharacteristicId,
        mut sink: ResultSink,
    ) {
        if self.pending.is_some() {
            sink.resolve(Err(BleError::OperationInProgress));
            return;
        }
        if let Err(e) = self.check_ready() {
            sink.resolve(Err(e));
            return;
        }
        self.expect_disconnect = false;

        let Some(handle) = find_readable(&self.services, service, characteristic).map(|c| c.handle) else {
            sink.resolve(Err(Self::not_found(service, characteristic)));
            return;
        };

        log::info!("{}: read {}", self.address, uuid_to_string(characteristic));
        self.pending = Some(PendingOperation::on_handle(OperationKind::Read, handle, sink));
        if let Err(e) = self.on_session(radio, |r, s| r.request_read(s, handle)) {
            self.resolve_pending(OperationKind::Read, Some(handle), Err(e.into()));
        }
    }

    /// Register a standing notification route, then enable notifications on
    /// the peripheral. Resolves with the stream once the descriptor write
    /// succeeds.
    pub fn subscribe(
        &mut self,
        radio: &dyn Radio,
        service: &ServiceId,
        characteristic: &CharacteristicId,
        mut sink: ResultSink,
    ) {
        if self.subscribe.is_some() {
            sink.resolve(Err(BleError::OperationInProgress));
            return;
        }
        if let Err(e) = self.check_ready() {
            sink.resolve(Err(e));
            return;
        }
        self.expect_disconnect = false;

        let Some((handle, kind)) =
            find_notifiable(&self.services, service, characteristic).map(|(c, kind)| (c.handle, kind))
        else {
            sink.resolve(Err(Self::not_found(service, characteristic)));
            return;
        };

        log::info!("{}: subscribe to {} ({:?})", self.address, uuid_to_string(characteristic), kind);
        let (tx, rx) = mpsc::unbounded_channel();
        if self.routes.insert(handle, tx).is_some() {
            log::debug!("{}: replacing existing route for handle {}", self.address, handle);
        }
        self.subscribe = Some(PendingSubscribe { handle, sink, stream: Some(rx) });

        if let Err(e) = self.on_session(radio, |r, s| r.request_notify_enable(s, handle, kind)) {
            self.routes.remove(&handle);
            if let Some(mut sub) = self.subscribe.take() {
                log::warn!("{}: enabling notifications rejected: {}", self.address, e);
                sub.sink.resolve(Err(e.into()));
            }
        }
    }

    pub fn disconnect(&mut self, radio: &dyn Radio, mut sink: ResultSink) -> Effect {
        match self.pending.take() {
            Some(op) if op.kind == OperationKind::Subscribe => {
                log::debug!("{}: disconnect takes over the slot of a failed subscribe", self.address);
                self.lost_subscribes.push(op.sink);
            }
            Some(op) => {
                self.pending = Some(op);
                sink.resolve(Err(BleError::OperationInProgress));
                return Effect::None;
            }
            None => {}
        }
        self.expect_disconnect = true;

        let Some(session) = &self.session else {
            log::debug!("{}: disconnect without a session, nothing to do", self.address);
            sink.resolve(Ok(CommandOutput::Empty));
            if !self.settling {
                self.transition(ConnectionState::Disconnected);
            }
            return Effect::None;
        };

        log::info!("{}: disconnecting", self.address);
        match radio.request_disconnect(session) {
            Ok(()) => {
                self.pending = Some(PendingOperation::new(OperationKind::Disconnect, sink));
                self.transition(ConnectionState::Disconnecting);
            }
            Err(e) => {
                log::warn!("{}: disconnect rejected: {}", self.address, e);
                let err = BleError::from(e);
                for mut lost in self.lost_subscribes.drain(..) {
                    lost.resolve(Err(err.clone()));
                }
                sink.resolve(Err(err));
            }
        }
        Effect::None
    }

    /// Self-initiated disconnect with nothing pending
    fn teardown(&mut self, radio: &dyn Radio) -> Effect {
        self.expect_disconnect = true;
        let Some(session) = &self.session else {
            return Effect::None;
        };
        match radio.request_disconnect(session) {
            Ok(()) => {
                self.transition(ConnectionState::Disconnecting);
                Effect::None
            }
            Err(e) => {
                log::warn!("{}: teardown disconnect rejected ({}), releasing session", self.address, e);
                self.link_lost(radio)
            }
        }
    }

    /// Release the session once and start settling
    fn link_lost(&mut self, radio: &dyn Radio) -> Effect {
        if self.settling {
            log::trace!("{}: duplicate disconnect while settling", self.address);
            return Effect::None;
        }
        let Some(session) = self.session.take() else {
            log::debug!("{}: disconnect without a session, ignoring", self.address);
            return Effect::None;
        };
        radio.close(session);
        self.settling = true;
        Effect::ArmSettleTimer
    }

    /// Conclude a lost link after the settling delay.
    ///
    /// Resolves the outstanding command and every unfinished subscribe, ends
    /// every standing notification stream and returns whether the drop was
    /// unexpected. An unfinished subscribe never succeeds: it fails with
    /// `UnexpectedDisconnect`, or `NotConnected` if the disconnect was
    /// requested.
    pub fn settle(&mut self) -> bool {
        self.settling = false;
        let unexpected = !self.expect_disconnect;
        let subscribe_outcome = || -> CommandResult {
            if unexpected {
                Err(BleError::UnexpectedDisconnect)
            } else {
                Err(BleError::NotConnected)
            }
        };

        let mut resolved = 0;
        if let Some(mut op) = self.pending.take() {
            log::debug!("{}: resolving {:?} after disconnect", self.address, op.kind);
            let result = match op.kind {
                OperationKind::Subscribe => subscribe_outcome(),
                _ if unexpected => Err(BleError::UnexpectedDisconnect),
                _ => Ok(CommandOutput::Empty),
            };
            op.sink.resolve(result);
            resolved += 1;
        }
        if let Some(mut sub) = self.subscribe.take() {
            sub.sink.resolve(subscribe_outcome());
            resolved += 1;
        }
        for mut sink in self.lost_subscribes.drain(..) {
            sink.resolve(subscribe_outcome());
            resolved += 1;
        }
        if resolved == 0 {
            log::debug!("{}: disconnected with nothing outstanding", self.address);
        }
        if unexpected {
            self.reconnect_attempts += 1;
            log::warn!("{}: link lost unexpectedly ({} in a row)", self.address, self.reconnect_attempts);
        }

        self.routes.clear();
        self.services = ServiceMap::default();
        self.transition(ConnectionState::Disconnected);
        unexpected
    }

    /// Coordinator is going away: fail everything outstanding and release
    /// the session.
    pub fn shutdown(&mut self, radio: &dyn Radio) {
        if let Some(mut op) = self.pending.take() {
            op.sink.resolve(Err(BleError::CoordinatorStopped));
        }
        if let Some(mut sub) = self.subscribe.take() {
            sub.sink.resolve(Err(BleError::CoordinatorStopped));
        }
        for mut sink in self.lost_subscribes.drain(..) {
            sink.resolve(Err(BleError::CoordinatorStopped));
        }
        self.routes.clear();
        if let Some(session) = self.session.take() {
            if let Err(e) = radio.request_disconnect(&session) {
                log::debug!("{}: disconnect on shutdown failed: {}", self.address, e);
            }
            radio.close(session);
        }
        self.services = ServiceMap::default();
        self.transition(ConnectionState::Disconnected);
    }

    /// Interpret one radio event for this peripheral
    pub fn handle_event(&mut self, radio: &dyn Radio, event: RadioEvent) -> Effect {
        match event {
            RadioEvent::LinkStateChanged { state, status, .. } => self.on_link_state(radio, state, status),
            RadioEvent::ServicesDiscovered { result, .. } => self.on_services(radio, result),
            RadioEvent::WriteComplete { handle, status, .. } => {
                let result = if status == GATT_SUCCESS {
                    Ok(CommandOutput::Empty)
                } else {
                    Err(BleError::WriteFailed(status))
                };
                self.resolve_pending(OperationKind::Write, Some(handle), result);
                Effect::None
            }
            RadioEvent::ReadComplete { handle, result, .. } => {
                let result = result.map(CommandOutput::Value).map_err(BleError::ReadFailed);
                self.resolve_pending(OperationKind::Read, Some(handle), result);
                Effect::None
            }
            RadioEvent::DescriptorWriteComplete { handle, status, .. } => {
                self.on_descriptor_write(handle, status);
                Effect::None
            }
            RadioEvent::CharacteristicChanged { handle, value, .. } => {
                self.on_value_changed(handle, value);
                Effect::None
            }
            RadioEvent::DeviceDiscovered(_) => Effect::None,
        }
    }

    fn on_link_state(&mut self, radio: &dyn Radio, state: LinkState, status: u16) -> Effect {
        match state {
            LinkState::Connected => {
                if self.state != ConnectionState::Connecting || self.session.is_none() {
                    log::debug!("{}: link established in {:?}, ignoring", self.address, self.state);
                    return Effect::None;
                }
                let requested = match &self.session {
                    Some(session) => radio.request_service_discovery(session),
                    None => return Effect::None,
                };
                match requested {
                    Ok(()) => {
                        self.transition(ConnectionState::DiscoveringServices);
                        Effect::None
                    }
                    Err(e) => {
                        log::warn!("{}: service discovery rejected: {}", self.address, e);
                        self.resolve_pending(OperationKind::Connect, None, Err(BleError::ServiceDiscoveryError));
                        self.teardown(radio)
                    }
                }
            }
            LinkState::Disconnected => {
                log::info!("{}: link down (status {})", self.address, status);
                self.link_lost(radio)
            }
            LinkState::Connecting | LinkState::Disconnecting => {
                log::debug!("{}: link {:?}", self.address, state);
                Effect::None
            }
        }
    }

    fn on_services(&mut self, radio: &dyn Radio, result: Result<Vec<GattService>, u16>) -> Effect {
        if self.state != ConnectionState::DiscoveringServices {
            log::debug!("{}: services reported in {:?}, ignoring", self.address, self.state);
            return Effect::None;
        }
        match result {
            Ok(services) => {
                self.services = ServiceMap::new(services);
                self.reconnect_attempts = 0;
                self.transition(ConnectionState::Ready);
                let catalogue = self.catalogue();
                self.resolve_pending(OperationKind::Connect, None, Ok(CommandOutput::Catalogue(catalogue)));
                Effect::None
            }
            Err(status) => {
                log::warn!("{}: service discovery failed with status {}", self.address, status);
                self.resolve_pending(OperationKind::Connect, None, Err(BleError::ServiceDiscoveryError));
                self.teardown(radio)
            }
        }
    }

    fn on_descriptor_write(&mut self, handle: u16, status: u16) {
        let Some(mut sub) = self.subscribe.take_if(|s| s.handle == handle) else {
            log::debug!("{}: descriptor write on {} with no pending subscribe", self.address, handle);
            return;
        };

        match status {
            GATT_SUCCESS => {
                let result = match sub.stream.take() {
                    Some(stream) => Ok(CommandOutput::Notifications(stream)),
                    None => Err(BleError::Internal("notification stream already handed out".into())),
                };
                sub.sink.resolve(result);
            }
            GATT_ERROR => {
                // Link is going away; let the disconnect resolve the subscribe
                log::warn!("{}: descriptor write failed with {}, awaiting disconnect", self.address, status);
                self.routes.remove(&handle);
                if self.pending.is_none() {
                    self.pending = Some(PendingOperation::new(OperationKind::Subscribe, sub.sink));
                } else {
                    self.subscribe = Some(sub);
                }
            }
            code => {
                log::warn!("{}: enabling notifications failed with {}", self.address, code);
                self.routes.remove(&handle);
                sub.sink.resolve(Err(BleError::SubscribeFailed(code)));
            }
        }
    }

    fn on_value_changed(&mut self, handle: u16, value: Vec<u8>) {
        if self.state != ConnectionState::Ready {
            log::trace!("{}: value change in {:?}, dropped", self.address, self.state);
            return;
        }
        let Some(route) = self.routes.get(&handle) else {
            log::trace!("{}: value change on unsubscribed handle {}", self.address, handle);
            return;
        };
        let Some(descriptor) = self.services.by_handle(handle) else {
            return;
        };
        let notification = Notification {
            service: descriptor.service,
            characteristic: descriptor.uuid,
            value,
        };
        if route.send(notification).is_err() {
            log::debug!("{}: subscriber for handle {} went away", self.address, handle);
            self.routes.remove(&handle);
        }
    }
}
