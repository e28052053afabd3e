//! Central coordinator
//!
//! A single task owns every [`PeripheralConnection`], the scan session and
//! the settle timers. Callers talk to it through a cloneable
//! [`CentralHandle`]; radio drivers feed it [`RadioEvent`]s. All state
//! transitions happen on that one task, so a radio callback can never race a
//! caller-issued command.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::CentralConfig;
use crate::error::BleError;
use crate::peripheral::{Effect, PeripheralConnection};
use crate::pending::{CommandResult, ResultSink};
use crate::radio::{Radio, RadioEvent, RadioEventReceiver};
use crate::types::{
    Advertisement, AdvertisementSnapshot, CharacteristicId, CommandOutput, ConnectionState,
    DeviceAddress, NotificationStream, PeripheralInfo, ScanStream, ServiceCatalogue, ServiceId,
    WriteMode,
};

/// Messages accepted by the coordinator task
#[derive(Debug)]
enum Command {
    StartScan {
        services: Vec<Uuid>,
        reply: oneshot::Sender<Result<ScanStream, BleError>>,
    },
    StopScan {
        sink: ResultSink,
    },
    Connect {
        address: DeviceAddress,
        sink: ResultSink,
    },
    Disconnect {
        address: DeviceAddress,
        sink: ResultSink,
    },
    Write {
        address: DeviceAddress,
        service: ServiceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        mode: WriteMode,
        sink: ResultSink,
    },
    Read {
        address: DeviceAddress,
        service: ServiceId,
        characteristic: CharacteristicId,
        sink: ResultSink,
    },
    Subscribe {
        address: DeviceAddress,
        service: ServiceId,
        characteristic: CharacteristicId,
        sink: ResultSink,
    },
    Info {
        address: DeviceAddress,
        reply: oneshot::Sender<Option<PeripheralInfo>>,
    },
}

fn unexpected_output(output: CommandOutput) -> BleError {
    BleError::Internal(format!("unexpected command output: {output:?}"))
}

/// Cloneable front door to the coordinator task
#[derive(Clone, Debug)]
pub struct CentralHandle {
    tx: mpsc::Sender<Command>,
}

impl CentralHandle {
    async fn submit(&self, build: impl FnOnce(ResultSink) -> Command) -> CommandResult {
        let (sink, rx) = ResultSink::new();
        self.tx
            .send(build(sink))
            .await
            .map_err(|_| BleError::CoordinatorStopped)?;
        rx.await.map_err(|_| BleError::CoordinatorStopped)?
    }

    async fn submit_empty(&self, build: impl FnOnce(ResultSink) -> Command) -> Result<(), BleError> {
        match self.submit(build).await? {
            CommandOutput::Empty => Ok(()),
            other => Err(unexpected_output(other)),
        }
    }

    /// Start a continuous scan. An empty filter falls back to the configured
    /// default services. Starting again replaces the previous stream.
    pub async fn start_scan(&self, services: Vec<Uuid>) -> Result<ScanStream, BleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StartScan { services, reply })
            .await
            .map_err(|_| BleError::CoordinatorStopped)?;
        rx.await.map_err(|_| BleError::CoordinatorStopped)?
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.submit_empty(|sink| Command::StopScan { sink }).await
    }

    pub async fn connect(&self, address: DeviceAddress) -> Result<ServiceCatalogue, BleError> {
        match self.submit(|sink| Command::Connect { address, sink }).await? {
            CommandOutput::Catalogue(catalogue) => Ok(catalogue),
            other => Err(unexpected_output(other)),
        }
    }

    pub async fn disconnect(&self, address: DeviceAddress) -> Result<(), BleError> {
        self.submit_empty(|sink| Command::Disconnect { address, sink }).await
    }

    pub async fn write(
        &self,
        address: DeviceAddress,
        service: ServiceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        mode: WriteMode,
    ) -> Result<(), BleError> {
        self.submit_empty(|sink| Command::Write {
            address,
            service,
            characteristic,
            value,
            mode,
            sink,
        })
        .await
    }

    pub async fn read(
        &self,
        address: DeviceAddress,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, BleError> {
        let output = self
            .submit(|sink| Command::Read { address, service, characteristic, sink })
            .await?;
        match output {
            CommandOutput::Value(value) => Ok(value),
            other => Err(unexpected_output(other)),
        }
    }

    /// Resolves once notifications are enabled; the stream then yields every
    /// value change until the peripheral disconnects.
    pub async fn subscribe(
        &self,
        address: DeviceAddress,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<NotificationStream, BleError> {
        let output = self
            .submit(|sink| Command::Subscribe { address, service, characteristic, sink })
            .await?;
        match output {
            CommandOutput::Notifications(stream) => Ok(stream),
            other => Err(unexpected_output(other)),
        }
    }

    pub async fn peripheral_info(&self, address: DeviceAddress) -> Result<Option<PeripheralInfo>, BleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Info { address, reply })
            .await
            .map_err(|_| BleError::CoordinatorStopped)?;
        rx.await.map_err(|_| BleError::CoordinatorStopped)
    }
}

/// Coordinator task state
pub struct Central {
    radio: Arc<dyn Radio>,
    config: CentralConfig,
    default_scan_services: Vec<Uuid>,
    commands: mpsc::Receiver<Command>,
    events: RadioEventReceiver,
    events_open: bool,
    peripherals: HashMap<DeviceAddress, PeripheralConnection>,
    /// Standing delivery for the active scan, if any
    scan: Option<mpsc::UnboundedSender<AdvertisementSnapshot>>,
    last_seen: HashMap<DeviceAddress, AdvertisementSnapshot>,
    /// Consecutive unexpected drops per address, carried across instances
    reconnects: HashMap<DeviceAddress, u32>,
    sequence: u64,
    next_instance: u64,
    settle_tx: mpsc::UnboundedSender<(DeviceAddress, u64)>,
    settle_rx: mpsc::UnboundedReceiver<(DeviceAddress, u64)>,
}

impl Central {
    pub fn new(
        radio: Arc<dyn Radio>,
        events: RadioEventReceiver,
        config: CentralConfig,
    ) -> (Self, CentralHandle) {
        let (tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        let default_scan_services = config.scan_services().unwrap_or_else(|e| {
            log::warn!("ignoring default scan services: {}", e);
            Vec::new()
        });

        let central = Self {
            radio,
            config,
            default_scan_services,
            commands,
            events,
            events_open: true,
            peripherals: HashMap::new(),
            scan: None,
            last_seen: HashMap::new(),
            reconnects: HashMap::new(),
            sequence: 0,
            next_instance: 1,
            settle_tx,
            settle_rx,
        };
        (central, CentralHandle { tx })
    }

    /// Run the coordinator on the current tokio runtime
    pub fn spawn(
        radio: Arc<dyn Radio>,
        events: RadioEventReceiver,
        config: CentralConfig,
    ) -> CentralHandle {
        let (central, handle) = Self::new(radio, events, config);
        tokio::spawn(central.run());
        handle
    }

    /// Serve until every [`CentralHandle`] is dropped
    pub async fn run(mut self) {
        log::debug!("central coordinator started (settle delay {:?})", self.config.settle_delay());
        loop {
            tokio::select! {
                biased;

                // Settle timers first so a late callback never jumps ahead
                Some((address, instance)) = self.settle_rx.recv() => {
                    self.on_settle(address, instance);
                }

                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.on_radio_event(event),
                    None => {
                        log::warn!("radio event stream closed");
                        self.events_open = false;
                    }
                },

                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        log::debug!("central coordinator stopping");
        if self.scan.take().is_some() {
            if let Err(e) = self.radio.request_scan_stop() {
                log::debug!("stopping scan on shutdown failed: {}", e);
            }
        }
        for (_, mut peripheral) in self.peripherals.drain() {
            peripheral.shutdown(self.radio.as_ref());
        }
    }

    fn arm_settle_timer(&self, address: DeviceAddress, instance: u64) {
        let delay = self.config.settle_delay();
        let tx = self.settle_tx.clone();
        log::debug!("{}: settling for {:?}", address, delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send((address, instance));
        });
    }

    fn apply(&self, address: &DeviceAddress, instance: u64, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::ArmSettleTimer => self.arm_settle_timer(address.clone(), instance),
        }
    }

    fn on_settle(&mut self, address: DeviceAddress, instance: u64) {
        let Some(peripheral) = self.peripherals.get_mut(&address) else {
            log::trace!("{}: settle timer for a discarded connection", address);
            return;
        };
        if peripheral.instance() != instance || !peripheral.is_settling() {
            log::trace!("{}: stale settle timer", address);
            return;
        }
        peripheral.settle();
        self.reconnects.insert(address.clone(), peripheral.reconnect_attempts());
        self.peripherals.remove(&address);
    }

    /// Drop an entry that ended without ever holding a session
    fn prune(&mut self, address: &DeviceAddress) {
        let finished = self
            .peripherals
            .get(address)
            .is_some_and(|p| p.state() == ConnectionState::Disconnected && p.is_dormant());
        if finished {
            self.peripherals.remove(address);
        }
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        if let RadioEvent::DeviceDiscovered(advertisement) = event {
            self.on_discovered(advertisement);
            return;
        }

        let address = event.address().clone();
        let Some(peripheral) = self.peripherals.get_mut(&address) else {
            log::trace!("{}: event for untracked peripheral: {:?}", address, event);
            return;
        };
        let effect = peripheral.handle_event(self.radio.as_ref(), event);
        let instance = peripheral.instance();
        self.apply(&address, instance, effect);
    }

    /// Keep the latest snapshot per address, bounded by the configured cache
    fn remember(&mut self, snapshot: AdvertisementSnapshot) {
        let limit = self.config.advertisement_cache;
        if limit == 0 {
            return;
        }
        if !self.last_seen.contains_key(&snapshot.address) && self.last_seen.len() >= limit {
            let oldest = self
                .last_seen
                .values()
                .min_by_key(|s| s.discovered_at)
                .map(|s| s.address.clone());
            if let Some(oldest) = oldest {
                log::trace!("{}: evicting cached advertisement", oldest);
                self.last_seen.remove(&oldest);
            }
        }
        self.last_seen.insert(snapshot.address.clone(), snapshot);
    }

    fn on_discovered(&mut self, advertisement: Advertisement) {
        self.sequence += 1;
        let snapshot = AdvertisementSnapshot {
            address: advertisement.address,
            name: advertisement.name,
            rssi: advertisement.rssi,
            payload: advertisement.payload,
            discovered_at: self.sequence,
        };
        self.remember(snapshot.clone());

        let Some(scan) = &self.scan else {
            log::trace!("{}: discovered with no active scan", snapshot.address);
            return;
        };
        if scan.send(snapshot).is_err() {
            log::debug!("scan receiver dropped, stopping scan");
            self.scan = None;
            if let Err(e) = self.radio.request_scan_stop() {
                log::warn!("stopping scan failed: {}", e);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::StartScan { services, reply } => {
                let _ = reply.send(self.start_scan(services));
            }
            Command::StopScan { mut sink } => {
                self.stop_scan();
                sink.resolve(Ok(CommandOutput::Empty));
            }
            Command::Connect { address, sink } => self.connect(address, sink),
            Command::Disconnect { address, mut sink } => {
                let Some(peripheral) = self.peripherals.get_mut(&address) else {
                    log::debug!("{}: disconnect for untracked peripheral", address);
                    sink.resolve(Ok(CommandOutput::Empty));
                    return;
                };
                let effect = peripheral.disconnect(self.radio.as_ref(), sink);
                let instance = peripheral.instance();
                self.apply(&address, instance, effect);
                self.prune(&address);
            }
            Command::Write { address, service, characteristic, value, mode, mut sink } => {
                match self.peripherals.get_mut(&address) {
                    Some(p) => p.write(self.radio.as_ref(), &service, &characteristic, &value, mode, sink),
                    None => {
                        sink.resolve(Err(BleError::NotConnected));
                    }
                }
            }
            Command::Read { address, service, characteristic, mut sink } => {
                match self.peripherals.get_mut(&address) {
                    Some(p) => p.read(self.radio.as_ref(), &service, &characteristic, sink),
                    None => {
                        sink.resolve(Err(BleError::NotConnected));
                    }
                }
            }
            Command::Subscribe { address, service, characteristic, mut sink } => {
                match self.peripherals.get_mut(&address) {
                    Some(p) => p.subscribe(self.radio.as_ref(), &service, &characteristic, sink),
                    None => {
                        sink.resolve(Err(BleError::NotConnected));
                    }
                }
            }
            Command::Info { address, reply } => {
                let info = match self.peripherals.get(&address) {
                    Some(p) => Some(p.info()),
                    None => self.reconnects.get(&address).map(|&attempts| PeripheralInfo {
                        address: address.clone(),
                        state: ConnectionState::Disconnected,
                        reconnect_attempts: attempts,
                        subscriptions: 0,
                    }),
                };
                let _ = reply.send(info);
            }
        }
    }

    fn start_scan(&mut self, services: Vec<Uuid>) -> Result<ScanStream, BleError> {
        let services = if services.is_empty() {
            self.default_scan_services.clone()
        } else {
            services
        };

        if self.scan.take().is_some() {
            log::debug!("restarting scan, previous stream ends");
            if let Err(e) = self.radio.request_scan_stop() {
                log::debug!("stopping previous scan failed: {}", e);
            }
        }

        log::info!("starting scan ({} service filters)", services.len());
        self.radio.request_scan_start(&services).map_err(|e| {
            log::warn!("scan rejected: {}", e);
            BleError::from(e)
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.scan = Some(tx);
        Ok(rx)
    }

    fn stop_scan(&mut self) {
        if self.scan.take().is_none() {
            log::debug!("stop scan with no active scan");
            return;
        }
        log::info!("stopping scan");
        if let Err(e) = self.radio.request_scan_stop() {
            log::warn!("stopping scan failed: {}", e);
        }
    }

    fn connect(&mut self, address: DeviceAddress, mut sink: ResultSink) {
        if let Some(existing) = self.peripherals.get_mut(&address) {
            if existing.state() == ConnectionState::Ready && existing.has_session() {
                log::debug!("{}: already connected", address);
                sink.resolve(Ok(CommandOutput::Catalogue(existing.catalogue())));
                return;
            }
            if !existing.is_dormant() {
                sink.resolve(Err(BleError::OperationInProgress));
                return;
            }
            // Settling or finished: conclude it and start a fresh instance
            if existing.is_settling() {
                existing.settle();
            }
            self.reconnects.insert(address.clone(), existing.reconnect_attempts());
            self.peripherals.remove(&address);
        }

        let instance = self.next_instance;
        self.next_instance += 1;
        let attempts = self.reconnects.get(&address).copied().unwrap_or(0);
        let mut peripheral = PeripheralConnection::new(address.clone(), instance, attempts)
            .with_advertisement(self.last_seen.get(&address).cloned());
        peripheral.connect(self.radio.as_ref(), sink);
        self.peripherals.insert(address.clone(), peripheral);
        self.prune(&address);
    }
}
