//! Named-command dispatcher for the host bridge
//!
//! Turns a [`Request`] into coordinator calls and streams [`Response`]s back.
//! Standing deliveries (scan results, notifications) carry `keep = true`; the
//! last response for a request always carries `keep = false`. [`serve`] runs
//! the newline-delimited JSON bridge over any reader and writer.

use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use blecentral_proto::gatt::actions;
use blecentral_proto::{Request, Response, bytes_from_json, uuid_from_str};

use crate::central::CentralHandle;
use crate::error::BleError;
use crate::marshal::{catalogue_json, info_json, notification_json, snapshot_json};
use crate::types::{DeviceAddress, WriteMode};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unrecognized command: {0}")]
    UnrecognizedCommand(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Ble(#[from] BleError),
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::UnrecognizedCommand(_) => "unrecognized_command",
            BridgeError::InvalidArguments(_) => "invalid_arguments",
            BridgeError::Ble(e) => e.code(),
        }
    }
}

/// Response channel for one request
struct Reply<'a> {
    id: u64,
    out: &'a mpsc::UnboundedSender<Response>,
}

impl Reply<'_> {
    /// Standing delivery; false once the host stopped listening
    fn keep(&self, data: JsonValue) -> bool {
        self.out.send(Response::keep(data).with_id(self.id)).is_ok()
    }

    fn ack(&self) -> bool {
        let response = Response { keep: true, ..Response::done() };
        self.out.send(response.with_id(self.id)).is_ok()
    }
}

fn address_arg(request: &Request, index: usize) -> Result<DeviceAddress, BridgeError> {
    request
        .arg_str(index)
        .map(DeviceAddress::new)
        .ok_or_else(|| BridgeError::InvalidArguments(format!("argument {index} must be a device address")))
}

fn uuid_arg(request: &Request, index: usize) -> Result<Uuid, BridgeError> {
    let raw = request
        .arg_str(index)
        .ok_or_else(|| BridgeError::InvalidArguments(format!("argument {index} must be a UUID")))?;
    uuid_from_str(raw).map_err(|e| BridgeError::InvalidArguments(e.to_string()))
}

fn bytes_arg(request: &Request, index: usize) -> Result<Vec<u8>, BridgeError> {
    request
        .arg(index)
        .and_then(bytes_from_json)
        .ok_or_else(|| BridgeError::InvalidArguments(format!("argument {index} must be binary data")))
}

/// Optional list of service UUIDs; absent means "no filter"
fn uuid_list_arg(request: &Request, index: usize) -> Result<Vec<Uuid>, BridgeError> {
    let Some(value) = request.arg(index) else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| BridgeError::InvalidArguments(format!("argument {index} must be a list of UUIDs")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .ok_or_else(|| BridgeError::InvalidArguments("service filter entries must be strings".into()))
                .and_then(|s| uuid_from_str(s).map_err(|e| BridgeError::InvalidArguments(e.to_string())))
        })
        .collect()
}

#[derive(Clone)]
pub struct Dispatcher {
    central: CentralHandle,
}

impl Dispatcher {
    pub fn new(central: CentralHandle) -> Self {
        Self { central }
    }

    /// Run one request to completion, sending every response to `out`
    pub async fn execute(&self, request: Request, out: mpsc::UnboundedSender<Response>) {
        let id = request.id;
        log::debug!("bridge request {} {}", id, request.cmd);
        let reply = Reply { id, out: &out };

        let response = match self.run(&request, &reply).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("bridge request {} {} failed: {}", id, request.cmd, e);
                Response::err(e.code(), e.to_string())
            }
        };
        let _ = out.send(response.with_id(id));
    }

    async fn run(&self, request: &Request, reply: &Reply<'_>) -> Result<Response, BridgeError> {
        match request.cmd.as_str() {
            actions::START_SCAN | actions::SCAN => {
                let services = uuid_list_arg(request, 0)?;
                let mut results = self.central.start_scan(services).await?;
                while let Some(snapshot) = results.recv().await {
                    if !reply.keep(snapshot_json(&snapshot)) {
                        break;
                    }
                }
                Ok(Response::done())
            }
            actions::STOP_SCAN => {
                self.central.stop_scan().await?;
                Ok(Response::done())
            }
            actions::CONNECT => {
                let address = address_arg(request, 0)?;
                let catalogue = self.central.connect(address).await?;
                Ok(Response::ok(catalogue_json(&catalogue)))
            }
            actions::DISCONNECT => {
                let address = address_arg(request, 0)?;
                self.central.disconnect(address).await?;
                Ok(Response::done())
            }
            actions::WRITE | actions::WRITE_WITHOUT_RESPONSE => {
                let mode = if request.cmd == actions::WRITE {
                    WriteMode::WithResponse
                } else {
                    WriteMode::WithoutResponse
                };
                let address = address_arg(request, 0)?;
                let service = uuid_arg(request, 1)?;
                let characteristic = uuid_arg(request, 2)?;
                let value = bytes_arg(request, 3)?;
                self.central
                    .write(address, service, characteristic, value, mode)
                    .await?;
                Ok(Response::done())
            }
            actions::READ => {
                let address = address_arg(request, 0)?;
                let service = uuid_arg(request, 1)?;
                let characteristic = uuid_arg(request, 2)?;
                let value = self.central.read(address, service, characteristic).await?;
                Ok(Response::ok(blecentral_proto::array_buffer(&value)))
            }
            actions::START_NOTIFICATION => {
                let address = address_arg(request, 0)?;
                let service = uuid_arg(request, 1)?;
                let characteristic = uuid_arg(request, 2)?;
                let mut notifications = self
                    .central
                    .subscribe(address, service, characteristic)
                    .await?;
                if !reply.ack() {
                    return Ok(Response::done());
                }
                while let Some(notification) = notifications.recv().await {
                    if !reply.keep(notification_json(&notification)) {
                        break;
                    }
                }
                Ok(Response::done())
            }
            actions::PERIPHERAL_INFO => {
                let address = address_arg(request, 0)?;
                let info = self.central.peripheral_info(address).await?;
                Ok(Response::ok(info.as_ref().map_or(JsonValue::Null, info_json)))
            }
            actions::ENABLE => Ok(Response::done()),
            other => Err(BridgeError::UnrecognizedCommand(other.to_string())),
        }
    }
}

/// Requests that stream until the host or the device ends them
fn is_standing(request: &Request) -> bool {
    matches!(request.cmd.as_str(), actions::START_SCAN | actions::SCAN | actions::START_NOTIFICATION)
}

/// Serve `Request` lines from `input`, writing `Response` lines to `output`.
///
/// Requests run concurrently and responses are written in completion order.
/// When `input` ends, the scan is stopped and scan and notification streams
/// get their final response. Other requests get `drain` to finish. Every
/// response is flushed before `output` is handed back.
pub async fn serve<R, W>(central: CentralHandle, input: R, output: W, drain: Duration) -> std::io::Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let dispatcher = Dispatcher::new(central.clone());
    let (out, mut responses) = mpsc::unbounded_channel::<Response>();
    let (closing_tx, closing) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(response) = responses.recv().await {
            let mut line = match serde_json::to_vec(&response) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("unserializable response {}: {}", response.id, e);
                    continue;
                }
            };
            line.push(b'\n');
            output.write_all(&line).await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(output)
    });

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        while tasks.try_join_next().is_some() {}
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("malformed request: {}", e);
                let _ = out.send(Response::err("invalid_request", e.to_string()));
                continue;
            }
        };
        let dispatcher = dispatcher.clone();
        let out = out.clone();
        if is_standing(&request) {
            let mut closing = closing.clone();
            tasks.spawn(async move {
                let id = request.id;
                tokio::select! {
                    biased;
                    _ = closing.wait_for(|closed| *closed) => {
                        let _ = out.send(Response::done().with_id(id));
                    }
                    _ = dispatcher.execute(request, out.clone()) => {}
                }
            });
        } else {
            tasks.spawn(async move { dispatcher.execute(request, out).await });
        }
    }

    log::info!("bridge input closed, finishing {} requests", tasks.len());
    let _ = closing_tx.send(true);
    if let Err(e) = central.stop_scan().await {
        log::warn!("stopping scan on exit failed: {}", e);
    }
    let drained = tokio::time::timeout(drain, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        log::warn!("{} bridge requests still running, abandoning them", tasks.len());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    drop(dispatcher);
    drop(out);
    writer.await.map_err(std::io::Error::other)?
}
