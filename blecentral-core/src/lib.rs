//! BLE central-role connection manager
//!
//! The [`central::Central`] coordinator owns one
//! [`peripheral::PeripheralConnection`] per address and serializes every
//! command and radio callback on a single task. Radio drivers plug in through
//! the [`radio::Radio`] trait and report outcomes as [`radio::RadioEvent`]s.

pub mod central;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod marshal;
pub mod matching;
pub mod peripheral;
pub mod pending;
pub mod radio;
pub mod types;

pub use central::{Central, CentralHandle};
pub use config::{CentralConfig, ConfigError};
pub use dispatch::{BridgeError, Dispatcher};
pub use error::{BleError, RadioError};
pub use radio::{
    LinkState, NotifyKind, Radio, RadioEvent, RadioEventReceiver, RadioEventSender, SessionHandle,
    event_channel,
};
pub use types::*;
