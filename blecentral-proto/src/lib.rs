//! blecentral protocol types
//!
//! Everything here is plain data shared by the connection manager, the radio
//! drivers and the host bridge: UUID canonicalization, the standard GATT
//! constants, and the JSON request/response envelope used by `blecentral bridge`.

pub mod bridge;
pub mod gatt;
pub mod uuids;

pub use bridge::{Request, Response, array_buffer, bytes_from_json};
pub use uuids::{UuidError, uuid_from_str, uuid_to_string};

pub use uuid::Uuid;
