//! JSON views of core types for the host bridge and the CLI

use serde_json::{Map, Value as JsonValue, json};

use blecentral_proto::{array_buffer, uuid_to_string};

use crate::types::{
    AdvertisementSnapshot, CharacteristicDescriptor, Notification, PeripheralInfo,
    ServiceCatalogue, permission_names,
};

/// `{name, id, advertising, rssi}`
pub fn snapshot_json(snapshot: &AdvertisementSnapshot) -> JsonValue {
    json!({
        "name": snapshot.name,
        "id": snapshot.address.as_str(),
        "advertising": array_buffer(&snapshot.payload),
        "rssi": snapshot.rssi,
    })
}

fn characteristic_json(characteristic: &CharacteristicDescriptor) -> JsonValue {
    let mut obj = Map::new();
    obj.insert("service".into(), json!(uuid_to_string(&characteristic.service)));
    obj.insert("characteristic".into(), json!(uuid_to_string(&characteristic.uuid)));
    obj.insert("properties".into(), json!(characteristic.capabilities.names()));
    if characteristic.permissions > 0 {
        obj.insert("permissions".into(), json!(permission_names(characteristic.permissions)));
    }
    if !characteristic.descriptors.is_empty() {
        let descriptors: Vec<JsonValue> = characteristic
            .descriptors
            .iter()
            .map(|d| json!({ "uuid": uuid_to_string(d) }))
            .collect();
        obj.insert("descriptors".into(), JsonValue::Array(descriptors));
    }
    JsonValue::Object(obj)
}

/// Connect result: the snapshot fields plus `services` and `characteristics`
pub fn catalogue_json(catalogue: &ServiceCatalogue) -> JsonValue {
    let services: Vec<String> = catalogue
        .services
        .services()
        .iter()
        .map(|s| uuid_to_string(&s.uuid))
        .collect();
    let characteristics: Vec<JsonValue> = catalogue
        .services
        .characteristics()
        .map(characteristic_json)
        .collect();

    json!({
        "name": catalogue.name,
        "id": catalogue.address.as_str(),
        "advertising": array_buffer(&catalogue.advertising),
        "rssi": catalogue.rssi,
        "services": services,
        "characteristics": characteristics,
    })
}

pub fn notification_json(notification: &Notification) -> JsonValue {
    array_buffer(&notification.value)
}

pub fn info_json(info: &PeripheralInfo) -> JsonValue {
    json!({
        "id": info.address.as_str(),
        "state": format!("{:?}", info.state),
        "reconnectAttempts": info.reconnect_attempts,
        "subscriptions": info.subscriptions,
    })
}
