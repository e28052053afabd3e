//! Rebuild a raw advertising payload from btleplug's parsed properties
//!
//! btleplug hands out the decoded fields only, while hosts expect the bytes
//! as they were on air. Each field becomes one AD structure:
//! `[length, type, data...]`.

use btleplug::api::PeripheralProperties;
use uuid::Uuid;

use blecentral_proto::uuids::as_u16;

const AD_INCOMPLETE_16: u8 = 0x02;
const AD_INCOMPLETE_128: u8 = 0x06;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0a;
const AD_SERVICE_DATA_16: u8 = 0x16;
const AD_SERVICE_DATA_128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xff;

fn push_structure(out: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    // Length byte covers the type byte too
    let len = data.len().min(usize::from(u8::MAX) - 1);
    out.push(len as u8 + 1);
    out.push(ad_type);
    out.extend_from_slice(&data[..len]);
}

fn uuid_128_le(uuid: &Uuid) -> [u8; 16] {
    uuid.as_u128().to_le_bytes()
}

pub fn encode(props: &PeripheralProperties) -> Vec<u8> {
    let mut out = Vec::new();

    if let Some(name) = &props.local_name {
        push_structure(&mut out, AD_COMPLETE_NAME, name.as_bytes());
    }
    if let Some(power) = props.tx_power_level {
        push_structure(&mut out, AD_TX_POWER, &[power as i8 as u8]);
    }

    let (short, long): (Vec<&Uuid>, Vec<&Uuid>) =
        props.services.iter().partition(|u| as_u16(u).is_some());
    if !short.is_empty() {
        let data: Vec<u8> = short
            .iter()
            .filter_map(|u| as_u16(u))
            .flat_map(u16::to_le_bytes)
            .collect();
        push_structure(&mut out, AD_INCOMPLETE_16, &data);
    }
    if !long.is_empty() {
        let data: Vec<u8> = long.iter().flat_map(|u| uuid_128_le(u)).collect();
        push_structure(&mut out, AD_INCOMPLETE_128, &data);
    }

    let mut service_data: Vec<_> = props.service_data.iter().collect();
    service_data.sort_by_key(|(uuid, _)| **uuid);
    for (uuid, value) in service_data {
        let mut data = Vec::with_capacity(16 + value.len());
        match as_u16(uuid) {
            Some(short) => {
                data.extend_from_slice(&short.to_le_bytes());
                data.extend_from_slice(value);
                push_structure(&mut out, AD_SERVICE_DATA_16, &data);
            }
            None => {
                data.extend_from_slice(&uuid_128_le(uuid));
                data.extend_from_slice(value);
                push_structure(&mut out, AD_SERVICE_DATA_128, &data);
            }
        }
    }

    let mut manufacturer: Vec<_> = props.manufacturer_data.iter().collect();
    manufacturer.sort_by_key(|(company, _)| **company);
    for (company, value) in manufacturer {
        let mut data = company.to_le_bytes().to_vec();
        data.extend_from_slice(value);
        push_structure(&mut out, AD_MANUFACTURER_DATA, &data);
    }

    out
}
