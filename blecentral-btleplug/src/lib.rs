//! btleplug-backed radio for `blecentral-core`

mod advertising;
mod radio;

pub use radio::BtleplugRadio;
