//! BLE GATT Service Constants for LinkedLamp Provisioning
//!
//! The lamp exposes a single provisioning service with one write-only
//! characteristic (app to device) and one notify-only characteristic
//! (device to app). Every protocol frame travels over those two.

use uuid::Uuid;

/// Provisioning service UUID: 6E400001-B5A3-F393-E0A9-E50E24DCCA9E
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// App to device characteristic (write)
pub const APP_TO_DEVICE_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Device to app characteristic (notify)
pub const DEVICE_TO_APP_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Advertised name prefix of lamps waiting for provisioning
pub const DEVICE_NAME_PREFIX: &str = "LinkedLamp_Caskev_";
