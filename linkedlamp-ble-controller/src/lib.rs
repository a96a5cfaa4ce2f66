//! LinkedLamp BLE Controller
//!
//! BLE central side of LinkedLamp provisioning: find a lamp, read the WiFi
//! networks it can see, and hand it group and WiFi credentials.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use linkedlamp_ble_controller::{BtleplugAdapter, ProvisioningClient, ProvisioningConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let client = ProvisioningClient::new(adapter, ProvisioningConfig::default());
//!     let cancel = CancellationToken::new();
//!
//!     // Wait for a lamp, connect, list its networks
//!     let ssids = client.scan_connect_and_request_ssids(&cancel).await?;
//!     println!("{ssids:?}");
//!
//!     // Send credentials
//!     let outcome = client.provision("MyGroup", &ssids[0], "secret", &cancel).await?;
//!     println!("{outcome:?}");
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod assembler;
#[cfg(feature = "platform")]
pub mod ble;
pub mod client;
pub mod config;
pub mod error;
pub mod scanner;
pub mod session;
mod state;

pub use adapter::{Advertisement, BleAdapter, ScanFilter};
pub use assembler::{Ack, SsidAssembler};
#[cfg(feature = "platform")]
pub use ble::BtleplugAdapter;
pub use client::ProvisioningClient;
pub use config::{ConfigError, ProvisioningConfig, linkedlamp_home};
pub use error::{InvalidOperation, ProvisioningError, RetryHint, TransportError};
pub use scanner::{DeviceCandidate, DeviceScanner};
pub use session::ProvisioningSession;
pub use state::{ConnectionState, DisconnectReason, ProvisionOutcome};
