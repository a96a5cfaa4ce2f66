//! Platform BLE seam
//!
//! The provisioning engine never talks to a Bluetooth stack directly. It
//! drives a [`BleAdapter`], implemented over btleplug for real hardware
//! (feature `platform`) and by in-process simulators in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::TransportError;

/// One advertisement seen during a scan
#[derive(Debug, Clone)]
pub struct Advertisement<P> {
    pub peripheral: P,
    /// Stable platform identifier, used to deduplicate repeated advertisements
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// Service UUIDs listed in the advertisement (may be empty)
    pub services: Vec<Uuid>,
}

/// Scan restriction passed down to the platform
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

/// BLE central primitives used by the provisioning engine
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Opaque handle to a remote device
    type Peripheral: Clone + Send + Sync + 'static;
    /// Resolved GATT characteristic
    type Characteristic: Clone + Send + Sync + 'static;

    /// Start discovery; the stream yields advertisements until `stop_scan`.
    async fn start_scan(
        &self,
        filter: ScanFilter,
    ) -> Result<BoxStream<'static, Advertisement<Self::Peripheral>>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, peripheral: &Self::Peripheral) -> Result<(), TransportError>;

    async fn disconnect(&self, peripheral: &Self::Peripheral) -> Result<(), TransportError>;

    /// Run GATT discovery and return the UUIDs of the services found
    async fn discover_services(
        &self,
        peripheral: &Self::Peripheral,
    ) -> Result<Vec<Uuid>, TransportError>;

    async fn characteristic(
        &self,
        peripheral: &Self::Peripheral,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<Option<Self::Characteristic>, TransportError>;

    async fn write(
        &self,
        peripheral: &Self::Peripheral,
        characteristic: &Self::Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Enable notifications; the stream yields each notified value.
    async fn subscribe(
        &self,
        peripheral: &Self::Peripheral,
        characteristic: &Self::Characteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    async fn unsubscribe(
        &self,
        peripheral: &Self::Peripheral,
        characteristic: &Self::Characteristic,
    ) -> Result<(), TransportError>;

    /// Yields once for every disconnect of `peripheral` not requested by us
    async fn disconnections(
        &self,
        peripheral: &Self::Peripheral,
    ) -> Result<BoxStream<'static, ()>, TransportError>;
}
