//! btleplug implementation of [`BleAdapter`]
//!
//! Scan results come from the central's event stream rather than polling
//! `peripherals()`, so the scanner sees advertisements as they arrive.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as PlatformScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use log::debug;
use uuid::Uuid;

use crate::adapter::{Advertisement, BleAdapter, ScanFilter};
use crate::error::TransportError;

/// The host's first Bluetooth adapter
#[derive(Clone)]
pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new("No Bluetooth adapter found"))?;
        Ok(Self { adapter })
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    type Peripheral = Peripheral;
    type Characteristic = Characteristic;

    async fn start_scan(
        &self,
        filter: ScanFilter,
    ) -> Result<BoxStream<'static, Advertisement<Peripheral>>, TransportError> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(PlatformScanFilter {
                services: filter.services,
            })
            .await?;

        let adapter = self.adapter.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let props = peripheral.properties().await.ok().flatten()?;
                Some(Advertisement {
                    id: id.to_string(),
                    name: props.local_name,
                    rssi: props.rssi,
                    services: props.services,
                    peripheral,
                })
            }
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &Peripheral,
    ) -> Result<Vec<Uuid>, TransportError> {
        peripheral.discover_services().await?;
        let services: Vec<Uuid> = peripheral.services().iter().map(|s| s.uuid).collect();
        debug!("Discovered services: {services:?}");
        Ok(services)
    }

    async fn characteristic(
        &self,
        peripheral: &Peripheral,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<Option<Characteristic>, TransportError> {
        Ok(peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == uuid))
    }

    async fn write(
        &self,
        peripheral: &Peripheral,
        characteristic: &Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError> {
        peripheral
            .write(characteristic, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        peripheral: &Peripheral,
        characteristic: &Characteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        // Open the stream first so no notification sent right after the
        // CCCD write is missed.
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(characteristic).await?;

        let uuid = characteristic.uuid;
        let stream = notifications.filter_map(move |n| async move {
            (n.uuid == uuid).then_some(n.value)
        });
        Ok(stream.boxed())
    }

    async fn unsubscribe(
        &self,
        peripheral: &Peripheral,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError> {
        peripheral.unsubscribe(characteristic).await?;
        Ok(())
    }

    async fn disconnections(
        &self,
        peripheral: &Peripheral,
    ) -> Result<BoxStream<'static, ()>, TransportError> {
        let events = self.adapter.events().await?;
        let target = peripheral.id();
        let stream = events.filter_map(move |event| {
            let target = target.clone();
            async move {
                match event {
                    CentralEvent::DeviceDisconnected(id) if id == target => Some(()),
                    _ => None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
