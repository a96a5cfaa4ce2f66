//! Discovery of lamps waiting for provisioning

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, trace};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{Advertisement, BleAdapter, ScanFilter};
use crate::error::ProvisioningError;
use crate::state::{ConnectionState, Shared};

/// A device that passed the name and service filters
#[derive(Debug, Clone)]
pub struct DeviceCandidate<P> {
    pub peripheral: P,
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

/// Scans on behalf of one provisioning session
///
/// Scanning marks the session `Scanning`, so a scan cannot overlap a
/// connection attempt or another scan.
pub struct DeviceScanner<A: BleAdapter> {
    shared: Arc<Shared<A>>,
    scan_timeout: Duration,
}

impl<A: BleAdapter> Clone for DeviceScanner<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            scan_timeout: self.scan_timeout,
        }
    }
}

impl<A: BleAdapter> DeviceScanner<A> {
    pub(crate) fn new(shared: Arc<Shared<A>>, scan_timeout: Duration) -> Self {
        Self {
            shared,
            scan_timeout,
        }
    }

    /// Scan for one window and return every matching device, strongest first.
    ///
    /// The window ends at the scan timeout, on [`stop`](Self::stop) or when
    /// `cancel` fires. Whichever it is, the radio is stopped before returning
    /// and whatever was collected is returned, possibly nothing.
    pub async fn scan_once(
        &self,
        prefix: Option<&str>,
        service: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceCandidate<A::Peripheral>>, ProvisioningError> {
        let stop = CancellationToken::new();
        {
            let mut inner = self.shared.lock();
            inner.state.check_idle()?;
            inner.state = ConnectionState::Scanning;
            inner.scan_stop = Some(stop.clone());
        }

        info!("Scanning for devices (service {service}, prefix {prefix:?})");
        let filter = ScanFilter {
            services: vec![service],
        };
        let stream = match self.shared.adapter.start_scan(filter).await {
            Ok(stream) => stream,
            Err(e) => {
                self.finish();
                return Err(e.into());
            }
        };

        let found = self
            .collect(stream, prefix.unwrap_or_default(), service, cancel, &stop)
            .await;

        let stopped = self.shared.adapter.stop_scan().await;
        self.finish();
        stopped?;

        let mut candidates: Vec<_> = found.into_values().collect();
        candidates.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        info!("Scan found {} device(s)", candidates.len());
        Ok(candidates)
    }

    /// Scan repeatedly, pausing `retry_delay` after each empty window, until
    /// a device shows up or `cancel` fires.
    pub async fn scan_until_found(
        &self,
        prefix: Option<&str>,
        service: Uuid,
        retry_delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<DeviceCandidate<A::Peripheral>, ProvisioningError> {
        loop {
            let found = self.scan_once(prefix, service, cancel).await?;
            if let Some(best) = found.into_iter().next() {
                return Ok(best);
            }
            if cancel.is_cancelled() {
                return Err(ProvisioningError::Cancelled);
            }

            debug!("No device yet, retrying in {retry_delay:?}");
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisioningError::Cancelled),
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    }

    /// Strongest matching device of a single scan window
    pub async fn find_best(
        &self,
        prefix: Option<&str>,
        service: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<DeviceCandidate<A::Peripheral>>, ProvisioningError> {
        Ok(self
            .scan_once(prefix, service, cancel)
            .await?
            .into_iter()
            .next())
    }

    /// End the running scan window early; a no-op when nothing is scanning
    pub fn stop(&self) {
        if let Some(stop) = self.shared.lock().scan_stop.as_ref() {
            stop.cancel();
        }
    }

    async fn collect(
        &self,
        mut stream: BoxStream<'static, Advertisement<A::Peripheral>>,
        prefix: &str,
        service: Uuid,
        cancel: &CancellationToken,
        stop: &CancellationToken,
    ) -> HashMap<String, DeviceCandidate<A::Peripheral>> {
        let mut found = HashMap::new();
        let window = tokio::time::sleep(self.scan_timeout);
        tokio::pin!(window);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Scan cancelled");
                    break;
                }
                _ = stop.cancelled() => {
                    debug!("Scan stopped");
                    break;
                }
                _ = &mut window => {
                    debug!("Scan window elapsed");
                    break;
                }
                advertisement = stream.next() => match advertisement {
                    Some(advertisement) => {
                        if let Some(candidate) = accept(advertisement, prefix, service) {
                            // latest advertisement wins
                            found.insert(candidate.id.clone(), candidate);
                        }
                    }
                    None => break,
                },
            }
        }
        found
    }

    fn finish(&self) {
        let mut inner = self.shared.lock();
        inner.scan_stop = None;
        if inner.state == ConnectionState::Scanning {
            inner.state = ConnectionState::Idle;
        }
    }
}

/// Platforms may ignore the service filter, so it is checked again here
/// whenever the advertisement lists its services.
fn accept<P>(
    advertisement: Advertisement<P>,
    prefix: &str,
    service: Uuid,
) -> Option<DeviceCandidate<P>> {
    let name = advertisement.name.unwrap_or_default();
    trace!(
        "Saw {} ({name:?}), RSSI {:?}",
        advertisement.id, advertisement.rssi
    );

    if !advertisement.services.is_empty() && !advertisement.services.contains(&service) {
        return None;
    }
    if !name.starts_with(prefix) {
        return None;
    }

    Some(DeviceCandidate {
        peripheral: advertisement.peripheral,
        id: advertisement.id,
        name,
        rssi: advertisement.rssi,
    })
}
