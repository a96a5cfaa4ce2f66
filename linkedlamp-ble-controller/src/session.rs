//! Provisioning session: one connection attempt to one lamp
//!
//! ```text
//! Idle ──scan──▶ Scanning ──▶ Idle
//! Idle ──connect──▶ Connecting ──▶ Connected ──▶ Disconnected
//!                        └──────── failure ───────────┘
//! ```
//!
//! While connected, a background task owns the notification and
//! disconnect streams. It writes SSID acks, resolves the pending request
//! and turns a lost link into [`ProvisioningError::Disconnected`] for
//! whoever is waiting before releasing the device.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use linkedlamp_proto::ble::{APP_TO_DEVICE_UUID, DEVICE_TO_APP_UUID, SERVICE_UUID};
use linkedlamp_proto::{
    DeviceFrame, ProtocolError, decode_incoming, encode_configuration, encode_ssid_ack,
    encode_ssid_list_request,
};

use crate::adapter::BleAdapter;
use crate::error::{InvalidOperation, ProvisioningError};
use crate::scanner::{DeviceCandidate, DeviceScanner};
use crate::state::{
    ConnectionState, DisconnectReason, Link, PendingKind, ProvisionOutcome, Shared,
};

pub struct ProvisioningSession<A: BleAdapter> {
    shared: Arc<Shared<A>>,
    scan_timeout: Duration,
}

/// GATT plumbing handed to the events task once setup succeeds
struct Established<C> {
    link: Link<C>,
    notifications: BoxStream<'static, Vec<u8>>,
    disconnections: BoxStream<'static, ()>,
}

impl<A: BleAdapter> ProvisioningSession<A> {
    pub fn new(adapter: Arc<A>, scan_timeout: Duration) -> Self {
        let (disconnects, _) = broadcast::channel(8);
        Self::with_disconnects(adapter, scan_timeout, disconnects)
    }

    /// Session reporting device-initiated disconnects on an existing channel
    pub fn with_disconnects(
        adapter: Arc<A>,
        scan_timeout: Duration,
        disconnects: broadcast::Sender<DisconnectReason>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(adapter, disconnects)),
            scan_timeout,
        }
    }

    pub fn scanner(&self) -> DeviceScanner<A> {
        DeviceScanner::new(self.shared.clone(), self.scan_timeout)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Name of the device being connected or connected to
    pub fn device_name(&self) -> Option<String> {
        self.shared.lock().device.as_ref().map(|d| d.name.clone())
    }

    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<DisconnectReason> {
        self.shared.disconnects.subscribe()
    }

    /// Connect and set up the provisioning service.
    ///
    /// Any failure after the platform connect, including a missing service or
    /// characteristic, disconnects again and leaves the session `Disconnected`.
    pub async fn connect(
        &self,
        candidate: DeviceCandidate<A::Peripheral>,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisioningError> {
        {
            let mut inner = self.shared.lock();
            inner.state.check_idle()?;
            inner.state = ConnectionState::Connecting;
            inner.device = Some(candidate.clone());
        }
        info!("Connecting to {} ({})", candidate.name, candidate.id);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisioningError::Cancelled),
            r = self.establish(&candidate.peripheral) => r,
        };

        let established = match result {
            Ok(established) => established,
            Err(e) => {
                warn!("Connection to {} failed: {e}", candidate.name);
                self.shared.lock().state = ConnectionState::Disconnected;
                if let Err(e) = self.shared.adapter.disconnect(&candidate.peripheral).await {
                    debug!("Cleanup disconnect failed: {e}");
                }
                return Err(e);
            }
        };

        // disconnect() may have run while we were connecting
        let raced = {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Connecting {
                inner.state = ConnectionState::Connected;
                inner.link = Some(established.link);
                inner.events = Some(tokio::spawn(run_events(
                    self.shared.clone(),
                    established.notifications,
                    established.disconnections,
                )));
                false
            } else {
                true
            }
        };

        if raced {
            info!("Disconnect requested while connecting to {}", candidate.name);
            self.shared.adapter.disconnect(&candidate.peripheral).await?;
            return Err(ProvisioningError::Disconnected);
        }

        info!("Connected to {}", candidate.name);
        Ok(())
    }

    async fn establish(
        &self,
        peripheral: &A::Peripheral,
    ) -> Result<Established<A::Characteristic>, ProvisioningError> {
        let adapter = &self.shared.adapter;
        adapter.connect(peripheral).await?;
        let disconnections = adapter.disconnections(peripheral).await?;

        let services = adapter.discover_services(peripheral).await?;
        if !services.contains(&SERVICE_UUID) {
            return Err(ProvisioningError::ServiceNotFound(SERVICE_UUID));
        }

        let write = adapter
            .characteristic(peripheral, SERVICE_UUID, APP_TO_DEVICE_UUID)
            .await?
            .ok_or(ProvisioningError::CharacteristicNotFound(APP_TO_DEVICE_UUID))?;
        let notify = adapter
            .characteristic(peripheral, SERVICE_UUID, DEVICE_TO_APP_UUID)
            .await?
            .ok_or(ProvisioningError::CharacteristicNotFound(DEVICE_TO_APP_UUID))?;

        let notifications = adapter.subscribe(peripheral, &notify).await?;
        debug!("Provisioning service ready");

        Ok(Established {
            link: Link { write, notify },
            notifications,
            disconnections,
        })
    }

    /// Ask the lamp for the networks it can see, in the lamp's order
    pub async fn request_ssid_list(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProvisioningError> {
        let (tx, rx) = oneshot::channel();
        let (id, peripheral, write) = {
            let mut inner = self.shared.lock();
            let (peripheral, write) = inner.writable()?;
            let id = inner.install(PendingKind::SsidList(tx))?;
            inner.assembler.reset();
            (id, peripheral, write)
        };

        debug!("Requesting SSID list");
        if let Err(e) = self
            .shared
            .adapter
            .write(&peripheral, &write, &encode_ssid_list_request())
            .await
        {
            self.shared.lock().clear_pending(id);
            return Err(e.into());
        }

        let ssids = self.wait(id, rx, cancel).await?;
        info!("Received {} SSID(s)", ssids.len());
        Ok(ssids)
    }

    /// Send group and WiFi credentials and wait for the lamp's verdict
    pub async fn provision(
        &self,
        group_name: &str,
        ssid: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        let (tx, rx) = oneshot::channel();
        let (id, peripheral, write, frame) = {
            let mut inner = self.shared.lock();
            let (peripheral, write) = inner.writable()?;
            let frame = encode_configuration(group_name, ssid, password)?;
            let id = inner.install(PendingKind::Provision(tx))?;
            (id, peripheral, write, frame)
        };

        info!(
            "Provisioning group {group_name:?} on {ssid:?} (password {} bytes)",
            password.len()
        );
        if let Err(e) = self.shared.adapter.write(&peripheral, &write, &frame).await {
            self.shared.lock().clear_pending(id);
            return Err(e.into());
        }

        let outcome = self.wait(id, rx, cancel).await?;
        info!("Provisioning result: {outcome:?}");
        Ok(outcome)
    }

    async fn wait<T>(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<T, ProvisioningError>>,
        cancel: &CancellationToken,
    ) -> Result<T, ProvisioningError> {
        tokio::select! {
            biased;
            result = rx => result.unwrap_or(Err(ProvisioningError::Disconnected)),
            _ = cancel.cancelled() => {
                debug!("Request {id} cancelled");
                self.shared.lock().clear_pending(id);
                Err(ProvisioningError::Cancelled)
            }
        }
    }

    /// Tear the connection down. Calling it again afterwards is a no-op.
    pub async fn disconnect(&self) -> Result<(), ProvisioningError> {
        let (previous, device, link, events, pending) = {
            let mut inner = self.shared.lock();
            match inner.state {
                ConnectionState::Idle => return Err(InvalidOperation::NotConnected.into()),
                ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Scanning => {
                    if let Some(stop) = inner.scan_stop.take() {
                        stop.cancel();
                    }
                    inner.state = ConnectionState::Disconnected;
                    return Ok(());
                }
                ConnectionState::Connecting | ConnectionState::Connected => {}
            }
            let previous = std::mem::replace(&mut inner.state, ConnectionState::Disconnected);
            (
                previous,
                inner.device.clone(),
                inner.link.take(),
                inner.events.take(),
                inner.pending.take(),
            )
        };

        if let Some(pending) = pending {
            pending.fail(ProvisioningError::Disconnected);
        }
        if let Some(events) = events {
            events.abort();
        }
        // a connect still in flight notices the state change and cleans up itself
        if previous != ConnectionState::Connected {
            return Ok(());
        }

        let Some(device) = device else {
            return Ok(());
        };
        if let Some(link) = link {
            if let Err(e) = self
                .shared
                .adapter
                .unsubscribe(&device.peripheral, &link.notify)
                .await
            {
                debug!("Unsubscribe failed: {e}");
            }
        }
        self.shared.adapter.disconnect(&device.peripheral).await?;
        info!("Disconnected from {}", device.name);
        Ok(())
    }
}

impl<A: BleAdapter> Drop for ProvisioningSession<A> {
    fn drop(&mut self) {
        if let Some(events) = self.shared.lock().events.take() {
            events.abort();
        }
    }
}

async fn run_events<A: BleAdapter>(
    shared: Arc<Shared<A>>,
    mut notifications: BoxStream<'static, Vec<u8>>,
    mut disconnections: BoxStream<'static, ()>,
) {
    loop {
        tokio::select! {
            biased;
            Some(()) = disconnections.next() => {
                link_down(&shared, DisconnectReason::Remote).await;
                return;
            }
            value = notifications.next() => match value {
                Some(value) => on_notification(&shared, &value).await,
                None => {
                    link_down(&shared, DisconnectReason::LinkLost).await;
                    return;
                }
            },
        }
    }
}

/// Flip to `Disconnected` once, fail whatever was waiting and release the
/// device. The radio link may still be up when only the notification
/// stream ended.
async fn link_down<A: BleAdapter>(shared: &Shared<A>, reason: DisconnectReason) {
    let (device, link, pending) = {
        let mut inner = shared.lock();
        if inner.state != ConnectionState::Connected {
            // an explicit disconnect got there first
            return;
        }
        inner.state = ConnectionState::Disconnected;
        inner.events = None;
        (inner.device.clone(), inner.link.take(), inner.pending.take())
    };

    warn!("Device disconnected ({reason:?})");
    if let Some(pending) = pending {
        pending.fail(ProvisioningError::Disconnected);
    }
    let _ = shared.disconnects.send(reason);

    let Some(device) = device else {
        return;
    };
    if let Some(link) = link {
        if let Err(e) = shared.adapter.unsubscribe(&device.peripheral, &link.notify).await {
            debug!("Unsubscribe after link loss failed: {e}");
        }
    }
    if let Err(e) = shared.adapter.disconnect(&device.peripheral).await {
        debug!("Disconnect after link loss failed: {e}");
    }
}

async fn on_notification<A: BleAdapter>(shared: &Shared<A>, value: &[u8]) {
    let frame = match decode_incoming(value) {
        Ok(frame) => frame,
        Err(e) => {
            on_protocol_error(shared, e);
            return;
        }
    };

    match frame {
        DeviceFrame::Ssid(chunk) => {
            let (ack, peripheral, write) = {
                let mut inner = shared.lock();
                if !inner.awaiting_ssids() {
                    debug!("SSID chunk with no list request pending, dropped");
                    return;
                }
                let Ok((peripheral, write)) = inner.writable() else {
                    return;
                };
                (inner.assembler.add(&chunk), peripheral, write)
            };

            let frame = encode_ssid_ack(ack.ssid_index, ack.chunk_index);
            if let Err(e) = shared.adapter.write(&peripheral, &write, &frame).await {
                warn!(
                    "Failed to ack SSID {} chunk {}: {e}",
                    ack.ssid_index, ack.chunk_index
                );
            }
        }
        DeviceFrame::SsidEnd => {
            let resolved = {
                let mut inner = shared.lock();
                match inner.take_ssid_list() {
                    Some(tx) => Some((tx, inner.assembler.finalize())),
                    None => None,
                }
            };
            match resolved {
                Some((tx, ssids)) => {
                    let _ = tx.send(Ok(ssids));
                }
                None => debug!("SSID end with no list request pending, dropped"),
            }
        }
        DeviceFrame::WifiOk => resolve_provision(shared, ProvisionOutcome::Success),
        DeviceFrame::WifiFail => resolve_provision(shared, ProvisionOutcome::WifiFailed),
    }
}

fn resolve_provision<A: BleAdapter>(shared: &Shared<A>, outcome: ProvisionOutcome) {
    let pending = shared.lock().take_provision();
    match pending {
        Some(tx) => {
            let _ = tx.send(Ok(outcome));
        }
        None => debug!("{outcome:?} with no provisioning pending, dropped"),
    }
}

/// A malformed SSID frame fails the list request it belongs to; anything
/// else undecodable is dropped.
fn on_protocol_error<A: BleAdapter>(shared: &Shared<A>, error: ProtocolError) {
    let pending = {
        let mut inner = shared.lock();
        if error == ProtocolError::MalformedSsid {
            inner.take_ssid_list()
        } else {
            None
        }
    };

    match pending {
        Some(tx) => {
            warn!("Failing SSID list request: {error}");
            let _ = tx.send(Err(ProvisioningError::Protocol(error)));
        }
        None => warn!("Dropped undecodable notification: {error}"),
    }
}
