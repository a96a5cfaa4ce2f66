//! High-level provisioning flow used by front ends
//!
//! Wraps one [`ProvisioningSession`] at a time. Once a session ends
//! (`Disconnected`), the next scan or connect starts a fresh one.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use linkedlamp_proto::ble::SERVICE_UUID;

use crate::adapter::BleAdapter;
use crate::config::ProvisioningConfig;
use crate::error::ProvisioningError;
use crate::scanner::DeviceCandidate;
use crate::session::ProvisioningSession;
use crate::state::{ConnectionState, DisconnectReason, ProvisionOutcome};

/// Every method takes `&self`, so `stop_scan` and `disconnect` can run while
/// a scan or connect is in flight on another task or in the same `join!`.
pub struct ProvisioningClient<A: BleAdapter> {
    adapter: Arc<A>,
    config: ProvisioningConfig,
    session: Mutex<Arc<ProvisioningSession<A>>>,
    disconnects: broadcast::Sender<DisconnectReason>,
}

impl<A: BleAdapter> ProvisioningClient<A> {
    pub fn new(adapter: Arc<A>, config: ProvisioningConfig) -> Self {
        let (disconnects, _) = broadcast::channel(8);
        let session = ProvisioningSession::with_disconnects(
            adapter.clone(),
            config.scan_timeout(),
            disconnects.clone(),
        );
        Self {
            adapter,
            config,
            session: Mutex::new(Arc::new(session)),
            disconnects,
        }
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// The current session
    pub fn session(&self) -> Arc<ProvisioningSession<A>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.session().state()
    }

    pub fn device_name(&self) -> Option<String> {
        self.session().device_name()
    }

    /// Device-initiated disconnects of this and every later session
    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<DisconnectReason> {
        self.disconnects.subscribe()
    }

    fn prefix(&self) -> Option<&str> {
        Some(self.config.device_name_prefix.as_str()).filter(|p| !p.is_empty())
    }

    /// The current session, replaced by a fresh one if it has ended
    fn open_session(&self) -> Arc<ProvisioningSession<A>> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.state() == ConnectionState::Disconnected {
            log::debug!("Previous session closed, starting a new one");
            *session = Arc::new(ProvisioningSession::with_disconnects(
                self.adapter.clone(),
                self.config.scan_timeout(),
                self.disconnects.clone(),
            ));
        }
        session.clone()
    }

    pub async fn scan_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceCandidate<A::Peripheral>>, ProvisioningError> {
        self.open_session()
            .scanner()
            .scan_once(self.prefix(), SERVICE_UUID, cancel)
            .await
    }

    pub async fn scan_until_found(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DeviceCandidate<A::Peripheral>, ProvisioningError> {
        self.open_session()
            .scanner()
            .scan_until_found(self.prefix(), SERVICE_UUID, self.config.retry_delay(), cancel)
            .await
    }

    /// Strongest lamp of one scan window, if any
    pub async fn find_best_device(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<DeviceCandidate<A::Peripheral>>, ProvisioningError> {
        self.open_session()
            .scanner()
            .find_best(self.prefix(), SERVICE_UUID, cancel)
            .await
    }

    /// End the running scan window early
    pub fn stop_scan(&self) {
        self.session().scanner().stop();
    }

    pub async fn connect(
        &self,
        candidate: DeviceCandidate<A::Peripheral>,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisioningError> {
        self.open_session().connect(candidate, cancel).await
    }

    /// Wait for a lamp to show up and connect to it
    pub async fn scan_until_found_and_connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DeviceCandidate<A::Peripheral>, ProvisioningError> {
        let candidate = self.scan_until_found(cancel).await?;
        self.connect(candidate.clone(), cancel).await?;
        Ok(candidate)
    }

    /// Wait for a lamp, connect, and fetch the networks it can see
    pub async fn scan_connect_and_request_ssids(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProvisioningError> {
        self.scan_until_found_and_connect(cancel).await?;
        self.request_ssid_list(cancel).await
    }

    pub async fn request_ssid_list(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProvisioningError> {
        self.session().request_ssid_list(cancel).await
    }

    pub async fn provision(
        &self,
        group_name: &str,
        ssid: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        self.session()
            .provision(group_name, ssid, password, cancel)
            .await
    }

    pub async fn disconnect(&self) -> Result<(), ProvisioningError> {
        self.session().disconnect().await
    }
}
