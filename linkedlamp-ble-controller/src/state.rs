//! Session state shared between caller operations and the events task
//!
//! Everything that changes while a session runs lives behind one mutex: the
//! connection state, the scan stop handle, the resolved GATT link, the pending
//! request and the SSID assembler. The guard is never held across an await.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::BleAdapter;
use crate::assembler::SsidAssembler;
use crate::error::{InvalidOperation, ProvisioningError, RetryHint};
use crate::scanner::DeviceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    /// Terminal, a new session is needed for another attempt
    Disconnected,
}

impl ConnectionState {
    /// Scan and connect both need an idle session
    pub(crate) fn check_idle(self) -> Result<(), InvalidOperation> {
        match self {
            ConnectionState::Idle => Ok(()),
            ConnectionState::Scanning => Err(InvalidOperation::AlreadyScanning),
            ConnectionState::Connecting => Err(InvalidOperation::AlreadyConnecting),
            ConnectionState::Connected => Err(InvalidOperation::AlreadyConnected),
            ConnectionState::Disconnected => Err(InvalidOperation::SessionClosed),
        }
    }
}

/// Why a connected session went down without being asked to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The platform reported the device disconnected
    Remote,
    /// The notification stream ended
    LinkLost,
}

/// Result of a completed configuration exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The lamp joined the network
    Success,
    /// The lamp answered but could not join the network
    WifiFailed,
}

impl ProvisionOutcome {
    pub fn retry_hint(self) -> RetryHint {
        match self {
            ProvisionOutcome::Success => RetryHint::None,
            ProvisionOutcome::WifiFailed => RetryHint::CheckPasswordAndRetry,
        }
    }
}

pub(crate) type SsidListResult = Result<Vec<String>, ProvisioningError>;
pub(crate) type ProvisionResult = Result<ProvisionOutcome, ProvisioningError>;

pub(crate) enum PendingKind {
    SsidList(oneshot::Sender<SsidListResult>),
    Provision(oneshot::Sender<ProvisionResult>),
}

/// The single request waiting for the device
pub(crate) struct Pending {
    pub id: u64,
    pub kind: PendingKind,
}

impl Pending {
    pub fn fail(self, error: ProvisioningError) {
        // the waiter may already be gone (cancelled), nothing to resolve then
        match self.kind {
            PendingKind::SsidList(tx) => {
                let _ = tx.send(Err(error));
            }
            PendingKind::Provision(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// Resolved characteristics of a connected device
pub(crate) struct Link<C> {
    pub write: C,
    pub notify: C,
}

pub(crate) struct Inner<A: BleAdapter> {
    pub state: ConnectionState,
    pub scan_stop: Option<CancellationToken>,
    pub device: Option<DeviceCandidate<A::Peripheral>>,
    pub link: Option<Link<A::Characteristic>>,
    pub pending: Option<Pending>,
    pub assembler: SsidAssembler,
    pub events: Option<JoinHandle<()>>,
    next_id: u64,
}

impl<A: BleAdapter> Inner<A> {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            scan_stop: None,
            device: None,
            link: None,
            pending: None,
            assembler: SsidAssembler::new(),
            events: None,
            next_id: 0,
        }
    }

    /// Peripheral and write characteristic, if a request may be sent now
    pub fn writable(&self) -> Result<(A::Peripheral, A::Characteristic), InvalidOperation> {
        if self.state != ConnectionState::Connected {
            return Err(InvalidOperation::NotConnected);
        }
        match (&self.device, &self.link) {
            (Some(device), Some(link)) => Ok((device.peripheral.clone(), link.write.clone())),
            _ => Err(InvalidOperation::NotConnected),
        }
    }

    pub fn install(&mut self, kind: PendingKind) -> Result<u64, InvalidOperation> {
        if self.pending.is_some() {
            return Err(InvalidOperation::OperationPending);
        }
        self.next_id += 1;
        self.pending = Some(Pending {
            id: self.next_id,
            kind,
        });
        Ok(self.next_id)
    }

    /// Drop the pending slot only if it still belongs to request `id`
    pub fn clear_pending(&mut self, id: u64) {
        if self.pending.as_ref().is_some_and(|p| p.id == id) {
            self.pending = None;
        }
    }

    pub fn awaiting_ssids(&self) -> bool {
        matches!(
            self.pending,
            Some(Pending {
                kind: PendingKind::SsidList(_),
                ..
            })
        )
    }

    pub fn take_ssid_list(&mut self) -> Option<oneshot::Sender<SsidListResult>> {
        match self.pending.take() {
            Some(Pending {
                kind: PendingKind::SsidList(tx),
                ..
            }) => Some(tx),
            other => {
                self.pending = other;
                None
            }
        }
    }

    pub fn take_provision(&mut self) -> Option<oneshot::Sender<ProvisionResult>> {
        match self.pending.take() {
            Some(Pending {
                kind: PendingKind::Provision(tx),
                ..
            }) => Some(tx),
            other => {
                self.pending = other;
                None
            }
        }
    }
}

pub(crate) struct Shared<A: BleAdapter> {
    pub adapter: Arc<A>,
    inner: Mutex<Inner<A>>,
    pub disconnects: broadcast::Sender<DisconnectReason>,
}

impl<A: BleAdapter> Shared<A> {
    pub fn new(adapter: Arc<A>, disconnects: broadcast::Sender<DisconnectReason>) -> Self {
        Self {
            adapter,
            inner: Mutex::new(Inner::new()),
            disconnects,
        }
    }

    /// A panic elsewhere must not wedge the session, so poisoning is ignored
    pub fn lock(&self) -> MutexGuard<'_, Inner<A>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
