//! Error taxonomy of the provisioning engine

use linkedlamp_proto::{EncodingError, ProtocolError};
use uuid::Uuid;

/// A platform BLE call failed (scan, connect, discovery, write)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

#[cfg(feature = "platform")]
impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        Self::new(e)
    }
}

/// The operation is not allowed in the current session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidOperation {
    #[error("adapter is already scanning")]
    AlreadyScanning,
    #[error("adapter is already connecting")]
    AlreadyConnecting,
    #[error("adapter is already connected")]
    AlreadyConnected,
    #[error("adapter is not connected")]
    NotConnected,
    #[error("session is closed, start a new one")]
    SessionClosed,
    #[error("another request is already waiting for the device")]
    OperationPending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] InvalidOperation),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("device disconnected")]
    Disconnected,
    #[error("operation cancelled")]
    Cancelled,
}

/// What a user interface should offer after a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Start over from scanning
    RetryScan,
    /// The device answered but could not join the network
    CheckPasswordAndRetry,
    /// Caller bug, retrying the same call cannot help
    None,
}

impl ProvisioningError {
    pub fn retry_hint(&self) -> RetryHint {
        match self {
            ProvisioningError::InvalidOperation(_) | ProvisioningError::Encoding(_) => {
                RetryHint::None
            }
            ProvisioningError::Transport(_)
            | ProvisioningError::Protocol(_)
            | ProvisioningError::ServiceNotFound(_)
            | ProvisioningError::CharacteristicNotFound(_)
            | ProvisioningError::Disconnected
            | ProvisioningError::Cancelled => RetryHint::RetryScan,
        }
    }
}
