//! Transport boundary for the messaging platform
//!
//! The wire protocol itself is out of scope; a binding crate implements
//! [`Transport`] over the real client library. Everything in this crate talks
//! to the platform exclusively through this trait, which keeps the lifecycle
//! manager and pipeline testable against in-memory fakes.

use crate::config::{TRANSPORT_INITIAL_BACKOFF_MS, TRANSPORT_MAX_BACKOFF_MS, TRANSPORT_MAX_RETRIES};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

/// Structured classification of a transport failure.
///
/// Retry and diagnostics logic branches on this kind, never on error message
/// text, so a binding must map its library-specific errors into one of these
/// variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection refused, reset, or otherwise unreachable
    Network,
    /// Operation exceeded the transport's own deadline
    Timeout,
    /// The platform rejected the phone number
    InvalidPhone,
    /// The login code was wrong or expired
    InvalidCode,
    /// The account is protected by a second factor
    PasswordRequired,
    /// The persisted session has expired
    SessionExpired,
    /// The session was revoked (password changed elsewhere)
    SessionRevoked,
    /// The authorization key is no longer registered (logged out remotely)
    KeyUnregistered,
    /// The account itself was deactivated
    AccountDeactivated,
    /// Any other RPC-level failure
    Rpc,
}

impl TransportErrorKind {
    /// Whether reconnecting or reloading the persisted session plausibly
    /// fixes this failure, as opposed to requiring operator re-login.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::SessionExpired
                | Self::SessionRevoked
                | Self::KeyUnregistered
        )
    }
}

/// Error returned by transport operations
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    /// Create a new transport error of the given kind
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The structured failure classification
    #[must_use]
    pub const fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// See [`TransportErrorKind::is_recoverable`]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

/// Identity of the authenticated account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Display name reported by the platform
    pub display_name: String,
}

/// An inbound message delivered by a subscription
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Platform message identifier, unique within the source chat
    pub id: i64,
    /// Chat the message arrived from
    pub chat_id: i64,
    /// Message text
    pub text: String,
    /// Labels of interactive buttons attached to the message, if any
    pub buttons: Vec<String>,
}

/// Opaque handle identifying one event subscription on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Inbound event stream produced by [`Transport::subscribe`].
///
/// Dropping the receiver does not revoke the subscription; callers revoke it
/// explicitly via [`Transport::unsubscribe`] with the stream's id.
pub struct EventStream {
    /// Handle used to revoke this subscription
    pub id: SubscriptionId,
    /// Channel of inbound messages from the subscribed chat
    pub receiver: mpsc::Receiver<InboundMessage>,
}

/// Low-level client of the messaging platform.
///
/// One instance corresponds to one connected client. Authorization is not
/// implied by a successful connection; callers probe it via
/// [`Transport::get_identity`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the transport currently reports itself connected.
    ///
    /// This is a local flag, not a network round trip.
    fn is_connected(&self) -> bool;

    /// Re-establish the connection after a drop
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Close the connection and release resources
    async fn disconnect(&self);

    /// Request a login code for the phone number; returns the code hash
    /// required by [`Transport::sign_in`]
    async fn send_login_code(&self, phone: &str) -> Result<String, TransportError>;

    /// Complete a code login. Fails with [`TransportErrorKind::PasswordRequired`]
    /// when the account demands a second factor.
    async fn sign_in(
        &self,
        phone: &str,
        code: &str,
        code_hash: &str,
    ) -> Result<(), TransportError>;

    /// Complete a second-factor login after `PasswordRequired`
    async fn sign_in_with_password(&self, password: &str) -> Result<(), TransportError>;

    /// Serialize the current session into an opaque token
    async fn export_session(&self) -> Result<String, TransportError>;

    /// Live authorization probe. `Ok(None)` means the probe completed but the
    /// platform reports no authorized account.
    async fn get_identity(&self) -> Result<Option<Identity>, TransportError>;

    /// Resolve the display title of a chat, if it is reachable
    async fn chat_title(&self, chat_id: i64) -> Result<Option<String>, TransportError>;

    /// Subscribe to new messages in the given chat
    async fn subscribe(&self, chat_id: i64) -> Result<EventStream, TransportError>;

    /// Revoke exactly the subscription identified by `id`, leaving any other
    /// registrations on this client untouched
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// Relay a message to the target recipient
    async fn forward_message(
        &self,
        target: &str,
        message: &InboundMessage,
    ) -> Result<(), TransportError>;

    /// Activate the interactive button with the given label on a message
    async fn click_button(
        &self,
        message: &InboundMessage,
        label: &str,
    ) -> Result<(), TransportError>;
}

/// Retry a transport operation with exponential backoff and jitter.
///
/// Only recoverable failures are retried; a non-recoverable error is returned
/// immediately so credential faults never burn retry budget.
///
/// # Errors
///
/// Returns the last error once the retry budget is exhausted.
pub async fn retry_transport_operation<F, Fut, T>(operation: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TransportError>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(TRANSPORT_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TRANSPORT_MAX_BACKOFF_MS))
        .map(jitter) // Add jitter to prevent thundering herd
        .take(TRANSPORT_MAX_RETRIES);

    RetryIf::spawn(retry_strategy, operation, TransportError::is_recoverable)
        .await
        .map_err(|e| {
            warn!(
                "Transport operation failed after {} attempts: {}",
                TRANSPORT_MAX_RETRIES + 1,
                e
            );
            e
        })
}
