//! Connection factory and authorization probing
//!
//! Creates connected (not necessarily authorized) transport clients and
//! provides the live authorization probe plus failure diagnostics used by the
//! session lifecycle manager.

use crate::transport::{Identity, Transport, TransportError, TransportErrorKind};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Creates transport clients from optional persisted session tokens.
///
/// A successful `create` means the client is connected; it does not assert
/// that the session token is still authorized.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Connect a new client, restoring the given session token when present
    async fn create<'a>(
        &self,
        session: Option<&'a str>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Operator-facing classification of an authorization loss.
///
/// Purely observational: control flow branches on
/// [`TransportErrorKind::is_recoverable`], never on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFault {
    /// The account was deactivated by the platform
    AccountDeactivated,
    /// Logged out from another device
    KeyUnregistered,
    /// The session expired
    SessionExpired,
    /// The password was changed elsewhere, revoking the session
    SessionRevoked,
    /// No specific cause could be determined
    Unknown,
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AccountDeactivated => "account deactivated",
            Self::KeyUnregistered => "logged out from another device",
            Self::SessionExpired => "session expired",
            Self::SessionRevoked => "password changed",
            Self::Unknown => "unknown cause",
        };
        f.write_str(text)
    }
}

impl From<TransportErrorKind> for SessionFault {
    fn from(kind: TransportErrorKind) -> Self {
        match kind {
            TransportErrorKind::AccountDeactivated => Self::AccountDeactivated,
            TransportErrorKind::KeyUnregistered => Self::KeyUnregistered,
            TransportErrorKind::SessionExpired => Self::SessionExpired,
            TransportErrorKind::SessionRevoked => Self::SessionRevoked,
            _ => Self::Unknown,
        }
    }
}

/// Live authorization probe.
///
/// Returns `false` on any error rather than propagating it, because
/// authorization state must be checkable without crashing the caller.
pub async fn check_authorization(client: &dyn Transport) -> bool {
    matches!(client.get_identity().await, Ok(Some(_)))
}

/// Fetch the authenticated identity, swallowing errors
pub async fn identity(client: &dyn Transport) -> Option<Identity> {
    match client.get_identity().await {
        Ok(me) => me,
        Err(e) => {
            debug!("identity lookup failed: {}", e);
            None
        }
    }
}

/// Classify the current authorization failure of a client.
///
/// Runs one live probe and maps its structured error kind. A probe that
/// unexpectedly succeeds, or fails without a recognizable kind, reports
/// [`SessionFault::Unknown`].
pub async fn diagnose_failure(client: &dyn Transport) -> SessionFault {
    match client.get_identity().await {
        Ok(_) => SessionFault::Unknown,
        Err(e) => SessionFault::from(e.kind()),
    }
}
