//! Persistent session credential store
//!
//! Persists the opaque session token per identity role so a restart can
//! reconnect without an interactive login. Tokens are treated as opaque
//! strings; a non-empty token only implies that a sign-in once succeeded,
//! not that it is still valid.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Identity role a session token belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// A regular user account (phone + code login)
    User,
    /// A bot account (token login)
    Bot,
}

impl SessionRole {
    /// File name the token for this role is stored under
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::User => "session.txt",
            Self::Bot => "session_bot.txt",
        }
    }
}

/// Interface for session token persistence.
///
/// Failures are absorbed: `load` reports a missing or unreadable token as
/// `None`, `save` reports failure as `false`. Callers treat both as
/// "no usable credential", never as process-fatal errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the persisted token for a role, if one exists
    async fn load(&self, role: SessionRole) -> Option<String>;
    /// Persist a token for a role; returns whether the write succeeded
    async fn save(&self, role: SessionRole, token: &str) -> bool;
}

/// File-backed session store, one file per role inside a base directory
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Create a store rooted at the given directory.
    ///
    /// The directory is created lazily on the first save.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, role: SessionRole) -> PathBuf {
        self.dir.join(role.file_name())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, role: SessionRole) -> Option<String> {
        let path = self.path_for(role);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let token = contents.trim();
                if token.is_empty() {
                    None
                } else {
                    Some(token.to_string())
                }
            }
            Err(e) => {
                debug!("no session file at {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn save(&self, role: SessionRole, token: &str) -> bool {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(
                "failed to create session directory {}: {}",
                self.dir.display(),
                e
            );
            return false;
        }

        let path = self.path_for(role);
        match tokio::fs::write(&path, token).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to persist session to {}: {}", path.display(), e);
                false
            }
        }
    }
}
