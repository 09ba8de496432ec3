//! Authentication material for the SSH transport.
//!
//! Password and/or private-key authentication. The key is loaded from disk
//! on every dial so a rotated key file is picked up on reconnect.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::Handle;

use crate::client::SessionHandler;
use crate::error::SshError;

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

/// Credentials used for every (re)connect. Immutable once built.
#[derive(Clone)]
pub struct AuthConfig {
    // ---
    pub user: String,
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
}

// ---

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

// ---

impl AuthConfig {
    // ---
    pub fn new(user: impl Into<String>) -> Self {
        // ---
        Self {
            user: user.into(),
            password: None,
            key_path: None,
        }
    }

    // ---

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    // ---

    /// Private key file. A leading `~/` is expanded against `$HOME`.
    pub fn with_key_path(mut self, path: impl AsRef<str>) -> Self {
        self.key_path = Some(expand_home(path.as_ref()));
        self
    }

    // ---

    /// Authenticate `handle`, trying the key first and the password second.
    pub(crate) async fn authenticate(
        &self,
        handle: &mut Handle<SessionHandler>,
    ) -> Result<(), SshError> {
        // ---
        if self.key_path.is_none() && self.password.is_none() {
            return Err(SshError::NoCredentials);
        }

        if let Some(path) = &self.key_path {
            let key = load_key(path)?;
            if handle.authenticate_publickey(&self.user, key).await? {
                tracing::debug!(user = %self.user, "authenticated with private key");
                return Ok(());
            }
            tracing::debug!(user = %self.user, key = %path.display(), "private key rejected");
        }

        if let Some(password) = &self.password {
            if handle.authenticate_password(&self.user, password).await? {
                tracing::debug!(user = %self.user, "authenticated with password");
                return Ok(());
            }
        }

        Err(SshError::AuthRejected {
            user: self.user.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_key(path: &Path) -> Result<Arc<russh_keys::key::KeyPair>, SshError> {
    // ---
    let key = russh_keys::load_secret_key(path, None)?;
    Ok(Arc::new(key))
}

// ---

/// Expand a leading `~/` (or a bare `~`) to the user's home directory.
/// Paths without one, or hosts without `$HOME`, are returned as given.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    // ---
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
