//! Authentication
//!
//! The broker authenticates CONNECT attempts through the pluggable
//! [`AuthProvider`] trait. The bundled [`StaticAuth`] implementation checks
//! against the user list from the configuration file; when authentication is
//! disabled it admits everything.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::config::SecurityConfig;

/// Authentication error (provider-internal failure, not a rejection)
#[derive(Debug)]
pub struct AuthError(pub String);

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "auth error: {}", self.0)
    }
}

impl std::error::Error for AuthError {}

/// Outcome of an authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub ok: bool,
    /// Authenticated username, when one was presented
    pub user: Option<String>,
}

impl AuthOutcome {
    pub fn allow(user: Option<String>) -> Self {
        Self { ok: true, user }
    }

    pub fn deny() -> Self {
        Self {
            ok: false,
            user: None,
        }
    }
}

/// Pluggable authentication gate invoked during CONNECT
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Check the credentials from a CONNECT packet.
    /// `Ok(AuthOutcome::deny())` rejects with CONNACK return code 4;
    /// `Err` is an internal failure and also rejects.
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<AuthOutcome, AuthError>;
}

/// Provider that admits every connection (auth disabled)
pub struct AllowAll;

#[async_trait]
impl AuthProvider for AllowAll {
    async fn authenticate(
        &self,
        username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> Result<AuthOutcome, AuthError> {
        Ok(AuthOutcome::allow(username.map(str::to_string)))
    }
}

/// Config-driven username/password authentication
pub struct StaticAuth {
    /// Whether credentials are required at all
    require_auth: bool,
    /// username -> password
    users: HashMap<String, String>,
}

impl StaticAuth {
    pub fn new(config: &SecurityConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| (u.username.clone(), u.password.clone()))
            .collect();

        Self {
            require_auth: config.require_auth,
            users,
        }
    }

    fn verify(&self, username: &str, password: &[u8]) -> bool {
        match self.users.get(username) {
            Some(stored) => std::str::from_utf8(password)
                .map(|p| p == stored)
                .unwrap_or(false),
            None => false,
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<AuthOutcome, AuthError> {
        if !self.require_auth {
            return Ok(AuthOutcome::allow(username.map(str::to_string)));
        }

        let Some(username) = username else {
            return Ok(AuthOutcome::deny());
        };

        if self.verify(username, password.unwrap_or(&[])) {
            Ok(AuthOutcome::allow(Some(username.to_string())))
        } else {
            Ok(AuthOutcome::deny())
        }
    }
}
