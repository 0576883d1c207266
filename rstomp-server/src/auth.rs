//! Credential-based authentication of CONNECT frames.
//!
//! Passcodes are validated against SHA-256 hashes stored in configuration,
//! so plaintext passcodes never appear in config files.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid credentials for '{0}'")]
    InvalidCredentials(String),

    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

/// Checks the `login`/`passcode` pair of a CONNECT frame.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(
        &self,
        login: Option<&str>,
        passcode: Option<&str>,
    ) -> Result<User, AuthError>;
}

/// Validates logins against pre-configured passcode hashes.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    /// login -> SHA-256 hex hash of the passcode.
    users: HashMap<String, String>,
}

impl CredentialStore {
    /// Creates a store from `(login, passcode_hash)` pairs.
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|(login, hash)| (login, hash.to_lowercase()))
                .collect(),
        }
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Validates a plaintext passcode by hashing and comparing.
    pub fn validate(&self, login: &str, passcode: &str) -> bool {
        self.users
            .get(login)
            .is_some_and(|hash| *hash == Self::hash_passcode(passcode))
    }

    /// Hashes a passcode using SHA-256, returning a lowercase hex string.
    pub fn hash_passcode(passcode: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(passcode.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl AuthProvider for CredentialStore {
    async fn authenticate(
        &self,
        login: Option<&str>,
        passcode: Option<&str>,
    ) -> Result<User, AuthError> {
        let (Some(login), Some(passcode)) = (login, passcode) else {
            return Err(AuthError::MissingCredentials);
        };
        if self.validate(login, passcode) {
            Ok(User {
                login: login.to_string(),
            })
        } else {
            Err(AuthError::InvalidCredentials(login.to_string()))
        }
    }
}
