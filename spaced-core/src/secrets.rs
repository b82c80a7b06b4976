//! Secret store collaborator.
//!
//! The daemon never owns credential storage; it talks to whatever keyring the
//! platform offers through [`SecretStore`]. [`MemorySecretStore`] keeps
//! everything in process memory and backs tests and development runs.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::SecretStoreError;

/// Bookkeeping about a stored secret, readable without the secret itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMetadata {
    pub key: String,
    pub size: usize,
    pub updated_at: DateTime<Utc>,
}

pub trait SecretStore: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), SecretStoreError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, SecretStoreError>;
    fn remove(&self, key: &str) -> Result<(), SecretStoreError>;
    fn metadata(&self, key: &str) -> Result<SecretMetadata, SecretStoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    items: RwLock<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> SecretStoreError {
    SecretStoreError::Backend("memory secret store lock poisoned".to_string())
}

fn not_found(key: &str) -> SecretStoreError {
    SecretStoreError::NotFound {
        key: key.to_string(),
    }
}

impl SecretStore for MemorySecretStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), SecretStoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        items.insert(key.to_string(), (value.to_vec(), Utc::now()));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, SecretStoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        items
            .get(key)
            .map(|(value, _)| value.clone())
            .ok_or_else(|| not_found(key))
    }

    fn remove(&self, key: &str) -> Result<(), SecretStoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        items.remove(key).map(|_| ()).ok_or_else(|| not_found(key))
    }

    fn metadata(&self, key: &str) -> Result<SecretMetadata, SecretStoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        items
            .get(key)
            .map(|(value, updated_at)| SecretMetadata {
                key: key.to_string(),
                size: value.len(),
                updated_at: *updated_at,
            })
            .ok_or_else(|| not_found(key))
    }
}
