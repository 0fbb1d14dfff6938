use async_trait::async_trait;
use keyring::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const API_KEY_SERVICE: &str = "vistachat.api_keys";

#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn store(&self, service: &str, key: &str, value: &str) -> Result<()>;
    async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>>;
    async fn delete(&self, service: &str, key: &str) -> Result<()>;
}

/// Provider API keys, kept out of the config file.
pub struct SecureStorageManager {
    backend: Box<dyn SecureStorage>,
}

impl SecureStorageManager {
    pub fn new() -> Result<Self> {
        Ok(Self::with_backend(Box::new(KeyringStorage)))
    }

    pub fn with_backend(backend: Box<dyn SecureStorage>) -> Self {
        Self { backend }
    }

    pub async fn store_api_key(&self, provider: &str, key: &str) -> Result<()> {
        let result = self.backend.store(API_KEY_SERVICE, provider, key).await;
        match &result {
            Ok(()) => debug!("Stored API key for provider: {}", provider),
            Err(e) => warn!("Failed to store API key for provider {}: {}", provider, e),
        }
        result
    }

    pub async fn retrieve_api_key(&self, provider: &str) -> Result<Option<String>> {
        let result = self.backend.retrieve(API_KEY_SERVICE, provider).await;
        match &result {
            Ok(Some(_)) => debug!("Found API key for provider: {}", provider),
            Ok(None) => debug!("No API key stored for provider: {}", provider),
            Err(e) => warn!("Failed to read API key for provider {}: {}", provider, e),
        }
        result
    }

    pub async fn delete_api_key(&self, provider: &str) -> Result<()> {
        let result = self.backend.delete(API_KEY_SERVICE, provider).await;
        if let Err(e) = &result {
            warn!("Failed to delete API key for provider {}: {}", provider, e);
        }
        result
    }
}

/// OS keychain through the keyring crate.
pub struct KeyringStorage;

#[async_trait]
impl SecureStorage for KeyringStorage {
    async fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let entry = Entry::new(service, key)?;
        entry.set_password(value)?;
        Ok(())
    }

    async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>> {
        let entry = Entry::new(service, key)?;
        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::SecureStorage(e)),
        }
    }

    async fn delete(&self, service: &str, key: &str) -> Result<()> {
        let entry = Entry::new(service, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::SecureStorage(e)),
        }
    }
}

/// Process-local store for tests and machines without a keychain.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<(String, String), String>>,
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .insert((service.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .get(&(service.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, service: &str, key: &str) -> Result<()> {
        self.entries.lock().remove(&(service.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_api_key_roundtrip() {
        let storage = SecureStorageManager::with_backend(Box::<MemoryStorage>::default());

        storage.store_api_key("anthropic", "sk-test").await.unwrap();
        assert_eq!(
            storage.retrieve_api_key("anthropic").await.unwrap(),
            Some("sk-test".to_string())
        );

        storage.delete_api_key("anthropic").await.unwrap();
        assert_eq!(storage.retrieve_api_key("anthropic").await.unwrap(), None);
        storage.delete_api_key("anthropic").await.unwrap();
    }

    #[tokio::test]
    async fn test_keychain_keeps_stored_key() {
        let storage = SecureStorageManager::new().unwrap();
        let provider = format!("test-{}", uuid::Uuid::new_v4());

        // Machines without a keychain service reject the write outright.
        if let Err(e) = storage.store_api_key(&provider, "secret-123").await {
            eprintln!("skipping: no keychain available ({})", e);
            return;
        }

        let stored = storage.retrieve_api_key(&provider).await;
        storage.delete_api_key(&provider).await.unwrap();
        assert_eq!(stored.unwrap(), Some("secret-123".to_string()));
    }
}
