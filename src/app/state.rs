use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::account::SessionStore;
use crate::app::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::{AnthropicProvider, ModelProvider};
use crate::platform::{AppPaths, SecureStorageManager};
use crate::server::ChatEndpoint;
use crate::transport::HttpTransport;

/// Environment variable checked before the keychain.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

pub struct AppState {
    config: RwLock<AppConfig>,
    paths: AppPaths,
    secure_storage: SecureStorageManager,
    sessions: SessionStore,
}

impl AppState {
    pub fn new(config: AppConfig, paths: AppPaths, secure_storage: SecureStorageManager) -> Self {
        info!("Initializing application state");
        let sessions = SessionStore::new(paths.session_file(), config.account.clone());

        Self {
            config: RwLock::new(config),
            paths,
            secure_storage,
            sessions,
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub async fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        debug!("Updating application configuration");

        let config = {
            let mut config = self.config.write();
            let mut updated = config.clone();
            updater(&mut updated);
            updated.validate()?;
            *config = updated.clone();
            updated
        };

        config.save(&self.paths).await?;
        info!("Configuration updated and saved");
        Ok(())
    }

    pub fn get_paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// `ANTHROPIC_API_KEY` if set, otherwise the key stored for the
    /// configured provider.
    pub async fn get_api_key(&self) -> Result<Option<String>> {
        self.resolve_api_key(std::env::var(API_KEY_ENV).ok()).await
    }

    async fn resolve_api_key(&self, from_env: Option<String>) -> Result<Option<String>> {
        if let Some(key) = from_env.filter(|key| !key.trim().is_empty()) {
            debug!("Using API key from {}", API_KEY_ENV);
            return Ok(Some(key));
        }
        let provider = self.config.read().model.provider.clone();
        self.secure_storage.retrieve_api_key(&provider).await
    }

    pub async fn set_api_key(&self, api_key: &str) -> Result<()> {
        if api_key.trim().is_empty() {
            return Err(Error::validation("API key must not be empty"));
        }
        let provider = self.config.read().model.provider.clone();
        self.secure_storage.store_api_key(&provider, api_key.trim()).await?;
        info!("Stored API key for {}", provider);
        Ok(())
    }

    pub async fn remove_api_key(&self) -> Result<()> {
        let provider = self.config.read().model.provider.clone();
        self.secure_storage.delete_api_key(&provider).await?;
        info!("Removed API key for {}", provider);
        Ok(())
    }

    pub async fn create_provider(&self) -> Result<Arc<dyn ModelProvider>> {
        let model = self.config.read().model.clone();
        let api_key = self.get_api_key().await?.ok_or_else(|| {
            Error::model_provider(format!(
                "No API key for {}; set {} or run `vistachat api-key --set <KEY>`",
                model.provider, API_KEY_ENV
            ))
        })?;

        match model.provider.as_str() {
            "anthropic" => Ok(Arc::new(AnthropicProvider::new(api_key, &model)?)),
            other => Err(Error::validation(format!("Unsupported model provider: {}", other))),
        }
    }

    pub async fn create_endpoint(&self) -> Result<ChatEndpoint> {
        let provider = self.create_provider().await?;
        let model = self.config.read().model.clone();
        Ok(ChatEndpoint::new(provider, model.model, model.max_tokens))
    }

    pub fn create_transport(&self) -> Result<HttpTransport> {
        let client = self.config.read().client.clone();
        HttpTransport::new(client.endpoint, Duration::from_secs(client.connect_timeout_seconds))
    }
}
