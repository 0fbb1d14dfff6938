use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::platform::AppPaths;

/// Prefix of environment overrides, e.g. `VISTACHAT__SERVER__PORT=8080`.
pub const ENV_PREFIX: &str = "VISTACHAT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub client: ClientConfig,
    pub account: AccountConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Requests with a larger body are refused with 413.
    pub max_body_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub api_endpoint: String,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub endpoint: String,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub demo_email: String,
    pub demo_password: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub session_ttl_hours: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 3000,
                max_body_bytes: 32 * 1024 * 1024,
            },
            model: ModelConfig {
                provider: "anthropic".to_string(),
                model: "claude-3-5-sonnet-20240620".to_string(),
                api_endpoint: "https://api.anthropic.com/v1/messages".to_string(),
                max_tokens: 1024,
                timeout_seconds: 120,
            },
            client: ClientConfig {
                endpoint: "http://127.0.0.1:3000/api/chat".to_string(),
                connect_timeout_seconds: 10,
            },
            account: AccountConfig {
                demo_email: "test@example.com".to_string(),
                demo_password: "password123".to_string(),
                display_name: "Test User".to_string(),
                avatar_url: Some("https://github.com/shadcn.png".to_string()),
                session_ttl_hours: 24,
            },
        }
    }
}

impl AppConfig {
    /// Loads `config.toml`, writing the defaults first if it does not exist,
    /// then applies `VISTACHAT__*` environment overrides.
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            Self::default().save(paths).await?;
        }

        info!("Loading configuration from: {:?}", config_file);
        let config = Self::load_layered(&config_file, None)?;
        config.validate()?;

        debug!("Configuration loaded: {:?}", config.server);
        Ok(config)
    }

    /// Defaults, then the file, then the environment. `env` replaces the
    /// process environment when given.
    pub fn load_layered(config_file: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let defaults = toml::to_string(&Self::default())
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let config = Config::builder()
            .add_source(File::from_str(&defaults, FileFormat::Toml))
            .add_source(File::from(config_file).format(FileFormat::Toml).required(false))
            .add_source(environment)
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        let config_file = paths.config_file();
        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!("Saving configuration to: {:?}", config_file);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        fs::write(&config_file, config_content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::validation("Server port must not be 0"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(Error::validation("Server max_body_bytes must be positive"));
        }

        if self.model.model.trim().is_empty() {
            return Err(Error::validation("Model id must not be empty"));
        }
        if self.model.max_tokens == 0 {
            return Err(Error::validation("Model max_tokens must be positive"));
        }
        if self.model.timeout_seconds == 0 {
            return Err(Error::validation("Model timeout_seconds must be positive"));
        }
        if !is_http_url(&self.model.api_endpoint) {
            return Err(Error::validation(format!(
                "Model api_endpoint is not an http(s) URL: {}",
                self.model.api_endpoint
            )));
        }

        if !is_http_url(&self.client.endpoint) {
            return Err(Error::validation(format!(
                "Client endpoint is not an http(s) URL: {}",
                self.client.endpoint
            )));
        }

        if self.account.session_ttl_hours <= 0 {
            return Err(Error::validation("Session TTL must be positive"));
        }

        Ok(())
    }

    /// `host:port` the server listens on.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}
