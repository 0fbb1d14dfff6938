pub mod config;
pub mod state;

pub use config::{AccountConfig, AppConfig, ClientConfig, ModelConfig, ServerConfig};
pub use state::AppState;
