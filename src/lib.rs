pub mod account;
pub mod app;
pub mod chat;
pub mod error;
pub mod models;
pub mod platform;
pub mod server;
pub mod transport;

pub use error::{Error, Result};
