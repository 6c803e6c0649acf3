pub mod config;
pub mod error;
pub mod hub;
pub mod routes;
pub mod server;
pub mod session;

pub use config::{load_config, AppConfig, ConfigError, ServerConfig};
pub use error::{ApiError, ServerError};
pub use hub::{ConnectionHub, HubConfig};
pub use server::{build_router, start, start_with, AppState, ServerHandle};
