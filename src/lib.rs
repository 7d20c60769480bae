pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod proxy;
pub mod route;
pub mod sniff;

pub use config::{Config, ConfigStore};
pub use engine::Engine;
pub use error::ProxyError;
