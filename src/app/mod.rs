pub mod config;

pub use config::{BrokerConfig, Config, ListenerConfig};
