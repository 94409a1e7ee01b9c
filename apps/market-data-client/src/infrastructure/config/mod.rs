//! Configuration Module
//!
//! Configuration loading for the market data client.

mod settings;

pub use settings::{
    ApiKey, BatchSettings, CacheSettings, ClientConfig, ConfigError, EndpointSettings,
    RateLimitSettings, ServerSettings, StoreSettings, WebSocketSettings,
};
