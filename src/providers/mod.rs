//! Odds provider adapters

pub mod api_key;
pub mod core;
pub mod fallback;
pub mod hmac;
pub mod socket_push;
pub mod traits;

pub use api_key::ApiKeyProvider;
pub use fallback::{FallbackSource, HttpFallbackSource};
pub use hmac::HmacProvider;
pub use socket_push::SocketPushProvider;
pub use traits::*;

use crate::{config::ProviderConfig, OddsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Supported adapter implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// REST with an API key header
    ApiKey,
    /// REST with HMAC-signed requests
    Hmac,
    /// Websocket push feed
    SocketPush,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::ApiKey => write!(f, "api_key"),
            ProviderKind::Hmac => write!(f, "hmac"),
            ProviderKind::SocketPush => write!(f, "socket_push"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = OddsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api_key" => Ok(ProviderKind::ApiKey),
            "hmac" => Ok(ProviderKind::Hmac),
            "socket_push" => Ok(ProviderKind::SocketPush),
            _ => Err(OddsError::Config(format!("Unknown provider kind: {}", s))),
        }
    }
}

/// Provider factory for creating adapters from configuration
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create the adapter for `config.kind`
    pub fn create(config: ProviderConfig, error_threshold: u32) -> Result<Arc<dyn ProviderAdapter>> {
        match config.kind {
            ProviderKind::ApiKey => Ok(Arc::new(ApiKeyProvider::with_error_threshold(config, error_threshold)?)),
            ProviderKind::Hmac => Ok(Arc::new(HmacProvider::with_error_threshold(config, error_threshold)?)),
            ProviderKind::SocketPush => Ok(Arc::new(SocketPushProvider::with_error_threshold(
                config,
                error_threshold,
            )?)),
        }
    }
}
