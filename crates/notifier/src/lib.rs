//! Channel adapters: the transports notifications are delivered through.
//!
//! Every transport implements [`ChannelAdapter`]: hand it a recipient
//! address and a rendered message, get back a [`Delivery`] or a
//! [`ChannelError`] that says whether the failure is worth retrying
//! elsewhere. Wire formats stay inside the adapter.

pub mod email;
pub mod gateway;
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::config::AppConfig;
use herald_common::types::{Channel, FailureKind, RenderedMessage};

pub use email::EmailAdapter;
pub use gateway::GatewayAdapter;
pub use mock::MockAdapter;

/// Successful hand-off to a transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    /// Latency reported by the transport; when absent the caller measures it.
    pub latency_ms: Option<u64>,
    /// Provider-side message id, if the transport returns one.
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("recipient rejected: {0}")]
    Rejected(String),
}

impl ChannelError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ChannelError::Transient(_) => FailureKind::Transient,
            ChannelError::Timeout(_) => FailureKind::Timeout,
            ChannelError::Rejected(_) => FailureKind::Permanent,
        }
    }

    /// Map an HTTP status from a provider to a failure class.
    ///
    /// Client errors mean the request (usually the address) is bad and will
    /// stay bad; 408/429 and server errors may succeed later.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
        if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            ChannelError::Rejected(detail)
        } else {
            ChannelError::Transient(detail)
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        ChannelError::Transient(err.to_string())
    }
}

/// Uniform send contract every transport implements.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, address: &str, message: &RenderedMessage)
    -> Result<Delivery, ChannelError>;
}

/// Adapters keyed by the channel they serve.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for its channel.
    pub fn register(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.adapters.keys().copied().collect();
        channels.sort();
        channels
    }

    /// Build the adapters whose credentials/endpoints are configured.
    pub fn from_config(config: &AppConfig) -> Self {
        let client = reqwest::Client::new();
        let mut registry = Self::new();

        if let Some(api_key) = &config.resend_api_key {
            let from = config
                .email_from
                .clone()
                .unwrap_or_else(|| "notifications@herald.local".to_string());
            registry = registry.register(Arc::new(EmailAdapter::new(
                client.clone(),
                api_key.clone(),
                from,
            )));
        }
        if let Some(url) = &config.push_gateway_url {
            registry = registry.register(Arc::new(GatewayAdapter::new(
                Channel::Push,
                client.clone(),
                url.clone(),
            )));
        }
        if let Some(url) = &config.inapp_gateway_url {
            registry = registry.register(Arc::new(GatewayAdapter::new(
                Channel::InApp,
                client,
                url.clone(),
            )));
        }

        tracing::info!(channels = ?registry.channels(), "Channel adapters configured");
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            ChannelError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "bad address").kind(),
            FailureKind::Permanent
        );
        assert_eq!(
            ChannelError::from_status(StatusCode::TOO_MANY_REQUESTS, "").kind(),
            FailureKind::Transient
        );
        assert_eq!(
            ChannelError::from_status(StatusCode::BAD_GATEWAY, "").kind(),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_registry_replaces_by_channel() {
        let registry = AdapterRegistry::new()
            .register(Arc::new(MockAdapter::new(Channel::Email)))
            .register(Arc::new(MockAdapter::new(Channel::Push)))
            .register(Arc::new(MockAdapter::new(Channel::Email)));
        assert_eq!(registry.channels(), vec![Channel::Email, Channel::Push]);
        assert!(registry.get(Channel::Sms).is_none());
    }

    #[test]
    fn test_from_config_skips_unconfigured() {
        let config = AppConfig {
            push_gateway_url: Some("http://push.local".to_string()),
            ..AppConfig::default()
        };
        let registry = AdapterRegistry::from_config(&config);
        assert_eq!(registry.channels(), vec![Channel::Push]);
    }
}
