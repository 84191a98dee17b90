//! JSON-over-HTTP gateway adapter used for push and in-app (socket) delivery.
//!
//! The gateway owns device tokens and live socket sessions; this side only
//! posts `{address, subject, body}` and reads the verdict.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use herald_common::types::{Channel, RenderedMessage};

use crate::{ChannelAdapter, ChannelError, Delivery};

#[derive(Debug, Default, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    latency_ms: Option<u64>,
}

pub struct GatewayAdapter {
    channel: Channel,
    client: reqwest::Client,
    endpoint: String,
}

impl GatewayAdapter {
    pub fn new(channel: Channel, client: reqwest::Client, endpoint: String) -> Self {
        Self {
            channel,
            client,
            endpoint,
        }
    }
}

#[async_trait]
impl ChannelAdapter for GatewayAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        address: &str,
        message: &RenderedMessage,
    ) -> Result<Delivery, ChannelError> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "channel": self.channel,
                "address": address,
                "subject": message.subject,
                "body": message.body,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::from_status(status, &body));
        }

        let parsed: GatewayResponse = response.json().await.unwrap_or_default();
        Ok(Delivery {
            latency_ms: Some(
                parsed
                    .latency_ms
                    .unwrap_or_else(|| started.elapsed().as_millis() as u64),
            ),
            provider_id: parsed.message_id,
        })
    }
}
