//! Email delivery through the Resend HTTP API.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use herald_common::types::{Channel, RenderedMessage};

use crate::{ChannelAdapter, ChannelError, Delivery};

const RESEND_API_URL: &str = "https://api.resend.com";
const DEFAULT_SUBJECT: &str = "Notification";

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    id: Option<String>,
}

pub struct EmailAdapter {
    client: reqwest::Client,
    api_key: String,
    from: String,
    base_url: String,
}

impl EmailAdapter {
    pub fn new(client: reqwest::Client, api_key: String, from: String) -> Self {
        Self {
            client,
            api_key,
            from,
            base_url: RESEND_API_URL.to_string(),
        }
    }

    /// Point the adapter at a different API host (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        address: &str,
        message: &RenderedMessage,
    ) -> Result<Delivery, ChannelError> {
        if !address.contains('@') {
            return Err(ChannelError::Rejected(format!(
                "'{}' is not an email address",
                address
            )));
        }

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/emails", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [address],
                "subject": message.subject.as_deref().unwrap_or(DEFAULT_SUBJECT),
                "text": message.body,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::from_status(status, &body));
        }

        let parsed: SendEmailResponse = response
            .json()
            .await
            .unwrap_or(SendEmailResponse { id: None });

        tracing::debug!(provider_id = ?parsed.id, "Email accepted by provider");

        Ok(Delivery {
            latency_ms: Some(started.elapsed().as_millis() as u64),
            provider_id: parsed.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::FailureKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> RenderedMessage {
        RenderedMessage {
            subject: Some("Reminder".to_string()),
            body: "Your meeting starts soon".to_string(),
        }
    }

    fn adapter(server: &MockServer) -> EmailAdapter {
        EmailAdapter::new(
            reqwest::Client::new(),
            "re_test".to_string(),
            "noreply@herald.test".to_string(),
        )
        .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_send_returns_provider_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("authorization", "Bearer re_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "em_123"})))
            .mount(&server)
            .await;

        let delivery = adapter(&server)
            .send("user@example.com", &message())
            .await
            .unwrap();
        assert_eq!(delivery.provider_id.as_deref(), Some("em_123"));
        assert!(delivery.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_invalid_address_is_permanent() {
        let server = MockServer::start().await;
        let err = adapter(&server)
            .send("not-an-address", &message())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .send("user@example.com", &message())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
    }
}
