//! Scriptable in-memory adapter for tests and local runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use herald_common::types::{Channel, RenderedMessage};

use crate::{ChannelAdapter, ChannelError, Delivery};

/// Adapter whose outcomes are queued up front.
///
/// Queued outcomes are consumed in order; once empty, every send gets the
/// fallback outcome (success unless configured otherwise).
pub struct MockAdapter {
    channel: Channel,
    script: Mutex<VecDeque<Result<Delivery, ChannelError>>>,
    fallback: Mutex<Result<Delivery, ChannelError>>,
    delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<(String, RenderedMessage)>>,
}

impl MockAdapter {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(Delivery::default())),
            delay: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every unscripted send fails with `err`.
    pub fn failing(self, err: ChannelError) -> Self {
        self.set_fallback(Err(err));
        self
    }

    /// Every unscripted send succeeds with the given reported latency.
    pub fn with_latency(self, latency_ms: u64) -> Self {
        self.set_fallback(Ok(Delivery {
            latency_ms: Some(latency_ms),
            provider_id: None,
        }));
        self
    }

    /// Sleep before answering (for timeout tests).
    pub fn with_delay(self, delay: Duration) -> Self {
        if let Ok(mut d) = self.delay.lock() {
            *d = Some(delay);
        }
        self
    }

    pub fn set_fallback(&self, outcome: Result<Delivery, ChannelError>) {
        if let Ok(mut fallback) = self.fallback.lock() {
            *fallback = outcome;
        }
    }

    pub fn push_outcome(&self, outcome: Result<Delivery, ChannelError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Number of send calls observed (successful or not).
    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn sent(&self) -> Vec<(String, RenderedMessage)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        address: &str,
        message: &RenderedMessage,
    ) -> Result<Delivery, ChannelError> {
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Ok(mut sent) = self.sent.lock() {
            sent.push((address.to_string(), message.clone()));
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => self
                .fallback
                .lock()
                .map(|f| f.clone())
                .unwrap_or_else(|_| Err(ChannelError::Transient("mock poisoned".to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> RenderedMessage {
        RenderedMessage {
            subject: None,
            body: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let adapter = MockAdapter::new(Channel::Push);
        adapter.push_outcome(Err(ChannelError::Transient("flaky".to_string())));

        assert!(adapter.send("a", &message()).await.is_err());
        assert!(adapter.send("a", &message()).await.is_ok());
        assert_eq!(adapter.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_failing_fallback() {
        let adapter =
            MockAdapter::new(Channel::Sms).failing(ChannelError::Rejected("no number".to_string()));
        let err = adapter.send("x", &message()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(_)));
    }
}
