//! Recipient address lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use herald_common::types::Channel;

use crate::store::StoreError;

/// Resolves where a recipient is reached on a channel.
///
/// `Ok(None)` means the recipient has no address on that channel, which the
/// dispatcher treats as a permanent rejection for the attempt.
#[async_trait]
pub trait AddressBook: Send + Sync {
    async fn address(
        &self,
        recipient_id: &str,
        channel: Channel,
    ) -> Result<Option<String>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryAddressBook {
    entries: RwLock<HashMap<(String, Channel), String>>,
}

impl InMemoryAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        recipient_id: impl Into<String>,
        channel: Channel,
        address: impl Into<String>,
    ) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert((recipient_id.into(), channel), address.into());
        }
    }

    /// Register the same address on every channel (handy for local runs).
    pub fn insert_all(&self, recipient_id: &str, address: &str) {
        for channel in Channel::ALL {
            self.insert(recipient_id, channel, address);
        }
    }
}

#[async_trait]
impl AddressBook for InMemoryAddressBook {
    async fn address(
        &self,
        recipient_id: &str,
        channel: Channel,
    ) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Unavailable("address book lock poisoned".to_string()))?;
        Ok(entries.get(&(recipient_id.to_string(), channel)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_per_channel() {
        let book = InMemoryAddressBook::new();
        book.insert("alice", Channel::Email, "alice@example.com");

        assert_eq!(
            book.address("alice", Channel::Email).await.unwrap().as_deref(),
            Some("alice@example.com")
        );
        assert!(book.address("alice", Channel::Sms).await.unwrap().is_none());
        assert!(book.address("bob", Channel::Email).await.unwrap().is_none());
    }
}
