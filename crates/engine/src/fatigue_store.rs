//! Durable storage for fatigue records.
//!
//! Records are written with an expiry at the next daily reset, so a stale
//! day's counter disappears on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;

use herald_common::types::FatigueRecord;

use crate::store::StoreError;

#[async_trait]
pub trait FatigueStore: Send + Sync {
    async fn load(&self, recipient_id: &str) -> Result<Option<FatigueRecord>, StoreError>;
    /// Persist `record` until `expires_at`.
    async fn save(
        &self,
        record: &FatigueRecord,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryFatigueStore {
    records: RwLock<HashMap<String, FatigueRecord>>,
    unavailable: AtomicBool,
}

impl MemoryFatigueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("fatigue store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FatigueStore for MemoryFatigueStore {
    async fn load(&self, recipient_id: &str) -> Result<Option<FatigueRecord>, StoreError> {
        self.check()?;
        Ok(self.records.read().await.get(recipient_id).cloned())
    }

    async fn save(
        &self,
        record: &FatigueRecord,
        _expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.records
            .write()
            .await
            .insert(record.recipient_id.clone(), record.clone());
        Ok(())
    }
}

/// Redis-backed store. One JSON value per recipient under `fatigue:{id}`.
#[derive(Clone)]
pub struct RedisFatigueStore {
    redis: ConnectionManager,
}

impl RedisFatigueStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(recipient_id: &str) -> String {
        format!("fatigue:{}", recipient_id)
    }
}

#[async_trait]
impl FatigueStore for RedisFatigueStore {
    async fn load(&self, recipient_id: &str) -> Result<Option<FatigueRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(Self::key(recipient_id)).await?;
        raw.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn save(
        &self,
        record: &FatigueRecord,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(record)?;

        // SET key value EXAT unix_ts
        let _: () = redis::cmd("SET")
            .arg(Self::key(&record.recipient_id))
            .arg(json)
            .arg("EXAT")
            .arg(expires_at.timestamp())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_key_format() {
        assert_eq!(RedisFatigueStore::key("user-7"), "fatigue:user-7");
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryFatigueStore::new();
        let mut record = FatigueRecord::new("r1", Utc::now().date_naive());
        record.daily_count = 3;
        store.save(&record, Utc::now()).await.unwrap();
        assert_eq!(store.load("r1").await.unwrap(), Some(record));
        assert!(store.load("r2").await.unwrap().is_none());
    }
}
