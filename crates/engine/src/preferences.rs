//! Recipient delivery preferences: channel opt-outs and quiet hours.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use herald_common::types::{MAX_UTC_OFFSET_MINUTES, RecipientPreferences};

use crate::store::StoreError;

/// Where recipient preferences are kept. A recipient without a stored entry
/// accepts every channel at any hour.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn preferences(
        &self,
        recipient_id: &str,
    ) -> Result<Option<RecipientPreferences>, StoreError>;

    /// Insert or replace a recipient's preferences.
    async fn save_preferences(&self, preferences: &RecipientPreferences)
    -> Result<(), StoreError>;
}

/// Check preferences before they are stored.
pub fn validate(preferences: &RecipientPreferences) -> Result<(), String> {
    if preferences.recipient_id.trim().is_empty() {
        return Err("recipient_id must not be empty".to_string());
    }
    if let Some(dnd) = &preferences.do_not_disturb
        && dnd.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES
    {
        return Err(format!(
            "utc_offset_minutes {} must be within -{max}..={max}",
            dnd.utc_offset_minutes,
            max = MAX_UTC_OFFSET_MINUTES
        ));
    }
    Ok(())
}

#[derive(Default)]
pub struct InMemoryPreferences {
    entries: RwLock<HashMap<String, RecipientPreferences>>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferences {
    async fn preferences(
        &self,
        recipient_id: &str,
    ) -> Result<Option<RecipientPreferences>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Unavailable("preferences lock poisoned".to_string()))?;
        Ok(entries.get(recipient_id).cloned())
    }

    async fn save_preferences(
        &self,
        preferences: &RecipientPreferences,
    ) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Unavailable("preferences lock poisoned".to_string()))?;
        entries.insert(preferences.recipient_id.clone(), preferences.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Utc};
    use herald_common::types::{Channel, DoNotDisturb};

    #[tokio::test]
    async fn test_save_replaces_entry() {
        let store = InMemoryPreferences::new();
        assert!(store.preferences("r1").await.unwrap().is_none());

        let mut prefs = RecipientPreferences::new("r1", Utc::now());
        prefs.opted_out = vec![Channel::Email];
        store.save_preferences(&prefs).await.unwrap();
        prefs.opted_out = vec![Channel::Push];
        store.save_preferences(&prefs).await.unwrap();

        let stored = store.preferences("r1").await.unwrap().unwrap();
        assert_eq!(stored.opted_out, vec![Channel::Push]);
    }

    #[test]
    fn test_validate_rejects_offset_out_of_range() {
        let mut prefs = RecipientPreferences::new("r1", Utc::now());
        prefs.do_not_disturb = Some(DoNotDisturb {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            utc_offset_minutes: 15 * 60,
        });
        assert!(validate(&prefs).is_err());

        prefs.do_not_disturb = prefs.do_not_disturb.map(|d| DoNotDisturb {
            utc_offset_minutes: -300,
            ..d
        });
        assert!(validate(&prefs).is_ok());
        assert!(validate(&RecipientPreferences::new(" ", Utc::now())).is_err());
    }
}
