//! Delivery orchestration engine: channel selection, health tracking,
//! recipient fatigue, automation rules, follow-ups and analytics.

pub mod analytics;
pub mod clock;
pub mod directory;
pub mod dispatch;
pub mod events;
pub mod fatigue;
pub mod fatigue_store;
pub mod followup;
pub mod health;
pub mod orchestrator;
pub mod policy;
pub mod preferences;
pub mod queue;
pub mod rule_service;
pub mod rules;
pub mod store;
pub mod templates;

pub use orchestrator::{Engine, EngineDeps};
