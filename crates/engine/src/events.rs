//! In-process event bus between engine components.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use herald_common::types::{Channel, HealthStatus};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    HealthChanged {
        channel: Channel,
        from: HealthStatus,
        to: HealthStatus,
    },
    /// A send was counted against a recipient's daily budget.
    FatigueRecorded {
        recipient_id: String,
    },
    FatigueCooldown {
        recipient_id: String,
        until: DateTime<Utc>,
    },
    ReportGenerated {
        report_id: Uuid,
    },
    RulesChanged,
    FollowUpExhausted {
        task_id: Uuid,
        request_id: Uuid,
    },
}

/// Cloneable publisher; subscribers that fall behind lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine: nothing is listening yet.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
