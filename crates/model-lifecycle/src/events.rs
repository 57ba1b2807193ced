//! Lifecycle event stream.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use pattern_core::{CoreError, CoreResult, HorizonKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEventType {
    Bootstrapped,
    ShadowCreated,
    Promoted,
    RolledBack,
    Retrained,
    Frozen,
    Unfrozen,
}

impl LifecycleEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEventType::Bootstrapped => "BOOTSTRAPPED",
            LifecycleEventType::ShadowCreated => "SHADOW_CREATED",
            LifecycleEventType::Promoted => "PROMOTED",
            LifecycleEventType::RolledBack => "ROLLED_BACK",
            LifecycleEventType::Retrained => "RETRAINED",
            LifecycleEventType::Frozen => "FROZEN",
            LifecycleEventType::Unfrozen => "UNFROZEN",
        }
    }
}

impl fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleEventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BOOTSTRAPPED" => Ok(LifecycleEventType::Bootstrapped),
            "SHADOW_CREATED" => Ok(LifecycleEventType::ShadowCreated),
            "PROMOTED" => Ok(LifecycleEventType::Promoted),
            "ROLLED_BACK" => Ok(LifecycleEventType::RolledBack),
            "RETRAINED" => Ok(LifecycleEventType::Retrained),
            "FROZEN" => Ok(LifecycleEventType::Frozen),
            "UNFROZEN" => Ok(LifecycleEventType::Unfrozen),
            other => Err(CoreError::Storage(format!("unknown event type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub event_type: LifecycleEventType,
    pub key: HorizonKey,
    pub from_model_id: Option<String>,
    pub to_model_id: Option<String>,
    pub reason: String,
    /// Measured margins or other structured context.
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        event_type: LifecycleEventType,
        key: HorizonKey,
        from_model_id: Option<String>,
        to_model_id: Option<String>,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            key,
            from_model_id,
            to_model_id,
            reason: reason.into(),
            details: serde_json::Value::Null,
            timestamp,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Append-only in-memory log with a broadcast feed for subscribers.
pub struct EventLog {
    events: RwLock<Vec<LifecycleEvent>>,
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            events: RwLock::new(Vec::new()),
            sender,
        }
    }

    pub fn append(&self, event: LifecycleEvent) -> CoreResult<()> {
        let mut guard = self
            .events
            .write()
            .map_err(|_| CoreError::Storage("event log lock poisoned".to_string()))?;
        guard.push(event.clone());
        drop(guard);
        // No subscribers is fine
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, key: &HorizonKey) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .map(|g| g.iter().filter(|e| &e.key == key).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pattern_core::Horizon;

    #[test]
    fn test_event_type_round_trip_through_str() {
        for t in [
            LifecycleEventType::Bootstrapped,
            LifecycleEventType::ShadowCreated,
            LifecycleEventType::Promoted,
            LifecycleEventType::RolledBack,
            LifecycleEventType::Retrained,
            LifecycleEventType::Frozen,
            LifecycleEventType::Unfrozen,
        ] {
            assert_eq!(t.as_str().parse::<LifecycleEventType>().unwrap(), t);
        }
        assert!("DELETED".parse::<LifecycleEventType>().is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_appended_events() {
        let log = EventLog::new(8);
        let mut rx = log.subscribe();
        let key = HorizonKey::new("eth", Horizon::days(7));
        log.append(LifecycleEvent::new(
            LifecycleEventType::Bootstrapped,
            key.clone(),
            None,
            Some("v1".to_string()),
            "initial",
            Utc::now(),
        ))
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, LifecycleEventType::Bootstrapped);
        assert_eq!(log.events_for(&key).len(), 1);
        assert!(log.events_for(&HorizonKey::new("BTC", Horizon::days(7))).is_empty());
    }

    #[test]
    fn test_event_serializes_screaming_case() {
        let e = LifecycleEvent::new(
            LifecycleEventType::RolledBack,
            HorizonKey::new("SPY", Horizon::days(1)),
            Some("v2".to_string()),
            Some("v1".to_string()),
            "WIN_RATE_FLOOR",
            Utc::now(),
        );
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["event_type"], "ROLLED_BACK");
        assert_eq!(json["key"]["horizon"], "1d");
    }
}
