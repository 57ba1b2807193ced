//! Exposes the latest drift verdict per symbol as a lifecycle governance gate.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use pattern_core::{ConfigHandle, GovernanceGate, HorizonKey, LifecycleAction};

use crate::config::DriftConfig;
use crate::engine::DriftPayload;
use crate::severity::Severity;

pub struct DriftGovernance {
    latest: DashMap<String, DriftPayload>,
    config: ConfigHandle<DriftConfig>,
}

impl DriftGovernance {
    pub fn new(config: ConfigHandle<DriftConfig>) -> Self {
        Self {
            latest: DashMap::new(),
            config,
        }
    }

    /// Older payloads never replace newer ones.
    pub fn update(&self, payload: DriftPayload) {
        match self.latest.entry(payload.symbol.clone()) {
            Entry::Occupied(mut current) => {
                if current.get().as_of <= payload.as_of {
                    current.insert(payload);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(payload);
            }
        }
    }

    pub fn latest(&self, symbol: &str) -> Option<DriftPayload> {
        self.latest.get(symbol).map(|p| p.value().clone())
    }
}

#[async_trait]
impl GovernanceGate for DriftGovernance {
    async fn blocked_reason(&self, key: &HorizonKey, action: LifecycleAction) -> Option<String> {
        let payload = self.latest.get(&key.symbol)?;
        payload.blocks(action).then(|| {
            format!(
                "{}: drift {} as of {}",
                payload.recommendation,
                payload.severity,
                payload.as_of.date_naive()
            )
        })
    }

    async fn rollback_trigger(&self, key: &HorizonKey) -> Option<String> {
        if !self.config.snapshot().rollback_on_critical {
            return None;
        }
        let payload = self.latest.get(&key.symbol)?;
        (payload.severity == Severity::Critical)
            .then(|| format!("CRITICAL drift as of {}", payload.as_of.date_naive()))
    }
}
