//! Event schema versioning.
//!
//! Each upgrader lifts one event type one schema version; the registry
//! composes them into a chain applied on read, so old events always
//! fold with the latest `apply` logic. Upgraders must be pure and total
//! for their declared source version.

use std::collections::HashMap;
use std::sync::Arc;

use catga_core::{CatgaError, Result};

use crate::event::StoredEvent;

pub trait EventUpgrader: Send + Sync {
    fn event_type(&self) -> &str;

    /// Schema version this upgrader consumes; it produces
    /// `source_version() + 1`.
    fn source_version(&self) -> u16;

    fn upgrade(&self, payload: serde_json::Value) -> Result<serde_json::Value>;
}

#[derive(Default)]
pub struct EventVersionRegistry {
    upgraders: HashMap<(String, u16), Arc<dyn EventUpgrader>>,
    latest: HashMap<String, u16>,
}

impl EventVersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, upgrader: Arc<dyn EventUpgrader>) {
        let event_type = upgrader.event_type().to_string();
        let source = upgrader.source_version();
        let produced = source + 1;

        let latest = self.latest.entry(event_type.clone()).or_insert(produced);
        if produced > *latest {
            *latest = produced;
        }
        self.upgraders.insert((event_type, source), upgrader);
    }

    /// Latest known schema version for `event_type`; 1 when no
    /// upgraders are registered.
    pub fn latest_version(&self, event_type: &str) -> u16 {
        self.latest.get(event_type).copied().unwrap_or(1)
    }

    /// Upgrade a stored event in place to the latest schema. Fails if
    /// the chain has a gap.
    pub fn upgrade_to_latest(&self, event: &mut StoredEvent) -> Result<()> {
        let latest = self.latest_version(&event.event_type);
        while event.schema_version < latest {
            let key = (event.event_type.clone(), event.schema_version);
            let upgrader = self.upgraders.get(&key).ok_or_else(|| {
                CatgaError::Serialization(format!(
                    "no upgrader for {} v{} (latest is v{})",
                    event.event_type, event.schema_version, latest
                ))
            })?;
            event.payload = upgrader.upgrade(std::mem::take(&mut event.payload))?;
            event.schema_version += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    struct AddCurrency;

    impl EventUpgrader for AddCurrency {
        fn event_type(&self) -> &str {
            "Deposited"
        }
        fn source_version(&self) -> u16 {
            1
        }
        fn upgrade(&self, mut payload: serde_json::Value) -> Result<serde_json::Value> {
            payload["currency"] = json!("EUR");
            Ok(payload)
        }
    }

    struct RenameAmount;

    impl EventUpgrader for RenameAmount {
        fn event_type(&self) -> &str {
            "Deposited"
        }
        fn source_version(&self) -> u16 {
            2
        }
        fn upgrade(&self, payload: serde_json::Value) -> Result<serde_json::Value> {
            let amount = payload.get("amount").cloned().unwrap_or(json!(0));
            let currency = payload.get("currency").cloned().unwrap_or(json!("EUR"));
            Ok(json!({ "value": amount, "currency": currency }))
        }
    }

    fn stored(schema_version: u16, payload: serde_json::Value) -> StoredEvent {
        StoredEvent {
            stream_id: "acct-1".into(),
            version: 0,
            event_type: "Deposited".into(),
            schema_version,
            payload,
            appended_at: Utc::now(),
        }
    }

    fn registry() -> EventVersionRegistry {
        let mut registry = EventVersionRegistry::new();
        registry.register(Arc::new(AddCurrency));
        registry.register(Arc::new(RenameAmount));
        registry
    }

    #[test]
    fn chain_upgrades_oldest_to_latest() {
        let registry = registry();
        assert_eq!(registry.latest_version("Deposited"), 3);

        let mut event = stored(1, json!({ "amount": 100 }));
        registry.upgrade_to_latest(&mut event).unwrap();
        assert_eq!(event.schema_version, 3);
        assert_eq!(event.payload, json!({ "value": 100, "currency": "EUR" }));
    }

    #[test]
    fn intermediate_version_reaches_same_terminal_value() {
        let registry = registry();

        // Starting at v2 must equal composing from v1.
        let mut from_v1 = stored(1, json!({ "amount": 100 }));
        registry.upgrade_to_latest(&mut from_v1).unwrap();

        let mut from_v2 = stored(2, json!({ "amount": 100, "currency": "EUR" }));
        registry.upgrade_to_latest(&mut from_v2).unwrap();

        assert_eq!(from_v1.payload, from_v2.payload);
    }

    #[test]
    fn latest_events_pass_through_untouched() {
        let registry = registry();
        let payload = json!({ "value": 7, "currency": "EUR" });
        let mut event = stored(3, payload.clone());
        registry.upgrade_to_latest(&mut event).unwrap();
        assert_eq!(event.payload, payload);
    }

    #[test]
    fn gap_in_chain_is_an_error() {
        let mut registry = EventVersionRegistry::new();
        registry.register(Arc::new(RenameAmount)); // only v2 -> v3

        let mut event = stored(1, json!({ "amount": 1 }));
        assert!(registry.upgrade_to_latest(&mut event).is_err());
    }

    #[test]
    fn unknown_type_defaults_to_version_one() {
        let registry = EventVersionRegistry::new();
        assert_eq!(registry.latest_version("Whatever"), 1);
    }
}
