//! Cross-crate integration test helpers.
//!
//! A [`Ledger`] remembers every operation a test submitted so that, after
//! any sequence of flushes and network changes, the store can be checked
//! for lost or altered work.

use serde_json::Value;
use std::collections::BTreeMap;
use syncwell_protocol::{Operation, OperationId, OperationStatus};
use syncwell_store::OperationStore;

/// Where a submitted operation ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    /// Applied remotely (or superseded) and possibly archived.
    Completed,
    /// Still queued, failed, or parked, with its payload intact.
    Retained(OperationStatus),
}

/// Submitted operations and their original payloads.
#[derive(Debug, Default)]
pub struct Ledger {
    submitted: BTreeMap<OperationId, Value>,
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a queued operation.
    pub fn record(&mut self, op: &Operation) {
        self.submitted.insert(op.id, op.payload.clone());
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.submitted.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.submitted.is_empty()
    }

    /// Checks every recorded operation against the store.
    ///
    /// Each one must be completed (live or archived) or still present with
    /// the payload it was submitted with.
    pub fn verify(&self, store: &OperationStore) -> Result<BTreeMap<OperationId, Fate>, String> {
        let mut fates = BTreeMap::new();
        for (id, payload) in &self.submitted {
            let fate = match store.get(id) {
                Some(op) if op.status == OperationStatus::Completed => Fate::Completed,
                Some(op) if &op.payload != payload => {
                    return Err(format!(
                        "{id} payload changed: {} became {}",
                        payload, op.payload
                    ));
                }
                Some(op) => Fate::Retained(op.status),
                None if store.is_done(id) => Fate::Completed,
                None => return Err(format!("{id} disappeared from the store")),
            };
            fates.insert(*id, fate);
        }
        Ok(fates)
    }

    /// Operations of the ledger that completed.
    pub fn completed(&self, store: &OperationStore) -> usize {
        self.submitted.keys().filter(|id| store.is_done(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncwell_protocol::{NewOperation, Timestamp};
    use syncwell_store::WriteOrigin;

    fn queued(store: &OperationStore, title: &str) -> Operation {
        let request = NewOperation::create_with_id("card", title, json!({ "title": title }));
        store
            .insert(Operation::from_request(request, 3, Timestamp::from_millis(1)))
            .unwrap()
    }

    #[test]
    fn retained_operations_keep_their_payload() {
        let store = OperationStore::in_memory().unwrap();
        let mut ledger = Ledger::new();
        let op = queued(&store, "a");
        ledger.record(&op);

        let fates = ledger.verify(&store).unwrap();
        assert_eq!(fates[&op.id], Fate::Retained(OperationStatus::Pending));
        assert_eq!(ledger.completed(&store), 0);
    }

    #[test]
    fn altered_payload_is_reported() {
        let store = OperationStore::in_memory().unwrap();
        let mut ledger = Ledger::new();
        let op = queued(&store, "a");
        ledger.record(&op);

        store
            .update(&op.id, WriteOrigin::Sync, |op| {
                op.payload = json!({ "title": "b" });
            })
            .unwrap();

        assert!(ledger.verify(&store).is_err());
    }

    #[test]
    fn missing_operation_is_reported() {
        let store = OperationStore::in_memory().unwrap();
        let mut ledger = Ledger::new();
        ledger.record(&Operation::from_request(
            NewOperation::delete("card", "c1"),
            3,
            Timestamp::from_millis(1),
        ));
        assert!(ledger.verify(&store).unwrap_err().contains("disappeared"));
    }
}
