//! Picks the operations a flush cycle may dispatch next.

use std::collections::{BTreeMap, BTreeSet};
use syncwell_protocol::{EntityKey, Operation, OperationId};

/// Why a pending operation was held back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hold {
    /// A dependency has not completed.
    Dependency(OperationId),
    /// An earlier pending operation on the same entity goes first.
    Behind(OperationId),
    /// Another operation on the same entity is in flight or was picked
    /// earlier in this round.
    EntityBusy(EntityKey),
    /// The entity is contained by an isolated error.
    EntityIsolated(EntityKey),
}

/// Selects up to `limit` dispatchable operations from `pending`.
///
/// `pending` must already be in dispatch order (priority, then submission
/// order) and hold every pending operation. An operation is selected only
/// if it is the oldest pending operation on each entity it touches, none
/// of those entities is busy or isolated, and every dependency is done.
///
/// Priority orders work across entities; on one entity, submission order
/// always wins. Dependencies point at older operations, so the oldest
/// pending operation never waits on anything still pending.
pub fn select_ready(
    pending: &[Operation],
    busy: &BTreeSet<EntityKey>,
    limit: usize,
    is_done: impl Fn(&OperationId) -> bool,
    is_isolated: impl Fn(&EntityKey) -> bool,
) -> (Vec<Operation>, Vec<(OperationId, Hold)>) {
    let mut oldest: BTreeMap<EntityKey, (u64, OperationId)> = BTreeMap::new();
    for op in pending {
        for key in op.touched_entities() {
            let slot = oldest.entry(key).or_insert((op.sequence, op.id));
            if op.sequence < slot.0 {
                *slot = (op.sequence, op.id);
            }
        }
    }

    let mut claimed = busy.clone();
    let mut ready = Vec::new();
    let mut held = Vec::new();

    for op in pending {
        if ready.len() >= limit {
            break;
        }
        let entities = op.touched_entities();
        let ahead = entities
            .iter()
            .filter_map(|k| oldest.get(k))
            .find(|(_, id)| *id != op.id)
            .map(|(_, id)| *id);
        let hold = if let Some(id) = ahead {
            Some(Hold::Behind(id))
        } else if let Some(key) = entities.iter().find(|k| claimed.contains(*k)) {
            Some(Hold::EntityBusy(key.clone()))
        } else if let Some(key) = entities.iter().find(|k| is_isolated(k)) {
            Some(Hold::EntityIsolated(key.clone()))
        } else {
            op.dependencies
                .iter()
                .find(|dep| !is_done(dep))
                .map(|dep| Hold::Dependency(*dep))
        };
        match hold {
            Some(reason) => held.push((op.id, reason)),
            None => {
                claimed.extend(entities);
                ready.push(op.clone());
            }
        }
    }
    (ready, held)
}
