//! Property-based test generators using proptest.
//!
//! Provides strategies for requests, scripts of network events, conflicts,
//! and failure contexts.

use crate::fixtures::CARD;
use proptest::prelude::*;
use serde_json::{json, Value};
use syncwell_engine::FailureContext;
use syncwell_protocol::{
    Conflict, ConflictId, ConflictKind, ConflictResolution, ErrorKind, NetworkTier, NewOperation,
    OperationId, Priority, Severity, Timestamp,
};

/// Strategy for entity ids drawn from a pool of `pool` cards.
///
/// A small pool makes several operations touch the same entity.
pub fn entity_id_strategy(pool: usize) -> impl Strategy<Value = String> {
    (0..pool.max(1)).prop_map(|n| format!("c{n}"))
}

/// Strategy for card payloads with a fixed field set.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    (
        prop::string::string_regex("[a-z ]{0,24}").expect("Invalid regex"),
        0i64..1000,
    )
        .prop_map(|(title, rank)| json!({ "title": title, "rank": rank }))
}

/// Strategy for dispatch priorities.
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Critical),
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

/// Strategy for create, update, and delete requests on the card pool.
pub fn request_strategy(pool: usize) -> impl Strategy<Value = NewOperation> {
    let request = prop_oneof![
        3 => (entity_id_strategy(pool), payload_strategy())
            .prop_map(|(id, payload)| NewOperation::create_with_id(CARD, id, payload)),
        4 => (entity_id_strategy(pool), payload_strategy())
            .prop_map(|(id, payload)| NewOperation::update(CARD, id, payload)),
        1 => entity_id_strategy(pool).prop_map(|id| NewOperation::delete(CARD, id)),
    ];
    (request, priority_strategy()).prop_map(|(request, priority)| request.with_priority(priority))
}

/// Error kinds a remote call may fail with in generated scripts.
///
/// Kinds that escalate to full isolation are left out so that one failure
/// does not stall the whole run.
pub fn remote_failure_strategy() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        4 => Just(ErrorKind::Network),
        2 => Just(ErrorKind::Timeout),
        1 => Just(ErrorKind::RateLimit),
        1 => Just(ErrorKind::Validation),
    ]
}

/// One step of a generated session.
#[derive(Debug, Clone)]
pub enum Step {
    /// Submit a request.
    Execute(NewOperation),
    /// Connectivity comes back.
    Online,
    /// Connectivity drops.
    Offline,
    /// Run a flush to completion.
    Flush,
    /// Start a flush and drop connectivity while it runs.
    FlushThenDrop,
    /// Script failures for one entity.
    Fail(String, usize, ErrorKind),
    /// Reset failed operations.
    RetryFailed,
}

/// Strategy for a single session step.
pub fn step_strategy(pool: usize) -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => request_strategy(pool).prop_map(Step::Execute),
        2 => Just(Step::Online),
        1 => Just(Step::Offline),
        2 => Just(Step::Flush),
        1 => Just(Step::FlushThenDrop),
        1 => (entity_id_strategy(pool), 1usize..6, remote_failure_strategy())
            .prop_map(|(id, count, kind)| Step::Fail(id, count, kind)),
        1 => Just(Step::RetryFailed),
    ]
}

/// Strategy for a session of up to `len` steps.
pub fn session_strategy(pool: usize, len: usize) -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(step_strategy(pool), 1..len.max(2))
}

/// Strategy for a dependency forest over `len` operations.
///
/// Entry `i` names at most one earlier operation that `i` depends on.
pub fn dependency_strategy(len: usize) -> impl Strategy<Value = Vec<Option<usize>>> {
    let slots: Vec<BoxedStrategy<Option<usize>>> = (0..len)
        .map(|i| {
            if i == 0 {
                Just(None).boxed()
            } else {
                prop::option::of(0..i).boxed()
            }
        })
        .collect();
    slots
}

/// Strategy for conflict kinds.
pub fn conflict_kind_strategy() -> impl Strategy<Value = ConflictKind> {
    prop_oneof![
        Just(ConflictKind::SimultaneousEdit),
        Just(ConflictKind::DeleteConflict),
        Just(ConflictKind::StructureConflict),
    ]
}

/// Strategy for unresolved conflicts with arbitrary snapshots and
/// timestamps.
pub fn conflict_strategy() -> impl Strategy<Value = Conflict> {
    (
        payload_strategy(),
        payload_strategy(),
        conflict_kind_strategy(),
        0u64..10_000,
        0u64..10_000,
    )
        .prop_map(|(local, remote, kind, lt, rt)| Conflict {
            id: ConflictId::new(),
            entity_type: CARD.into(),
            entity_id: "c1".into(),
            operation_id: OperationId::new(),
            local_snapshot: local,
            remote_snapshot: remote,
            local_timestamp: Timestamp::from_millis(lt),
            remote_timestamp: Timestamp::from_millis(rt),
            kind,
            resolution: ConflictResolution::Pending,
            similarity: None,
            detected_at: Timestamp::from_millis(lt.max(rt)),
            resolved_at: None,
        })
}

/// Strategy for link tiers.
pub fn tier_strategy() -> impl Strategy<Value = NetworkTier> {
    prop_oneof![
        Just(NetworkTier::Unknown),
        Just(NetworkTier::Poor),
        Just(NetworkTier::Fair),
        Just(NetworkTier::Good),
        Just(NetworkTier::Excellent),
    ]
}

/// Strategy for failure contexts of any kind, with an occasional
/// escalated severity.
pub fn failure_context_strategy() -> impl Strategy<Value = FailureContext> {
    (
        proptest::sample::select(ErrorKind::ALL.to_vec()),
        prop::option::of(prop_oneof![Just(Severity::High), Just(Severity::Critical)]),
    )
        .prop_map(|(kind, severity)| {
            let context = FailureContext::new(kind);
            match severity {
                Some(severity) => context.with_severity(severity),
                None => context,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn dependencies_point_backwards() {
        let mut runner = TestRunner::default();
        for _ in 0..50 {
            let deps = dependency_strategy(6)
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert_eq!(deps.len(), 6);
            assert_eq!(deps[0], None);
            for (i, dep) in deps.iter().enumerate() {
                if let Some(j) = dep {
                    assert!(*j < i);
                }
            }
        }
    }

    proptest! {
        #[test]
        fn requests_stay_in_the_pool(request in request_strategy(3)) {
            let id = request.entity_id.unwrap();
            prop_assert!(["c0", "c1", "c2"].contains(&id.as_str()));
            prop_assert_eq!(request.entity_type.as_str(), CARD);
        }
    }
}
