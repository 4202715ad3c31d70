//! Property tests over whole sync sessions.

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncwell_engine::conflict::detect;
use syncwell_engine::retry::base_delay;
use syncwell_engine::{
    ConflictConfig, ConflictResolver, NetworkConfig, NetworkMonitor, RetryConditions, RetryConfig,
    RetryDecision, RetryManager,
};
use syncwell_protocol::{
    EntityKey, EntityRecord, ErrorKind, NewOperation, Operation, OperationStatus, RetryStrategy,
    Timestamp,
};
use syncwell_testkit::prelude::*;

async fn run_step(engine: &TestEngine, ledger: &mut Ledger, step: Step) -> Result<(), String> {
    match step {
        Step::Execute(request) => {
            let before = engine.store.counts().live();
            match engine.manager.execute(request) {
                Ok(op) => ledger.record(&op),
                Err(e) => {
                    if engine.store.counts().live() != before {
                        return Err(format!("rejected request left work behind: {e}"));
                    }
                }
            }
        }
        Step::Online => {
            engine.manager.set_online(true);
        }
        Step::Offline => {
            engine.manager.set_online(false);
        }
        Step::Flush => {
            let _ = engine.manager.flush().await;
        }
        Step::FlushThenDrop => {
            engine.remote.set_latency(Some(Duration::from_millis(20)));
            let manager = Arc::clone(&engine.manager);
            let flushing = tokio::spawn(async move { manager.flush().await });
            tokio::time::sleep(Duration::from_millis(5)).await;
            engine.manager.set_online(false);
            let _ = flushing.await.map_err(|e| e.to_string())?;
            engine.remote.set_latency(None);
        }
        Step::Fail(id, count, kind) => engine.remote.fail_entity(CARD, &id, count, kind),
        Step::RetryFailed => {
            let _ = engine.manager.retry_failed(&[]);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn no_operation_is_lost(steps in session_strategy(4, 24)) {
        let result = paused_runtime().block_on(async {
            let engine = TestEngine::memory();
            let mut ledger = Ledger::new();
            for step in steps {
                run_step(&engine, &mut ledger, step).await?;
            }
            engine.manager.set_online(true);
            for _ in 0..3 {
                let _ = engine.manager.flush().await;
            }
            ledger.verify(&engine.store).map(|_| ())
        });
        prop_assert!(result.is_ok(), "{}", result.unwrap_err());
    }

    #[test]
    fn entity_is_never_in_flight_twice(
        requests in prop::collection::vec(request_strategy(3), 1..20),
        failures in prop::collection::vec((entity_id_strategy(3), 1usize..3), 0..3),
    ) {
        let result = paused_runtime().block_on(async {
            let engine = TestEngine::memory();
            for request in requests {
                let _ = engine.manager.execute(request);
            }
            for (id, count) in failures {
                engine.remote.fail_entity(CARD, &id, count, ErrorKind::Network);
            }
            engine.remote.set_latency(Some(Duration::from_millis(10)));
            engine.manager.set_online(true);

            let done = Arc::new(AtomicBool::new(false));
            let watcher = tokio::spawn({
                let store = Arc::clone(&engine.store);
                let done = Arc::clone(&done);
                async move {
                    while !done.load(Ordering::SeqCst) {
                        let mut seen = BTreeSet::new();
                        for op in store.with_status(OperationStatus::InFlight) {
                            for key in op.touched_entities() {
                                if !seen.insert(key.clone()) {
                                    return Err(format!("{key} in flight twice"));
                                }
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Ok(())
                }
            });
            let _ = engine.manager.flush().await;
            done.store(true, Ordering::SeqCst);
            watcher.await.map_err(|e| e.to_string())??;

            match engine.remote.max_concurrent_per_entity() {
                0 | 1 => Ok(()),
                n => Err(format!("{n} concurrent calls for one entity")),
            }
        });
        prop_assert!(result.is_ok(), "{}", result.unwrap_err());
    }

    #[test]
    fn dependents_start_after_their_dependencies(
        deps in dependency_strategy(6),
        priorities in prop::collection::vec(priority_strategy(), 6),
        entities in prop::collection::vec(entity_id_strategy(3), 6),
        failures in prop::collection::vec((entity_id_strategy(3), 1usize..3, remote_failure_strategy()), 0..4),
    ) {
        let result = paused_runtime().block_on(async {
            let engine = TestEngine::memory();
            let mut ops: Vec<Operation> = Vec::new();
            let mut seen = BTreeSet::new();
            for (i, dep) in deps.iter().enumerate() {
                let id = &entities[i];
                let mut request = if seen.insert(id.clone()) {
                    card(id, "x")
                } else {
                    card_update(id, serde_json::json!({ "title": format!("x{i}") }))
                };
                request = request.with_priority(priorities[i]);
                if let Some(j) = dep {
                    request = request.depends_on(ops[*j].id);
                }
                ops.push(engine.execute(request));
            }
            let scripted = !failures.is_empty();
            for (id, count, kind) in failures {
                engine.remote.fail_entity(CARD, &id, count, kind);
            }
            engine.remote.set_latency(Some(Duration::from_millis(10)));
            engine.manager.set_online(true);

            let done = Arc::new(AtomicBool::new(false));
            let watcher = tokio::spawn({
                let store = Arc::clone(&engine.store);
                let done = Arc::clone(&done);
                async move {
                    while !done.load(Ordering::SeqCst) {
                        for op in store.with_status(OperationStatus::InFlight) {
                            if let Some(dep) = op.dependencies.iter().find(|d| !store.is_done(d)) {
                                return Err(format!("{} in flight before {dep} completed", op.id));
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Ok(())
                }
            });
            let _ = engine.manager.flush().await;
            done.store(true, Ordering::SeqCst);
            watcher.await.map_err(|e| e.to_string())??;

            for (i, dep) in deps.iter().enumerate() {
                let Some(j) = dep else { continue };
                if engine.store.is_done(&ops[i].id) && !engine.store.is_done(&ops[*j].id) {
                    return Err(format!("op {i} completed before op {j}"));
                }
            }
            if !scripted {
                for (i, op) in ops.iter().enumerate() {
                    if !engine.store.is_done(&op.id) {
                        return Err(format!(
                            "op {i} on {} never completed: {:?}",
                            entities[i],
                            engine.store.get(&op.id).map(|o| o.status)
                        ));
                    }
                }
            }
            Ok(())
        });
        prop_assert!(result.is_ok(), "{}", result.unwrap_err());
    }

    #[test]
    fn retry_delays_never_shrink(
        strategy in prop_oneof![Just(RetryStrategy::Exponential), Just(RetryStrategy::Adaptive)],
        context in failure_context_strategy(),
        tier in tier_strategy(),
        base in 1u64..3_000,
        multiplier in 1.0f64..3.0,
    ) {
        let config = RetryConfig::new(10)
            .with_strategy(strategy)
            .with_base_delay(Duration::from_millis(base))
            .with_multiplier(multiplier);
        let delays: Vec<Duration> = (1..=10)
            .map(|attempt| base_delay(&config, attempt, &context, tier))
            .collect();
        for pair in delays.windows(2) {
            prop_assert!(pair[1] >= pair[0], "{:?}", delays);
        }
    }

    #[test]
    fn resolution_depends_only_on_the_snapshots(conflict in conflict_strategy()) {
        let resolver = ConflictResolver::new(ConflictConfig::default());
        let first = resolver.resolve(&conflict);

        let mut replay = conflict.clone();
        replay.id = syncwell_protocol::ConflictId::new();
        replay.operation_id = syncwell_protocol::OperationId::new();
        replay.detected_at = Timestamp::from_millis(0);
        let again = ConflictResolver::new(ConflictConfig::default()).resolve(&replay);

        prop_assert_eq!(first.resolution, again.resolution);
        prop_assert_eq!(first.similarity, again.similarity);
    }

    #[test]
    fn detection_is_repeatable(
        payload in payload_strategy(),
        remote in payload_strategy(),
        created in 0u64..10_000,
        base in prop::option::of(0u64..10_000),
        updated in 0u64..10_000,
    ) {
        let mut request = NewOperation::update(CARD, "c1", payload);
        if let Some(base) = base {
            request = request.with_base_version(Timestamp::from_millis(base));
        }
        let op = Operation::from_request(request, 3, Timestamp::from_millis(created));
        let record = EntityRecord::new("c1", remote, Timestamp::from_millis(updated));
        let resolver = ConflictResolver::new(ConflictConfig::default());

        let verdicts: Vec<_> = (0..2)
            .map(|_| match detect(&op, Some(&record), Timestamp::from_millis(created)) {
                syncwell_engine::Detection::Conflict(conflict) => {
                    Some((conflict.kind, resolver.resolve(&conflict).resolution))
                }
                _ => None,
            })
            .collect();
        prop_assert_eq!(verdicts[0], verdicts[1]);
    }
}

#[tokio::test(start_paused = true)]
async fn recorded_retry_delays_grow_until_the_cap() {
    let network = Arc::new(NetworkMonitor::new(NetworkConfig::default()));
    network.set_online(true);
    let manager = RetryManager::new(
        RetryConfig::new(8)
            .with_strategy(RetryStrategy::Exponential)
            .with_base_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(0.0),
        network,
    );
    let mut sequence = manager.begin(None);
    let context = syncwell_engine::FailureContext::new(ErrorKind::Network);

    let mut delays = Vec::new();
    while let RetryDecision::Retry(delay) =
        manager.decide(&mut sequence, &context, 8, &RetryConditions::new())
    {
        delays.push(delay.as_millis());
    }

    assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 10000, 10000, 10000]);
}
