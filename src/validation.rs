//! The invariant checker. A failed check is a programming error somewhere in
//! the worker, never a runtime condition, so every violation panics.

use std::cmp::Reverse;

use crate::state::{DepState, TaskState, WorkerData};

/// Check the per-state invariants of one task, plus the cross-table checks.
/// Unknown keys pass (the caller may have just released them).
pub fn validate_key(data: &WorkerData, key: &str) {
    let Some(record) = data.tasks.get(key) else {
        return;
    };
    match record.state {
        TaskState::Waiting => {
            for dep in &record.waiting_for_data {
                assert!(
                    record.dependencies.contains(dep),
                    "task {} waits for {} which is not among its dependencies",
                    key,
                    dep
                );
                assert!(
                    data.in_flight_tasks.contains_key(dep)
                        || data.missing_dep_flight.contains(dep)
                        || data.dep_state.contains_key(dep),
                    "dependency {} of waiting task {} is not in flight, missing, or known",
                    dep,
                    key
                );
            }
        }
        TaskState::Ready => {
            assert!(
                record.waiting_for_data.is_empty(),
                "ready task {} still waits for data",
                key
            );
            for dep in &record.dependencies {
                assert!(
                    data.data.contains_key(dep),
                    "dependency {} of ready task {} is not resident",
                    dep,
                    key
                );
            }
            assert!(
                data.ready.iter().any(|Reverse((_, k))| k.as_str() == key),
                "ready task {} is not in the ready queue",
                key
            );
        }
        TaskState::Constrained => {
            assert!(
                record.waiting_for_data.is_empty(),
                "constrained task {} still waits for data",
                key
            );
            assert!(
                !record.resource_restrictions.is_empty(),
                "constrained task {} has no resource restrictions",
                key
            );
            assert!(
                data.constrained.contains(&key.to_string()),
                "constrained task {} is not in the constrained queue",
                key
            );
        }
        TaskState::Executing => {
            assert!(
                data.executing.contains(key),
                "executing task {} is not in the executing set",
                key
            );
            assert!(
                !data.data.contains_key(key),
                "executing task {} already has a resident value",
                key
            );
        }
        TaskState::Memory => {
            assert!(
                data.data.contains_key(key),
                "task {} is in memory but has no resident value",
                key
            );
            assert!(
                data.nbytes.contains_key(key),
                "task {} is in memory but has no size",
                key
            );
            assert!(
                data.types.contains_key(key),
                "task {} is in memory but has no type",
                key
            );
            assert!(
                record.waiting_for_data.is_empty(),
                "task {} is in memory but still waits for data",
                key
            );
            assert!(
                !data.executing.contains(key),
                "task {} is in memory but still executing",
                key
            );
            assert!(
                !data.ready.iter().any(|Reverse((_, k))| k.as_str() == key),
                "task {} is in memory but still in the ready queue",
                key
            );
        }
        TaskState::Error => {
            assert!(
                data.exceptions.contains_key(key),
                "task {} is in error but has no exception",
                key
            );
        }
        TaskState::LongRunning => {}
    }
    validate_shared(data);
}

/// Check the per-state invariants of one dependency, plus the cross-table
/// checks. Unknown dependencies pass.
pub fn validate_dep(data: &WorkerData, dep: &str) {
    let Some(&state) = data.dep_state.get(dep) else {
        return;
    };
    match state {
        DepState::Waiting => {
            assert!(
                data.dependents
                    .get(dep)
                    .map_or(false, |dependents| !dependents.is_empty()),
                "waiting dependency {} has no dependents",
                dep
            );
            assert!(
                data.nbytes.contains_key(dep),
                "waiting dependency {} has no size hint",
                dep
            );
        }
        DepState::Flight => {
            let peer = data.in_flight_tasks.get(dep);
            assert!(
                peer.is_some(),
                "dependency {} is in flight but towards no peer",
                dep
            );
            let peer = peer.unwrap();
            assert!(
                data.in_flight_workers
                    .get(peer)
                    .map_or(false, |batch| batch.contains(dep)),
                "dependency {} is in flight but not in the batch of {}",
                dep,
                peer
            );
        }
        DepState::Memory => {
            assert!(
                data.data.contains_key(dep),
                "dependency {} is in memory but has no resident value",
                dep
            );
            assert!(
                !data.in_flight_tasks.contains_key(dep),
                "dependency {} is in memory but still in flight",
                dep
            );
        }
    }
    validate_shared(data);
}

/// Check every task, every dependency and the cross-table invariants.
pub fn validate_state(data: &WorkerData) {
    for key in data.tasks.keys() {
        validate_key(data, key);
    }
    for dep in data.dep_state.keys() {
        validate_dep(data, dep);
    }
    validate_shared(data);
}

/// The cross-table invariants: who_has/has_what symmetry, the connection
/// bound and resource non-negativity.
fn validate_shared(data: &WorkerData) {
    for (peer, held) in &data.has_what {
        for dep in held {
            assert!(
                data.who_has
                    .get(dep)
                    .map_or(false, |holders| holders.contains(peer)),
                "{} advertises {} but who_has disagrees",
                peer,
                dep
            );
        }
    }
    for (dep, holders) in &data.who_has {
        for peer in holders {
            assert!(
                data.has_what
                    .get(peer)
                    .map_or(false, |held| held.contains(dep)),
                "who_has lists {} at {} but has_what disagrees",
                dep,
                peer
            );
        }
    }
    assert!(
        data.in_flight_workers.len() <= data.total_connections,
        "{} peers in flight exceed the budget of {}",
        data.in_flight_workers.len(),
        data.total_connections
    );
    for (resource, amount) in &data.available_resources {
        assert!(
            *amount >= 0.0,
            "available resource {} went negative: {}",
            resource,
            amount
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::loader::Value;
    use crate::state::TaskState;
    use crate::test_utils::{task_record, test_data};

    use super::*;

    #[test]
    fn test_consistent_state_passes() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Memory, vec![0]));
        data.data.insert("a".into(), Value::from_i64(1));
        data.nbytes.insert("a".into(), 8);
        data.types.insert("a".into(), "Int64".into());
        data.who_has.entry("b".into()).or_default().insert("p".into());
        data.has_what.entry("p".into()).or_default().insert("b".into());
        validate_state(&data);
    }

    #[test]
    #[should_panic(expected = "is not resident")]
    fn test_ready_task_without_resident_dep_panics() {
        let mut data = test_data();
        let mut record = task_record(TaskState::Ready, vec![0]);
        record.dependencies.insert("b".into());
        data.tasks.insert("a".into(), record);
        data.ready.push(Reverse((
            data.tasks["a"].priority.clone(),
            "a".to_string(),
        )));
        validate_key(&data, "a");
    }

    #[test]
    #[should_panic(expected = "who_has disagrees")]
    fn test_asymmetric_tables_panic() {
        let mut data = test_data();
        data.has_what.entry("p".into()).or_default().insert("b".into());
        validate_state(&data);
    }

    #[test]
    #[should_panic(expected = "towards no peer")]
    fn test_flight_without_peer_panics() {
        let mut data = test_data();
        data.dep_state.insert("b".into(), DepState::Flight);
        validate_dep(&data, "b");
    }

    #[test]
    #[should_panic(expected = "exceed the budget")]
    fn test_connection_bound_panics() {
        let mut data = test_data();
        data.total_connections = 1;
        data.in_flight_workers.entry("p1".into()).or_default();
        data.in_flight_workers.entry("p2".into()).or_default();
        validate_state(&data);
    }
}
