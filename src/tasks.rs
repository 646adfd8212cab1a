//! The task assignment handlers: ingesting scheduler commands, building the
//! local dependency-graph fragments and tearing them down again.

use std::collections::HashSet;

use anyhow::Error;

use crate::error::WorkerError;
use crate::loader::CodeLoader;
use crate::proto::{SchedulerUpdate, TaskAssignment};
use crate::session;
use crate::state::{DepState, FutureHandle, Key, Priority, TaskRecord, TaskState, WorkerData};
use crate::transition::{TaskContext, Transitions};
use crate::validation;

/// Ingest a task assignment from the scheduler.
///
/// Re-assignments of known keys are idempotent (finished keys re-publish
/// their state). The worker-local assignment counter is injected as the
/// second element of the priority so equal priorities admit in submission
/// order. A payload the loader cannot decode fails the task without any
/// worker-wide effect.
pub fn add_task(
    data: &mut WorkerData,
    assignment: TaskAssignment,
    future: Option<FutureHandle>,
    loader: &dyn CodeLoader,
) -> Result<(), Error> {
    let TaskAssignment {
        key,
        mut priority,
        duration,
        who_has,
        nbytes,
        resource_restrictions,
        func,
        args,
        kwargs,
    } = assignment;
    if key.is_empty() {
        return Err(WorkerError::EmptyKey.into());
    }
    if priority.is_empty() {
        warn!("Task {} was assigned with an empty priority", key);
        data.exceptions
            .insert(key.clone(), "empty task priority".into());
        data.tracebacks.insert(
            key.clone(),
            format!("Task {} was assigned with an empty priority", key),
        );
        session::send_task_state_to_scheduler(data, &key);
        return Ok(());
    }
    priority.insert(1, data.priority_counter);
    let priority = Priority(priority);

    if let Some(record) = data.tasks.get(&key) {
        match record.state {
            TaskState::Memory | TaskState::Error => {
                debug!("Task {} is already {}, republishing", key, record.state);
                session::send_task_state_to_scheduler(data, &key);
            }
            state => debug!("Task {} is already known in state {}", key, state),
        }
        return Ok(());
    }

    if data.dep_state.get(&key) == Some(&DepState::Memory) {
        debug!("{} is already resident as a dependency, promoting it", key);
        data.tasks.insert(
            key.clone(),
            TaskRecord {
                state: TaskState::Memory,
                priority,
                duration,
                resource_restrictions,
                callable: None,
                args,
                kwargs,
                future,
                dependencies: HashSet::new(),
                waiting_for_data: HashSet::new(),
            },
        );
        session::send_task_state_to_scheduler(data, &key);
        return Ok(());
    }

    let callable = match loader.decode(&func) {
        Ok(callable) => callable,
        Err(message) => {
            warn!("Cannot decode the payload of {}: {}", key, message);
            data.exceptions.insert(key.clone(), message.clone());
            data.tracebacks.insert(
                key.clone(),
                format!("Failed to deserialize the task payload: {}", message),
            );
            session::send_task_state_to_scheduler(data, &key);
            return Ok(());
        }
    };

    let dependencies: HashSet<Key> = who_has.keys().cloned().collect();
    data.tasks.insert(
        key.clone(),
        TaskRecord {
            state: TaskState::Waiting,
            priority,
            duration,
            resource_restrictions,
            callable: Some(callable),
            args,
            kwargs,
            future,
            dependencies: dependencies.clone(),
            waiting_for_data: HashSet::new(),
        },
    );
    for (dep, size) in &nbytes {
        data.nbytes.insert(dep.clone(), *size);
    }

    for dep in &dependencies {
        data.dependents
            .entry(dep.clone())
            .or_default()
            .insert(key.clone());
        if !data.dep_state.contains_key(dep) {
            let resident = data.tasks.get(dep).map(|r| r.state) == Some(TaskState::Memory)
                || data.data.contains_key(dep);
            let state = if resident {
                DepState::Memory
            } else {
                DepState::Waiting
            };
            data.dep_state.insert(dep.clone(), state);
        }
        if data.dep_state[dep] != DepState::Memory {
            data.tasks
                .get_mut(&key)
                .unwrap()
                .waiting_for_data
                .insert(dep.clone());
        }
    }

    for (dep, peers) in &who_has {
        if peers.is_empty() {
            warn!("Dependency {} of {} was advertised with no peers", dep, key);
            continue;
        }
        for peer in peers {
            data.who_has
                .entry(dep.clone())
                .or_default()
                .insert(peer.clone());
            data.has_what
                .entry(peer.clone())
                .or_default()
                .insert(dep.clone());
            if data.dep_state[dep] != DepState::Memory {
                data.pending_data_per_worker
                    .entry(peer.clone())
                    .or_default()
                    .push_back(dep.clone());
            }
        }
    }

    if data.tasks[&key].waiting_for_data.is_empty() {
        Transitions::transition(data, &key, TaskState::Ready, TaskContext::default())?;
    } else {
        data.data_needed.push_back(key.clone());
    }

    if data.validate {
        for dep in &dependencies {
            assert!(
                data.dep_state.contains_key(dep),
                "dependency {} of {} has no record",
                dep,
                key
            );
            assert!(
                data.nbytes.contains_key(dep),
                "dependency {} of {} has no size hint",
                dep,
                key
            );
            validation::validate_dep(data, dep);
        }
        validation::validate_key(data, &key);
    }
    Ok(())
}

/// Release a task: drop its record, its result tables and its bookkeeping.
///
/// A key released with reason `"stolen"` is kept when it is executing or
/// already finished (stealing does not drop finished work). Releasing a key
/// in a processing state notifies the scheduler.
pub fn release_key(data: &mut WorkerData, key: &str, cause: Option<Key>, reason: Option<&str>) {
    let Some(record) = data.tasks.get(key) else {
        debug!("Release of unknown key {}", key);
        return;
    };
    let state = record.state;
    if reason == Some("stolen") && matches!(state, TaskState::Executing | TaskState::Memory) {
        debug!("Refusing to release stolen key {} in state {}", key, state);
        return;
    }
    debug!("Releasing key {} in state {} (cause: {:?})", key, state, cause);
    let record = data.tasks.remove(key).unwrap();

    match state {
        TaskState::Executing => {
            for (resource, amount) in &record.resource_restrictions {
                *data
                    .available_resources
                    .entry(resource.clone())
                    .or_insert(0.0) += *amount;
            }
            data.executing.remove(key);
        }
        TaskState::Ready => Transitions::remove_from_ready(data, key),
        TaskState::Constrained => data.constrained.retain(|k| k.as_str() != key),
        _ => {}
    }

    for dep in &record.dependencies {
        let orphaned = match data.dependents.get_mut(dep) {
            Some(dependents) => {
                dependents.remove(key);
                dependents.is_empty()
            }
            None => false,
        };
        if orphaned {
            data.dependents.remove(dep);
            if data.dep_state.get(dep) == Some(&DepState::Waiting) {
                release_dep(data, dep);
            }
        }
    }

    data.exceptions.remove(key);
    data.tracebacks.remove(key);
    data.startstops.remove(key);
    data.maybe_drop_result(key);

    if state.is_processing() {
        data.send_to_scheduler(SchedulerUpdate::Release {
            key: key.to_string(),
            cause,
        });
    }
}

/// Release a dependency: drop its record and advertisements, and cascade to
/// every dependent task that does not already hold its own value.
pub fn release_dep(data: &mut WorkerData, dep: &str) {
    if data.dep_state.remove(dep).is_none() {
        return;
    }
    debug!("Releasing dependency {}", dep);
    if let Some(peer) = data.in_flight_tasks.remove(dep) {
        if let Some(batch) = data.in_flight_workers.get_mut(&peer) {
            batch.remove(dep);
            if batch.is_empty() {
                data.in_flight_workers.remove(&peer);
            }
        }
    }
    if let Some(holders) = data.who_has.remove(dep) {
        for peer in holders {
            if let Some(held) = data.has_what.get_mut(&peer) {
                held.remove(dep);
                if held.is_empty() {
                    data.has_what.remove(&peer);
                }
            }
        }
    }
    data.missing_dep_flight.remove(dep);
    data.maybe_drop_result(dep);

    let dependents: Vec<Key> = data
        .dependents
        .remove(dep)
        .map(|d| d.into_iter().collect())
        .unwrap_or_default();
    for dependent in dependents {
        let cascades = match data.tasks.get_mut(&dependent) {
            Some(record) => {
                record.dependencies.remove(dep);
                record.waiting_for_data.remove(dep);
                record.state != TaskState::Memory
            }
            None => false,
        };
        if cascades {
            release_key(data, &dependent, Some(dep.to_string()), None);
        }
    }
}

/// Drop the given keys from local memory, tearing down task and dependency
/// records that own them. When `report` is set, confirm with a
/// `remove-keys` update on the batched stream.
pub fn delete_data(data: &mut WorkerData, keys: Vec<Key>, report: bool) {
    debug!("Deleting {} keys", keys.len());
    for key in &keys {
        if data.tasks.contains_key(key) {
            release_key(data, key, None, None);
        }
        if data.dep_state.contains_key(key) {
            release_dep(data, key);
        }
        data.data.remove(key);
        data.nbytes.remove(key);
        data.types.remove(key);
    }
    if report {
        let address = data.address.clone();
        data.send_to_scheduler(SchedulerUpdate::RemoveKeys { address, keys });
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Reverse;
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use crate::loader::{TableLoader, TaskArg, Value};
    use crate::test_utils::{task_record, test_data};

    use super::*;

    fn loader() -> TableLoader {
        TableLoader::new()
            .with("const42", |_args: &[Value], _kwargs| Ok(Value::from_i64(42)))
            .with("add1", |args: &[Value], _kwargs| {
                let x = args[0].as_i64().ok_or("not an Int64")?;
                Ok(Value::from_i64(x + 1))
            })
    }

    fn assignment(key: &str, priority: Vec<i64>) -> TaskAssignment {
        TaskAssignment {
            key: key.into(),
            priority,
            duration: 0.1,
            who_has: HashMap::new(),
            nbytes: HashMap::new(),
            resource_restrictions: HashMap::new(),
            func: b"const42".to_vec(),
            args: vec![],
            kwargs: HashMap::new(),
        }
    }

    #[test]
    fn test_add_task_no_deps_becomes_ready() {
        let mut data = test_data();
        add_task(&mut data, assignment("a", vec![3]), None, &loader()).unwrap();
        assert_eq!(data.tasks["a"].state, TaskState::Ready);
        assert_eq!(data.tasks["a"].priority, Priority(vec![3, 0]));
        assert_eq!(data.ready.len(), 1);
    }

    #[test]
    fn test_add_task_rejects_empty_key() {
        let mut data = test_data();
        assert!(add_task(&mut data, assignment("", vec![0]), None, &loader()).is_err());
    }

    #[test]
    fn test_add_task_empty_priority_fails_the_task() {
        let mut data = test_data();
        add_task(&mut data, assignment("a", vec![]), None, &loader()).unwrap();
        assert!(!data.tasks.contains_key("a"));
        assert_eq!(data.exceptions["a"], "empty task priority");
    }

    #[test]
    fn test_add_task_idempotent() {
        let mut data = test_data();
        add_task(&mut data, assignment("a", vec![0]), None, &loader()).unwrap();
        add_task(&mut data, assignment("a", vec![0]), None, &loader()).unwrap();
        assert_eq!(data.tasks.len(), 1);
        assert_eq!(data.ready.len(), 1);
    }

    #[test]
    fn test_add_task_fifo_tie_break() {
        let mut data = test_data();
        add_task(&mut data, assignment("first", vec![7]), None, &loader()).unwrap();
        data.priority_counter += 1;
        add_task(&mut data, assignment("second", vec![7]), None, &loader()).unwrap();

        let Reverse((_, first)) = data.ready.pop().unwrap();
        let Reverse((_, second)) = data.ready.pop().unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, "second");
    }

    #[test]
    fn test_add_task_undecodable_payload() {
        let mut data = test_data();
        let mut a = assignment("a", vec![0]);
        a.func = b"no-such-function".to_vec();
        add_task(&mut data, a, None, &loader()).unwrap();
        assert!(!data.tasks.contains_key("a"));
        assert!(data.exceptions["a"].contains("no-such-function"));
    }

    #[test]
    fn test_add_task_with_missing_dep_waits() {
        let mut data = test_data();
        let mut a = assignment("c", vec![1]);
        a.func = b"add1".to_vec();
        a.args = vec![TaskArg::Key("b".into())];
        a.who_has
            .insert("b".into(), vec!["tcp://10.0.0.1:1".into()]);
        a.nbytes.insert("b".into(), 8);
        add_task(&mut data, a, None, &loader()).unwrap();

        assert_eq!(data.tasks["c"].state, TaskState::Waiting);
        assert!(data.tasks["c"].waiting_for_data.contains("b"));
        assert_eq!(data.dep_state["b"], DepState::Waiting);
        assert!(data.who_has["b"].contains("tcp://10.0.0.1:1"));
        assert!(data.has_what["tcp://10.0.0.1:1"].contains("b"));
        assert_eq!(
            data.pending_data_per_worker["tcp://10.0.0.1:1"].front(),
            Some(&"b".to_string())
        );
        assert_eq!(data.data_needed.front(), Some(&"c".to_string()));
    }

    #[test]
    fn test_add_task_resident_dep_not_refetched() {
        let mut data = test_data();
        data.dep_state.insert("b".into(), DepState::Memory);
        data.data.insert("b".into(), Value::from_i64(7));
        data.nbytes.insert("b".into(), 8);
        data.types.insert("b".into(), "Int64".into());

        let mut a = assignment("c", vec![1]);
        a.func = b"add1".to_vec();
        a.args = vec![TaskArg::Key("b".into())];
        a.who_has
            .insert("b".into(), vec!["tcp://10.0.0.1:1".into()]);
        a.nbytes.insert("b".into(), 8);
        add_task(&mut data, a, None, &loader()).unwrap();

        assert_eq!(data.tasks["c"].state, TaskState::Ready);
        assert!(data.tasks["c"].waiting_for_data.is_empty());
        assert!(data.pending_data_per_worker.is_empty());
        assert!(data.data_needed.is_empty());
    }

    #[test]
    fn test_add_task_promotes_resident_dependency() {
        let mut data = test_data();
        data.dep_state.insert("a".into(), DepState::Memory);
        data.data.insert("a".into(), Value::from_i64(7));
        data.nbytes.insert("a".into(), 8);
        data.types.insert("a".into(), "Int64".into());

        add_task(&mut data, assignment("a", vec![0]), None, &loader()).unwrap();
        assert_eq!(data.tasks["a"].state, TaskState::Memory);
        assert!(data.ready.is_empty());
    }

    #[test]
    fn test_release_key_stolen_refused() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Memory, vec![0]));
        data.data.insert("a".into(), Value::from_i64(1));
        data.nbytes.insert("a".into(), 8);
        data.types.insert("a".into(), "Int64".into());

        release_key(&mut data, "a", None, Some("stolen"));
        assert!(data.tasks.contains_key("a"));
        assert!(data.data.contains_key("a"));

        release_key(&mut data, "a", None, None);
        assert!(!data.tasks.contains_key("a"));
        assert!(!data.data.contains_key("a"));
    }

    #[test]
    fn test_release_key_refunds_executing_resources() {
        let mut data = test_data();
        let mut record = task_record(TaskState::Executing, vec![0]);
        record.resource_restrictions.insert("GPU".into(), 1.0);
        data.tasks.insert("a".into(), record);
        data.executing.insert("a".into());
        data.available_resources.insert("GPU".into(), 0.0);

        release_key(&mut data, "a", None, None);
        assert!(!data.tasks.contains_key("a"));
        assert!(data.executing.is_empty());
        assert_eq!(data.available_resources["GPU"], 1.0);
    }

    #[test]
    fn test_release_key_releases_orphaned_deps() {
        let mut data = test_data();
        let mut record = task_record(TaskState::Waiting, vec![0]);
        record.dependencies.insert("b".into());
        record.waiting_for_data.insert("b".into());
        data.tasks.insert("a".into(), record);
        data.dependents
            .entry("b".into())
            .or_default()
            .insert("a".into());
        data.dep_state.insert("b".into(), DepState::Waiting);
        data.nbytes.insert("b".into(), 8);

        release_key(&mut data, "a", None, None);
        assert!(!data.dep_state.contains_key("b"));
        assert!(!data.dependents.contains_key("b"));
    }

    #[test]
    fn test_release_dep_cascades() {
        let mut data = test_data();
        let mut record = task_record(TaskState::Waiting, vec![0]);
        record.dependencies.insert("b".into());
        record.waiting_for_data.insert("b".into());
        data.tasks.insert("a".into(), record);
        data.dependents
            .entry("b".into())
            .or_default()
            .insert("a".into());
        data.dep_state.insert("b".into(), DepState::Waiting);
        data.nbytes.insert("b".into(), 8);

        release_dep(&mut data, "b");
        assert!(!data.dep_state.contains_key("b"));
        assert!(!data.tasks.contains_key("a"));
    }

    #[test]
    fn test_release_dep_keeps_finished_dependents() {
        let mut data = test_data();
        let mut record = task_record(TaskState::Memory, vec![0]);
        record.dependencies.insert("b".into());
        data.tasks.insert("a".into(), record);
        data.data.insert("a".into(), Value::from_i64(1));
        data.nbytes.insert("a".into(), 8);
        data.types.insert("a".into(), "Int64".into());
        data.dependents
            .entry("b".into())
            .or_default()
            .insert("a".into());
        data.dep_state.insert("b".into(), DepState::Memory);
        data.data.insert("b".into(), Value::from_i64(2));
        data.nbytes.insert("b".into(), 8);
        data.types.insert("b".into(), "Int64".into());

        release_dep(&mut data, "b");
        assert!(data.tasks.contains_key("a"));
        assert!(!data.tasks["a"].dependencies.contains("b"));
        assert!(!data.data.contains_key("b"));
    }

    #[test]
    fn test_delete_data_drops_everything() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Memory, vec![0]));
        data.data.insert("a".into(), Value::from_i64(1));
        data.nbytes.insert("a".into(), 8);
        data.types.insert("a".into(), "Int64".into());

        delete_data(&mut data, vec!["a".into(), "unknown".into()], true);
        assert!(!data.tasks.contains_key("a"));
        assert!(!data.data.contains_key("a"));
        assert!(!data.nbytes.contains_key("a"));
    }
}
