//! The transition engine: the only place task and dependency lifecycle
//! states change. Each `(from, to)` edge is dispatched statically; edges not
//! in the tables are rejected with a typed error.

use std::cmp::Reverse;

use anyhow::{Context, Error};

use crate::error::WorkerError;
use crate::gather;
use crate::loader::Value;
use crate::session;
use crate::state::{DepState, Key, TaskState, WorkerData};
use crate::tasks;
use crate::validation;

/// Payload of a task transition. Only some edges consume fields:
/// executing→memory takes the computed value (absent when the value already
/// arrived through another path), executing→error takes the failure text.
#[derive(Debug, Default)]
pub struct TaskContext {
    /// The computed value, for executing→memory.
    pub value: Option<Value>,
    /// The exception text, for executing→error.
    pub exception: Option<String>,
    /// The traceback text, for executing→error.
    pub traceback: Option<String>,
}

impl TaskContext {
    /// Context carrying a computed value.
    pub fn done(value: Option<Value>) -> TaskContext {
        TaskContext {
            value,
            ..TaskContext::default()
        }
    }

    /// Context carrying a failure.
    pub fn failed<S: Into<String>, T: Into<String>>(exception: S, traceback: T) -> TaskContext {
        TaskContext {
            exception: Some(exception.into()),
            traceback: Some(traceback.into()),
            ..TaskContext::default()
        }
    }
}

/// Payload of a dependency transition: waiting→flight takes the chosen peer,
/// flight→memory takes the fetched value.
#[derive(Debug, Default)]
pub struct DepContext {
    /// The peer the dependency is being fetched from, for waiting→flight.
    pub peer: Option<String>,
    /// The fetched value, for flight→memory.
    pub value: Option<Value>,
}

impl DepContext {
    /// Context carrying the chosen peer.
    pub fn to_peer<S: Into<String>>(peer: S) -> DepContext {
        DepContext {
            peer: Some(peer.into()),
            ..DepContext::default()
        }
    }

    /// Context carrying the fetched value.
    pub fn fetched(value: Value) -> DepContext {
        DepContext {
            value: Some(value),
            ..DepContext::default()
        }
    }
}

/// The two static transition tables and their effect handlers.
pub struct Transitions;

impl Transitions {
    /// Move a task along a table edge, applying the edge's effects. A
    /// transition to the current state is a no-op with a warning; an edge
    /// not in the table fails loudly.
    pub fn transition(
        data: &mut WorkerData,
        key: &str,
        finish: TaskState,
        mut ctx: TaskContext,
    ) -> Result<(), Error> {
        let Some(record) = data.tasks.get(key) else {
            warn!("Transition of unknown task {} to {}", key, finish);
            return Ok(());
        };
        let start = record.state;
        if start == finish {
            warn!("No-op transition of task {}: already {}", key, start);
            return Ok(());
        }
        debug!("Task {}: {} -> {}", key, start, finish);
        match (start, finish) {
            (TaskState::Waiting, TaskState::Ready) => Self::task_waiting_ready(data, key)?,
            (TaskState::Waiting, TaskState::Memory) => Self::task_waiting_memory(data, key),
            (TaskState::Ready, TaskState::Executing) => Self::task_ready_executing(data, key)?,
            (TaskState::Constrained, TaskState::Executing) => {
                Self::task_constrained_executing(data, key)?
            }
            (TaskState::Ready, TaskState::Memory) => Self::task_ready_memory(data, key),
            (TaskState::Executing, TaskState::Memory) => {
                Self::task_executing_memory(data, key, ctx.value.take())?
            }
            (TaskState::Executing, TaskState::Error) => Self::task_executing_error(
                data,
                key,
                ctx.exception.take().unwrap_or_default(),
                ctx.traceback.take().unwrap_or_default(),
            ),
            (from, to) => {
                return Err(WorkerError::IllegalTransition {
                    key: key.to_string(),
                    from,
                    to,
                }
                .into())
            }
        }
        if data.validate {
            validation::validate_key(data, key);
        }
        Ok(())
    }

    /// Move a dependency along a table edge, applying the edge's effects.
    pub fn transition_dep(
        data: &mut WorkerData,
        dep: &str,
        finish: DepState,
        mut ctx: DepContext,
    ) -> Result<(), Error> {
        let Some(&start) = data.dep_state.get(dep) else {
            warn!("Transition of unknown dependency {} to {}", dep, finish);
            return Ok(());
        };
        if start == finish {
            warn!("No-op transition of dependency {}: already {}", dep, start);
            return Ok(());
        }
        debug!("Dependency {}: {} -> {}", dep, start, finish);
        match (start, finish) {
            (DepState::Waiting, DepState::Flight) => {
                let peer = ctx.peer.take().ok_or(WorkerError::MissingTransitionPayload {
                    dep: dep.to_string(),
                    what: "peer",
                })?;
                data.in_flight_tasks.insert(dep.to_string(), peer);
                data.dep_state.insert(dep.to_string(), DepState::Flight);
            }
            (DepState::Flight, DepState::Waiting) => Self::dep_flight_waiting(data, dep)?,
            (DepState::Flight, DepState::Memory) => {
                let value = ctx.value.take().ok_or(WorkerError::MissingTransitionPayload {
                    dep: dep.to_string(),
                    what: "value",
                })?;
                Self::dep_flight_memory(data, dep, value)?;
            }
            (DepState::Waiting, DepState::Memory) => Self::dep_waiting_memory(data, dep),
            (from, to) => {
                return Err(WorkerError::IllegalDepTransition {
                    dep: dep.to_string(),
                    from,
                    to,
                }
                .into())
            }
        }
        if data.validate && data.dep_state.contains_key(dep) {
            validation::validate_dep(data, dep);
        }
        Ok(())
    }

    /// Install a value in local memory. This is the single writer of the
    /// result tables: a second write for the same key is a logged no-op.
    /// Dependents waiting only on this key become ready; a task record for
    /// the key itself in waiting or ready is promoted to memory.
    pub fn put_key_in_memory(data: &mut WorkerData, key: &str, value: Value) -> Result<(), Error> {
        if data.data.contains_key(key) {
            debug!("{} is already in memory, dropping the new value", key);
            return Ok(());
        }
        data.nbytes.insert(key.to_string(), value.nbytes());
        data.types.insert(key.to_string(), value.type_name.clone());
        data.data.insert(key.to_string(), value);

        let dependents: Vec<Key> = data
            .dependents
            .get(key)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        for dependent in dependents {
            let now_ready = match data.tasks.get_mut(&dependent) {
                Some(record) => {
                    record.waiting_for_data.remove(key);
                    record.waiting_for_data.is_empty() && record.state == TaskState::Waiting
                }
                None => false,
            };
            if now_ready {
                Self::transition(data, &dependent, TaskState::Ready, TaskContext::default())?;
            }
        }

        match data.tasks.get(key).map(|record| record.state) {
            Some(TaskState::Waiting) | Some(TaskState::Ready) => {
                Self::transition(data, key, TaskState::Memory, TaskContext::default())?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Fail a task from any processing state. This is the direct fault path
    /// used where no table edge exists: a dependency nobody holds, or an
    /// assignment whose payload cannot be decoded after the record was made.
    pub fn fail_task(data: &mut WorkerData, key: &str, exception: String, traceback: String) {
        let Some(record) = data.tasks.get(key) else {
            return;
        };
        let state = record.state;
        if state == TaskState::Memory {
            debug!("Not failing {}: already in memory", key);
            return;
        }
        match state {
            TaskState::Executing => {
                Self::refund_resources(data, key);
                data.executing.remove(key);
            }
            TaskState::Ready => Self::remove_from_ready(data, key),
            TaskState::Constrained => data.constrained.retain(|k| k.as_str() != key),
            _ => {}
        }
        let record = data.tasks.get_mut(key).unwrap();
        record.state = TaskState::Error;
        record.waiting_for_data.clear();
        data.exceptions.insert(key.to_string(), exception);
        data.tracebacks.insert(key.to_string(), traceback);
        Self::notify_future(data, key);
        session::send_task_state_to_scheduler(data, key);
    }

    fn task_waiting_ready(data: &mut WorkerData, key: &str) -> Result<(), Error> {
        let record = data.tasks.get_mut(key).unwrap();
        record.waiting_for_data.clear();
        if record.resource_restrictions.is_empty() {
            record.state = TaskState::Ready;
            let priority = record.priority.clone();
            data.ready.push(Reverse((priority, key.to_string())));
        } else {
            record.state = TaskState::Constrained;
            data.constrained.push_back(key.to_string());
        }
        Ok(())
    }

    fn task_waiting_memory(data: &mut WorkerData, key: &str) {
        let record = data.tasks.get_mut(key).unwrap();
        record.waiting_for_data.clear();
        record.state = TaskState::Memory;
        Self::notify_future(data, key);
        session::send_task_state_to_scheduler(data, key);
    }

    fn task_ready_executing(data: &mut WorkerData, key: &str) -> Result<(), Error> {
        data.tasks.get_mut(key).unwrap().state = TaskState::Executing;
        data.executing.insert(key.to_string());
        Self::spawn_execution(data, key)
    }

    fn task_constrained_executing(data: &mut WorkerData, key: &str) -> Result<(), Error> {
        let restrictions = data.tasks.get(key).unwrap().resource_restrictions.clone();
        for (resource, amount) in restrictions {
            let available = data.available_resources.entry(resource).or_insert(0.0);
            *available -= amount;
        }
        data.tasks.get_mut(key).unwrap().state = TaskState::Executing;
        data.executing.insert(key.to_string());
        Self::spawn_execution(data, key)
    }

    fn task_ready_memory(data: &mut WorkerData, key: &str) {
        Self::remove_from_ready(data, key);
        data.tasks.get_mut(key).unwrap().state = TaskState::Memory;
        Self::notify_future(data, key);
        session::send_task_state_to_scheduler(data, key);
    }

    fn task_executing_memory(
        data: &mut WorkerData,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), Error> {
        Self::refund_resources(data, key);
        data.executing.remove(key);
        data.executed_count += 1;
        data.tasks.get_mut(key).unwrap().state = TaskState::Memory;
        match value {
            Some(value) => Self::put_key_in_memory(data, key, value)?,
            None => {
                if !data.data.contains_key(key) {
                    warn!("Task {} completed without a value and none is resident", key);
                }
            }
        }
        if data.dep_state.get(key) == Some(&DepState::Waiting) {
            Self::transition_dep(data, key, DepState::Memory, DepContext::default())?;
        }
        Self::notify_future(data, key);
        session::send_task_state_to_scheduler(data, key);
        Ok(())
    }

    fn task_executing_error(
        data: &mut WorkerData,
        key: &str,
        exception: String,
        traceback: String,
    ) {
        Self::refund_resources(data, key);
        data.executing.remove(key);
        data.tasks.get_mut(key).unwrap().state = TaskState::Error;
        data.exceptions.insert(key.to_string(), exception);
        data.tracebacks.insert(key.to_string(), traceback);
        Self::notify_future(data, key);
        session::send_task_state_to_scheduler(data, key);
    }

    /// A fetch for this dependency failed: scrub the peer and queue the
    /// dependency for another attempt, or start recovery when no peer is
    /// left.
    fn dep_flight_waiting(data: &mut WorkerData, dep: &str) -> Result<(), Error> {
        let peer = data.in_flight_tasks.remove(dep);
        if let Some(peer) = &peer {
            if let Some(batch) = data.in_flight_workers.get_mut(peer) {
                batch.remove(dep);
                if batch.is_empty() {
                    data.in_flight_workers.remove(peer);
                }
            }
            if let Some(holders) = data.who_has.get_mut(dep) {
                holders.remove(peer);
                if holders.is_empty() {
                    data.who_has.remove(dep);
                }
            }
            if let Some(held) = data.has_what.get_mut(peer) {
                held.remove(dep);
                if held.is_empty() {
                    data.has_what.remove(peer);
                }
            }
        }
        data.dep_state.insert(dep.to_string(), DepState::Waiting);

        if data.who_has.get(dep).map_or(true, |holders| holders.is_empty())
            && data.missing_dep_flight.insert(dep.to_string())
        {
            gather::spawn_missing_dep_recovery(data, vec![dep.to_string()]);
        }

        let dependents: Vec<Key> = data
            .dependents
            .get(dep)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        if dependents.is_empty() {
            tasks::release_dep(data, dep);
            return Ok(());
        }
        for dependent in dependents {
            if data.tasks.get(&dependent).map(|r| r.state) == Some(TaskState::Waiting) {
                data.data_needed.push_front(dependent);
            }
        }
        Ok(())
    }

    fn dep_flight_memory(data: &mut WorkerData, dep: &str, value: Value) -> Result<(), Error> {
        if let Some(peer) = data.in_flight_tasks.remove(dep) {
            if let Some(batch) = data.in_flight_workers.get_mut(&peer) {
                batch.remove(dep);
                if batch.is_empty() {
                    data.in_flight_workers.remove(&peer);
                }
            }
        }
        data.dep_state.insert(dep.to_string(), DepState::Memory);
        Self::put_key_in_memory(data, dep, value)
    }

    fn dep_waiting_memory(data: &mut WorkerData, dep: &str) {
        if !data.data.contains_key(dep) {
            warn!("Dependency {} moved to memory but no value is resident", dep);
        }
        data.dep_state.insert(dep.to_string(), DepState::Memory);
    }

    /// Give back the resources a task deducted when it was admitted from the
    /// constrained queue. Unconstrained tasks have an empty map, so this is
    /// a no-op for them.
    fn refund_resources(data: &mut WorkerData, key: &str) {
        let Some(record) = data.tasks.get(key) else {
            return;
        };
        let restrictions = record.resource_restrictions.clone();
        for (resource, amount) in restrictions {
            *data.available_resources.entry(resource).or_insert(0.0) += amount;
        }
    }

    /// Rebuild the ready heap without the given key. Rare: only taken when a
    /// ready task reaches memory or error without executing here.
    pub(crate) fn remove_from_ready(data: &mut WorkerData, key: &str) {
        let heap = std::mem::take(&mut data.ready);
        data.ready = heap
            .into_iter()
            .filter(|Reverse((_, k))| k.as_str() != key)
            .collect();
    }

    /// Push the final outcome of a task into its completion sink, if an
    /// in-process submitter attached one.
    fn notify_future(data: &mut WorkerData, key: &str) {
        let future = data.tasks.get_mut(key).and_then(|record| record.future.take());
        if let Some(future) = future {
            let outcome = if let Some(exception) = data.exceptions.get(key) {
                Err(exception.clone())
            } else if let Some(value) = data.data.get(key) {
                Ok(value.clone())
            } else {
                Err(format!("no result recorded for {}", key))
            };
            let _ = future.send(outcome);
        }
    }

    /// Spawn the execution thread for a task that just entered `executing`.
    fn spawn_execution(data: &mut WorkerData, key: &str) -> Result<(), Error> {
        let Some(handle) = data.self_ref.as_ref().and_then(std::sync::Weak::upgrade) else {
            debug!("No shared handle, not spawning the execution of {}", key);
            return Ok(());
        };
        let key = key.to_string();
        let name = format!("Execution of {}", key);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || crate::computing::execute(handle, key))
            .context("Failed to spawn the execution thread")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::test_utils::{task_record, test_data};

    use super::*;

    #[test]
    fn test_waiting_to_ready_unconstrained() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Waiting, vec![0]));
        Transitions::transition(&mut data, "a", TaskState::Ready, TaskContext::default()).unwrap();
        assert_eq!(data.tasks["a"].state, TaskState::Ready);
        assert_eq!(data.ready.len(), 1);
        assert!(data.constrained.is_empty());
    }

    #[test]
    fn test_waiting_to_ready_lands_in_constrained() {
        let mut data = test_data();
        let mut record = task_record(TaskState::Waiting, vec![0]);
        record.resource_restrictions.insert("GPU".into(), 1.0);
        data.tasks.insert("a".into(), record);
        Transitions::transition(&mut data, "a", TaskState::Ready, TaskContext::default()).unwrap();
        assert_eq!(data.tasks["a"].state, TaskState::Constrained);
        assert!(data.ready.is_empty());
        assert_eq!(data.constrained.front(), Some(&"a".to_string()));
    }

    #[test]
    fn test_illegal_edge_rejected() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Waiting, vec![0]));
        let err =
            Transitions::transition(&mut data, "a", TaskState::Executing, TaskContext::default())
                .unwrap_err();
        assert!(err.to_string().contains("illegal task transition"));
    }

    #[test]
    fn test_same_state_is_noop() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Waiting, vec![0]));
        Transitions::transition(&mut data, "a", TaskState::Waiting, TaskContext::default())
            .unwrap();
        assert_eq!(data.tasks["a"].state, TaskState::Waiting);
    }

    #[test]
    fn test_executing_to_memory_installs_value() {
        let mut data = test_data();
        let mut record = task_record(TaskState::Executing, vec![0]);
        record.resource_restrictions.insert("GPU".into(), 1.0);
        data.tasks.insert("a".into(), record);
        data.executing.insert("a".into());
        data.available_resources.insert("GPU".into(), 0.0);

        Transitions::transition(
            &mut data,
            "a",
            TaskState::Memory,
            TaskContext::done(Some(Value::from_i64(42))),
        )
        .unwrap();

        assert_eq!(data.tasks["a"].state, TaskState::Memory);
        assert_eq!(data.data["a"].as_i64(), Some(42));
        assert_eq!(data.nbytes["a"], 8);
        assert_eq!(data.types["a"], "Int64");
        assert!(data.executing.is_empty());
        assert_eq!(data.executed_count, 1);
        assert_eq!(data.available_resources["GPU"], 1.0);
    }

    #[test]
    fn test_executing_to_error_records_failure() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Executing, vec![0]));
        data.executing.insert("a".into());
        Transitions::transition(
            &mut data,
            "a",
            TaskState::Error,
            TaskContext::failed("boom", "trace"),
        )
        .unwrap();
        assert_eq!(data.tasks["a"].state, TaskState::Error);
        assert_eq!(data.exceptions["a"], "boom");
        assert_eq!(data.tracebacks["a"], "trace");
        assert!(data.executing.is_empty());
    }

    #[test]
    fn test_put_key_in_memory_single_writer() {
        let mut data = test_data();
        Transitions::put_key_in_memory(&mut data, "a", Value::from_i64(1)).unwrap();
        Transitions::put_key_in_memory(&mut data, "a", Value::from_i64(2)).unwrap();
        assert_eq!(data.data["a"].as_i64(), Some(1));
    }

    #[test]
    fn test_put_key_in_memory_unblocks_dependents() {
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

        data.in_flight_workers
            .entry("tcp://10.0.0.1:1".into())
            .or_default()
            .insert("b".into());
        Transitions::transition_dep(
            &mut data,
            "b",
            DepState::Flight,
            DepContext::to_peer("tcp://10.0.0.1:1"),
        )
        .unwrap();
        Transitions::transition_dep(
            &mut data,
            "b",
            DepState::Memory,
            DepContext::fetched(Value::from_i64(7)),
        )
        .unwrap();

        assert_eq!(data.dep_state["b"], DepState::Memory);
        assert!(data.in_flight_tasks.is_empty());
        assert!(data.in_flight_workers.is_empty());
        assert_eq!(data.tasks["a"].state, TaskState::Ready);
        assert!(data.tasks["a"].waiting_for_data.is_empty());
    }

    #[test]
    fn test_dep_flight_waiting_scrubs_peer() {
        let mut data = test_data();
        let peer = "tcp://10.0.0.1:1".to_string();
        let mut record = task_record(TaskState::Waiting, vec![0]);
        record.dependencies.insert("b".into());
        record.waiting_for_data.insert("b".into());
        data.tasks.insert("a".into(), record);
        data.dependents
            .entry("b".into())
            .or_default()
            .insert("a".into());
        data.dep_state.insert("b".into(), DepState::Flight);
        data.nbytes.insert("b".into(), 8);
        data.in_flight_tasks.insert("b".into(), peer.clone());
        data.in_flight_workers
            .entry(peer.clone())
            .or_default()
            .insert("b".into());
        data.who_has.entry("b".into()).or_default().insert(peer.clone());
        data.has_what.entry(peer.clone()).or_default().insert("b".into());

        Transitions::transition_dep(&mut data, "b", DepState::Waiting, DepContext::default())
            .unwrap();

        assert_eq!(data.dep_state["b"], DepState::Waiting);
        assert!(data.in_flight_tasks.is_empty());
        assert!(data.in_flight_workers.is_empty());
        assert!(!data.who_has.contains_key("b"));
        assert!(!data.has_what.contains_key(&peer));
        // no peer left: the dependency is under recovery
        assert!(data.missing_dep_flight.contains("b"));
        // the waiting dependent is re-headed
        assert_eq!(data.data_needed.front(), Some(&"a".to_string()));
    }

    #[test]
    fn test_dep_flight_waiting_releases_orphan() {
        let mut data = test_data();
        let peer = "tcp://10.0.0.1:1".to_string();
        data.dep_state.insert("b".into(), DepState::Flight);
        data.in_flight_tasks.insert("b".into(), peer.clone());
        data.in_flight_workers
            .entry(peer)
            .or_default()
            .insert("b".into());

        Transitions::transition_dep(&mut data, "b", DepState::Waiting, DepContext::default())
            .unwrap();
        assert!(!data.dep_state.contains_key("b"));
    }

    #[test]
    fn test_waiting_flight_requires_peer() {
        let mut data = test_data();
        data.dep_state.insert("b".into(), DepState::Waiting);
        let err =
            Transitions::transition_dep(&mut data, "b", DepState::Flight, DepContext::default())
                .unwrap_err();
        assert!(err.to_string().contains("missing its peer"));
    }

    #[test]
    fn test_fail_task_from_waiting() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Waiting, vec![0]));
        Transitions::fail_task(&mut data, "a", "nope".into(), "trace".into());
        assert_eq!(data.tasks["a"].state, TaskState::Error);
        assert_eq!(data.exceptions["a"], "nope");
    }

    #[test]
    fn test_fail_task_keeps_memory() {
        let mut data = test_data();
        data.tasks
            .insert("a".into(), task_record(TaskState::Memory, vec![0]));
        data.data.insert("a".into(), Value::from_i64(1));
        data.nbytes.insert("a".into(), 8);
        data.types.insert("a".into(), "Int64".into());
        Transitions::fail_task(&mut data, "a", "nope".into(), "trace".into());
        assert_eq!(data.tasks["a"].state, TaskState::Memory);
        assert!(!data.exceptions.contains_key("a"));
    }

    #[test]
    fn test_resource_conservation() {
        let mut data = test_data();
        let mut record = task_record(TaskState::Waiting, vec![0]);
        record.resource_restrictions.insert("GPU".into(), 1.0);
        data.tasks.insert("a".into(), record);
        data.available_resources.insert("GPU".into(), 1.0);

        Transitions::transition(&mut data, "a", TaskState::Ready, TaskContext::default()).unwrap();
        assert_eq!(data.tasks["a"].state, TaskState::Constrained);
        data.constrained.pop_front();
        Transitions::transition(&mut data, "a", TaskState::Executing, TaskContext::default())
            .unwrap();
        assert_eq!(data.available_resources["GPU"], 0.0);
        Transitions::transition(
            &mut data,
            "a",
            TaskState::Memory,
            TaskContext::done(Some(Value::from_i64(0))),
        )
        .unwrap();
        assert_eq!(data.available_resources["GPU"], 1.0);
    }

    #[test]
    fn test_future_notified_on_completion() {
        let mut data = test_data();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut record = task_record(TaskState::Executing, vec![0]);
        record.future = Some(tx);
        data.tasks.insert("a".into(), record);
        data.executing.insert("a".into());
        Transitions::transition(
            &mut data,
            "a",
            TaskState::Memory,
            TaskContext::done(Some(Value::from_i64(3))),
        )
        .unwrap();
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.as_i64(), Some(3));
    }
}
