//! The admission loop promoting ready and constrained tasks into execution,
//! and the execution itself.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::gather;
use crate::loader::{Callable, TaskArg, Value};
use crate::proto::StartStop;
use crate::state::{now_secs, Key, TaskState, WorkerData};
use crate::transition::{TaskContext, Transitions};

/// Upper bound on the tasks admitted by a single `ensure_computing` call, so
/// a long ready queue cannot monopolize the worker. The loop is re-invoked
/// after every completion and every administrative operation.
const MAX_ADMIT_PER_CALL: usize = 64;

/// Promote runnable tasks into execution.
///
/// The constrained queue drains first and blocks at its head: a task whose
/// resources are not available makes the whole queue wait, preserving
/// arrival order. The ready queue then drains by priority, discarding
/// entries whose task is gone or no longer ready.
pub fn ensure_computing(data: &mut WorkerData) {
    let mut admitted = 0;
    while admitted < MAX_ADMIT_PER_CALL {
        let Some(key) = data.constrained.front().cloned() else {
            break;
        };
        if data.tasks.get(&key).map(|r| r.state) != Some(TaskState::Constrained) {
            data.constrained.pop_front();
            continue;
        }
        let restrictions = data.tasks[&key].resource_restrictions.clone();
        let enough = restrictions.iter().all(|(resource, amount)| {
            data.available_resources
                .get(resource)
                .copied()
                .unwrap_or(0.0)
                >= *amount
        });
        if !enough {
            break;
        }
        data.constrained.pop_front();
        if let Err(e) =
            Transitions::transition(data, &key, TaskState::Executing, TaskContext::default())
        {
            error!("Failed to start constrained task {}: {:?}", key, e);
        }
        admitted += 1;
    }
    while admitted < MAX_ADMIT_PER_CALL {
        let Some(Reverse((_, key))) = data.ready.pop() else {
            break;
        };
        match data.tasks.get(&key).map(|r| r.state) {
            Some(TaskState::Ready) | Some(TaskState::Constrained) => {}
            _ => continue,
        }
        if let Err(e) =
            Transitions::transition(data, &key, TaskState::Executing, TaskContext::default())
        {
            error!("Failed to start task {}: {:?}", key, e);
        }
        admitted += 1;
    }
    if admitted == MAX_ADMIT_PER_CALL {
        debug!("Admission batch exhausted, leaving the rest to the next pass");
    }
}

/// Body of an execution thread: invoke the task's callable outside the state
/// lock and apply the outcome, unless the task was released or otherwise
/// moved on in the meantime.
pub(crate) fn execute(worker: Arc<Mutex<WorkerData>>, key: Key) {
    let prepared = {
        let mut data = worker.lock().unwrap();
        let taken = match data.tasks.get_mut(&key) {
            Some(record) if record.state == TaskState::Executing => Some((
                record.callable.take(),
                record.args.clone(),
                record.kwargs.clone(),
            )),
            _ => None,
        };
        match taken {
            None => {
                debug!("Not executing {}: no longer scheduled here", key);
                return;
            }
            Some((None, _, _)) => Err("task has no callable".to_string()),
            Some((Some(callable), args, kwargs)) => {
                match (pack_args(&data, &args), pack_kwargs(&data, &kwargs)) {
                    (Ok(args), Ok(kwargs)) => Ok((callable, args, kwargs)),
                    (Err(msg), _) | (_, Err(msg)) => Err(msg),
                }
            }
        }
    };

    let result = match prepared {
        Err(msg) => {
            let mut data = worker.lock().unwrap();
            if let Err(e) = Transitions::transition(
                &mut data,
                &key,
                TaskState::Error,
                TaskContext::failed(msg.clone(), msg),
            ) {
                error!("Failed to fail task {}: {:?}", key, e);
            }
            gather::ensure_communicating(&mut data);
            ensure_computing(&mut data);
            return;
        }
        Ok((callable, args, kwargs)) => {
            let start = now_secs();
            let timer = Instant::now();
            let result = run_callable(&callable, &args, &kwargs);
            let stop = start + timer.elapsed().as_secs_f64();
            (result, start, stop)
        }
    };
    let (result, start, stop) = result;

    let mut data = worker.lock().unwrap();
    if data.tasks.get(&key).map(|r| r.state) != Some(TaskState::Executing) {
        debug!("Discarding the result of {}: released while executing", key);
        return;
    }
    data.startstops.entry(key.clone()).or_default().push(StartStop {
        phase: "compute".into(),
        start,
        stop,
    });
    let applied = match result {
        Ok(value) => Transitions::transition(
            &mut data,
            &key,
            TaskState::Memory,
            TaskContext::done(Some(value)),
        ),
        Err(msg) => Transitions::transition(
            &mut data,
            &key,
            TaskState::Error,
            TaskContext::failed(msg.clone(), msg),
        ),
    };
    if let Err(e) = applied {
        error!("Failed to record the outcome of {}: {:?}", key, e);
    }
    ensure_computing(&mut data);
    gather::ensure_communicating(&mut data);
}

fn run_callable(
    callable: &Callable,
    args: &[Value],
    kwargs: &HashMap<String, Value>,
) -> Result<Value, String> {
    callable(args, kwargs)
}

/// Substitute the positional arguments that name a resident key with that
/// key's value.
fn pack_args(data: &WorkerData, args: &[TaskArg]) -> Result<Vec<Value>, String> {
    args.iter().map(|arg| pack_one(data, arg)).collect()
}

/// Substitute the keyword arguments that name a resident key with that
/// key's value.
fn pack_kwargs(
    data: &WorkerData,
    kwargs: &HashMap<String, TaskArg>,
) -> Result<HashMap<String, Value>, String> {
    kwargs
        .iter()
        .map(|(name, arg)| pack_one(data, arg).map(|value| (name.clone(), value)))
        .collect()
}

fn pack_one(data: &WorkerData, arg: &TaskArg) -> Result<Value, String> {
    match arg {
        TaskArg::Literal(value) => Ok(value.clone()),
        TaskArg::Key(key) => data
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| format!("dependency {} is not resident", key)),
    }
}
