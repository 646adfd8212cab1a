//! The in-memory state of the worker: every table the other components read
//! and mutate. This module is passive, it holds no policy; the transition
//! engine and the loops are its clients.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::loader::{Callable, TaskArg, Value};
use crate::proto::StartStop;
use crate::session::BatchedSender;
use crate::worker::WorkerOptions;

/// The opaque global identifier of a task or data value, assigned by the
/// scheduler.
pub type Key = String;

/// A client-side completion sink: the worker pushes the final outcome of a
/// task into it when the task reaches `memory` or `error`.
pub type FutureHandle = crossbeam_channel::Sender<Result<Value, String>>;

/// The lifecycle state of a task assigned to this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Some dependencies are not resident yet.
    Waiting,
    /// All dependencies are resident, the task is queued for execution.
    Ready,
    /// Like `Ready` but the task needs resources, so it waits in the
    /// constrained queue.
    Constrained,
    /// The task is currently running.
    Executing,
    /// Reserved: a task that detached itself from the executing count. No
    /// transition currently produces this state.
    LongRunning,
    /// The task's value is resident in local memory.
    Memory,
    /// The task failed; exception and traceback are recorded.
    Error,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TaskState::Waiting => "waiting",
            TaskState::Ready => "ready",
            TaskState::Constrained => "constrained",
            TaskState::Executing => "executing",
            TaskState::LongRunning => "long-running",
            TaskState::Memory => "memory",
            TaskState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

impl TaskState {
    /// Whether a release of a task in this state must be reported to the
    /// scheduler.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            TaskState::Waiting | TaskState::Ready | TaskState::Constrained | TaskState::Executing
        )
    }
}

/// The lifecycle state of a dependency this worker needs or holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepState {
    /// The dependency is known but not resident and no fetch is outstanding.
    Waiting,
    /// A `get_data` RPC for the dependency is outstanding to a chosen peer.
    Flight,
    /// The dependency's value is resident in local memory.
    Memory,
}

impl fmt::Display for DepState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DepState::Waiting => "waiting",
            DepState::Flight => "flight",
            DepState::Memory => "memory",
        };
        write!(f, "{}", name)
    }
}

/// A task admission priority: an ordered tuple, lower admits earlier.
/// The second element is the worker-local assignment counter, injected by
/// `add_task` to break ties in submission order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub Vec<i64>);

/// Everything the worker tracks about one assigned task.
pub struct TaskRecord {
    /// The lifecycle state of the task.
    pub state: TaskState,
    /// The admission priority, counter already injected.
    pub priority: Priority,
    /// The estimated compute cost in seconds.
    pub duration: f64,
    /// Resources the task holds while executing; empty when unconstrained.
    pub resource_restrictions: HashMap<String, f64>,
    /// The decoded callable; taken out of the record while the task runs.
    pub callable: Option<Callable>,
    /// Positional arguments, packed at execution time.
    pub args: Vec<TaskArg>,
    /// Keyword arguments, packed at execution time.
    pub kwargs: HashMap<String, TaskArg>,
    /// Optional completion sink for an in-process submitter.
    pub future: Option<FutureHandle>,
    /// The keys this task reads.
    pub dependencies: HashSet<Key>,
    /// The subset of `dependencies` not yet resident.
    pub waiting_for_data: HashSet<Key>,
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("waiting_for_data", &self.waiting_for_data)
            .finish()
    }
}

/// The state store of a worker. All access is serialized through the single
/// `Mutex` wrapping it; the lock is never held across I/O or across the user
/// callable.
#[derive(Debug, Default)]
pub struct WorkerData {
    /// This worker's advertised `tcp://host:port` address, set after the
    /// listener is bound.
    pub address: String,
    /// The scheduler address used for registration and `who_has` RPCs.
    pub scheduler_addr: String,
    /// Number of cores advertised at registration.
    pub ncores: usize,
    /// Upper bound on the number of distinct peers with outstanding fetches.
    pub total_connections: usize,
    /// Soft cap on the total byte size of a single gather batch.
    pub target_message_size: u64,
    /// Whether the validator runs after every transition.
    pub validate: bool,

    /// Every task assigned to this worker, by key.
    pub tasks: HashMap<Key, TaskRecord>,
    /// The lifecycle state of every known dependency.
    pub dep_state: HashMap<Key, DepState>,
    /// For every dependency, the peers advertising it.
    pub who_has: HashMap<Key, HashSet<String>>,
    /// For every peer, the dependencies it advertises.
    pub has_what: HashMap<String, HashSet<Key>>,
    /// For every peer, dependencies the fetcher may batch next time it opens
    /// a connection to it.
    pub pending_data_per_worker: HashMap<String, VecDeque<Key>>,
    /// For every dependency, the tasks that read it.
    pub dependents: HashMap<Key, HashSet<Key>>,
    /// Lookup-failure counters; kept across dependency releases so recovery
    /// rounds accumulate.
    pub suspicious_deps: HashMap<Key, u32>,
    /// Dependencies under active scheduler-lookup recovery.
    pub missing_dep_flight: HashSet<Key>,

    /// Tasks ready to run, by priority (lowest first).
    pub ready: BinaryHeap<Reverse<(Priority, Key)>>,
    /// Tasks ready to run but needing resources, in arrival order.
    pub constrained: VecDeque<Key>,
    /// Tasks whose `waiting_for_data` is non-empty, in arrival order.
    pub data_needed: VecDeque<Key>,
    /// Keys currently running.
    pub executing: HashSet<Key>,
    /// For every dependency in flight, the peer it is being fetched from.
    pub in_flight_tasks: HashMap<Key, String>,
    /// For every peer with an outstanding fetch, the dependencies in that
    /// batch.
    pub in_flight_workers: HashMap<String, HashSet<Key>>,

    /// Resident values, computed or fetched.
    pub data: HashMap<Key, Value>,
    /// Runtime type description of every resident value.
    pub types: HashMap<Key, String>,
    /// Byte sizes: actual for resident values, hints for pending deps.
    pub nbytes: HashMap<Key, u64>,
    /// Exception text of failed keys.
    pub exceptions: HashMap<Key, String>,
    /// Traceback text of failed keys.
    pub tracebacks: HashMap<Key, String>,
    /// Append-only per-key log of `(phase, start, stop)` intervals.
    pub startstops: HashMap<Key, Vec<StartStop>>,

    /// Resources currently free for constrained tasks. Never negative.
    pub available_resources: HashMap<String, f64>,
    /// Counts the administrative operations received; its value is injected
    /// into each assignment's priority so equal priorities admit in
    /// submission order.
    pub priority_counter: i64,
    /// Number of tasks this worker completed.
    pub executed_count: usize,

    /// The batched stream to the scheduler, present once the compute stream
    /// is open.
    pub batched: Option<BatchedSender>,
    /// Whether the compute stream is open and computing ops are accepted.
    pub is_computing: bool,
    /// Whether the worker is shutting down.
    pub shutting_down: bool,

    /// Back-handle to the shared state, used to spawn executions and fetches
    /// from inside a transition.
    pub self_ref: Option<Weak<Mutex<WorkerData>>>,
}

impl WorkerData {
    /// Make a fresh state store from the worker options.
    pub fn new(options: &WorkerOptions) -> WorkerData {
        WorkerData {
            scheduler_addr: options.scheduler_addr.clone(),
            ncores: options.ncores,
            total_connections: options.total_connections,
            target_message_size: options.target_message_size,
            validate: options.validate,
            available_resources: options.available_resources.clone(),
            ..WorkerData::default()
        }
    }

    /// Make a fresh state store already wrapped for sharing, with the
    /// back-handle set.
    pub fn new_shared(options: &WorkerOptions) -> std::sync::Arc<Mutex<WorkerData>> {
        let data = std::sync::Arc::new(Mutex::new(WorkerData::new(options)));
        data.lock().unwrap().self_ref = Some(std::sync::Arc::downgrade(&data));
        data
    }

    /// Enqueue an update on the batched scheduler stream. Before the compute
    /// stream is open the update is dropped with a log entry.
    pub fn send_to_scheduler(&self, update: crate::proto::SchedulerUpdate) {
        match &self.batched {
            Some(batched) => batched.send(update),
            None => debug!("No scheduler stream, dropping update: {:?}", update),
        }
    }

    /// Drop the result tables of a key, but only when neither a task record
    /// nor a dependency record still references it.
    pub fn maybe_drop_result(&mut self, key: &str) {
        if self.tasks.contains_key(key) || self.dep_state.contains_key(key) {
            return;
        }
        self.data.remove(key);
        self.types.remove(key);
        self.nbytes.remove(key);
    }
}

/// The current time as seconds since the epoch, for registration timestamps
/// and the per-key timing log.
pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
