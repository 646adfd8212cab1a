//! Worker endpoint for a Dask-compatible distributed computation cluster.
//!
//! A [`Worker`](struct.Worker.html) attaches to a central scheduler, accepts
//! serialized task assignments, fetches the tasks' data dependencies from
//! peer workers, executes the tasks and publishes the results back to the
//! scheduler, while serving its own results to peers on request.
//!
//! [`ductile`] channels are used for every connection; the state of the
//! worker lives behind a single mutex and every activity (connection
//! handlers, execution threads, gather threads) applies its effects through
//! short critical sections, never holding the lock across I/O.
//!
//! ## Implementation details
//!
//! The components of the worker are:
//!
//! - The state store ([`WorkerData`](struct.WorkerData.html)): the in-memory
//!   tables holding task, dependency, peer and result data. Passive, no
//!   policy.
//! - The transition engine: the static tables moving tasks through
//!   `waiting → ready|constrained → executing → memory|error` and
//!   dependencies through `waiting → flight → memory`, applying each edge's
//!   effects. Illegal edges fail loudly.
//! - The admission loop ([`ensure_computing`](fn.ensure_computing.html)):
//!   promotes ready and constrained tasks into execution, honoring resource
//!   restrictions with head-of-line blocking on the constrained queue.
//! - The gather loop ([`ensure_communicating`](fn.ensure_communicating.html)):
//!   fans out to peer workers for dependency transfers, batching keys per
//!   peer and respecting the connection budget. Dependencies nobody
//!   advertises are recovered through the scheduler or, after too many
//!   failures, fail their dependents.
//! - The assignment handlers ([`add_task`](fn.add_task.html),
//!   [`release_key`](fn.release_key.html),
//!   [`release_dep`](fn.release_dep.html)): build and tear down the local
//!   dependency-graph fragments.
//! - The scheduler session: registration, the listener dispatch loop and
//!   the batched, time-windowed update stream.
//! - The validator: optional invariant checks after every transition,
//!   aborting on violations.
//!
//! Task payloads are opaque: a [`CodeLoader`](trait.CodeLoader.html)
//! injected at construction decodes them into callables, so the worker
//! embeds no language-specific evaluator.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub use ductile;

mod computing;
mod error;
mod gather;
mod loader;
/// The wire protocol spoken with the scheduler and with peer workers.
pub mod proto;
mod session;
mod state;
mod tasks;
#[cfg(test)]
mod test_utils;
mod transition;
mod validation;
mod worker;

pub use computing::ensure_computing;
pub use error::WorkerError;
pub use gather::ensure_communicating;
pub use loader::{Callable, CodeLoader, TableLoader, TaskArg, Value};
pub use proto::{StartStop, TaskAssignment, WorkerAddr};
pub use session::BatchedSender;
pub use state::{
    DepState, FutureHandle, Key, Priority, TaskRecord, TaskState, WorkerData,
};
pub use tasks::{add_task, delete_data, release_dep, release_key};
pub use transition::{DepContext, TaskContext, Transitions};
pub use validation::{validate_dep, validate_key, validate_state};
pub use worker::{
    Worker, WorkerOptions, WorkerUuid, DEFAULT_TARGET_MESSAGE_SIZE, DEFAULT_TOTAL_CONNECTIONS,
};
