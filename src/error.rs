use thiserror::Error;

use crate::state::{DepState, TaskState};

/// The typed error conditions of the worker.
///
/// Everything else in the crate flows through `anyhow::Error`; these are the
/// conditions a caller may want to match on.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A task was asked to move along an edge that is not in the transition
    /// table.
    #[error("illegal task transition for {key}: {from} -> {to}")]
    IllegalTransition {
        /// The key of the task.
        key: String,
        /// The state the task is in.
        from: TaskState,
        /// The state the task was asked to move to.
        to: TaskState,
    },
    /// A dependency was asked to move along an edge that is not in the
    /// transition table.
    #[error("illegal dependency transition for {dep}: {from} -> {to}")]
    IllegalDepTransition {
        /// The key of the dependency.
        dep: String,
        /// The state the dependency is in.
        from: DepState,
        /// The state the dependency was asked to move to.
        to: DepState,
    },
    /// A dependency transition needed a payload the caller did not supply,
    /// e.g. waiting→flight without the target peer.
    #[error("dependency transition for {dep} is missing its {what}")]
    MissingTransitionPayload {
        /// The key of the dependency.
        dep: String,
        /// What was missing ("peer" or "value").
        what: &'static str,
    },
    /// The scheduler sent a task assignment with an empty key.
    #[error("task assignment with an empty key")]
    EmptyKey,
    /// The scheduler answered the registration with something other than the
    /// literal "OK".
    #[error("scheduler refused the registration: {reply:?}")]
    RegistrationRefused {
        /// The reply the scheduler sent instead.
        reply: String,
    },
    /// No free port could be found for the worker listener.
    #[error("no free port between {low} and {high} after {attempts} attempts")]
    NoFreePort {
        /// Lower bound of the scanned port range.
        low: u16,
        /// Upper bound of the scanned port range.
        high: u16,
        /// How many random ports were tried.
        attempts: usize,
    },
    /// A worker address could not be parsed.
    #[error("invalid worker address {addr:?}: {reason}")]
    InvalidAddress {
        /// The offending address string.
        addr: String,
        /// Why it was rejected.
        reason: String,
    },
}
