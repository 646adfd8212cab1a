//! Small helpers shared by the unit tests of the crate.

use std::collections::HashMap;

use crate::state::{Priority, TaskRecord, TaskState, WorkerData};
use crate::worker::WorkerOptions;

/// A state store with validation on, as the tests exercise the invariants.
pub fn test_data() -> WorkerData {
    let options = WorkerOptions {
        validate: true,
        ..WorkerOptions::default()
    };
    WorkerData::new(&options)
}

/// A bare task record in the given state.
pub fn task_record(state: TaskState, priority: Vec<i64>) -> TaskRecord {
    TaskRecord {
        state,
        priority: Priority(priority),
        duration: 0.1,
        resource_restrictions: HashMap::new(),
        callable: None,
        args: vec![],
        kwargs: HashMap::new(),
        future: None,
        dependencies: Default::default(),
        waiting_for_data: Default::default(),
    }
}
