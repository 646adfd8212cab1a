//! The code-loader capability and the opaque values it operates on.
//!
//! The worker never interprets task payloads itself: the scheduler ships an
//! opaque function blob and the embedder supplies a [`CodeLoader`] that turns
//! the blob into an invocable [`Callable`]. This keeps the core free of any
//! language-specific evaluator, the same way the sandbox runner is injected
//! in place of a hardcoded sandbox.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An opaque value held by the worker: the serialized payload plus a runtime
/// type description for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// The serialized payload bytes.
    pub bytes: Vec<u8>,
    /// A short description of the runtime type, e.g. `Int64`.
    pub type_name: String,
}

impl Value {
    /// Make a new value from its payload and type description.
    pub fn new<B: Into<Vec<u8>>, S: Into<String>>(bytes: B, type_name: S) -> Value {
        Value {
            bytes: bytes.into(),
            type_name: type_name.into(),
        }
    }

    /// Make a value holding a little-endian signed 64-bit integer.
    pub fn from_i64(v: i64) -> Value {
        Value::new(v.to_le_bytes().to_vec(), "Int64")
    }

    /// Read the value back as a signed 64-bit integer, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        if self.type_name != "Int64" {
            return None;
        }
        let bytes: [u8; 8] = self.bytes.as_slice().try_into().ok()?;
        Some(i64::from_le_bytes(bytes))
    }

    /// The size of the payload in bytes.
    pub fn nbytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// A single argument of a task: either a reference to a key whose value must
/// be resident in local memory when the task runs, or an immediate value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskArg {
    /// The argument is the value of another key, substituted at execution
    /// time.
    Key(String),
    /// The argument is an immediate value.
    Literal(Value),
}

/// An invocable produced by a [`CodeLoader`]. Receives the packed positional
/// arguments and keyword arguments; an `Err` is recorded as the task's
/// exception text.
pub type Callable =
    Box<dyn Fn(&[Value], &HashMap<String, Value>) -> Result<Value, String> + Send>;

/// The capability that decodes opaque function payloads.
///
/// Injected at worker construction; the core calls [`CodeLoader::decode`]
/// once per assignment and stores the resulting [`Callable`] in the task
/// record.
pub trait CodeLoader: Send + Sync {
    /// Decode a function payload into a callable. The error string is
    /// surfaced to the scheduler as a `task-erred` for the assignment.
    fn decode(&self, blob: &[u8]) -> Result<Callable, String>;
}

/// Shared, clonable function body stored by a [`TableLoader`].
type TableFn = Arc<dyn Fn(&[Value], &HashMap<String, Value>) -> Result<Value, String> + Send + Sync>;

/// A [`CodeLoader`] backed by an in-process table of registered callables.
///
/// The function payload is interpreted as the UTF-8 name of a registered
/// entry. Useful for tests and for embedders that ship their task bodies
/// with the worker binary.
#[derive(Default)]
pub struct TableLoader {
    table: HashMap<String, TableFn>,
}

impl TableLoader {
    /// Make an empty loader.
    pub fn new() -> TableLoader {
        TableLoader::default()
    }

    /// Register a callable under a name, consuming and returning the loader
    /// so registrations can be chained.
    pub fn with<S, F>(mut self, name: S, f: F) -> TableLoader
    where
        S: Into<String>,
        F: Fn(&[Value], &HashMap<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.table.insert(name.into(), Arc::new(f));
        self
    }
}

impl fmt::Debug for TableLoader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TableLoader")
            .field("entries", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CodeLoader for TableLoader {
    fn decode(&self, blob: &[u8]) -> Result<Callable, String> {
        let name = std::str::from_utf8(blob)
            .map_err(|_| "function payload is not valid UTF-8".to_string())?;
        let f = self
            .table
            .get(name)
            .ok_or_else(|| format!("unknown function {:?}", name))?
            .clone();
        Ok(Box::new(move |args, kwargs| f(args, kwargs)))
    }
}
