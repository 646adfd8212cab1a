//! The protocol related structs and enums.
//!
//! # Protocol Specification
//!
//! The communication between the services is done over [`ductile`] channels;
//! the way messages are framed on the wire is a detail of that crate and no
//! code here should read from or write to the underlying sockets directly.
//!
//! There are 3 actors in the protocol:
//!
//! - The Scheduler: the central coordinator the worker registers with and
//!   reports task state to;
//! - The Worker: this crate, which executes tasks and holds their results;
//! - The Peers: other workers holding data this worker may depend on.
//!
//! The valid communication directions are:
//! - `Scheduler/Peer` — [`WorkerRequest`](enum.WorkerRequest.html) → `Worker`
//! - `Scheduler/Peer` ← [`WorkerResponse`](enum.WorkerResponse.html) — `Worker`
//! - `Worker` — [`SchedulerRequest`](enum.SchedulerRequest.html) → `Scheduler`
//! - `Worker` ← [`SchedulerReply`](enum.SchedulerReply.html) — `Scheduler`
//!
//! Every connection to the worker's listener speaks `WorkerRequest` inbound
//! and `WorkerResponse` outbound. The scheduler upgrades one such connection
//! with [`WorkerRequest::ComputeStream`]; from then on that connection also
//! carries task assignments inbound and batched
//! [`SchedulerUpdate`](enum.SchedulerUpdate.html) frames outbound. Scheduler
//! RPCs (`register`, `who_has`) are short-lived dedicated connections opened
//! by the worker.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use anyhow::Error;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::WorkerError;
use crate::loader::{TaskArg, Value};
use crate::state::Key;

/// A single task assignment, as shipped by the scheduler in a
/// [`WorkerRequest::ComputeTask`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// The key of the task.
    pub key: Key,
    /// The scheduler-assigned priority tuple; lower admits earlier.
    pub priority: Vec<i64>,
    /// The estimated compute cost in seconds.
    pub duration: f64,
    /// For every dependency of the task, the peers advertising it.
    pub who_has: HashMap<Key, Vec<String>>,
    /// Size hints for the dependencies.
    pub nbytes: HashMap<Key, u64>,
    /// Resources the task needs while executing; empty when unconstrained.
    pub resource_restrictions: HashMap<String, f64>,
    /// The opaque function payload, decoded by the worker's code loader.
    pub func: Vec<u8>,
    /// Positional arguments.
    pub args: Vec<TaskArg>,
    /// Keyword arguments.
    pub kwargs: HashMap<String, TaskArg>,
}

/// Messages the worker accepts on its listener, from the scheduler and from
/// peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Upgrade this connection to the compute stream: task assignments will
    /// follow and batched state updates flow back on the same connection.
    ComputeStream,
    /// A task assignment. Boxed to reduce the enum size. Only valid after
    /// `ComputeStream`.
    ComputeTask(Box<TaskAssignment>),
    /// Release a task. Only valid after `ComputeStream`.
    ReleaseTask {
        /// The key to release.
        key: Key,
        /// The key whose failure or release caused this one, if any.
        cause: Option<Key>,
        /// The release reason; `"stolen"` refuses to drop finished work.
        reason: Option<String>,
    },
    /// Drop the given keys from local memory.
    DeleteData {
        /// The keys to drop.
        keys: Vec<Key>,
        /// When true, confirm with a `remove-keys` update on the batched
        /// stream.
        report: bool,
    },
    /// A peer (or the scheduler) asks for the values of some keys.
    GetData {
        /// The wanted keys.
        keys: Vec<Key>,
        /// The address of the asking party, for diagnostics.
        who: Option<String>,
    },
    /// Ask for the list of keys resident in local memory.
    Keys,
    /// Reserved administrative operation, not implemented.
    Gather {
        /// Keys to pull and the peers holding them.
        who_has: HashMap<Key, Vec<String>>,
    },
    /// Reserved administrative operation, not implemented.
    Terminate,
    /// Orderly shutdown of the worker.
    Close,
}

/// Messages the worker sends back on listener connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Reply to [`WorkerRequest::GetData`]: the requested keys that were
    /// resident, with their values.
    GetData(HashMap<Key, Value>),
    /// Reply to [`WorkerRequest::Keys`].
    Keys(Vec<Key>),
    /// A coalesced frame of state updates on the compute stream.
    Updates(Vec<SchedulerUpdate>),
}

/// A single state update published to the scheduler over the batched stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerUpdate {
    /// A task completed and its value is resident.
    TaskFinished {
        /// The key of the task.
        key: Key,
        /// Size of the computed value.
        nbytes: u64,
        /// Runtime type description of the computed value.
        type_name: String,
        /// Timing log of the phases the key went through.
        startstops: Vec<StartStop>,
    },
    /// A task failed.
    TaskErred {
        /// The key of the task.
        key: Key,
        /// The exception text.
        exception: String,
        /// The traceback text.
        traceback: String,
        /// Timing log of the phases the key went through.
        startstops: Vec<StartStop>,
    },
    /// Keys that arrived from peers and are now resident here.
    AddKeys {
        /// The newly resident keys.
        keys: Vec<Key>,
    },
    /// Keys that were deleted on request, confirmed because the delete asked
    /// for a report.
    RemoveKeys {
        /// The address of this worker.
        address: String,
        /// The deleted keys.
        keys: Vec<Key>,
    },
    /// A still-processing task was released locally.
    Release {
        /// The released key.
        key: Key,
        /// The key that caused the release, if any.
        cause: Option<Key>,
    },
}

/// One entry of the per-key timing log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartStop {
    /// The phase the interval covers, e.g. `compute`.
    pub phase: String,
    /// Start of the interval, seconds since the epoch.
    pub start: f64,
    /// End of the interval, seconds since the epoch.
    pub stop: f64,
}

/// RPC requests the worker sends to the scheduler on dedicated connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerRequest {
    /// Announce this worker to the scheduler.
    Register {
        /// The worker's advertised `tcp://host:port` address.
        address: String,
        /// Number of cores available for execution.
        ncores: usize,
        /// Keys already resident in memory.
        keys: Vec<Key>,
        /// Sizes of the resident keys.
        nbytes: HashMap<Key, u64>,
        /// Current time, seconds since the epoch.
        now: f64,
        /// Number of currently executing tasks.
        executing: usize,
        /// Number of keys in memory.
        in_memory: usize,
        /// Number of tasks ready to run.
        ready: usize,
        /// Number of dependencies currently being fetched.
        in_flight: usize,
    },
    /// Ask which peers hold the given keys.
    WhoHas {
        /// The keys to look up.
        keys: Vec<Key>,
    },
}

/// RPC replies from the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerReply {
    /// Reply to [`SchedulerRequest::Register`]; anything but the literal
    /// `"OK"` is fatal for the worker.
    Register(String),
    /// Reply to [`SchedulerRequest::WhoHas`]: for each key, the peers
    /// currently advertising it.
    WhoHas(HashMap<Key, Vec<String>>),
}

/// A worker endpoint address, stringified as `tcp://host:port`.
///
/// Constructing an address from the loopback literal `127.0.0.1` rewrites
/// the host to the machine's primary outbound IP when one can be determined,
/// so the address stays meaningful to remote peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerAddr(String);

impl WorkerAddr {
    /// Build an address from host and port, rewriting the loopback literal.
    pub fn new(host: &str, port: u16) -> WorkerAddr {
        let host = if host == "127.0.0.1" {
            primary_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| host.to_string())
        } else {
            host.to_string()
        };
        WorkerAddr(format!("tcp://{}:{}", host, port))
    }

    /// Parse an address of the form `tcp://host:port` (the scheme may be
    /// omitted).
    pub fn parse(addr: &str) -> Result<WorkerAddr, Error> {
        let url = match Url::parse(addr) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(&format!("tcp://{}", addr)).map_err(|e| WorkerError::InvalidAddress {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?
            }
            Err(e) => {
                return Err(WorkerError::InvalidAddress {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        };
        if url.scheme() != "tcp" {
            return Err(WorkerError::InvalidAddress {
                addr: addr.to_string(),
                reason: format!("unsupported scheme {:?}", url.scheme()),
            }
            .into());
        }
        let host = url.host_str().ok_or_else(|| WorkerError::InvalidAddress {
            addr: addr.to_string(),
            reason: "missing host".into(),
        })?;
        let port = url.port().ok_or_else(|| WorkerError::InvalidAddress {
            addr: addr.to_string(),
            reason: "missing port".into(),
        })?;
        Ok(WorkerAddr(format!("tcp://{}:{}", host, port)))
    }

    /// Resolve the address to a connectable socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        let url = Url::parse(&self.0).map_err(|e| WorkerError::InvalidAddress {
            addr: self.0.clone(),
            reason: e.to_string(),
        })?;
        let addrs = url
            .socket_addrs(|| None)
            .map_err(|e| WorkerError::InvalidAddress {
                addr: self.0.clone(),
                reason: e.to_string(),
            })?;
        addrs
            .into_iter()
            .next()
            .ok_or_else(|| {
                WorkerError::InvalidAddress {
                    addr: self.0.clone(),
                    reason: "address did not resolve".into(),
                }
                .into()
            })
    }

    /// The address as a `tcp://host:port` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Best-effort detection of the primary outbound IP: the local address of a
/// UDP socket "connected" to a public address. No packet is sent.
fn primary_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}
