//! The worker owner type: options, the shared state handle, and the run
//! loop accepting scheduler and peer connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Error};
use uuid::Uuid;

use crate::loader::CodeLoader;
use crate::proto::WorkerAddr;
use crate::session;
use crate::state::WorkerData;

/// The unique identifier of a worker instance, used in logs and thread
/// names.
pub type WorkerUuid = Uuid;

/// Default bound on distinct peers with outstanding fetches.
pub const DEFAULT_TOTAL_CONNECTIONS: usize = 50;
/// Default soft cap on the byte size of a single gather batch.
pub const DEFAULT_TARGET_MESSAGE_SIZE: u64 = 50 * 1024 * 1024;

/// Configuration of a worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Address of the scheduler, `tcp://host:port` (the scheme may be
    /// omitted).
    pub scheduler_addr: String,
    /// The host advertised to the scheduler and to peers; the loopback
    /// literal is rewritten to the primary IP. The listener itself binds all
    /// interfaces.
    pub host: String,
    /// Human-readable worker name; defaults to `user@hostname`.
    pub name: Option<String>,
    /// Number of cores advertised at registration.
    pub ncores: usize,
    /// Bound on distinct peers with outstanding fetches.
    pub total_connections: usize,
    /// Soft cap on the byte size of a single gather batch.
    pub target_message_size: u64,
    /// Whether the invariant checker runs after every transition.
    pub validate: bool,
    /// Resources available to constrained tasks, e.g. `GPU -> 1`.
    pub available_resources: HashMap<String, f64>,
}

impl Default for WorkerOptions {
    fn default() -> WorkerOptions {
        WorkerOptions {
            scheduler_addr: "tcp://127.0.0.1:8786".into(),
            host: "127.0.0.1".into(),
            name: None,
            ncores: num_cpus::get(),
            total_connections: DEFAULT_TOTAL_CONNECTIONS,
            target_message_size: DEFAULT_TARGET_MESSAGE_SIZE,
            validate: true,
            available_resources: HashMap::new(),
        }
    }
}

/// A worker endpoint of the cluster.
///
/// The worker binds a listener on a random free port, registers with the
/// scheduler, then serves connections until a `Close` operation arrives:
/// the scheduler drives it over the compute stream, peers fetch data with
/// `get_data`. Task payloads are decoded by the injected [`CodeLoader`].
pub struct Worker {
    /// The unique identifier of this worker instance.
    pub uuid: WorkerUuid,
    /// The name of this worker, for logs and diagnostics.
    pub name: String,
    options: WorkerOptions,
    data: Arc<Mutex<WorkerData>>,
    loader: Arc<dyn CodeLoader>,
}

impl Worker {
    /// Make a new worker from its options and code loader.
    pub fn new(options: WorkerOptions, loader: Arc<dyn CodeLoader>) -> Worker {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}@{}", whoami::username(), whoami::hostname()));
        let data = WorkerData::new_shared(&options);
        Worker {
            uuid: Uuid::new_v4(),
            name,
            options,
            data,
            loader,
        }
    }

    /// A handle to the shared state store, for embedders and tests.
    pub fn state_handle(&self) -> Arc<Mutex<WorkerData>> {
        self.data.clone()
    }

    /// Run the worker: bind, register, serve connections until closed.
    ///
    /// Registration failure is fatal and reported as an error; everything
    /// recoverable (peer faults, bad assignments) is handled internally and
    /// surfaced to the scheduler per affected key.
    pub fn run(self) -> Result<(), Error> {
        let (mut server, port) = session::bind_random_port("0.0.0.0")?;
        let address = WorkerAddr::new(&self.options.host, port);
        info!("Worker {} listening at {}", self, address);
        self.data.lock().unwrap().address = address.to_string();

        session::register(&self.data).context("Failed to register with the scheduler")?;

        while let Some((sender, receiver, peer)) = server.next() {
            if self.data.lock().unwrap().shutting_down {
                break;
            }
            debug!("Connection from {:?}", peer);
            let worker = self.data.clone();
            let loader = self.loader.clone();
            thread::Builder::new()
                .name(format!("Connection from {:?}", peer))
                .spawn(move || session::handle_connection(worker, loader, sender, receiver, peer))
                .context("Failed to spawn the connection thread")?;
        }
        info!("Worker {} shut down", self);
        Ok(())
    }
}

impl std::fmt::Display for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "'{}' ({})", self.name, self.uuid)
    }
}
