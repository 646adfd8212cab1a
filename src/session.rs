//! The scheduler session: registration, the dispatch loop serving listener
//! connections, the batched outgoing stream and the scheduler RPCs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use itertools::Itertools;

use ductile::{connect_channel, ChannelReceiver, ChannelSender, ChannelServer};

use crate::computing::ensure_computing;
use crate::error::WorkerError;
use crate::gather::ensure_communicating;
use crate::loader::{CodeLoader, Value};
use crate::proto::{
    SchedulerReply, SchedulerRequest, SchedulerUpdate, WorkerAddr, WorkerRequest, WorkerResponse,
};
use crate::state::{now_secs, Key, WorkerData};
use crate::tasks;

/// The coalescing window of the batched stream: updates enqueued within this
/// interval of each other are flushed as one frame.
const BATCH_WINDOW: Duration = Duration::from_millis(2);

/// The port range scanned when binding the worker listener.
const PORT_LOW: u16 = 39_000;
/// Upper end of the scanned port range.
const PORT_HIGH: u16 = 39_500;
/// How many random ports are tried before giving up.
const MAX_BIND_ATTEMPTS: usize = 10;

/// The sending end of the batched, time-windowed stream to the scheduler.
///
/// Updates are enqueued without blocking; a dedicated thread coalesces
/// everything enqueued within [`BATCH_WINDOW`] into a single frame. A broken
/// stream is fatal for the worker.
#[derive(Debug, Clone)]
pub struct BatchedSender {
    tx: crossbeam_channel::Sender<SchedulerUpdate>,
}

impl BatchedSender {
    /// Spawn the flusher thread around the compute-stream sender and return
    /// the enqueueing handle.
    pub(crate) fn spawn(
        sender: ChannelSender<WorkerResponse>,
        worker: Weak<Mutex<WorkerData>>,
    ) -> BatchedSender {
        let (tx, rx) = crossbeam_channel::unbounded::<SchedulerUpdate>();
        let spawned = std::thread::Builder::new()
            .name("Batched scheduler stream".into())
            .spawn(move || {
                while let Ok(first) = rx.recv() {
                    let mut batch = vec![first];
                    let deadline = Instant::now() + BATCH_WINDOW;
                    while let Ok(update) = rx.recv_deadline(deadline) {
                        batch.push(update);
                    }
                    trace!("Flushing {} updates to the scheduler", batch.len());
                    if let Err(e) = sender.send(WorkerResponse::Updates(batch)) {
                        error!("The scheduler stream is broken, shutting down: {:?}", e);
                        if let Some(worker) = worker.upgrade() {
                            worker.lock().unwrap().shutting_down = true;
                        }
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            error!("Failed to spawn the batched stream thread: {:?}", e);
        }
        BatchedSender { tx }
    }

    /// Enqueue one update for the next flush.
    pub fn send(&self, update: SchedulerUpdate) {
        if self.tx.send(update).is_err() {
            debug!("The batched stream is closed, dropping an update");
        }
    }
}

/// Publish the state of a key to the scheduler, choosing the message shape
/// by where the key lives: a resident value becomes `task-finished`, a
/// recorded exception becomes `task-erred`. A key with neither is an error.
pub(crate) fn send_task_state_to_scheduler(data: &WorkerData, key: &str) {
    let startstops = data.startstops.get(key).cloned().unwrap_or_default();
    let update = if data.data.contains_key(key) {
        SchedulerUpdate::TaskFinished {
            key: key.to_string(),
            nbytes: data.nbytes.get(key).copied().unwrap_or(0),
            type_name: data.types.get(key).cloned().unwrap_or_default(),
            startstops,
        }
    } else if let Some(exception) = data.exceptions.get(key) {
        SchedulerUpdate::TaskErred {
            key: key.to_string(),
            exception: exception.clone(),
            traceback: data.tracebacks.get(key).cloned().unwrap_or_default(),
            startstops,
        }
    } else {
        error!("Key {} has neither a value nor an exception to report", key);
        return;
    };
    data.send_to_scheduler(update);
}

/// Bind the worker listener on a random free port, retrying on busy ports
/// within a small range.
pub(crate) fn bind_random_port(
    host: &str,
) -> Result<(ChannelServer<WorkerResponse, WorkerRequest>, u16), Error> {
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = fastrand::u16(PORT_LOW..PORT_HIGH);
        match ChannelServer::bind((host, port)) {
            Ok(server) => {
                debug!("Listening on {}:{}", host, port);
                return Ok((server, port));
            }
            Err(e) => debug!("Port {} is busy: {:?}", port, e),
        }
    }
    Err(WorkerError::NoFreePort {
        low: PORT_LOW,
        high: PORT_HIGH,
        attempts: MAX_BIND_ATTEMPTS,
    }
    .into())
}

/// Open a fresh RPC connection to the scheduler.
fn connect_to_scheduler(
    addr: &str,
) -> Result<(ChannelSender<SchedulerRequest>, ChannelReceiver<SchedulerReply>), Error> {
    let addr = WorkerAddr::parse(addr)?.socket_addr()?;
    connect_channel(addr).context("Failed to connect to the scheduler")
}

/// Register this worker with the scheduler. Anything but the literal `"OK"`
/// reply is fatal.
pub(crate) fn register(worker: &Arc<Mutex<WorkerData>>) -> Result<(), Error> {
    let (request, scheduler_addr) = {
        let data = worker.lock().unwrap();
        let request = SchedulerRequest::Register {
            address: data.address.clone(),
            ncores: data.ncores,
            keys: data.data.keys().cloned().sorted().collect(),
            nbytes: data.nbytes.clone(),
            now: now_secs(),
            executing: data.executing.len(),
            in_memory: data.data.len(),
            ready: data.ready.len(),
            in_flight: data.in_flight_tasks.len(),
        };
        (request, data.scheduler_addr.clone())
    };
    let (sender, receiver) = connect_to_scheduler(&scheduler_addr)?;
    sender
        .send(request)
        .context("Failed to send the registration")?;
    match receiver
        .recv()
        .context("Failed to receive the registration reply")?
    {
        SchedulerReply::Register(reply) if reply == "OK" => {
            info!("Registered with the scheduler at {}", scheduler_addr);
            Ok(())
        }
        SchedulerReply::Register(reply) => Err(WorkerError::RegistrationRefused { reply }.into()),
        other => Err(WorkerError::RegistrationRefused {
            reply: format!("{:?}", other),
        }
        .into()),
    }
}

/// Ask the scheduler which peers hold the given keys.
pub(crate) fn who_has_rpc(
    scheduler_addr: &str,
    keys: Vec<Key>,
) -> Result<HashMap<Key, Vec<String>>, Error> {
    let (sender, receiver) = connect_to_scheduler(scheduler_addr)?;
    sender
        .send(SchedulerRequest::WhoHas { keys })
        .context("Failed to send who_has")?;
    match receiver
        .recv()
        .context("Failed to receive the who_has reply")?
    {
        SchedulerReply::WhoHas(map) => Ok(map),
        other => bail!("Unexpected reply to who_has: {:?}", other),
    }
}

/// Body of the thread serving one listener connection, from the scheduler or
/// from a peer. The state lock is taken per message and never held while
/// sending or receiving.
pub(crate) fn handle_connection(
    worker: Arc<Mutex<WorkerData>>,
    loader: Arc<dyn CodeLoader>,
    sender: ChannelSender<WorkerResponse>,
    receiver: ChannelReceiver<WorkerRequest>,
    peer: Option<SocketAddr>,
) {
    loop {
        let message = match receiver.recv() {
            Ok(message) => message,
            Err(_) => {
                debug!("Connection from {:?} closed", peer);
                break;
            }
        };
        match message {
            WorkerRequest::ComputeStream => {
                info!("Compute stream opened by {:?}", peer);
                let mut data = worker.lock().unwrap();
                data.is_computing = true;
                data.batched = Some(BatchedSender::spawn(
                    sender.clone(),
                    Arc::downgrade(&worker),
                ));
            }
            WorkerRequest::ComputeTask(assignment) => {
                let mut data = worker.lock().unwrap();
                if !data.is_computing {
                    warn!("compute-task received outside of a compute stream");
                    continue;
                }
                if let Err(e) = tasks::add_task(&mut data, *assignment, None, loader.as_ref()) {
                    warn!("Rejected task assignment: {:?}", e);
                }
                after_computing_op(&mut data);
            }
            WorkerRequest::ReleaseTask { key, cause, reason } => {
                let mut data = worker.lock().unwrap();
                if !data.is_computing {
                    warn!("release-task received outside of a compute stream");
                    continue;
                }
                tasks::release_key(&mut data, &key, cause, reason.as_deref());
                after_computing_op(&mut data);
            }
            WorkerRequest::DeleteData { keys, report } => {
                let mut data = worker.lock().unwrap();
                tasks::delete_data(&mut data, keys, report);
                if data.is_computing {
                    after_computing_op(&mut data);
                }
            }
            WorkerRequest::GetData { keys, who } => {
                if let Some(who) = &who {
                    debug!("get_data of {} keys for {}", keys.len(), who);
                }
                let values: HashMap<Key, Value> = {
                    let data = worker.lock().unwrap();
                    keys.iter()
                        .filter_map(|key| data.data.get(key).map(|v| (key.clone(), v.clone())))
                        .collect()
                };
                if let Err(e) = sender.send(WorkerResponse::GetData(values)) {
                    warn!("Failed to answer get_data from {:?}: {:?}", peer, e);
                    break;
                }
            }
            WorkerRequest::Keys => {
                let keys: Vec<Key> = {
                    let data = worker.lock().unwrap();
                    data.data.keys().cloned().sorted().collect()
                };
                if let Err(e) = sender.send(WorkerResponse::Keys(keys)) {
                    warn!("Failed to answer keys from {:?}: {:?}", peer, e);
                    break;
                }
            }
            WorkerRequest::Gather { .. } => warn!("gather is not implemented, ignoring"),
            WorkerRequest::Terminate => warn!("terminate is not implemented, ignoring"),
            WorkerRequest::Close => {
                info!("Close requested by {:?}", peer);
                let address = {
                    let mut data = worker.lock().unwrap();
                    data.shutting_down = true;
                    data.is_computing = false;
                    data.batched = None;
                    data.address.clone()
                };
                // wake the listener so it notices the flag
                if let Ok(addr) = WorkerAddr::parse(&address).and_then(|a| a.socket_addr()) {
                    let _ = connect_channel::<_, WorkerRequest, WorkerResponse>(addr);
                }
                break;
            }
        }
    }
}

/// Bookkeeping after each computing operation: count it for the priority
/// tie-break and keep the worker saturated.
fn after_computing_op(data: &mut WorkerData) {
    data.priority_counter += 1;
    ensure_computing(data);
    ensure_communicating(data);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use ductile::new_local_channel;

    use crate::loader::Value;
    use crate::test_utils::test_data;

    use super::*;

    fn drain_updates(
        receiver: &ChannelReceiver<WorkerResponse>,
        wanted: usize,
    ) -> Vec<SchedulerUpdate> {
        let mut updates = vec![];
        while updates.len() < wanted {
            match receiver.recv().unwrap() {
                WorkerResponse::Updates(batch) => updates.extend(batch),
                other => panic!("Unexpected frame: {:?}", other),
            }
        }
        updates
    }

    #[test]
    fn test_batched_sender_coalesces() {
        let (tx, rx) = new_local_channel::<WorkerResponse>();
        let batched = BatchedSender::spawn(tx, Weak::new());
        for _ in 0..3 {
            batched.send(SchedulerUpdate::AddKeys { keys: vec!["k".into()] });
        }
        let updates = drain_updates(&rx, 3);
        assert_eq!(updates.len(), 3);
    }

    #[test]
    fn test_send_task_state_finished() {
        let mut data = test_data();
        let (tx, rx) = new_local_channel::<WorkerResponse>();
        data.batched = Some(BatchedSender::spawn(tx, Weak::new()));
        data.data.insert("a".into(), Value::from_i64(42));
        data.nbytes.insert("a".into(), 8);
        data.types.insert("a".into(), "Int64".into());

        send_task_state_to_scheduler(&data, "a");
        let updates = drain_updates(&rx, 1);
        match &updates[0] {
            SchedulerUpdate::TaskFinished {
                key,
                nbytes,
                type_name,
                ..
            } => {
                assert_eq!(key, "a");
                assert_eq!(*nbytes, 8);
                assert_eq!(type_name, "Int64");
            }
            other => panic!("Unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_send_task_state_erred() {
        let mut data = test_data();
        let (tx, rx) = new_local_channel::<WorkerResponse>();
        data.batched = Some(BatchedSender::spawn(tx, Weak::new()));
        data.exceptions.insert("a".into(), "boom".into());
        data.tracebacks.insert("a".into(), "trace".into());

        send_task_state_to_scheduler(&data, "a");
        let updates = drain_updates(&rx, 1);
        match &updates[0] {
            SchedulerUpdate::TaskErred {
                key,
                exception,
                traceback,
                ..
            } => {
                assert_eq!(key, "a");
                assert_eq!(exception, "boom");
                assert_eq!(traceback, "trace");
            }
            other => panic!("Unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_bind_random_port_twice() {
        let (_server1, port1) = bind_random_port("127.0.0.1").unwrap();
        let (_server2, port2) = bind_random_port("127.0.0.1").unwrap();
        assert_ne!(port1, port2);
    }

    #[test]
    fn test_register_handshake() {
        let (port_tx, port_rx) = crossbeam_channel::bounded(1);
        let stub = std::thread::spawn(move || {
            // a stub scheduler on a random port
            let mut bound = None;
            for _ in 0..10 {
                let port = fastrand::u16(30_000..31_000);
                if let Ok(server) =
                    ChannelServer::<SchedulerReply, SchedulerRequest>::bind(("127.0.0.1", port))
                {
                    bound = Some((server, port));
                    break;
                }
            }
            let (mut scheduler, port) = bound.unwrap();
            port_tx.send(port).unwrap();
            let (sender, receiver, _addr) = scheduler.next().unwrap();
            match receiver.recv().unwrap() {
                SchedulerRequest::Register { address, ncores, .. } => {
                    assert_eq!(address, "tcp://10.0.0.9:1234");
                    assert!(ncores > 0);
                }
                other => panic!("Unexpected request: {:?}", other),
            }
            sender.send(SchedulerReply::Register("OK".into())).unwrap();
        });
        let port = port_rx.recv().unwrap();

        let options = crate::worker::WorkerOptions {
            scheduler_addr: format!("tcp://127.0.0.1:{}", port),
            ncores: 2,
            ..crate::worker::WorkerOptions::default()
        };
        let worker = WorkerData::new_shared(&options);
        worker.lock().unwrap().address = "tcp://10.0.0.9:1234".into();

        register(&worker).unwrap();
        stub.join().unwrap();
    }

    #[test]
    fn test_register_refused() {
        let (port_tx, port_rx) = crossbeam_channel::bounded(1);
        let stub = std::thread::spawn(move || {
            let mut bound = None;
            for _ in 0..10 {
                let port = fastrand::u16(31_000..32_000);
                if let Ok(server) =
                    ChannelServer::<SchedulerReply, SchedulerRequest>::bind(("127.0.0.1", port))
                {
                    bound = Some((server, port));
                    break;
                }
            }
            let (mut scheduler, port) = bound.unwrap();
            port_tx.send(port).unwrap();
            let (sender, receiver, _addr) = scheduler.next().unwrap();
            let _ = receiver.recv().unwrap();
            sender
                .send(SchedulerReply::Register("too many workers".into()))
                .unwrap();
        });
        let port = port_rx.recv().unwrap();

        let options = crate::worker::WorkerOptions {
            scheduler_addr: format!("tcp://127.0.0.1:{}", port),
            ..crate::worker::WorkerOptions::default()
        };
        let worker = WorkerData::new_shared(&options);
        worker.lock().unwrap().address = "tcp://10.0.0.9:1234".into();

        let err = register(&worker).unwrap_err();
        assert!(err.to_string().contains("refused"));
        stub.join().unwrap();
    }
}
