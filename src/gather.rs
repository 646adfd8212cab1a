//! The peer gather loop: picking dependencies to fetch, batching them per
//! peer under the connection budget, dispatching `get_data` RPCs and
//! recovering dependencies nobody advertises anymore.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};
use itertools::Itertools;

use ductile::connect_channel;

use crate::computing;
use crate::loader::Value;
use crate::proto::{SchedulerUpdate, WorkerAddr, WorkerRequest, WorkerResponse};
use crate::session;
use crate::state::{DepState, Key, TaskState, WorkerData};
use crate::tasks;
use crate::transition::{DepContext, Transitions};

/// How many times a dependency lookup may fail before its dependents are
/// failed for good.
const SUSPICIOUS_LIMIT: u32 = 5;

/// Walk `data_needed` and fetch what can be fetched.
///
/// Tasks are visited in arrival order and never reordered. For every waiting
/// dependency of a visited task a peer is chosen uniformly at random among
/// the advertisers without an outstanding fetch; the batch for that peer is
/// extended with other pending dependencies up to the target message size.
/// The loop stops opening connections once `total_connections` distinct
/// peers have outstanding fetches. Dependencies nobody advertises go to
/// missing-dep recovery.
pub fn ensure_communicating(data: &mut WorkerData) {
    let mut i = 0;
    while i < data.data_needed.len() {
        if data.in_flight_workers.len() >= data.total_connections {
            break;
        }
        let key = data.data_needed[i].clone();
        let Some(record) = data.tasks.get(&key) else {
            data.data_needed.remove(i);
            continue;
        };
        if record.state != TaskState::Waiting {
            data.data_needed.remove(i);
            continue;
        }
        let deps: Vec<Key> = record.waiting_for_data.iter().cloned().sorted().collect();

        let mut in_flight_any = false;
        let mut missing = vec![];
        for dep in deps {
            match data.dep_state.get(&dep) {
                Some(DepState::Waiting) => {}
                Some(DepState::Flight) => {
                    in_flight_any = true;
                    continue;
                }
                Some(DepState::Memory) | None => continue,
            }
            if data.who_has.get(&dep).map_or(true, |h| h.is_empty()) {
                if data.missing_dep_flight.insert(dep.clone()) {
                    missing.push(dep.clone());
                }
                continue;
            }
            if data.in_flight_workers.len() >= data.total_connections {
                in_flight_any = true;
                break;
            }
            let mut candidates: Vec<String> = data.who_has[&dep]
                .iter()
                .filter(|peer| !data.in_flight_workers.contains_key(*peer))
                .cloned()
                .sorted()
                .collect();
            if candidates.is_empty() {
                in_flight_any = true;
                continue;
            }
            let peer = candidates.swap_remove(fastrand::usize(..candidates.len()));
            let batch = select_keys_for_gather(data, &peer, dep);
            debug!("Gathering {:?} from {}", batch, peer);
            data.in_flight_workers
                .insert(peer.clone(), batch.iter().cloned().collect());
            for dep in &batch {
                if let Err(e) = Transitions::transition_dep(
                    data,
                    dep,
                    DepState::Flight,
                    DepContext::to_peer(peer.clone()),
                ) {
                    error!("Failed to mark {} in flight: {:?}", dep, e);
                }
            }
            in_flight_any = true;
            spawn_gather(data, peer, batch);
        }
        if !missing.is_empty() {
            warn!("No peer advertises {:?}, asking the scheduler", missing);
            spawn_missing_dep_recovery(data, missing);
        }
        if in_flight_any {
            i += 1;
        } else {
            data.data_needed.remove(i);
        }
    }
}

/// Extend a gather batch for `peer` beyond the seed dependency: pop from the
/// peer's pending queue while the candidates are still waiting and the batch
/// stays within the target message size. A candidate that would overflow the
/// budget ends the batch and stays queued; stale entries are dropped.
pub fn select_keys_for_gather(data: &mut WorkerData, peer: &str, seed: Key) -> Vec<Key> {
    let mut total = data.nbytes.get(&seed).copied().unwrap_or(0);
    let mut batch = vec![seed];
    loop {
        let candidate = match data
            .pending_data_per_worker
            .get_mut(peer)
            .and_then(|queue| queue.front().cloned())
        {
            Some(candidate) => candidate,
            None => break,
        };
        if batch.contains(&candidate)
            || data.dep_state.get(&candidate) != Some(&DepState::Waiting)
        {
            data.pending_data_per_worker
                .get_mut(peer)
                .unwrap()
                .pop_front();
            continue;
        }
        let bytes = data.nbytes.get(&candidate).copied().unwrap_or(0);
        if total + bytes > data.target_message_size {
            break;
        }
        data.pending_data_per_worker
            .get_mut(peer)
            .unwrap()
            .pop_front();
        total += bytes;
        batch.push(candidate);
    }
    batch
}

/// Spawn the connection thread for one gather batch.
fn spawn_gather(data: &WorkerData, peer: String, batch: Vec<Key>) {
    let Some(worker) = data.self_ref.as_ref().and_then(std::sync::Weak::upgrade) else {
        debug!("No shared handle, not fetching from {}", peer);
        return;
    };
    let name = format!("Gather from {}", peer);
    let spawned = std::thread::Builder::new()
        .name(name)
        .spawn(move || gather_from_peer(worker, peer, batch));
    if let Err(e) = spawned {
        error!("Failed to spawn a gather thread: {:?}", e);
    }
}

/// Body of a gather connection thread: one `get_data` RPC to one peer,
/// then the per-dependency transitions under the lock.
fn gather_from_peer(worker: Arc<Mutex<WorkerData>>, peer: String, deps: Vec<Key>) {
    let who = worker.lock().unwrap().address.clone();
    let result = fetch_from_peer(&peer, &deps, who);

    let mut data = worker.lock().unwrap();
    match result {
        Ok(mut values) => {
            let received: Vec<Key> = deps
                .iter()
                .filter(|dep| values.contains_key(*dep))
                .cloned()
                .collect();
            if !received.is_empty() {
                data.send_to_scheduler(SchedulerUpdate::AddKeys { keys: received });
            }
            for dep in &deps {
                let applied = match values.remove(dep) {
                    Some(value) => Transitions::transition_dep(
                        &mut data,
                        dep,
                        DepState::Memory,
                        DepContext::fetched(value),
                    ),
                    None => Transitions::transition_dep(
                        &mut data,
                        dep,
                        DepState::Waiting,
                        DepContext::default(),
                    ),
                };
                if let Err(e) = applied {
                    error!("Failed to resolve the fetch of {}: {:?}", dep, e);
                }
            }
        }
        Err(e) => {
            warn!("Failed to gather {} keys from {}: {:?}", deps.len(), peer, e);
            purge_peer(&mut data, &peer);
            for dep in &deps {
                if let Err(e) = Transitions::transition_dep(
                    &mut data,
                    dep,
                    DepState::Waiting,
                    DepContext::default(),
                ) {
                    error!("Failed to return {} to waiting: {:?}", dep, e);
                }
            }
        }
    }
    computing::ensure_computing(&mut data);
    ensure_communicating(&mut data);
}

fn fetch_from_peer(
    peer: &str,
    deps: &[Key],
    who: String,
) -> Result<HashMap<Key, Value>, Error> {
    let addr = WorkerAddr::parse(peer)?.socket_addr()?;
    let (sender, receiver) = connect_channel::<_, WorkerRequest, WorkerResponse>(addr)?;
    sender.send(WorkerRequest::GetData {
        keys: deps.to_vec(),
        who: Some(who),
    })?;
    match receiver.recv()? {
        WorkerResponse::GetData(values) => Ok(values),
        other => bail!("Unexpected reply to get_data: {:?}", other),
    }
}

/// Forget everything a peer advertised. Called when a connection to it
/// failed.
fn purge_peer(data: &mut WorkerData, peer: &str) {
    if let Some(held) = data.has_what.remove(peer) {
        for dep in held {
            if let Some(holders) = data.who_has.get_mut(&dep) {
                holders.remove(peer);
                if holders.is_empty() {
                    data.who_has.remove(&dep);
                }
            }
        }
    }
    data.pending_data_per_worker.remove(peer);
}

/// Spawn a recovery round for dependencies whose advertisers are all gone.
/// The round runs on its own thread because it talks to the scheduler.
pub(crate) fn spawn_missing_dep_recovery(data: &WorkerData, deps: Vec<Key>) {
    let Some(worker) = data.self_ref.as_ref().and_then(std::sync::Weak::upgrade) else {
        debug!("No shared handle, not recovering {:?}", deps);
        return;
    };
    let spawned = std::thread::Builder::new()
        .name("Missing dependency recovery".into())
        .spawn(move || handle_missing_dep(worker, deps));
    if let Err(e) = spawned {
        error!("Failed to spawn a recovery thread: {:?}", e);
    }
}

/// One recovery round: fail dependencies that failed too often, ask the
/// scheduler about the rest, merge the answer and retry or give up per
/// dependency.
pub(crate) fn handle_missing_dep(worker: Arc<Mutex<WorkerData>>, deps: Vec<Key>) {
    let (to_ask, scheduler_addr) = {
        let mut data = worker.lock().unwrap();
        let mut to_ask = vec![];
        for dep in deps {
            if data.suspicious_deps.get(&dep).copied().unwrap_or(0) > SUSPICIOUS_LIMIT {
                warn!("Giving up on {}: not found too many times", dep);
                bad_dep(&mut data, &dep);
                data.missing_dep_flight.remove(&dep);
            } else {
                to_ask.push(dep);
            }
        }
        (to_ask, data.scheduler_addr.clone())
    };
    if to_ask.is_empty() {
        let mut data = worker.lock().unwrap();
        ensure_communicating(&mut data);
        return;
    }

    debug!("Asking the scheduler who has {:?}", to_ask);
    let reply = session::who_has_rpc(&scheduler_addr, to_ask.clone()).unwrap_or_else(|e| {
        error!("who_has to the scheduler failed: {:?}", e);
        HashMap::new()
    });

    let mut data = worker.lock().unwrap();
    update_who_has(&mut data, &reply);
    for dep in &to_ask {
        *data.suspicious_deps.entry(dep.clone()).or_insert(0) += 1;
        data.missing_dep_flight.remove(dep);
        let found = reply.get(dep).map_or(false, |peers| !peers.is_empty());
        if found {
            let dependents: Vec<Key> = data
                .dependents
                .get(dep)
                .map(|d| d.iter().cloned().collect())
                .unwrap_or_default();
            for dependent in dependents {
                if data.tasks.get(&dependent).map(|r| r.state) == Some(TaskState::Waiting) {
                    data.data_needed.push_front(dependent);
                }
            }
        } else {
            debug!("No peer holds {}, releasing it", dep);
            tasks::release_dep(&mut data, dep);
        }
    }
    ensure_communicating(&mut data);
}

/// Merge a scheduler `who_has` answer into the local advertisement tables.
pub(crate) fn update_who_has(data: &mut WorkerData, reply: &HashMap<Key, Vec<String>>) {
    for (dep, peers) in reply {
        if peers.is_empty() {
            continue;
        }
        for peer in peers {
            data.who_has
                .entry(dep.clone())
                .or_default()
                .insert(peer.clone());
            data.has_what
                .entry(peer.clone())
                .or_default()
                .insert(dep.clone());
        }
    }
}

/// Fail every dependent of a dependency that cannot be found anywhere, then
/// release the dependency.
pub(crate) fn bad_dep(data: &mut WorkerData, dep: &str) {
    let message = format!("Could not find dependent {}", dep);
    let dependents: Vec<Key> = data
        .dependents
        .remove(dep)
        .map(|d| d.into_iter().collect())
        .unwrap_or_default();
    for key in dependents {
        let state = match data.tasks.get_mut(&key) {
            Some(record) => {
                record.dependencies.remove(dep);
                record.waiting_for_data.remove(dep);
                Some(record.state)
            }
            None => None,
        };
        if let Some(state) = state {
            if state != TaskState::Memory {
                Transitions::fail_task(data, &key, message.clone(), message.clone());
            }
        }
    }
    tasks::release_dep(data, dep);
    data.suspicious_deps.remove(dep);
}
