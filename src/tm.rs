// Numan Thabit 2025
// tm.rs - traffic manager: enqueue gate, dequeue worker, reconfiguration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::actions::ActionTable;
use crate::api::{EgressSink, Task, TaskKind};
use crate::config::{ConfigError, TmConfig};
use crate::descriptor::PacketDescriptor;
use crate::hierarchy::{Hierarchy, HierarchyError, HierarchySpec};
use crate::metrics::{Metrics, MetricsError};
use crate::packet::Packet;
use crate::pool::PacketPool;
use crate::server::ConfigServer;

const WORKER_POLL: Duration = Duration::from_millis(50);
const SUPERVISOR_POLL: Duration = Duration::from_millis(100);

/// Errors surfaced by the traffic manager.
#[derive(Debug, Error)]
pub enum TmError {
    /// The per-port pool queue is at capacity; the caller keeps the packet.
    #[error("packet pool is full for port {0}")]
    PoolFull(u32),
    /// The traffic manager is stopping and no longer accepts work.
    #[error("traffic manager is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

// Gate callers block on while a reconfiguration drains the pipeline. The
// guard is held for the whole enqueue, so closing the gate also waits out
// any enqueue already past the check.
#[derive(Debug)]
struct EnqueueGate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl EnqueueGate {
    fn new() -> Self {
        Self {
            open: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    fn lock_open(&self, stop: &AtomicBool) -> Option<MutexGuard<'_, bool>> {
        let mut guard = lock(&self.open);
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if *guard {
                return Some(guard);
            }
            guard = match self.cv.wait_timeout(guard, WORKER_POLL) {
                Ok((guard, _timeout)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn close(&self) {
        *lock(&self.open) = false;
    }

    fn open(&self) {
        *lock(&self.open) = true;
        self.cv.notify_all();
    }
}

// Signalled by the dequeue worker whenever the pool empties out.
#[derive(Debug, Default)]
struct DrainSignal {
    lock: Mutex<()>,
    cv: Condvar,
}

impl DrainSignal {
    // Unbounded by design: a pool that never drains indicates an upstream
    // bug, not a condition to time out on.
    fn wait_empty(&self, pool: &PacketPool, stop: &AtomicBool) {
        let mut guard = lock(&self.lock);
        while !pool.is_empty() && !stop.load(Ordering::Acquire) {
            guard = match self.cv.wait_timeout(guard, WORKER_POLL) {
                Ok((guard, _timeout)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn notify(&self) {
        drop(lock(&self.lock));
        self.cv.notify_all();
    }
}

struct TmShared {
    config: TmConfig,
    actions: ActionTable,
    pool: PacketPool,
    // Two immutable hierarchy slots; `swapped` selects the active one.
    slots: [RwLock<Option<Arc<Hierarchy>>>; 2],
    swapped: AtomicBool,
    gate: EnqueueGate,
    drain: DrainSignal,
    task_tx: Sender<Task>,
    stop: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    sink: Arc<dyn EgressSink>,
}

/// Bridges the switch's packet stream and the scheduling hierarchy.
///
/// Owns the packet pool and the hierarchy, drains Dequeue tasks into the
/// egress buffers, and supervises live reconfiguration delivered over the
/// configuration socket.
pub struct TrafficManager {
    shared: Arc<TmShared>,
    doc_tx: Sender<String>,
    server_addr: Option<std::net::SocketAddr>,
    dequeue_handle: Option<JoinHandle<()>>,
    supervisor_handle: Option<JoinHandle<()>>,
    server_handle: Option<JoinHandle<()>>,
}

impl TrafficManager {
    /// Builds the initial hierarchy and starts the worker threads.
    pub fn start(
        config: TmConfig,
        actions: ActionTable,
        sink: Arc<dyn EgressSink>,
        initial: &HierarchySpec,
    ) -> Result<Self, TmError> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new()?);
        let (task_tx, task_rx) = unbounded();

        let shared = Arc::new(TmShared {
            pool: PacketPool::new(config.workers(), config.pool_capacity_per_port),
            actions,
            slots: [RwLock::new(None), RwLock::new(None)],
            swapped: AtomicBool::new(false),
            gate: EnqueueGate::new(),
            drain: DrainSignal::default(),
            task_tx,
            stop: Arc::new(AtomicBool::new(false)),
            metrics: metrics.clone(),
            sink,
            config,
        });

        let dump_dir = shared
            .config
            .debug_dump
            .then(|| shared.config.dump_dir.clone());
        let hierarchy = Hierarchy::build(
            initial,
            &shared.actions,
            shared.task_tx.clone(),
            metrics.clone(),
            dump_dir.as_deref(),
        )?;
        metrics.hierarchy_nodes.set(hierarchy.len() as i64);
        *write(&shared.slots[0]) = Some(Arc::new(hierarchy));

        let dequeue_shared = shared.clone();
        let dequeue_handle = thread::Builder::new()
            .name("tm-dequeue".into())
            .spawn(move || dequeue_loop(dequeue_shared, task_rx))
            .map_err(HierarchyError::Io)?;

        let (doc_tx, doc_rx) = unbounded::<String>();
        let supervisor_shared = shared.clone();
        let supervisor_handle = thread::Builder::new()
            .name("tm-reconfig".into())
            .spawn(move || supervisor_loop(supervisor_shared, doc_rx))
            .map_err(HierarchyError::Io)?;

        // The listener is optional and its setup failures are fatal to the
        // listener alone, never to the traffic manager.
        let mut server_addr = None;
        let mut server_handle = None;
        if shared.config.config_server.enabled {
            let server_cfg = &shared.config.config_server;
            match ConfigServer::bind(&server_cfg.bind_addr, server_cfg.port) {
                Ok(server) => {
                    server_addr = server.local_addr().ok();
                    let documents = doc_tx.clone();
                    let stop = shared.stop.clone();
                    server_handle = Some(
                        thread::Builder::new()
                            .name("tm-config-server".into())
                            .spawn(move || server.run(documents, stop))
                            .map_err(HierarchyError::Io)?,
                    );
                }
                Err(err) => error!(?err, "configuration server failed to start"),
            }
        }

        Ok(Self {
            shared,
            doc_tx,
            server_addr,
            dequeue_handle: Some(dequeue_handle),
            supervisor_handle: Some(supervisor_handle),
            server_handle,
        })
    }

    /// Splits a packet into its pooled payload and a descriptor routed to
    /// the active hierarchy's entry node.
    ///
    /// Blocks while a reconfiguration has the enqueue gate closed.
    pub fn enqueue(&self, port: u32, packet: Packet) -> Result<(), TmError> {
        let shared = &self.shared;
        let _gate = shared
            .gate
            .lock_open(&shared.stop)
            .ok_or(TmError::ShuttingDown)?;

        let descriptor = Arc::new(PacketDescriptor::from_packet(&packet).with_egress_port(port));
        let packet_id = packet.id();
        if !shared.pool.push_front(port, packet) {
            shared.metrics.pool_rejects.inc();
            return Err(TmError::PoolFull(port));
        }
        shared.metrics.pool_depth.set(shared.pool.occupancy() as i64);

        let active = shared.swapped.load(Ordering::Acquire) as usize;
        let delivered = read(&shared.slots[active]).as_ref().map(|hierarchy| {
            let entry_id = hierarchy.nodes()[0].id();
            hierarchy.deliver(Task::enqueue(descriptor, entry_id))
        });
        match delivered {
            Some(true) => {
                shared.metrics.packets_enqueued.inc();
                Ok(())
            }
            _ => {
                // No live hierarchy to route to; reclaim the payload so the
                // pool stays consistent.
                shared.pool.take(port, packet_id);
                shared.metrics.packets_dropped.inc();
                Err(TmError::ShuttingDown)
            }
        }
    }

    /// Feeds a configuration document to the reconfiguration supervisor,
    /// exactly as if it had arrived over the socket.
    pub fn inject_config(&self, document: impl Into<String>) -> Result<(), TmError> {
        self.doc_tx
            .send(document.into())
            .map_err(|_| TmError::ShuttingDown)
    }

    /// Address the configuration listener bound to, when running.
    pub fn config_server_addr(&self) -> Option<std::net::SocketAddr> {
        self.server_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    pub fn pool_occupancy(&self) -> usize {
        self.shared.pool.occupancy()
    }

    /// The hierarchy enqueue work currently routes to.
    pub fn active_hierarchy(&self) -> Option<Arc<Hierarchy>> {
        let active = self.shared.swapped.load(Ordering::Acquire) as usize;
        read(&self.shared.slots[active]).clone()
    }

    /// Cooperative shutdown: raises the stop flag, wakes every waiter, and
    /// joins the worker threads and node threads.
    pub fn shutdown(&mut self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.gate.open();
        self.shared.drain.notify();

        for handle in [
            self.dequeue_handle.take(),
            self.supervisor_handle.take(),
            self.server_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            if handle.join().is_err() {
                warn!("traffic manager worker panicked");
            }
        }

        for slot in &self.shared.slots {
            if let Some(hierarchy) = write(slot).take() {
                hierarchy.shutdown();
            }
        }
    }
}

impl Drop for TrafficManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Long-lived consumer of the cross-node task queue: matches each Dequeue
// task with its pooled payload and emits it.
fn dequeue_loop(shared: Arc<TmShared>, tasks: Receiver<Task>) {
    while !shared.stop.load(Ordering::Acquire) {
        let mut task = match tasks.recv_timeout(WORKER_POLL) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if task.kind != TaskKind::Dequeue {
            warn!(node = task.node_id, "unexpected task kind on the TM queue");
            continue;
        }

        let descriptor = &task.descriptor;
        let port = descriptor.egress_port();
        match shared.pool.take(port, descriptor.packet_id()) {
            Some(packet) => {
                shared.sink.push_front(port, packet);
                task.transmitted = true;
                shared.metrics.packets_emitted.inc();
            }
            None => {
                warn!(port, packet = %descriptor.packet_id(), "payload missing from pool");
                shared.metrics.packets_dropped.inc();
            }
        }
        shared.metrics.pool_depth.set(shared.pool.occupancy() as i64);
        if shared.pool.is_empty() {
            shared.drain.notify();
        }
    }
    debug!("dequeue worker stopped");
}

fn supervisor_loop(shared: Arc<TmShared>, documents: Receiver<String>) {
    while !shared.stop.load(Ordering::Acquire) {
        let document = match documents.recv_timeout(SUPERVISOR_POLL) {
            Ok(document) => document,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        reconfigure(&shared, &document);
    }
    debug!("reconfiguration supervisor stopped");
}

// One reconfiguration attempt: quiesce, drain, publish, resume. Every
// payload enqueued before the gate closes is emitted through the old
// hierarchy before the swap; nothing is lost or duplicated.
fn reconfigure(shared: &Arc<TmShared>, document: &str) {
    let spec = match HierarchySpec::parse(document) {
        Ok(spec) => spec,
        Err(err) => {
            warn!(?err, "dropping configuration document");
            shared.metrics.config_parse_failures.inc();
            return;
        }
    };
    debug!(nodes = spec.nodes.len(), "reconfiguration accepted");

    shared.gate.close();
    shared.drain.wait_empty(&shared.pool, &shared.stop);
    if shared.stop.load(Ordering::Acquire) {
        shared.gate.open();
        return;
    }

    let dump_dir = shared
        .config
        .debug_dump
        .then(|| shared.config.dump_dir.clone());
    let candidate = match Hierarchy::build(
        &spec,
        &shared.actions,
        shared.task_tx.clone(),
        shared.metrics.clone(),
        dump_dir.as_deref(),
    ) {
        Ok(hierarchy) => Arc::new(hierarchy),
        Err(err) => {
            warn!(?err, "candidate hierarchy refused, keeping current");
            shared.gate.open();
            return;
        }
    };

    // Publish: the pool is empty at this instant, so the swap is invisible
    // to in-flight work. Enqueues route to the new entry node from here on.
    let standby = !shared.swapped.load(Ordering::Acquire);
    *write(&shared.slots[standby as usize]) = Some(candidate);
    shared.swapped.store(standby, Ordering::Release);
    let retired = write(&shared.slots[usize::from(!standby)]).take();

    shared.metrics.hierarchy_nodes.set(spec.nodes.len() as i64);
    shared.metrics.reconfigurations.inc();
    shared.gate.open();

    if let Some(old) = retired {
        old.shutdown();
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<'a, T>(lock: &'a RwLock<T>) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<'a, T>(lock: &'a RwLock<T>) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
