// Numan Thabit 2025
// node.rs - scheduling node: calendar, predicate state machine, workers

use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, warn};

use crate::actions::{ActionContext, ActionError, ActionHook, ActionTable, SchedulerType};
use crate::api::Task;
use crate::calendar::CalendarStore;
use crate::descriptor::PacketDescriptor;
use crate::dump::NodeDump;
use crate::metrics::Metrics;
use crate::rank::Rank;
use crate::registers::RegisterFile;

/// Messages delivered to a node's main loop.
///
/// The typed inbox replaces free-form task delivery: only enqueue work can
/// be addressed to a node, so a stray Dequeue task can never reach a node's
/// run loop. The traffic manager is the sole consumer of Dequeue tasks.
#[derive(Debug)]
pub(crate) enum NodeMessage {
    Enqueue(Task),
    Shutdown,
}

/// Messages delivered to a node's predicate worker.
#[derive(Debug)]
pub(crate) enum PredicateMessage {
    Evaluate,
    Shutdown,
}

// State guarded by the node mutex: every store mutation and every read of
// the output registers happens under this lock.
#[derive(Debug)]
struct NodeCore {
    store: CalendarStore,
    regs: RegisterFile,
    predicate_rank: Rank,
    predicate_set: bool,
    dump: Option<NodeDump>,
}

/// One scheduler instance.
///
/// A node owns a calendar store and runs the enqueue → rank → predicate →
/// dequeue cycle in isolation from other nodes. Root nodes (no parent) are
/// bound to an egress port and hand eligible descriptors to the traffic
/// manager; non-root nodes forward them to their parent for re-ranking.
#[derive(Debug)]
pub struct Node {
    id: u32,
    scheduler_type: SchedulerType,
    egress_port: Option<u32>,
    core: Mutex<NodeCore>,
    actions: ActionTable,
    tm_stream: Sender<Task>,
    parent: Option<(u32, Sender<NodeMessage>)>,
    predicate_tx: Sender<PredicateMessage>,
    metrics: Arc<Metrics>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        scheduler_type: SchedulerType,
        egress_port: Option<u32>,
        actions: ActionTable,
        tm_stream: Sender<Task>,
        parent: Option<(u32, Sender<NodeMessage>)>,
        predicate_tx: Sender<PredicateMessage>,
        metrics: Arc<Metrics>,
        dump: Option<NodeDump>,
    ) -> Result<Self, ActionError> {
        // A scheduler type with a missing hook is refused here, at install
        // time, rather than at the first enqueue.
        actions.verify(&scheduler_type)?;
        Ok(Self {
            id,
            scheduler_type,
            egress_port,
            core: Mutex::new(NodeCore {
                store: CalendarStore::new(),
                regs: RegisterFile::new(),
                predicate_rank: Rank::NULL,
                predicate_set: false,
                dump,
            }),
            actions,
            tm_stream,
            parent,
            predicate_tx,
            metrics,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn scheduler_type(&self) -> &SchedulerType {
        &self.scheduler_type
    }

    pub fn egress_port(&self) -> Option<u32> {
        self.egress_port
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Seeds read-only scheduler parameters before the node starts serving.
    pub(crate) fn seed_parameters(&self, params: &[(usize, Vec<u32>)]) {
        let mut core = self.lock_core();
        for (index, values) in params {
            core.regs.add_scheduler_parameter(*index, values.clone());
        }
    }

    /// Main loop: drains the inbox until shutdown.
    pub(crate) fn run(&self, inbox: Receiver<NodeMessage>) {
        for message in inbox {
            match message {
                NodeMessage::Enqueue(task) => self.enqueue(task),
                NodeMessage::Shutdown => break,
            }
        }
        debug!(node = self.id, "node main loop stopped");
    }

    /// Predicate worker: evaluations are idempotent, so redundant messages
    /// coalesce by simply running whatever is queued.
    pub(crate) fn predicate_worker(&self, queue: Receiver<PredicateMessage>) {
        for message in queue {
            match message {
                PredicateMessage::Evaluate => self.eval_predicate(),
                PredicateMessage::Shutdown => break,
            }
        }
        debug!(node = self.id, "node predicate worker stopped");
    }

    /// Ranks and stores one descriptor, then schedules an evaluation.
    pub(crate) fn enqueue(&self, task: Task) {
        let desc = task.descriptor;
        let mut core = self.lock_core();
        let rank = self.calculate_rank(&mut core, &desc);
        let rank = match normalize_rank(rank) {
            Some(rank) => rank,
            None => {
                // Only reachable if the action wrote (0, 0) with no day; a
                // zero-time rank is clamped instead so no packet is lost.
                warn!(node = self.id, "rank action produced the null sentinel");
                Rank::new(0, 1)
            }
        };
        if let Some(dump) = core.dump.as_mut() {
            if let Err(err) = dump.input.log(&desc) {
                debug!(node = self.id, ?err, "input dump write failed");
            }
        }
        core.store.insert(desc, rank);
        drop(core);
        self.schedule_eval();
    }

    fn calculate_rank(&self, core: &mut MutexGuard<'_, NodeCore>, desc: &PacketDescriptor) -> Rank {
        self.invoke(core, ActionHook::CalculateRank, desc);
        core.regs.rank()
    }

    /// Runs the predicate state machine once.
    ///
    /// ```text
    /// UNSET  --eval: p != 0-->  SET(p)
    /// SET(p) --eval: 0------->  UNSET
    /// SET(p) --eval: p' != p->  SET(p')   (non-root: old entry detached)
    /// SET(p) --dequeue, empty-> UNSET
    /// SET(p) --dequeue, rest--> SET(p)    (re-evaluated)
    /// ```
    pub(crate) fn eval_predicate(&self) {
        self.metrics.predicate_evals.inc();
        let mut core = self.lock_core();

        let lowest = match core.store.lowest() {
            Some(desc) => desc.clone(),
            None => {
                core.predicate_rank = Rank::NULL;
                core.predicate_set = false;
                return;
            }
        };

        self.invoke(&mut core, ActionHook::EvaluatePredicate, &lowest);
        let new_pred = core.regs.predicate();

        if new_pred.is_null() {
            core.predicate_rank = Rank::NULL;
            core.predicate_set = false;
            return;
        }
        if !new_pred.is_well_formed() {
            warn!(node = self.id, pred = %new_pred, "malformed predicate rank, treating as null");
            core.predicate_rank = Rank::NULL;
            core.predicate_set = false;
            return;
        }
        if new_pred == core.predicate_rank {
            return;
        }

        if core.predicate_set && self.parent.is_some() {
            // The previously selected entry has already flowed to the
            // parent at selection time; drop any leftover copy.
            let old = core.predicate_rank;
            if core.store.remove(old).is_some() {
                debug!(node = self.id, rank = %old, "detached superseded predicate entry");
            }
        }

        core.predicate_rank = new_pred;
        core.predicate_set = true;

        if !core.store.is_empty() {
            self.dequeue_locked(&mut core, new_pred);
        }
    }

    /// Emits the calendar entry at `rank`.
    ///
    /// Root nodes push a Dequeue task to the traffic manager; non-root nodes
    /// forward the descriptor to their parent as fresh enqueue work, where
    /// it is ranked again by the parent's own action set.
    fn dequeue_locked(&self, core: &mut MutexGuard<'_, NodeCore>, rank: Rank) {
        let desc = match core.store.get(rank) {
            Some(desc) => desc.clone(),
            None => {
                warn!(node = self.id, rank = %rank, "predicate target missing at dequeue");
                self.metrics.predicate_misses.inc();
                core.predicate_rank = Rank::NULL;
                core.predicate_set = false;
                return;
            }
        };

        match &self.parent {
            None => {
                if self.tm_stream.send(Task::dequeue(desc.clone(), self.id)).is_err() {
                    error!(node = self.id, "traffic manager task stream closed");
                }
            }
            Some((parent_id, parent_inbox)) => {
                let forwarded = Task::enqueue(desc.clone(), *parent_id);
                if parent_inbox.send(NodeMessage::Enqueue(forwarded)).is_err() {
                    error!(node = self.id, parent = *parent_id, "parent inbox closed");
                }
            }
        }

        if let Some(dump) = core.dump.as_mut() {
            if let Err(err) = dump.output.log(&desc) {
                debug!(node = self.id, ?err, "output dump write failed");
            }
        }

        self.invoke(core, ActionHook::Dequeued, &desc);
        core.store.remove(rank);

        if core.store.is_empty() {
            core.predicate_rank = Rank::NULL;
            core.predicate_set = false;
        } else {
            self.schedule_eval();
        }
    }

    // Runs a hook to completion under the node mutex. Presence was checked
    // at install time; a miss here is a wiring bug, logged and skipped.
    fn invoke(&self, core: &mut MutexGuard<'_, NodeCore>, hook: ActionHook, desc: &PacketDescriptor) {
        let action = match self.actions.get(&self.scheduler_type, hook) {
            Some(action) => action.clone(),
            None => {
                error!(node = self.id, scheduler = %self.scheduler_type, ?hook, "action vanished after install");
                return;
            }
        };
        let NodeCore { store, regs, .. } = &mut **core;
        let mut ctx = ActionContext::new(regs, store, desc);
        action(&mut ctx);
    }

    fn schedule_eval(&self) {
        let _ = self.predicate_tx.send(PredicateMessage::Evaluate);
    }

    fn lock_core(&self) -> MutexGuard<'_, NodeCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// `true` when the store is non-empty and a predicate is installed.
    pub fn ready(&self) -> bool {
        let core = self.lock_core();
        !core.store.is_empty() && core.predicate_set
    }

    /// Current predicate `(rank, installed)` pair, for observation.
    pub fn predicate_state(&self) -> (Rank, bool) {
        let core = self.lock_core();
        (core.predicate_rank, core.predicate_set)
    }

    /// Number of descriptors currently in the calendar store.
    pub fn calendar_len(&self) -> usize {
        self.lock_core().store.len()
    }
}

fn normalize_rank(rank: Rank) -> Option<Rank> {
    if rank.is_null() {
        return None;
    }
    if rank.time == 0 {
        // Zero time is reserved for the sentinel; clamp up rather than
        // stranding the descriptor behind an unselectable key.
        return Some(Rank::new(rank.day, 1));
    }
    Some(rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TaskKind;
    use crate::packet::{HeaderVector, Packet, PacketId};
    use bytes::Bytes;
    use crossbeam_channel::unbounded;

    fn descriptor(id: u32) -> Arc<PacketDescriptor> {
        let packet = Packet::new(
            PacketId(id),
            0,
            Bytes::from_static(b"p"),
            HeaderVector::new(),
        );
        Arc::new(PacketDescriptor::from_packet(&packet))
    }

    struct Harness {
        node: Node,
        tm_rx: crossbeam_channel::Receiver<Task>,
        pred_rx: crossbeam_channel::Receiver<PredicateMessage>,
    }

    fn root_node(actions: ActionTable) -> Harness {
        let (tm_tx, tm_rx) = unbounded();
        let (pred_tx, pred_rx) = unbounded();
        let node = Node::new(
            0,
            SchedulerType::Fifo,
            Some(0),
            actions,
            tm_tx,
            None,
            pred_tx,
            Arc::new(Metrics::new().expect("metrics")),
            None,
        )
        .expect("node");
        Harness {
            node,
            tm_rx,
            pred_rx,
        }
    }

    // Drives queued evaluations to completion, like the predicate worker.
    fn drain_evals(harness: &Harness) {
        while let Ok(message) = harness.pred_rx.try_recv() {
            if let PredicateMessage::Evaluate = message {
                harness.node.eval_predicate();
            }
        }
    }

    #[test]
    fn missing_action_is_rejected_at_install() {
        let (tm_tx, _tm_rx) = unbounded();
        let (pred_tx, _pred_rx) = unbounded();
        let err = Node::new(
            1,
            SchedulerType::Custom("WF2Q".into()),
            Some(0),
            ActionTable::with_builtins(),
            tm_tx,
            None,
            pred_tx,
            Arc::new(Metrics::new().expect("metrics")),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ActionError::Missing(_)));
    }

    #[test]
    fn enqueue_on_empty_node_emits_one_dequeue_task() {
        let harness = root_node(ActionTable::with_builtins());
        harness.node.enqueue(Task::enqueue(descriptor(10), 0));

        // Exactly one evaluation was scheduled by the enqueue.
        assert_eq!(harness.pred_rx.len(), 1);
        drain_evals(&harness);

        let task = harness.tm_rx.try_recv().expect("dequeue task");
        assert_eq!(task.kind, TaskKind::Dequeue);
        assert_eq!(task.descriptor.packet_id(), PacketId(10));
        assert!(harness.tm_rx.try_recv().is_err());

        // Store drained, predicate back to unset.
        assert_eq!(harness.node.calendar_len(), 0);
        assert_eq!(harness.node.predicate_state(), (Rank::NULL, false));
    }

    #[test]
    fn fifo_emits_in_arrival_order() {
        let harness = root_node(ActionTable::with_builtins());
        harness.node.enqueue(Task::enqueue(descriptor(10), 0));
        harness.node.enqueue(Task::enqueue(descriptor(11), 0));
        drain_evals(&harness);
        // Dequeues schedule follow-up evaluations; drain until quiescent.
        drain_evals(&harness);

        let ids: Vec<u32> = harness
            .tm_rx
            .try_iter()
            .map(|task| task.descriptor.packet_id().0)
            .collect();
        assert_eq!(ids, vec![10, 11]);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let harness = root_node(ActionTable::with_builtins());
        harness.node.enqueue(Task::enqueue(descriptor(5), 0));
        drain_evals(&harness);
        let state = harness.node.predicate_state();

        harness.node.eval_predicate();
        harness.node.eval_predicate();
        assert_eq!(harness.node.predicate_state(), state);
        // No additional dequeue tasks appeared.
        assert_eq!(harness.tm_rx.len(), 1);
    }

    #[test]
    fn non_root_forwards_to_parent() {
        let (tm_tx, tm_rx) = unbounded();
        let (pred_tx, pred_rx) = unbounded();
        let (parent_tx, parent_rx) = unbounded();
        let node = Node::new(
            2,
            SchedulerType::Fifo,
            None,
            ActionTable::with_builtins(),
            tm_tx,
            Some((1, parent_tx)),
            pred_tx,
            Arc::new(Metrics::new().expect("metrics")),
            None,
        )
        .expect("node");

        node.enqueue(Task::enqueue(descriptor(30), 2));
        while let Ok(PredicateMessage::Evaluate) = pred_rx.try_recv() {
            node.eval_predicate();
        }

        // Forwarded upward as enqueue work addressed to the parent, and
        // nothing went straight to the traffic manager.
        let forwarded = parent_rx.try_recv().expect("forwarded task");
        match forwarded {
            NodeMessage::Enqueue(task) => {
                assert_eq!(task.kind, TaskKind::Enqueue);
                assert_eq!(task.node_id, 1);
                assert_eq!(task.descriptor.packet_id(), PacketId(30));
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(tm_rx.try_recv().is_err());
        assert_eq!(node.calendar_len(), 0);
    }

    #[test]
    fn zero_time_rank_is_clamped() {
        let mut actions = ActionTable::with_builtins();
        actions.register(
            SchedulerType::Custom("BROKEN".into()),
            ActionHook::CalculateRank,
            |ctx| ctx.set_rank(4, 0),
        );
        actions.register(
            SchedulerType::Custom("BROKEN".into()),
            ActionHook::EvaluatePredicate,
            |ctx| ctx.set_predicate(0, 0),
        );
        actions.register(SchedulerType::Custom("BROKEN".into()), ActionHook::Dequeued, |_| {});

        let (tm_tx, _tm_rx) = unbounded();
        let (pred_tx, _pred_rx) = unbounded();
        let node = Node::new(
            3,
            SchedulerType::Custom("BROKEN".into()),
            Some(0),
            actions,
            tm_tx,
            None,
            pred_tx,
            Arc::new(Metrics::new().expect("metrics")),
            None,
        )
        .expect("node");

        node.enqueue(Task::enqueue(descriptor(1), 3));
        assert_eq!(node.calendar_len(), 1);
        assert!(!node.ready());
    }

    #[test]
    fn constant_rank_ties_emit_by_packet_id() {
        let mut actions = ActionTable::new();
        actions.register(SchedulerType::Fifo, ActionHook::CalculateRank, |ctx| {
            ctx.set_rank(1, 1)
        });
        actions.register(SchedulerType::Fifo, ActionHook::EvaluatePredicate, |ctx| {
            let lowest = ctx.get_lowest_priority();
            ctx.set_predicate(lowest.day, lowest.time);
        });
        actions.register(SchedulerType::Fifo, ActionHook::Dequeued, |_| {});

        let harness = root_node(actions);
        for id in [3, 1, 2] {
            harness.node.enqueue(Task::enqueue(descriptor(id), 0));
        }
        drain_evals(&harness);

        let ids: Vec<u32> = harness
            .tm_rx
            .try_iter()
            .map(|task| task.descriptor.packet_id().0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn missing_predicate_target_resets_to_unset() {
        let mut actions = ActionTable::new();
        actions.register(SchedulerType::Fifo, ActionHook::CalculateRank, |ctx| {
            ctx.set_rank(1, 1)
        });
        // Claims an entry that does not exist.
        actions.register(SchedulerType::Fifo, ActionHook::EvaluatePredicate, |ctx| {
            ctx.set_predicate(9, 9)
        });
        actions.register(SchedulerType::Fifo, ActionHook::Dequeued, |_| {});

        let harness = root_node(actions);
        harness.node.enqueue(Task::enqueue(descriptor(1), 0));
        drain_evals(&harness);

        assert_eq!(harness.node.predicate_state(), (Rank::NULL, false));
        assert!(harness.tm_rx.try_recv().is_err());
        // The entry itself is still waiting in the calendar.
        assert_eq!(harness.node.calendar_len(), 1);
    }
}
