// Numan Thabit 2025
// actions.rs - scheduler action dispatch and execution context

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use thiserror::Error;

use crate::calendar::CalendarStore;
use crate::descriptor::PacketDescriptor;
use crate::rank::Rank;
use crate::registers::RegisterFile;

/// Scheduling discipline selected per node by the configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchedulerType {
    Fifo,
    Sp,
    Drr,
    Custom(String),
}

impl SchedulerType {
    /// Parses the `scheduler` string of a configuration document.
    pub fn parse(name: &str) -> Self {
        match name {
            "FIFO" => SchedulerType::Fifo,
            "SP" => SchedulerType::Sp,
            "DRR" => SchedulerType::Drr,
            other => SchedulerType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for SchedulerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerType::Fifo => f.write_str("FIFO"),
            SchedulerType::Sp => f.write_str("SP"),
            SchedulerType::Drr => f.write_str("DRR"),
            SchedulerType::Custom(name) => f.write_str(name),
        }
    }
}

/// The three hooks a scheduler type must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionHook {
    CalculateRank,
    EvaluatePredicate,
    Dequeued,
}

impl ActionHook {
    pub const fn all() -> [ActionHook; 3] {
        [
            ActionHook::CalculateRank,
            ActionHook::EvaluatePredicate,
            ActionHook::Dequeued,
        ]
    }

    const fn suffix(self) -> &'static str {
        match self {
            ActionHook::CalculateRank => "calculate_rank",
            ActionHook::EvaluatePredicate => "evaluate_predicate",
            ActionHook::Dequeued => "dequeued",
        }
    }
}

/// Errors raised while wiring actions to a hierarchy.
#[derive(Debug, Error)]
pub enum ActionError {
    /// A scheduler type referenced by an installed node lacks a hook.
    #[error("missing action '{0}'")]
    Missing(String),
}

/// Execution context handed to an action for a single invocation.
///
/// Provides the register file, read access to the node's calendar store,
/// and the descriptor the hook was invoked for. The node mutex is held for
/// the whole invocation, so the action always observes a consistent store.
pub struct ActionContext<'a> {
    regs: &'a mut RegisterFile,
    store: &'a CalendarStore,
    descriptor: &'a PacketDescriptor,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        regs: &'a mut RegisterFile,
        store: &'a CalendarStore,
        descriptor: &'a PacketDescriptor,
    ) -> Self {
        Self {
            regs,
            store,
            descriptor,
        }
    }

    /// The descriptor this invocation is about.
    pub fn descriptor(&self) -> &PacketDescriptor {
        self.descriptor
    }

    pub fn get_scheduler_parameter(&self, index: usize, cell: usize) -> u32 {
        self.regs.get_scheduler_parameter(index, cell)
    }

    pub fn get_size_of_parameter(&self, index: usize) -> u32 {
        self.regs.get_size_of_parameter(index)
    }

    pub fn read_from_reg(&self, reg: usize, cell: usize) -> u32 {
        self.regs.read_from_reg(reg, cell)
    }

    pub fn write_to_reg(&mut self, reg: usize, cell: usize, value: u32) {
        self.regs.write_to_reg(reg, cell, value)
    }

    pub fn set_rank(&mut self, day: u32, time: u32) {
        self.regs.set_rank(day, time)
    }

    pub fn get_rank(&self) -> Rank {
        self.regs.rank()
    }

    pub fn set_predicate(&mut self, day: u32, time: u32) {
        self.regs.set_predicate(day, time)
    }

    pub fn set_field(&mut self, field: usize, value: u32) {
        self.regs.set_field(field, value)
    }

    pub fn get_field(&self, field: usize) -> u32 {
        self.regs.get_field(field)
    }

    /// Rank of the lowest calendar entry, `(0, 0)` when the store is empty.
    pub fn get_lowest_priority(&self) -> Rank {
        self.store
            .lowest()
            .map(|desc| desc.rank())
            .unwrap_or(Rank::NULL)
    }

    /// Time of the lowest entry for `day`, zero when the day is empty.
    pub fn get_lowest_priority_for_day(&self, day: u32) -> u32 {
        self.store
            .lowest_for_day(day)
            .map(|desc| desc.rank().time)
            .unwrap_or(0)
    }

    pub fn has_packets(&self, day: u32) -> bool {
        self.store.has_packets_for_day(day)
    }

    pub fn find_next_non_empty_day(&self, day: u32, limit: u32) -> u32 {
        self.store.find_next_non_empty_day(day, limit)
    }

    pub fn find_non_empty_day(&self, day: u32, limit: u32) -> u32 {
        self.store.find_non_empty_day(day, limit)
    }
}

/// A scheduling action: opaque to the node, runs to completion before the
/// node reads the output registers.
pub type ActionFn = dyn Fn(&mut ActionContext<'_>) + Send + Sync;

/// Dispatch table mapping `(scheduler type, hook)` to an action.
///
/// Completeness is checked when a hierarchy is installed, not at first
/// enqueue: a node whose scheduler type lacks any of the three hooks is
/// refused at build time.
#[derive(Clone, Default)]
pub struct ActionTable {
    actions: AHashMap<(SchedulerType, ActionHook), Arc<ActionFn>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table pre-populated with the built-in FIFO, SP and DRR action sets.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        builtins::install(&mut table);
        table
    }

    pub fn register<F>(&mut self, scheduler: SchedulerType, hook: ActionHook, action: F)
    where
        F: Fn(&mut ActionContext<'_>) + Send + Sync + 'static,
    {
        self.actions.insert((scheduler, hook), Arc::new(action));
    }

    pub(crate) fn get(&self, scheduler: &SchedulerType, hook: ActionHook) -> Option<&Arc<ActionFn>> {
        self.actions.get(&(scheduler.clone(), hook))
    }

    /// Verifies that every hook exists for `scheduler`.
    pub fn verify(&self, scheduler: &SchedulerType) -> Result<(), ActionError> {
        for hook in ActionHook::all() {
            if self.get(scheduler, hook).is_none() {
                return Err(ActionError::Missing(format!(
                    "{}_{}",
                    scheduler,
                    hook.suffix()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTable")
            .field("len", &self.actions.len())
            .finish()
    }
}

/// Built-in action sets for the standard scheduler types.
pub mod builtins {
    use super::*;

    // Cell 0 of general purpose register 0 holds the FIFO arrival counter.
    const FIFO_COUNTER_REG: usize = 0;
    // DRR keeps one byte accumulator per flow, one register array per flow.
    const DRR_DEFAULT_QUANTUM: u32 = 1500;

    /// Registers the FIFO, SP and DRR action sets into `table`.
    pub fn install(table: &mut ActionTable) {
        table.register(
            SchedulerType::Fifo,
            ActionHook::CalculateRank,
            |ctx: &mut ActionContext<'_>| {
                let next = ctx.read_from_reg(FIFO_COUNTER_REG, 0).saturating_add(1);
                ctx.write_to_reg(FIFO_COUNTER_REG, 0, next);
                ctx.set_rank(1, next);
            },
        );
        table.register(
            SchedulerType::Fifo,
            ActionHook::EvaluatePredicate,
            lowest_predicate,
        );
        table.register(SchedulerType::Fifo, ActionHook::Dequeued, |_ctx| {});

        table.register(
            SchedulerType::Sp,
            ActionHook::CalculateRank,
            |ctx: &mut ActionContext<'_>| {
                // Higher priority values go out first: rank time 8 - prio,
                // clamped so the result stays well formed.
                let priority = ctx.descriptor().priority() as u32;
                let time = 8u32.saturating_sub(priority).max(1);
                ctx.set_rank(0, time);
            },
        );
        table.register(
            SchedulerType::Sp,
            ActionHook::EvaluatePredicate,
            lowest_predicate,
        );
        table.register(SchedulerType::Sp, ActionHook::Dequeued, |_ctx| {});

        table.register(
            SchedulerType::Drr,
            ActionHook::CalculateRank,
            |ctx: &mut ActionContext<'_>| {
                // Virtual finish time per flow: accumulated bytes over the
                // configured quantum (scheduler parameter 0, cell 0).
                let flow = ctx.descriptor().vlan_id() as usize % crate::registers::MAX_NB_GP_REG;
                let quantum = match ctx.get_scheduler_parameter(0, 0) {
                    0 => DRR_DEFAULT_QUANTUM,
                    q => q,
                };
                let acc = ctx
                    .read_from_reg(flow, 0)
                    .saturating_add(ctx.descriptor().packet_size() as u32);
                ctx.write_to_reg(flow, 0, acc);
                let time = (acc / quantum).saturating_add(1);
                ctx.set_rank(1, time);
            },
        );
        table.register(
            SchedulerType::Drr,
            ActionHook::EvaluatePredicate,
            lowest_predicate,
        );
        table.register(SchedulerType::Drr, ActionHook::Dequeued, |_ctx| {});
    }

    fn lowest_predicate(ctx: &mut ActionContext<'_>) {
        let lowest = ctx.get_lowest_priority();
        ctx.set_predicate(lowest.day, lowest.time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{HeaderVector, Packet, PacketId};
    use bytes::Bytes;

    fn descriptor(id: u32, priority: u8, size: usize) -> PacketDescriptor {
        let mut headers = HeaderVector::new();
        headers
            .set("intrinsic_metadata.priority", priority as u64)
            .set("intrinsic_metadata.packet_length", size as u64);
        let packet = Packet::new(PacketId(id), 0, Bytes::from_static(b"x"), headers);
        PacketDescriptor::from_packet(&packet)
    }

    fn run(
        table: &ActionTable,
        scheduler: &SchedulerType,
        hook: ActionHook,
        regs: &mut RegisterFile,
        store: &CalendarStore,
        desc: &PacketDescriptor,
    ) {
        let action = table.get(scheduler, hook).cloned().unwrap();
        let mut ctx = ActionContext::new(regs, store, desc);
        action(&mut ctx);
    }

    #[test]
    fn verify_reports_missing_hooks() {
        let mut table = ActionTable::new();
        table.register(SchedulerType::Custom("WFQ".into()), ActionHook::CalculateRank, |_| {});
        let err = table
            .verify(&SchedulerType::Custom("WFQ".into()))
            .unwrap_err();
        assert!(matches!(err, ActionError::Missing(ref name) if name == "WFQ_evaluate_predicate"));
        assert!(table.verify(&SchedulerType::Fifo).is_err());
        assert!(ActionTable::with_builtins().verify(&SchedulerType::Fifo).is_ok());
    }

    #[test]
    fn fifo_ranks_monotonically() {
        let table = ActionTable::with_builtins();
        let mut regs = RegisterFile::new();
        let store = CalendarStore::new();
        let first = descriptor(1, 0, 100);
        let second = descriptor(2, 0, 100);

        run(&table, &SchedulerType::Fifo, ActionHook::CalculateRank, &mut regs, &store, &first);
        let rank_a = regs.rank();
        run(&table, &SchedulerType::Fifo, ActionHook::CalculateRank, &mut regs, &store, &second);
        let rank_b = regs.rank();
        assert!(rank_a < rank_b);
        assert!(rank_a.is_well_formed() && !rank_a.is_null());
    }

    #[test]
    fn sp_ranks_by_priority() {
        let table = ActionTable::with_builtins();
        let mut regs = RegisterFile::new();
        let store = CalendarStore::new();

        run(&table, &SchedulerType::Sp, ActionHook::CalculateRank, &mut regs, &store, &descriptor(20, 7, 100));
        let high = regs.rank();
        run(&table, &SchedulerType::Sp, ActionHook::CalculateRank, &mut regs, &store, &descriptor(21, 1, 100));
        let low = regs.rank();
        assert!(high < low);
        assert_eq!(high, Rank::new(0, 1));
        assert_eq!(low, Rank::new(0, 7));
    }

    #[test]
    fn drr_accumulates_per_flow() {
        let table = ActionTable::with_builtins();
        let mut regs = RegisterFile::new();
        regs.add_scheduler_parameter(0, vec![500]);
        let store = CalendarStore::new();
        let desc = descriptor(1, 0, 600);

        run(&table, &SchedulerType::Drr, ActionHook::CalculateRank, &mut regs, &store, &desc);
        let first = regs.rank();
        run(&table, &SchedulerType::Drr, ActionHook::CalculateRank, &mut regs, &store, &desc);
        let second = regs.rank();
        assert!(second.time > first.time);
    }

    #[test]
    fn predicate_follows_lowest_entry() {
        let table = ActionTable::with_builtins();
        let mut regs = RegisterFile::new();
        let mut store = CalendarStore::new();
        let desc = std::sync::Arc::new(descriptor(9, 0, 100));
        store.insert(desc.clone(), Rank::new(2, 4));

        run(&table, &SchedulerType::Fifo, ActionHook::EvaluatePredicate, &mut regs, &store, &desc);
        assert_eq!(regs.predicate(), Rank::new(2, 4));
    }
}
