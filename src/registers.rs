// Numan Thabit 2025
// registers.rs - per-node register file exposed to scheduling actions

use ahash::AHashMap;
use tracing::warn;

use crate::rank::Rank;

/// Number of general-purpose register arrays per node.
pub const MAX_NB_GP_REG: usize = 32;
/// Number of scheduler parameter slots per node.
pub const MAX_NB_SCHED_PARAM: usize = 32;
/// Cells per scheduler parameter array.
pub const MAX_SIZE_SCHED_PARAM_ARRAY: usize = 16;
/// Cells per general-purpose register array.
pub const MAX_SIZE_GP_REG_ARRAY: usize = 16;

/// Per-node scratch state read and written by scheduling actions.
///
/// Register indices coming from action code are untrusted; out-of-range
/// accesses log and leave the output untouched (reads return zero).
#[derive(Debug)]
pub struct RegisterFile {
    rank: [u32; 2],
    predicate: [u32; 2],
    scheduler_params: AHashMap<usize, Vec<u32>>,
    gen_purpose: Vec<Vec<u32>>,
    packet_informations: [u32; MAX_NB_SCHED_PARAM],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            rank: [0; 2],
            predicate: [0; 2],
            scheduler_params: AHashMap::default(),
            gen_purpose: vec![vec![0; MAX_SIZE_GP_REG_ARRAY]; MAX_NB_GP_REG],
            packet_informations: [0; MAX_NB_SCHED_PARAM],
        }
    }
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the rank output register.
    pub fn rank(&self) -> Rank {
        Rank::new(self.rank[0], self.rank[1])
    }

    pub fn set_rank(&mut self, day: u32, time: u32) {
        self.rank = [day, time];
    }

    /// Current value of the predicate output register.
    pub fn predicate(&self) -> Rank {
        Rank::new(self.predicate[0], self.predicate[1])
    }

    pub fn set_predicate(&mut self, day: u32, time: u32) {
        self.predicate = [day, time];
    }

    /// Seeds a scheduler parameter array at configuration time. Duplicate
    /// indices are refused; action code only ever reads these.
    pub fn add_scheduler_parameter(&mut self, index: usize, values: Vec<u32>) {
        if index >= MAX_NB_SCHED_PARAM {
            warn!(index, "scheduler parameter index out of bounds");
            return;
        }
        if self.scheduler_params.contains_key(&index) {
            warn!(index, "scheduler parameter already exists");
            return;
        }
        let mut values = values;
        values.truncate(MAX_SIZE_SCHED_PARAM_ARRAY);
        self.scheduler_params.insert(index, values);
    }

    pub fn get_scheduler_parameter(&self, index: usize, cell: usize) -> u32 {
        match self.scheduler_params.get(&index) {
            Some(values) => match values.get(cell) {
                Some(value) => *value,
                None => {
                    warn!(index, cell, "scheduler parameter cell out of bounds");
                    0
                }
            },
            None => {
                warn!(index, "scheduler parameter does not exist");
                0
            }
        }
    }

    pub fn get_size_of_parameter(&self, index: usize) -> u32 {
        match self.scheduler_params.get(&index) {
            Some(values) => values.len() as u32,
            None => {
                warn!(index, "scheduler parameter does not exist");
                0
            }
        }
    }

    pub fn read_from_reg(&self, reg: usize, cell: usize) -> u32 {
        match self.gen_purpose.get(reg).and_then(|array| array.get(cell)) {
            Some(value) => *value,
            None => {
                warn!(reg, cell, "general purpose register index out of bounds");
                0
            }
        }
    }

    pub fn write_to_reg(&mut self, reg: usize, cell: usize, value: u32) {
        match self
            .gen_purpose
            .get_mut(reg)
            .and_then(|array| array.get_mut(cell))
        {
            Some(slot) => *slot = value,
            None => {
                warn!(reg, cell, "general purpose register index out of bounds");
            }
        }
    }

    pub fn set_field(&mut self, field: usize, value: u32) {
        match self.packet_informations.get_mut(field) {
            Some(slot) => *slot = value,
            None => warn!(field, "packet field index out of bounds"),
        }
    }

    pub fn get_field(&self, field: usize) -> u32 {
        match self.packet_informations.get(field) {
            Some(value) => *value,
            None => {
                warn!(field, "packet field index out of bounds");
                0
            }
        }
    }
}
