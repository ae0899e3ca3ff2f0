// Numitm public library surface.
// Numan Thabit 2025

pub mod config;

pub mod rank;

pub mod packet;

pub mod descriptor;

pub mod calendar;

pub mod registers;

pub mod actions;

pub mod node;

pub mod hierarchy;

pub mod pool;

pub mod api;

pub mod tm;

pub mod server;

pub mod dump;

pub mod metrics;

pub use config::{ConfigError, ServerConfig, TmConfig};

pub use rank::Rank;

pub use packet::{HeaderVector, Packet, PacketId};

pub use descriptor::PacketDescriptor;

pub use calendar::CalendarStore;

pub use registers::{
    RegisterFile, MAX_NB_GP_REG, MAX_NB_SCHED_PARAM, MAX_SIZE_GP_REG_ARRAY,
    MAX_SIZE_SCHED_PARAM_ARRAY,
};

pub use actions::{ActionContext, ActionError, ActionHook, ActionTable, SchedulerType};

pub use node::Node;

pub use hierarchy::{Hierarchy, HierarchyError, HierarchySpec, NodeSpec};

pub use pool::PacketPool;

pub use api::{EgressSink, Task, TaskKind};

pub use tm::{TmError, TrafficManager};

pub use server::{ConfigServer, ServerError};

pub use metrics::{Metrics, MetricsError};
