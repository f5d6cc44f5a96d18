//! StateStore - file-backed IPC plane for AgentDaemon
//!
//! Three cooperating persistence surfaces shared between the controller and
//! worker processes:
//!
//! - [`StateStore`] - lock-protected JSON runtime state and recent-cycle ring
//! - [`CommandQueue`] - durable one-shot commands with lifecycle directories
//! - [`CycleJournal`] - SQLite row store of per-cycle records
//!
//! All three live under a single root directory on one host; renames and the
//! advisory lock are the coordination primitives, so cross-filesystem layouts
//! are not supported.

mod commands;
mod error;
mod journal;
mod state;

pub use commands::{AgentCommand, CommandQueue, CommandQueueStats, CommandStatus, CommandType};
pub use error::{Result, StoreError};
pub use journal::{
    CycleFilter, CycleJournal, CycleLog, CycleStats, MAX_CYCLES_TO_KEEP, generate_cycle_id,
};
pub use state::{
    AgentRuntimeState, AgentStatus, CycleInfo, FullStatus, RecentCycles, StateStore,
};
