//! Agent Pool
//!
//! - `lease` - the per-project run lease held by whoever runs the pool
//! - `registry` - agent records, reuse and retirement under the ceiling
//! - `slot` - an execution's hold on a concurrency permit and an agent
//! - `manager` - the coordinating loop that assigns ready tasks

mod lease;
mod manager;
mod registry;
mod slot;

pub use lease::{RunLease, RUN_LEASE_HEARTBEAT, RUN_LEASE_TTL};
pub use manager::{AgentPool, RunSummary};
pub use registry::AgentRegistry;
pub use slot::WorkerSlot;
