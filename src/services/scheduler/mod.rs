//! Task Graph & Scheduler
//!
//! - `graph` - index arena of task dependencies with cycle detection
//! - `chain` - readiness, assignment order, and chain block/release

mod graph;
mod chain;

pub use graph::TaskGraph;
pub use chain::Scheduler;
