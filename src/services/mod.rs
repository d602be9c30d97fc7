//! Services
//!
//! One directory per orchestration subsystem.

pub mod blockers;
pub mod checkpoint;
pub mod context;
pub mod correction;
pub mod pool;
pub mod providers;
pub mod scheduler;
pub mod sync;
pub mod worker;
