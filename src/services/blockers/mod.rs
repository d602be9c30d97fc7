//! Blocker Coordinator
//!
//! Questions raised by workers, their resolution, expiry, and the waits
//! that suspend on them.

mod coordinator;

pub use coordinator::{BlockerCoordinator, BlockerSettings};
