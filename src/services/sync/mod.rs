//! State Sync
//!
//! Lifecycle events from the scheduler, pool, workers, blockers and
//! checkpoints, pushed to any number of observers.
//!
//! - `events` - event wire types
//! - `broadcaster` - tokio broadcast fan-out with full resync on (re)connect or lag
//! - `reconcile` - observer-side last-write-wins cache

mod broadcaster;
mod events;
mod reconcile;

pub use broadcaster::*;
pub use events::*;
pub use reconcile::*;
