//! Run Lease
//!
//! At most one process drives a project's pool at a time. The holder keeps a
//! heartbeat in the store; a lease whose heartbeat is older than
//! [`RUN_LEASE_TTL`] belongs to a crashed process and may be taken over.
//! Recovery of interrupted tasks and agents is only safe under the lease.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::storage::Database;
use crate::utils::error::{AppError, AppResult};

pub const RUN_LEASE_TTL: Duration = Duration::from_secs(30);

/// How often a holder refreshes its heartbeat
pub const RUN_LEASE_HEARTBEAT: Duration = Duration::from_secs(10);

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Process-unique holder name, e.g. `run-4312-2`
fn holder_name(purpose: &str) -> String {
    format!(
        "{}-{}-{}",
        purpose,
        std::process::id(),
        NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Holder of the project run lease; released on drop
#[derive(Debug)]
pub struct RunLease {
    db: Database,
    holder: String,
}

impl RunLease {
    /// Take the lease, or fail with a conflict naming the live holder
    pub fn acquire(db: &Database, purpose: &str) -> AppResult<Self> {
        let holder = holder_name(purpose);
        if !db.acquire_run_lease(&holder, RUN_LEASE_TTL, Utc::now())? {
            let owner = db
                .active_run_lease(RUN_LEASE_TTL, Utc::now())?
                .unwrap_or_else(|| "unknown".to_string());
            return Err(AppError::conflict(format!(
                "another process ({}) is running this project",
                owner
            )));
        }
        tracing::debug!(holder = %holder, "Run lease acquired");
        Ok(Self {
            db: db.clone(),
            holder,
        })
    }

    /// Holder of a live lease, if any
    pub fn active(db: &Database) -> AppResult<Option<String>> {
        db.active_run_lease(RUN_LEASE_TTL, Utc::now())
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Refresh the heartbeat; a conflict means another process took over
    pub fn renew(&self) -> AppResult<()> {
        if !self.db.renew_run_lease(&self.holder, Utc::now())? {
            return Err(AppError::conflict(format!(
                "run lease {} was taken over",
                self.holder
            )));
        }
        Ok(())
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        match self.db.release_run_lease(&self.holder) {
            Ok(()) => tracing::debug!(holder = %self.holder, "Run lease released"),
            Err(e) => tracing::warn!(holder = %self.holder, error = %e, "Failed to release run lease"),
        }
    }
}
