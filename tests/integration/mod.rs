//! Integration Tests Module
//!
//! End-to-end tests of the orchestrator through `AppState`, with scripted
//! code generator and test runner collaborators and an in-memory store.

mod support;

// Assignment order, readiness and chain blocking
mod scheduler_test;

// Concurrency ceiling, isolation, cancellation and shutdown
mod pool_test;

// Question expiry, escalation and answers
mod blockers_test;

// Bounded self-correction
mod correction_test;

// Tiered context budgets and context selection
mod context_test;

// Joint code and state checkpoints over git
mod checkpoint_test;

// Observer event streams
mod sync_test;
