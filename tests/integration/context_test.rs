//! Tiered context: budget enforcement, persistence and what reaches the
//! generator.

use std::time::Duration;

use conductor::models::{ContextTier, TaskSpec};
use conductor::services::context::{ContextTierStore, TierBudgets};
use conductor::storage::Database;

use crate::support::{config, within, FakeGenerator, FakeTests, Harness};

fn budgets(hot: u64) -> TierBudgets {
    TierBudgets {
        hot,
        warm: 2_000,
        cold: 4_000,
    }
}

#[test]
fn test_hot_overflow_demotes_least_important_item() {
    let mut store = ContextTierStore::new("backend-worker-001", budgets(1_000));
    store
        .insert_with_tokens("file:src/schema.rs", "schema", 400, true)
        .unwrap();
    store
        .insert_with_tokens("file:src/routes.rs", "routes", 400, false)
        .unwrap();
    for _ in 0..10 {
        store.access("file:src/routes.rs").unwrap();
    }

    store
        .insert_with_tokens("file:src/util.rs", "util", 400, false)
        .unwrap();

    assert_eq!(store.peek("file:src/util.rs").unwrap().tier, ContextTier::Warm);
    assert_eq!(store.peek("file:src/schema.rs").unwrap().tier, ContextTier::Hot);
    assert_eq!(store.peek("file:src/routes.rs").unwrap().tier, ContextTier::Hot);
    assert!(store.hot_tokens() <= 1_000);
    assert_eq!(store.tier_stats(ContextTier::Hot).count, 2);
}

#[test]
fn test_repeated_access_promotes_warm_item_over_idle_one() {
    let mut store = ContextTierStore::new(
        "backend-worker-001",
        TierBudgets {
            hot: 100,
            warm: 1_000,
            cold: 1_000,
        },
    );
    store.insert_with_tokens("file:src/a.rs", "a", 60, false).unwrap();
    store.insert_with_tokens("file:src/b.rs", "b", 60, false).unwrap();
    assert_eq!(store.peek("file:src/a.rs").unwrap().tier, ContextTier::Warm);

    for _ in 0..20 {
        store.access("file:src/a.rs").unwrap();
    }

    let a = store.peek("file:src/a.rs").unwrap();
    assert_eq!(a.tier, ContextTier::Hot);
    assert!(a.importance_score >= 0.8 - 1e-9);
    assert_eq!(store.peek("file:src/b.rs").unwrap().tier, ContextTier::Warm);
    assert!(store.hot_tokens() <= 100);
}

#[test]
fn test_cold_overflow_evicts_and_budgets_hold() {
    let mut store = ContextTierStore::new(
        "backend-worker-001",
        TierBudgets {
            hot: 100,
            warm: 100,
            cold: 100,
        },
    );
    for i in 0..10 {
        store
            .insert_with_tokens(&format!("symbol:f{}", i), "fn f()", 60, false)
            .unwrap();
    }

    let stats = store.stats();
    assert!(stats.hot.tokens <= 100);
    assert!(stats.warm.tokens <= 100);
    assert!(stats.cold.tokens <= 100);
    assert!(stats.evicted > 0);
    assert_eq!(store.len() as u64 + stats.evicted, 10);
}

#[test]
fn test_store_survives_reopen() {
    let db = Database::new_in_memory().unwrap();
    {
        let mut store =
            ContextTierStore::open(db.clone(), "frontend-worker-001", budgets(500)).unwrap();
        store
            .insert_with_tokens("file:src/app.tsx", "export function App() {}", 300, true)
            .unwrap();
        store
            .insert_with_tokens("file:src/index.css", "body {}", 300, false)
            .unwrap();
    }

    let reopened = ContextTierStore::open(db, "frontend-worker-001", budgets(500)).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.peek("file:src/app.tsx").unwrap().tier, ContextTier::Hot);
    assert_eq!(reopened.peek("file:src/index.css").unwrap().tier, ContextTier::Warm);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependency_output_reaches_dependent_context() {
    let h = Harness::new(config(1), FakeGenerator::ok(), FakeTests::passing());
    h.state
        .plan(vec![
            TaskSpec::new(1, "User model"),
            TaskSpec::new(2, "User service").with_dependencies([1]),
        ])
        .unwrap();

    within(Duration::from_secs(20), h.state.run()).await.unwrap();

    let request = h.generator.calls_for(2).remove(0);
    let keys: Vec<&str> = request.context.iter().map(|c| c.key.as_str()).collect();
    assert!(keys.contains(&"file:src/task_1.rs"));
    assert!(keys.contains(&"symbol:src/task_1.rs:task_1"));
    assert_eq!(h.task(2).modified_files, vec!["src/task_2.rs".to_string()]);
}
