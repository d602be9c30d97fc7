//! Shared fixtures: scripted collaborators and an `AppState` over an
//! in-memory store rooted in a temporary project directory.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conductor::models::{OrchestratorConfig, Task, TaskStatus};
use conductor::storage::Database;
use conductor::{AppState, Collaborators};
use conductor_core::{
    CodeGenerator, CoreResult, DiffStats, FileChange, GenerationRequest, GenerationResponse,
    ProviderError, TestReport, TestRunner, VersionControl,
};
use tempfile::TempDir;

pub type Handler =
    dyn Fn(&GenerationRequest) -> Result<GenerationResponse, ProviderError> + Send + Sync;

/// Writes one file per task unless the handler says otherwise
pub fn default_response(request: &GenerationRequest) -> Result<GenerationResponse, ProviderError> {
    Ok(GenerationResponse {
        files: vec![FileChange::write(
            format!("src/task_{}.rs", request.task_id),
            format!("// task {}\npub fn task_{}() {{}}\n", request.task_id, request.task_id),
        )],
        explanation: format!("implemented task {}", request.task_id),
        question: None,
    })
}

pub struct FakeGenerator {
    handler: Box<Handler>,
    delay: Duration,
    calls: Mutex<Vec<GenerationRequest>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeGenerator {
    pub fn new(
        handler: impl Fn(&GenerationRequest) -> Result<GenerationResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn ok() -> Self {
        Self::new(default_response)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Task ids in the order their first generation call arrived
    pub fn start_order(&self) -> Vec<i64> {
        let mut order = Vec::new();
        for request in self.calls.lock().unwrap().iter() {
            if !order.contains(&request.task_id) {
                order.push(request.task_id);
            }
        }
        order
    }

    pub fn calls_for(&self, task_id: i64) -> Vec<GenerationRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.task_id == task_id)
            .collect()
    }

    /// Most generation calls ever in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeGenerator for FakeGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveCall(&self.active);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(&request)
    }
}

/// Test runner replaying scripted reports, then a fixed fallback
pub struct FakeTests {
    script: Mutex<VecDeque<TestReport>>,
    fallback: TestReport,
    runs: AtomicUsize,
}

impl FakeTests {
    pub fn passing() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(reports: Vec<TestReport>) -> Self {
        Self {
            script: Mutex::new(reports.into()),
            fallback: TestReport::passing(3),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: TestReport::failing(
                1,
                "test auth::login ... FAILED\nassertion failed: token.is_some()\ntest result: FAILED. 4 passed; 1 failed",
            ),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for FakeTests {
    async fn run_tests(&self, _project_root: &Path) -> CoreResult<TestReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Version control that only hands out revision ids
#[derive(Default)]
pub struct NullVcs {
    commits: AtomicUsize,
}

impl VersionControl for NullVcs {
    fn head_revision(&self) -> CoreResult<String> {
        Ok(format!("rev-{}", self.commits.load(Ordering::SeqCst)))
    }

    fn commit_all(&self, _message: &str) -> CoreResult<String> {
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("rev-{}", n))
    }

    fn diff_stats(&self, _revision: &str) -> CoreResult<DiffStats> {
        Ok(DiffStats::default())
    }

    fn reset_hard(&self, _revision: &str) -> CoreResult<()> {
        Ok(())
    }
}

pub fn config(max_agents: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_agents,
        provider_retries: 0,
        provider_backoff_ms: 1,
        generation_timeout_secs: 10,
        blocker_sweep_interval_secs: 1,
        ..OrchestratorConfig::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub state: AppState,
    pub generator: Arc<FakeGenerator>,
    pub tests: Arc<FakeTests>,
}

impl Harness {
    pub fn new(config: OrchestratorConfig, generator: FakeGenerator, tests: FakeTests) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::with_vcs(dir, config, generator, tests, Arc::new(NullVcs::default()))
    }

    pub fn with_vcs(
        dir: TempDir,
        config: OrchestratorConfig,
        generator: FakeGenerator,
        tests: FakeTests,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        let generator = Arc::new(generator);
        let tests = Arc::new(tests);
        let collaborators = Collaborators {
            generator: generator.clone(),
            tests: tests.clone(),
            vcs,
        };
        let db = Database::new_in_memory().unwrap();
        let state = AppState::build(dir.path(), config, db, collaborators).unwrap();
        Self {
            dir,
            state,
            generator,
            tests,
        }
    }

    /// Another `AppState` over the same store, as a second CLI process
    /// would open it
    pub fn open_again(&self) -> AppState {
        let collaborators = Collaborators {
            generator: self.generator.clone(),
            tests: self.tests.clone(),
            vcs: Arc::new(NullVcs::default()),
        };
        AppState::build(
            self.dir.path(),
            self.state.config().clone(),
            self.state.database().clone(),
            collaborators,
        )
        .unwrap()
    }

    pub fn task(&self, id: i64) -> Task {
        self.state.scheduler().get_task(id).unwrap()
    }

    pub fn status(&self, id: i64) -> TaskStatus {
        self.task(id).status
    }

    /// Run the pool on its own tokio task
    pub fn spawn_run(
        &self,
    ) -> tokio::task::JoinHandle<conductor::AppResult<conductor::services::pool::RunSummary>> {
        let pool = Arc::clone(self.state.pool());
        tokio::spawn(async move { pool.run().await })
    }
}

/// Poll `condition` every 10ms until it holds; panics after `timeout`
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Bound a whole run so a scheduling bug fails the test instead of hanging it
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}
