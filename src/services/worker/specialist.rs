//! Specialist Workers
//!
//! The closed set of agent specializations. Each one shares the pipeline and
//! differs in its role instructions and which project files it likes to
//! have in context.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::{AgentType, Task, TaskExecutionResult};
use crate::services::pool::WorkerSlot;

use super::context::mentioned_paths;
use super::pipeline::{run_pipeline, WorkerServices};

/// Common execution contract of every agent specialization
#[async_trait]
pub trait Specialist: Send + Sync {
    fn agent_type(&self) -> AgentType;

    /// Role instructions sent with every generation request
    fn role(&self) -> &'static str;

    /// Project-relative files worth caching for this task, beyond the ones
    /// the task mentions. Missing files are skipped by the context builder.
    fn context_hints(&self, _task: &Task, _project_root: &Path) -> Vec<String> {
        Vec::new()
    }

    async fn execute_task(
        &self,
        services: &WorkerServices,
        task: Task,
        slot: &mut WorkerSlot,
        cancel: &CancellationToken,
    ) -> TaskExecutionResult {
        run_pipeline(self, services, task, slot, cancel).await
    }
}

fn existing(project_root: &Path, candidates: &[&str]) -> Vec<String> {
    candidates
        .iter()
        .filter(|c| project_root.join(c).is_file())
        .map(|c| c.to_string())
        .collect()
}

pub struct BackendWorker;

#[async_trait]
impl Specialist for BackendWorker {
    fn agent_type(&self) -> AgentType {
        AgentType::Backend
    }

    fn role(&self) -> &'static str {
        "You are a backend engineer. Implement server-side logic, data access and APIs. \
         Keep changes minimal and consistent with the existing code."
    }

    fn context_hints(&self, _task: &Task, project_root: &Path) -> Vec<String> {
        existing(
            project_root,
            &["Cargo.toml", "pyproject.toml", "go.mod", "package.json", "src/lib.rs", "src/main.rs"],
        )
    }
}

pub struct FrontendWorker;

#[async_trait]
impl Specialist for FrontendWorker {
    fn agent_type(&self) -> AgentType {
        AgentType::Frontend
    }

    fn role(&self) -> &'static str {
        "You are a frontend engineer. Build UI components, pages and styles that match \
         the project's existing conventions."
    }

    fn context_hints(&self, _task: &Task, project_root: &Path) -> Vec<String> {
        existing(
            project_root,
            &["package.json", "tsconfig.json", "src/App.tsx", "src/main.tsx", "index.html"],
        )
    }
}

pub struct TestWorker;

#[async_trait]
impl Specialist for TestWorker {
    fn agent_type(&self) -> AgentType {
        AgentType::Test
    }

    fn role(&self) -> &'static str {
        "You are a test engineer. Write focused tests for the described behavior and fix \
         test code, not the code under test, unless the task says otherwise."
    }

    /// Conventional test locations next to the sources the task mentions
    fn context_hints(&self, task: &Task, _project_root: &Path) -> Vec<String> {
        let mut hints = Vec::new();
        for path in mentioned_paths(&format!("{}\n{}", task.title, task.description)) {
            let source = Path::new(&path);
            let (Some(stem), Some(ext)) = (
                source.file_stem().and_then(|s| s.to_str()),
                source.extension().and_then(|e| e.to_str()),
            ) else {
                continue;
            };
            let dir = source
                .parent()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            let sibling = |name: String| {
                if dir.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir, name)
                }
            };
            let candidates = match ext {
                "rs" => vec![format!("tests/{}.rs", stem)],
                "py" => vec![format!("tests/test_{}.py", stem), sibling(format!("test_{}.py", stem))],
                "go" => vec![sibling(format!("{}_test.go", stem))],
                "ts" | "tsx" | "js" | "jsx" => vec![
                    sibling(format!("{}.test.{}", stem, ext)),
                    sibling(format!("{}.spec.{}", stem, ext)),
                ],
                _ => Vec::new(),
            };
            for candidate in candidates {
                if !hints.contains(&candidate) {
                    hints.push(candidate);
                }
            }
        }
        hints
    }
}

/// The specialist that executes tasks of `agent_type`
pub fn specialist_for(agent_type: AgentType) -> Arc<dyn Specialist> {
    match agent_type {
        AgentType::Backend => Arc::new(BackendWorker),
        AgentType::Frontend => Arc::new(FrontendWorker),
        AgentType::Test => Arc::new(TestWorker),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskSpec;
    use chrono::Utc;

    #[test]
    fn test_specialist_for_each_type() {
        for agent_type in [AgentType::Backend, AgentType::Frontend, AgentType::Test] {
            assert_eq!(specialist_for(agent_type).agent_type(), agent_type);
        }
    }

    #[test]
    fn test_test_worker_hints_conventional_locations() {
        let task = Task::from_spec(
            TaskSpec::new(3, "Cover login").with_description("Test src/auth/login.ts and api/users.py"),
            Utc::now(),
        );
        let hints = TestWorker.context_hints(&task, Path::new("."));
        assert!(hints.contains(&"src/auth/login.test.ts".to_string()));
        assert!(hints.contains(&"tests/test_users.py".to_string()));
        assert!(hints.contains(&"api/test_users.py".to_string()));
    }

    #[test]
    fn test_backend_hints_only_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let task = Task::from_spec(TaskSpec::new(1, "API"), Utc::now());
        assert_eq!(BackendWorker.context_hints(&task, dir.path()), vec!["Cargo.toml"]);
    }
}
