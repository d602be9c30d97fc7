//! Shell Test Runner
//!
//! Runs the project's configured test command and reads pass/fail counts out
//! of its output. Counts are summed across every summary line, so workspaces
//! that print one summary per test binary are reported as a whole.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::{CoreError, CoreResult, TestReport, TestRunner};
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;

use crate::models::OrchestratorConfig;

/// Output kept on the report, from the end of the run
pub const MAX_TEST_OUTPUT_BYTES: usize = 64 * 1024;

fn count_pattern(outcome: &str) -> Option<Regex> {
    Regex::new(&format!(r"(\d+)\s+{}", outcome)).ok()
}

fn passed_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| count_pattern("passed")).as_ref()
}

fn failed_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| count_pattern("failed")).as_ref()
}

#[derive(Debug, Clone)]
pub struct ShellTestRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ShellTestRunner {
    pub fn new(command: &[String], timeout: Duration) -> CoreResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CoreError::config("test_command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            max_output_bytes: MAX_TEST_OUTPUT_BYTES,
        })
    }

    pub fn from_config(config: &OrchestratorConfig) -> CoreResult<Self> {
        Self::new(
            &config.test_command,
            Duration::from_secs(config.test_timeout_secs),
        )
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run_tests(&self, project_root: &Path) -> CoreResult<TestReport> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CoreError::command(format!(
                    "Failed to execute test command '{}': {}",
                    self.program, e
                )))
            }
            Err(_) => {
                tracing::warn!(secs = self.timeout.as_secs(), "Test command timed out");
                return Ok(TestReport::failing(
                    1,
                    format!("test command timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            combined.push('\n');
            combined.push_str(&stderr);
        }

        let (passed, mut failed) = parse_counts(&combined);
        let success = output.status.success() && failed == 0;
        // A failing exit with no parsable failures (build error, crash) still counts
        if !success && failed == 0 {
            failed = 1;
        }

        Ok(TestReport {
            passed,
            failed,
            success,
            output: tail(&combined, self.max_output_bytes).to_string(),
        })
    }
}

/// Sum `N passed` / `N failed` over the output.
///
/// Jest's per-suite summary line is skipped so suites are not counted as tests.
pub fn parse_counts(output: &str) -> (u32, u32) {
    let sum = |pattern: Option<&Regex>| -> u32 {
        let Some(pattern) = pattern else {
            return 0;
        };
        output
            .lines()
            .filter(|line| !line.trim_start().starts_with("Test Suites:"))
            .flat_map(|line| pattern.captures_iter(line).collect::<Vec<_>>())
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u32>().ok()))
            .sum()
    };
    (sum(passed_pattern()), sum(failed_pattern()))
}

/// The last `max` bytes of `s`, starting on a char boundary
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
