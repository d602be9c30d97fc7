//! Failure Analysis
//!
//! Pulls failing test names and error lines out of raw test-runner output so
//! a correction request can point the generator at what actually broke.

use std::sync::OnceLock;

use conductor_core::TestReport;
use regex::Regex;

const MAX_FAILING_TESTS: usize = 20;
const MAX_ERROR_LINES: usize = 30;
/// Tail of the raw output kept when nothing could be extracted
const RAW_TAIL_CHARS: usize = 2_000;

/// Patterns naming a failing test, first capture group is the name
fn failing_test_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // cargo test
            r"^test\s+(\S+)\s+\.\.\.\s+FAILED",
            // pytest
            r"^FAILED\s+(\S+)",
            // go test
            r"^\s*--- FAIL:\s+(\S+)",
            // jest / vitest
            r"^\s*[✕×]\s+(.+?)(?:\s+\(\d+\s*m?s\))?$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn error_line_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^error(?:\[E\d+\])?:",
            r"panicked at",
            r"^\s*(?:\w+)?Error:",
            r"^E\s{2,}",
            r"assert(?:ion)?.*(?:failed|left|right|expected)",
            r"^\s*-->\s+\S+:\d+",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// What went wrong in one test run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureAnalysis {
    pub passed: u32,
    pub failed: u32,
    pub failing_tests: Vec<String>,
    pub error_lines: Vec<String>,
    /// Raw output tail, used when no pattern matched
    pub raw_tail: String,
}

impl FailureAnalysis {
    pub fn from_report(report: &TestReport) -> Self {
        let mut failing_tests: Vec<String> = Vec::new();
        let mut error_lines: Vec<String> = Vec::new();

        for line in report.output.lines() {
            if failing_tests.len() < MAX_FAILING_TESTS {
                if let Some(name) = failing_test_patterns()
                    .iter()
                    .find_map(|p| p.captures(line).and_then(|c| c.get(1)))
                {
                    let name = name.as_str().trim().to_string();
                    if !failing_tests.contains(&name) {
                        failing_tests.push(name);
                    }
                    continue;
                }
            }
            if error_lines.len() < MAX_ERROR_LINES
                && error_line_patterns().iter().any(|p| p.is_match(line))
            {
                let line = line.trim().to_string();
                if !error_lines.contains(&line) {
                    error_lines.push(line);
                }
            }
        }

        let raw_tail = if failing_tests.is_empty() && error_lines.is_empty() {
            tail_chars(&report.output, RAW_TAIL_CHARS)
        } else {
            String::new()
        };

        Self {
            passed: report.passed,
            failed: report.failed,
            failing_tests,
            error_lines,
            raw_tail,
        }
    }

    /// One-line description stored with the correction attempt
    pub fn summary(&self) -> String {
        if self.failing_tests.is_empty() {
            format!(
                "{} failed, {} passed; {} error lines",
                self.failed,
                self.passed,
                self.error_lines.len()
            )
        } else {
            format!(
                "{} failed, {} passed: {}",
                self.failed,
                self.passed,
                self.failing_tests.join(", ")
            )
        }
    }

    /// Focused failure description sent with a corrective generation request
    pub fn prompt(&self, attempt: u32, max_attempts: u32) -> String {
        let mut prompt = format!(
            "Correction attempt {} of {}. The test run failed ({} failed, {} passed).\n",
            attempt, max_attempts, self.failed, self.passed
        );
        if !self.failing_tests.is_empty() {
            prompt.push_str("\nFailing tests:\n");
            for name in &self.failing_tests {
                prompt.push_str("- ");
                prompt.push_str(name);
                prompt.push('\n');
            }
        }
        if !self.error_lines.is_empty() {
            prompt.push_str("\nErrors:\n");
            for line in &self.error_lines {
                prompt.push_str(line);
                prompt.push('\n');
            }
        }
        if !self.raw_tail.is_empty() {
            prompt.push_str("\nTest output (tail):\n");
            prompt.push_str(&self.raw_tail);
            prompt.push('\n');
        }
        prompt.push_str("\nChange only what is needed to make these tests pass.");
        prompt
    }
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
