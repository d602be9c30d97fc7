//! Command-backed Code Generator
//!
//! Runs an external command per generation request. The request is written
//! to the child's stdin as JSON and the response is read from stdout as JSON
//! (`{files, explanation, question?}`).
//!
//! The child is killed when the call is dropped, so the caller's timeout
//! and cancellation also stop the process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use conductor_core::{CodeGenerator, GenerationRequest, GenerationResponse, ProviderError};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::utils::error::{AppError, AppResult};

/// Exit status commands use to ask for a retry later (EX_TEMPFAIL)
const EXIT_TEMPFAIL: i32 = 75;
const MAX_STDERR_CHARS: usize = 2000;

fn rate_limit_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)rate[ _-]?limit|too many requests|\b429\b|overloaded").ok())
        .as_ref()
}

#[derive(Debug, Clone)]
pub struct CommandCodeGenerator {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandCodeGenerator {
    pub fn new(command: &[String], working_dir: impl AsRef<Path>) -> AppResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AppError::config("generator_command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: working_dir.as_ref().to_path_buf(),
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl CodeGenerator for CommandCodeGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ProviderError::Failed(format!("failed to encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::Failed(format!("failed to start '{}': {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ProviderError::Failed(format!("failed to write request: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::Failed(format!("generator did not finish: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
            let code = output.status.code();
            tracing::debug!(task_id = request.task_id, ?code, "Generator exited with failure");
            let rate_limited = rate_limit_pattern().is_some_and(|p| p.is_match(&stderr));
            if code == Some(EXIT_TEMPFAIL) || rate_limited {
                return Err(ProviderError::RateLimited(stderr));
            }
            return Err(ProviderError::Failed(format!(
                "generator exited with {}: {}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr
            )));
        }

        parse_response(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Stands in when no `generator_command` is configured; every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGenerator;

#[async_trait]
impl CodeGenerator for UnconfiguredGenerator {
    async fn generate(
        &self,
        _request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        Err(ProviderError::Failed(
            "no generator_command configured in .conductor/config.json".to_string(),
        ))
    }
}

/// Parse the generator's stdout.
///
/// The whole output is tried first; commands that log before answering are
/// accepted when their last non-empty line is the JSON response.
pub fn parse_response(stdout: &str) -> Result<GenerationResponse, ProviderError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::Malformed("empty response".to_string()));
    }
    match serde_json::from_str::<GenerationResponse>(trimmed) {
        Ok(response) => Ok(response),
        Err(whole) => trimmed
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<GenerationResponse>(line.trim()).ok())
            .ok_or_else(|| ProviderError::Malformed(whole.to_string())),
    }
}
