//! Git Backend
//!
//! `VersionControl` over the git CLI. The orchestrator's own state directory
//! is never committed, reset or cleaned.

use std::path::{Path, PathBuf};
use std::process::Command;

use conductor_core::{CoreError, CoreResult, DiffStats, VersionControl};

use crate::utils::paths::STATE_DIR_NAME;

const COMMITTER_NAME: &str = "conductor";
const COMMITTER_EMAIL: &str = "conductor@localhost";

/// Result of running a git command
#[derive(Debug, Clone)]
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
    exit_code: i32,
}

impl GitOutput {
    fn into_result(self) -> CoreResult<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(CoreError::command(format!(
                "Git command failed (exit {}): {}",
                self.exit_code,
                self.stderr.trim()
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitBackend {
    root: PathBuf,
}

impl GitBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Open the repository at `root`, initializing one when absent, and make
    /// sure the state directory is excluded from it.
    pub fn open_or_init(root: impl AsRef<Path>) -> CoreResult<Self> {
        let backend = Self::new(root);
        if !backend.execute(&["rev-parse", "--git-dir"])?.success {
            backend.execute(&["init", "--quiet"])?.into_result()?;
            tracing::info!(root = %backend.root.display(), "Initialized git repository");
        }
        backend.exclude_state_dir()?;
        Ok(backend)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn execute(&self, args: &[&str]) -> CoreResult<GitOutput> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GCM_INTERACTIVE", "never")
            .output()
            .map_err(|e| CoreError::command(format!("Failed to execute git: {}", e)))?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn exclude_state_dir(&self) -> CoreResult<()> {
        let git_dir = self
            .execute(&["rev-parse", "--git-dir"])?
            .into_result()?
            .trim()
            .to_string();
        let info_dir = self.root.join(git_dir).join("info");
        std::fs::create_dir_all(&info_dir)?;
        let exclude = info_dir.join("exclude");
        let entry = format!("/{}/", STATE_DIR_NAME);
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        if !existing.lines().any(|line| line.trim() == entry) {
            let mut content = existing;
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&entry);
            content.push('\n');
            std::fs::write(&exclude, content)?;
        }
        Ok(())
    }

    fn untracked_files(&self) -> CoreResult<Vec<String>> {
        let output = self
            .execute(&["ls-files", "--others", "--exclude-standard"])?
            .into_result()?;
        Ok(output
            .lines()
            .filter(|l| !l.is_empty() && !l.starts_with(STATE_DIR_NAME))
            .map(str::to_string)
            .collect())
    }
}

impl VersionControl for GitBackend {
    fn head_revision(&self) -> CoreResult<String> {
        Ok(self
            .execute(&["rev-parse", "HEAD"])?
            .into_result()?
            .trim()
            .to_string())
    }

    fn commit_all(&self, message: &str) -> CoreResult<String> {
        let exclude = format!(":(exclude){}", STATE_DIR_NAME);
        self.execute(&["add", "-A", "--", ".", &exclude])?
            .into_result()?;
        let name = format!("user.name={}", COMMITTER_NAME);
        let email = format!("user.email={}", COMMITTER_EMAIL);
        self.execute(&[
            "-c",
            &name,
            "-c",
            &email,
            "commit",
            "--allow-empty",
            "--no-verify",
            "--no-gpg-sign",
            "--quiet",
            "-m",
            message,
        ])?
        .into_result()?;
        self.head_revision()
    }

    fn diff_stats(&self, revision: &str) -> CoreResult<DiffStats> {
        let numstat = self
            .execute(&["diff", "--numstat", revision, "--"])?
            .into_result()?;
        let mut stats = parse_numstat(&numstat);

        // `git diff` against the working tree does not see untracked files
        for path in self.untracked_files()? {
            stats.files_changed += 1;
            if let Ok(content) = std::fs::read_to_string(self.root.join(&path)) {
                stats.insertions += content.lines().count() as u32;
            }
        }
        Ok(stats)
    }

    fn reset_hard(&self, revision: &str) -> CoreResult<()> {
        self.execute(&["reset", "--hard", "--quiet", revision])?
            .into_result()?;
        let exclude = format!("{}/", STATE_DIR_NAME);
        self.execute(&["clean", "-fd", "--quiet", "-e", &exclude])?
            .into_result()?;
        Ok(())
    }
}

/// Sum `git diff --numstat` lines; binary files count as changed with no lines.
pub fn parse_numstat(output: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in output.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(added), Some(removed), Some(_path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        stats.files_changed += 1;
        stats.insertions += added.parse::<u32>().unwrap_or(0);
        stats.deletions += removed.parse::<u32>().unwrap_or(0);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    #[test]
    fn test_parse_numstat() {
        let output = "3\t1\tsrc/lib.rs\n-\t-\tlogo.png\n10\t0\tREADME.md\n";
        assert_eq!(
            parse_numstat(output),
            DiffStats {
                files_changed: 3,
                insertions: 13,
                deletions: 1
            }
        );
        assert_eq!(parse_numstat(""), DiffStats::default());
    }

    #[test]
    fn test_commit_diff_reset_cycle() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let git = GitBackend::open_or_init(dir.path()).unwrap();

        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR_NAME)).unwrap();
        std::fs::write(dir.path().join(STATE_DIR_NAME).join("state.db"), "db").unwrap();
        let base = git.commit_all("base").unwrap();
        assert_eq!(git.head_revision().unwrap(), base);

        std::fs::write(dir.path().join("a.txt"), "one\nthree\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "new\n").unwrap();
        let stats = git.diff_stats(&base).unwrap();
        assert_eq!(stats.files_changed, 2);
        assert_eq!(stats.insertions, 2);
        assert_eq!(stats.deletions, 1);

        git.reset_hard(&base).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\ntwo\n");
        assert!(!dir.path().join("b.txt").exists());
        assert!(dir.path().join(STATE_DIR_NAME).join("state.db").exists());
    }
}
