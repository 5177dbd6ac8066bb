//! Working-tree repository lifecycle.
//!
//! The git directory never lives inside the work tree: archive contents are
//! untrusted and must not be able to supply git configuration or hooks.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

/// A work tree paired with a git directory kept outside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub git_dir: PathBuf,
    pub work_tree: PathBuf,
}

impl Repo {
    pub fn new(git_dir: impl Into<PathBuf>, work_tree: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            work_tree: work_tree.into(),
        }
    }

    /// Global options selecting this repository: `-C`, `--git-dir`,
    /// `--work-tree`.
    pub(crate) fn git_args(&self) -> Vec<OsString> {
        let mut git_dir = OsString::from("--git-dir=");
        git_dir.push(&self.git_dir);
        let mut work_tree = OsString::from("--work-tree=");
        work_tree.push(&self.work_tree);
        vec![
            OsString::from("-C"),
            self.work_tree.clone().into_os_string(),
            git_dir,
            work_tree,
        ]
    }
}

/// Whether `git_dir` already holds a repository (`HEAD` exists).
pub fn is_repo(git_dir: &Path) -> bool {
    git_dir.join("HEAD").is_file()
}

/// Initialise `repo`: create the work tree and a bare git directory.
///
/// If the git directory already exists this is a no-op, so re-publishing
/// the same object reuses its history.
#[instrument(fields(git_dir = %repo.git_dir.display(), work_tree = %repo.work_tree.display()))]
pub async fn init_repo(repo: &Repo) -> Result<()> {
    tokio::fs::create_dir_all(&repo.work_tree)
        .await
        .with_context(|| format!("failed to create work tree: {}", repo.work_tree.display()))?;

    if is_repo(&repo.git_dir) {
        debug!("repository already exists; skipping init");
        return Ok(());
    }

    let output = Command::new("git")
        .args(["init", "--quiet", "--bare"])
        .arg(&repo.git_dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("repository initialised");
    Ok(())
}
