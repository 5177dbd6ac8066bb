//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every command runs against a [`Repo`], i.e. with explicit `--git-dir` and
//! `--work-tree`, so nothing under the work tree is read as git metadata.
//! Environment variables (`GIT_SSH_COMMAND` in practice) are injected via the
//! `env_vars` parameter so that credential handling stays with the caller
//! and is scoped to a single process.

use std::process::{Output, Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::repo::Repo;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Author and committer identity for generated commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run `git <repo options> <args...>` and fail with stderr on non-zero exit.
async fn run_git(
    repo: &Repo,
    args: &[&str],
    env_vars: &[(String, String)],
    what: &str,
) -> Result<Output> {
    let mut cmd = Command::new("git");
    cmd.args(repo.git_args()).args(args);

    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (k, v) in env_vars {
        cmd.env(k, v);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!("spawning git {what}");

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn git {what}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git {what} failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    Ok(output)
}

// ---------------------------------------------------------------------------
// Stage + commit
// ---------------------------------------------------------------------------

/// Stage every change in the working tree: new, modified and deleted files.
#[instrument(fields(work_tree = %repo.work_tree.display()))]
pub async fn add_all(repo: &Repo) -> Result<()> {
    run_git(repo, &["add", "--all", "."], &[], "add").await?;
    debug!("working tree staged");
    Ok(())
}

/// Commit the index with `message`.
///
/// Empty commits are allowed so that re-publishing an unchanged archive
/// still produces a commit to push.
#[instrument(skip(repo, committer), fields(git_dir = %repo.git_dir.display(), %message))]
pub async fn commit(repo: &Repo, message: &str, committer: &Committer) -> Result<()> {
    let name = format!("user.name={}", committer.name);
    let email = format!("user.email={}", committer.email);
    run_git(
        repo,
        &[
            "-c",
            name.as_str(),
            "-c",
            email.as_str(),
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--quiet",
            "--allow-empty",
            "-m",
            message,
        ],
        &[],
        "commit",
    )
    .await?;
    debug!("commit created");
    Ok(())
}

/// Resolve `HEAD` to its full hex object id.
#[instrument(fields(git_dir = %repo.git_dir.display()))]
pub async fn rev_parse_head(repo: &Repo) -> Result<String> {
    let output = run_git(repo, &["rev-parse", "--verify", "HEAD"], &[], "rev-parse").await?;
    let commit_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

    anyhow::ensure!(
        matches!(commit_id.len(), 40 | 64) && commit_id.chars().all(|c| c.is_ascii_hexdigit()),
        "git rev-parse returned an unexpected object id: {commit_id:?}"
    );

    debug!(%commit_id, "resolved HEAD");
    Ok(commit_id)
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Ref-spec mapping the local `HEAD` to `refs/heads/<branch>` on the remote.
pub fn refspec_for_branch(branch: &str) -> Result<String> {
    validate_branch_name(branch)?;
    Ok(format!("HEAD:refs/heads/{branch}"))
}

/// Reject names git would refuse or that could be mistaken for options.
fn validate_branch_name(branch: &str) -> Result<()> {
    let invalid = branch.is_empty()
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with('.')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("//")
        || branch.contains("@{")
        || branch == "@"
        || branch
            .chars()
            .any(|c| c.is_ascii_control() || c.is_whitespace() || "~^:?*[\\".contains(c));
    if invalid {
        bail!("invalid branch name: {branch:?}");
    }
    Ok(())
}

/// Run `git push --force <remote_url> <refspec>`.
///
/// The update is forced: remote history not reachable from the pushed
/// commit is discarded.
#[instrument(skip(repo, env_vars), fields(git_dir = %repo.git_dir.display(), %remote_url, %refspec))]
pub async fn push_force(
    repo: &Repo,
    remote_url: &str,
    refspec: &str,
    env_vars: &[(String, String)],
) -> Result<()> {
    if remote_url.starts_with('-') {
        bail!("invalid remote URL: {remote_url:?}");
    }

    let output = run_git(
        repo,
        &["push", "--force", "--porcelain", remote_url, refspec],
        env_vars,
        "push",
    )
    .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!(summary = %stdout.trim(), "git push complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use super::*;
    use crate::git::init_repo;

    /// Tests that drive the real binary skip themselves when it is absent.
    pub(crate) fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub(crate) fn committer() -> Committer {
        Committer {
            name: "Test".into(),
            email: "test@example.com".into(),
        }
    }

    /// Read `refs/heads/<branch>` from a bare repository.
    pub(crate) fn remote_ref(bare: &Path, branch: &str) -> Option<String> {
        let out = std::process::Command::new("git")
            .arg("--git-dir")
            .arg(bare)
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("refs/heads/{branch}"))
            .output()
            .ok()?;
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// List the files committed on `refs/heads/<branch>` of a bare repository.
    pub(crate) fn remote_tree(bare: &Path, branch: &str) -> Vec<String> {
        let out = std::process::Command::new("git")
            .arg("--git-dir")
            .arg(bare)
            .args(["ls-tree", "-r", "--name-only"])
            .arg(format!("refs/heads/{branch}"))
            .output()
            .unwrap();
        assert!(out.status.success());
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn scratch_repo(root: &Path, name: &str) -> Repo {
        Repo::new(root.join(format!("{name}.git")), root.join(name))
    }

    pub(crate) fn init_bare(path: &Path) {
        let status = std::process::Command::new("git")
            .args(["init", "--bare", "--quiet"])
            .arg(path)
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn refspec_targets_heads() {
        assert_eq!(refspec_for_branch("site.zip").unwrap(), "HEAD:refs/heads/site.zip");
        assert_eq!(refspec_for_branch("release/v1").unwrap(), "HEAD:refs/heads/release/v1");
    }

    #[test]
    fn refspec_rejects_bad_names() {
        for bad in ["", "-f", "a..b", "a b", "a:b", "x.lock", "a/", "@", "a@{1}", "ref~1"] {
            assert!(refspec_for_branch(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn commit_and_rev_parse() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let dir = scratch_repo(tmp.path(), "work");
        init_repo(&dir).await.unwrap();
        std::fs::write(dir.work_tree.join("index.html"), "hi").unwrap();

        add_all(&dir).await.unwrap();
        commit(&dir, "Made from git-motel", &committer()).await.unwrap();
        let first = rev_parse_head(&dir).await.unwrap();
        assert_eq!(first.len(), 40);

        // Nothing changed; the commit is still created.
        add_all(&dir).await.unwrap();
        commit(&dir, "Made from git-motel", &committer()).await.unwrap();
        let second = rev_parse_head(&dir).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn rev_parse_fails_without_commits() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let repo = scratch_repo(tmp.path(), "empty");
        init_repo(&repo).await.unwrap();
        assert!(rev_parse_head(&repo).await.is_err());
    }

    #[tokio::test]
    async fn push_force_overwrites_remote_branch() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let bare = tmp.path().join("remote.git");
        init_bare(&bare);
        let remote_url = bare.display().to_string();

        // Two unrelated histories pushed to the same branch.
        for name in ["one", "two"] {
            let dir = scratch_repo(tmp.path(), name);
            init_repo(&dir).await.unwrap();
            std::fs::write(dir.work_tree.join("file.txt"), name).unwrap();
            add_all(&dir).await.unwrap();
            commit(&dir, "Made from git-motel", &committer()).await.unwrap();
            let head = rev_parse_head(&dir).await.unwrap();

            let refspec = refspec_for_branch("site").unwrap();
            push_force(&dir, &remote_url, &refspec, &[]).await.unwrap();
            assert_eq!(remote_ref(&bare, "site").as_deref(), Some(head.as_str()));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn git_metadata_planted_in_work_tree_is_inert() {
        use std::os::unix::fs::PermissionsExt;

        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let repo = scratch_repo(tmp.path(), "site");
        init_repo(&repo).await.unwrap();

        let marker = tmp.path().join("hook-ran");
        let hooks = repo.work_tree.join(".git").join("hooks");
        std::fs::create_dir_all(&hooks).unwrap();
        std::fs::write(repo.work_tree.join(".git").join("HEAD"), "ref: refs/heads/x\n").unwrap();
        let hook = hooks.join("pre-commit");
        std::fs::write(&hook, format!("#!/bin/sh\ntouch '{}'\n", marker.display())).unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(repo.work_tree.join("index.html"), "hi").unwrap();

        add_all(&repo).await.unwrap();
        commit(&repo, "Made from git-motel", &committer()).await.unwrap();
        assert!(!marker.exists());

        let bare = tmp.path().join("remote.git");
        init_bare(&bare);
        let refspec = refspec_for_branch("site").unwrap();
        push_force(&repo, &bare.display().to_string(), &refspec, &[])
            .await
            .unwrap();
        assert_eq!(remote_tree(&bare, "site"), ["index.html"]);
    }

    #[tokio::test]
    async fn push_rejects_option_like_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = scratch_repo(tmp.path(), "any");
        let err = push_force(&repo, "--upload-pack=x", "HEAD:refs/heads/a", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid remote URL"));
    }
}
