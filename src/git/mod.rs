//! Git command wrappers.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`.
//! Credentials are injected per process through environment variables, never
//! through global git or SSH configuration.

pub mod commands;
pub mod repo;

pub use commands::{add_all, commit, push_force, refspec_for_branch, rev_parse_head, Committer};
pub use repo::{init_repo, is_repo, Repo};
