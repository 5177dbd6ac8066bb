//! Per-upload configuration.
//!
//! Bucket tags provide defaults for every object in a bucket; object user
//! metadata overrides them for a single upload.  The merged map is reduced
//! to an [`UploadTarget`]: where to push, with which key, to which branch.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::debug;

pub const GIT_REPOSITORY: &str = "git_repository";
pub const GIT_KEY: &str = "git_key";
pub const GIT_BRANCH: &str = "git_branch";

/// `git_branch` value that pushes to a branch named after the new commit.
pub const COMMIT_ID_BRANCH: &str = "commitId";

// ---------------------------------------------------------------------------
// Merged configuration map
// ---------------------------------------------------------------------------

/// Merged view of bucket tags and object metadata.
///
/// Ordered so that logging it is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMap(BTreeMap<String, String>);

impl ConfigMap {
    /// Tag keys are lower-cased; metadata keys are taken as-is and win on
    /// collision.
    pub fn merge(tags: HashMap<String, String>, metadata: HashMap<String, String>) -> Self {
        let mut map: BTreeMap<String, String> = tags
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        map.extend(metadata);
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

// ---------------------------------------------------------------------------
// Upload target
// ---------------------------------------------------------------------------

/// Branch the commit is pushed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchSpec {
    Named(String),
    /// Resolved after committing, to the commit's hex id.
    CommitId,
}

impl BranchSpec {
    /// Concrete branch name once the commit id is known.
    pub fn resolve(&self, commit_id: &str) -> String {
        match self {
            BranchSpec::Named(name) => name.clone(),
            BranchSpec::CommitId => commit_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Remote URL, e.g. `git@host:org/repo.git`.
    pub repository: String,
    /// Object name (in the same bucket) holding the SSH private key.
    pub key_name: String,
    pub branch: BranchSpec,
}

impl UploadTarget {
    /// Extract the target from a merged map.  `basename` is the default
    /// branch; `default_key_name` is used when `git_key` is absent.
    pub fn resolve(config: &ConfigMap, basename: &str, default_key_name: &str) -> Result<Self> {
        let repository = match config.get(GIT_REPOSITORY).map(str::trim) {
            Some(repo) if !repo.is_empty() => repo.to_string(),
            _ => bail!("missing required configuration key `{GIT_REPOSITORY}`"),
        };

        let key_name = config
            .get(GIT_KEY)
            .filter(|k| !k.is_empty())
            .unwrap_or(default_key_name)
            .to_string();

        let branch = match config.get(GIT_BRANCH) {
            Some(COMMIT_ID_BRANCH) => BranchSpec::CommitId,
            Some(name) if !name.is_empty() => BranchSpec::Named(name.to_string()),
            _ => BranchSpec::Named(basename.to_string()),
        };

        debug!(%repository, %key_name, ?branch, "upload target resolved");
        Ok(Self {
            repository,
            key_name,
            branch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn metadata_wins_after_lowercasing_tags() {
        let merged = ConfigMap::merge(
            map(&[("Git_Repository", "X")]),
            map(&[("git_repository", "Y")]),
        );
        assert_eq!(merged.get("git_repository"), Some("Y"));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn tag_keys_are_lowercased() {
        let merged = ConfigMap::merge(map(&[("GIT_BRANCH", "main")]), HashMap::new());
        assert_eq!(merged.get("git_branch"), Some("main"));
        assert_eq!(merged.get("GIT_BRANCH"), None);
    }

    #[test]
    fn metadata_keys_are_not_lowercased() {
        let merged = ConfigMap::merge(HashMap::new(), map(&[("Git_Key", "deploy")]));
        assert_eq!(merged.get("Git_Key"), Some("deploy"));
        assert_eq!(merged.get("git_key"), None);
    }

    #[test]
    fn defaults_branch_to_basename_and_key_to_id_rsa() {
        let merged = ConfigMap::merge(map(&[("git_repository", "git@host:repo.git")]), HashMap::new());
        let target = UploadTarget::resolve(&merged, "site.zip", "id_rsa").unwrap();
        assert_eq!(target.repository, "git@host:repo.git");
        assert_eq!(target.key_name, "id_rsa");
        assert_eq!(target.branch, BranchSpec::Named("site.zip".into()));
    }

    #[test]
    fn explicit_branch_and_key() {
        let merged = ConfigMap::merge(
            map(&[("git_repository", "git@host:repo.git"), ("git_key", "keys/deploy")]),
            map(&[("git_branch", "gh-pages")]),
        );
        let target = UploadTarget::resolve(&merged, "site.zip", "id_rsa").unwrap();
        assert_eq!(target.key_name, "keys/deploy");
        assert_eq!(target.branch.resolve("abc"), "gh-pages");
    }

    #[test]
    fn commit_id_branch_resolves_to_hash() {
        let merged = ConfigMap::merge(
            map(&[("git_repository", "git@host:repo.git"), ("git_branch", "commitId")]),
            HashMap::new(),
        );
        let target = UploadTarget::resolve(&merged, "site.zip", "id_rsa").unwrap();
        assert_eq!(target.branch, BranchSpec::CommitId);
        let sha = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(target.branch.resolve(sha), sha);
    }

    #[test]
    fn missing_repository_is_an_error() {
        let merged = ConfigMap::merge(map(&[("git_branch", "main")]), HashMap::new());
        let err = UploadTarget::resolve(&merged, "site.zip", "id_rsa").unwrap_err();
        assert!(err.to_string().contains("git_repository"));

        let blank = ConfigMap::merge(map(&[("git_repository", "  ")]), HashMap::new());
        assert!(UploadTarget::resolve(&blank, "site.zip", "id_rsa").is_err());
    }
}
