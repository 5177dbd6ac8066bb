use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Handler settings.
///
/// Per-upload settings (repository URL, branch, key object) never live here;
/// they come from bucket tags and object metadata at invocation time.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for extraction directories (`<work_dir>/<radical>`).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Directory where downloaded archives are staged.  Defaults to
    /// `<work_dir>/.archive`.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    /// Directory holding the git directories (`<repo_dir>/<radical>.git`),
    /// kept apart from the extracted work trees.  Defaults to
    /// `<work_dir>/.repos`.
    #[serde(default)]
    pub repo_dir: Option<PathBuf>,
    /// Message used for every commit.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default)]
    pub committer: CommitterConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub s3: S3Config,
    /// Stop processing a payload at the first failed record.
    #[serde(default)]
    pub fail_fast: bool,
    /// Socket address for the HTTP receiver (`serve` mode).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            archive_dir: None,
            repo_dir: None,
            commit_message: default_commit_message(),
            committer: CommitterConfig::default(),
            ssh: SshConfig::default(),
            s3: S3Config::default(),
            fail_fast: false,
            http_listen: default_http_listen(),
        }
    }
}

impl Config {
    /// Directory where archives are downloaded before extraction.
    ///
    /// The dot-prefixed defaults can never collide with an extraction
    /// directory: a radical is never empty and never starts with `.`.
    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(".archive"))
    }

    /// Directory holding one git directory per radical.
    pub fn repo_dir(&self) -> PathBuf {
        self.repo_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(".repos"))
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_commit_message() -> String {
    "Made from git-motel".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Committer identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CommitterConfig {
    #[serde(default = "default_committer_name")]
    pub name: String,
    #[serde(default = "default_committer_email")]
    pub email: String,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            name: default_committer_name(),
            email: default_committer_email(),
        }
    }
}

fn default_committer_name() -> String {
    "git-motel".to_string()
}

fn default_committer_email() -> String {
    "git-motel@localhost".to_string()
}

// ---------------------------------------------------------------------------
// SSH transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Verify the remote host key.  Off by default: the handler runs in
    /// throwaway containers with no `known_hosts`.
    #[serde(default)]
    pub strict_host_key_checking: bool,
    /// `known_hosts` file used when `strict_host_key_checking` is on.
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
    /// Key object name used when neither tags nor metadata set `git_key`.
    #[serde(default = "default_key_name")]
    pub default_key_name: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            strict_host_key_checking: false,
            known_hosts_file: None,
            default_key_name: default_key_name(),
        }
    }
}

fn default_key_name() -> String {
    "id_rsa".to_string()
}

// ---------------------------------------------------------------------------
// S3 client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Config {
    /// Region override; otherwise resolved from the environment.
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores (MinIO, Ceph, ...).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Load the config at `path`, or fall back to defaults when `path` is the
/// built-in default location and nothing is there.
pub fn load_config_or_default<P: AsRef<Path>>(path: P, is_default_path: bool) -> Result<Config> {
    let path = path.as_ref();
    if is_default_path && !path.exists() {
        let config = Config::default();
        validate_config(&config)?;
        return Ok(config);
    }
    load_config(path)
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.work_dir.is_absolute(),
        "work_dir must be an absolute path"
    );
    anyhow::ensure!(
        config.archive_dir().is_absolute(),
        "archive_dir must be an absolute path"
    );
    anyhow::ensure!(
        config.repo_dir().is_absolute(),
        "repo_dir must be an absolute path"
    );
    anyhow::ensure!(
        !config.commit_message.trim().is_empty(),
        "commit_message must not be empty"
    );
    anyhow::ensure!(
        !config.committer.name.trim().is_empty() && !config.committer.email.trim().is_empty(),
        "committer name and email must not be empty"
    );
    anyhow::ensure!(
        !config.ssh.default_key_name.is_empty(),
        "ssh.default_key_name must not be empty"
    );
    anyhow::ensure!(
        !config.ssh.strict_host_key_checking || config.ssh.known_hosts_file.is_some(),
        "ssh.known_hosts_file is required when strict_host_key_checking is enabled"
    );
    config
        .http_listen
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid http_listen address: {}", config.http_listen))?;
    Ok(())
}
