use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempPath;
use tracing::{debug, instrument};

use crate::config::SshConfig;
use crate::storage::ObjectStore;

/// How the remote host key is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key and remember nothing.
    AcceptAny,
    /// Require the host key to be listed in the given `known_hosts` file.
    Strict { known_hosts: PathBuf },
}

impl HostKeyPolicy {
    pub fn from_config(config: &SshConfig) -> Self {
        match (&config.known_hosts_file, config.strict_host_key_checking) {
            (Some(path), true) => HostKeyPolicy::Strict {
                known_hosts: path.clone(),
            },
            _ => HostKeyPolicy::AcceptAny,
        }
    }
}

/// A private key on disk plus the host-key policy to use it with.
///
/// The key file is deleted when the identity is dropped.
#[derive(Debug)]
pub struct SshIdentity {
    key_file: TempPath,
    host_keys: HostKeyPolicy,
}

impl SshIdentity {
    pub fn key_path(&self) -> &Path {
        &self.key_file
    }

    /// `ssh` command line for `GIT_SSH_COMMAND`.
    pub fn ssh_command(&self) -> String {
        let host_opts = match &self.host_keys {
            HostKeyPolicy::AcceptAny => {
                "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null".to_string()
            }
            HostKeyPolicy::Strict { known_hosts } => format!(
                "-o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
                shell_quote(&known_hosts.display().to_string())
            ),
        };
        format!(
            "ssh -i {} -o IdentitiesOnly=yes -o BatchMode=yes {host_opts}",
            shell_quote(&self.key_path().display().to_string())
        )
    }

    /// Environment for a single git process that talks to the remote.
    pub fn git_env(&self) -> Vec<(String, String)> {
        vec![("GIT_SSH_COMMAND".to_string(), self.ssh_command())]
    }
}

/// Download the key object `key_name` from `bucket` into a private temp file.
#[instrument(skip(store, ssh), fields(%bucket, %key_name))]
pub async fn fetch_identity(
    store: &dyn ObjectStore,
    bucket: &str,
    key_name: &str,
    ssh: &SshConfig,
) -> Result<SshIdentity> {
    let tmpfile = tempfile::Builder::new()
        .prefix("git-motel-")
        .suffix(".key")
        .tempfile()
        .context("failed to create temp SSH key file")?;
    let key_file = tmpfile.into_temp_path();

    store
        .download(bucket, key_name, None, &key_file)
        .await
        .with_context(|| format!("failed to download SSH key object `{key_name}`"))?;

    // OpenSSH rejects key files whose last line is unterminated.
    let mut data = tokio::fs::read(&key_file)
        .await
        .context("failed to read back SSH key file")?;
    anyhow::ensure!(!data.is_empty(), "SSH key object `{key_name}` is empty");
    if !data.ends_with(b"\n") {
        data.push(b'\n');
        tokio::fs::write(&key_file, &data)
            .await
            .context("failed to rewrite SSH key file")?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_file, std::fs::Permissions::from_mode(0o600))
            .context("failed to restrict SSH key file permissions")?;
    }

    debug!(path = %key_file.display(), "SSH identity installed");
    Ok(SshIdentity {
        key_file,
        host_keys: HostKeyPolicy::from_config(ssh),
    })
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
