//! Notification pipeline.
//!
//! For every record: resolve configuration, fetch the SSH identity, stage
//! and extract the archive, commit it, then force-push (unless dry-run).
//! Records are handled strictly one after another.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use prometheus_client::encoding::EncodeLabelValue;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{self, ArchiveFormat, StagingPaths};
use crate::config::Config;
use crate::credentials::fetch_identity;
use crate::event::{Invocation, NotificationEvent};
use crate::git::{self, Committer, Repo};
use crate::metrics::{MetricsRegistry, Outcome};
use crate::storage::ObjectStore;
use crate::target::{ConfigMap, UploadTarget};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Pipeline step a record failed in.
///
/// An unparsable payload never reaches this point: it is rejected as a
/// whole before any record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, EncodeLabelValue)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Config,
    Credential,
    Download,
    Extract,
    Commit,
    Push,
}

/// A failure tagged with the step it happened in.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub source: anyhow::Error,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} stage failed: {:#}", self.stage, self.source)
    }
}

trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T, StageError>;
}

impl<T> StageContext<T> for anyhow::Result<T> {
    fn stage(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|source| StageError { stage, source })
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of a successfully handled record.
#[derive(Debug, Clone, Serialize)]
pub struct PushOutcome {
    pub bucket: String,
    pub key: String,
    pub version: Option<String>,
    pub format: ArchiveFormat,
    pub extract_dir: PathBuf,
    pub git_dir: PathBuf,
    pub commit_id: String,
    pub remote: String,
    pub branch: String,
    pub refspec: String,
    /// False when the push was skipped for a dry run.
    pub pushed: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordResult {
    Published(PushOutcome),
    Failed {
        bucket: String,
        key: String,
        version: Option<String>,
        stage: Stage,
        error: String,
    },
}

impl RecordResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, RecordResult::Failed { .. })
    }
}

#[derive(Debug, Serialize)]
pub struct InvocationReport {
    pub dry_run: bool,
    pub records: Vec<RecordResult>,
    /// Records not attempted because `fail_fast` stopped the run.
    pub skipped: usize,
}

impl InvocationReport {
    pub fn failed(&self) -> usize {
        self.records.iter().filter(|r| r.is_failure()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped == 0
    }
}

// ---------------------------------------------------------------------------
// Uploader
// ---------------------------------------------------------------------------

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    config: Arc<Config>,
    metrics: MetricsRegistry,
    /// Serialises invocations: records share the staging directories.
    running: Mutex<()>,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: Arc<Config>, metrics: MetricsRegistry) -> Self {
        Self {
            store,
            config,
            metrics,
            running: Mutex::new(()),
        }
    }

    /// Process every record of `invocation` in order.
    ///
    /// A failed record is logged and reported; later records still run
    /// unless `fail_fast` is configured.
    #[instrument(skip_all, fields(dry_run = invocation.dry_run, records = invocation.events.len()))]
    pub async fn handle_invocation(&self, invocation: &Invocation) -> InvocationReport {
        let _guard = self.running.lock().await;

        let mut records = Vec::with_capacity(invocation.events.len());
        let mut skipped = 0;

        for (idx, event) in invocation.events.iter().enumerate() {
            info!(
                dry_run = invocation.dry_run,
                bucket = %event.bucket,
                key = %event.key,
                version = ?event.version,
                "handling notification"
            );

            let started = Instant::now();
            let result = self.handle_notification(invocation.dry_run, event).await;
            self.metrics
                .metrics
                .notification_duration_seconds
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(outcome) => {
                    self.metrics.metrics.record_outcome(if outcome.pushed {
                        Outcome::Pushed
                    } else {
                        Outcome::DryRun
                    });
                    records.push(RecordResult::Published(outcome));
                }
                Err(err) => {
                    error!(
                        bucket = %event.bucket,
                        key = %event.key,
                        stage = ?err.stage,
                        error = %format!("{:#}", err.source),
                        "notification failed"
                    );
                    self.metrics.metrics.record_failure(err.stage);
                    records.push(RecordResult::Failed {
                        bucket: event.bucket.clone(),
                        key: event.key.clone(),
                        version: event.version.clone(),
                        stage: err.stage,
                        error: format!("{:#}", err.source),
                    });

                    if self.config.fail_fast {
                        skipped = invocation.events.len() - idx - 1;
                        if skipped > 0 {
                            warn!(skipped, "fail_fast set; abandoning remaining records");
                        }
                        break;
                    }
                }
            }
        }

        InvocationReport {
            dry_run: invocation.dry_run,
            records,
            skipped,
        }
    }

    /// Publish one uploaded archive.
    #[instrument(skip(self, event), fields(bucket = %event.bucket, key = %event.key))]
    pub async fn handle_notification(
        &self,
        dry_run: bool,
        event: &NotificationEvent,
    ) -> Result<PushOutcome, StageError> {
        let store = self.store.as_ref();
        let config = &self.config;

        // ---- Configuration ----
        let paths = StagingPaths::for_event(
            event,
            &config.archive_dir(),
            &config.repo_dir(),
            &config.work_dir,
        )
        .stage(Stage::Config)?;

        let tags = store.bucket_tags(&event.bucket).await.stage(Stage::Config)?;
        let metadata = store
            .object_metadata(&event.bucket, &event.key)
            .await
            .stage(Stage::Config)?;
        let merged = ConfigMap::merge(tags, metadata);
        debug!(entries = merged.len(), "configuration merged");
        for (k, v) in merged.iter() {
            debug!(key = k, value = v, "config entry");
        }

        let target = UploadTarget::resolve(&merged, event.basename(), &config.ssh.default_key_name)
            .stage(Stage::Config)?;

        // ---- Credential ----
        let identity = fetch_identity(store, &event.bucket, &target.key_name, &config.ssh)
            .await
            .stage(Stage::Credential)?;

        // ---- Download + extract ----
        info!(archive = %paths.archive.display(), "staging archive");
        let bytes = archive::stage_archive(store, event, &paths)
            .await
            .stage(Stage::Download)?;
        self.metrics.metrics.downloaded_bytes.inc_by(bytes);

        let format = archive::extract(&paths.archive, &paths.extract_dir)
            .await
            .stage(Stage::Extract)?;
        info!(extract_dir = %paths.extract_dir.display(), ?format, "archive extracted");

        // ---- Commit ----
        let committer = Committer {
            name: config.committer.name.clone(),
            email: config.committer.email.clone(),
        };
        let repo = Repo::new(&paths.git_dir, &paths.extract_dir);
        git::init_repo(&repo).await.stage(Stage::Commit)?;
        git::add_all(&repo).await.stage(Stage::Commit)?;
        git::commit(&repo, &config.commit_message, &committer)
            .await
            .stage(Stage::Commit)?;
        let commit_id = git::rev_parse_head(&repo).await.stage(Stage::Commit)?;

        // ---- Push ----
        let branch = target.branch.resolve(&commit_id);
        let refspec = git::refspec_for_branch(&branch).stage(Stage::Push)?;

        info!(remote = %target.repository, %commit_id, "Will push to refs/heads/{branch}");

        let mut outcome = PushOutcome {
            bucket: event.bucket.clone(),
            key: event.key.clone(),
            version: event.version.clone(),
            format,
            extract_dir: paths.extract_dir.clone(),
            git_dir: paths.git_dir.clone(),
            commit_id,
            remote: target.repository.clone(),
            branch,
            refspec,
            pushed: false,
        };

        if dry_run {
            info!("dry run; skipping push");
            return Ok(outcome);
        }

        git::push_force(
            &repo,
            &target.repository,
            &outcome.refspec,
            &identity.git_env(),
        )
        .await
        .stage(Stage::Push)?;

        info!(remote = %outcome.remote, branch = %outcome.branch, "pushed");
        outcome.pushed = true;
        Ok(outcome)
    }
}
