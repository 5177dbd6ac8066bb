use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::config::Config;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub git: CheckResult,
    pub work_dir: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_git() -> CheckResult {
    match tokio::process::Command::new("git")
        .arg("--version")
        .output()
        .await
    {
        Ok(out) if out.status.success() => CheckResult {
            ok: true,
            detail: Some(String::from_utf8_lossy(&out.stdout).trim().to_string()),
        },
        Ok(out) => CheckResult::unhealthy(format!("git --version exited with {}", out.status)),
        Err(e) => CheckResult::unhealthy(format!("git not runnable: {e}")),
    }
}

/// The work directory must exist (or be creatable) and accept writes.
async fn check_work_dir(path: &Path) -> CheckResult {
    if let Err(e) = tokio::fs::create_dir_all(path).await {
        return CheckResult::unhealthy(format!("cannot create {}: {e}", path.display()));
    }
    let probe = path.join(".git-motel-health");
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            CheckResult::healthy()
        }
        Err(e) => CheckResult::unhealthy(format!("{} not writable: {e}", path.display())),
    }
}

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.git.ok && checks.work_dir.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 when healthy, 503 otherwise.
pub async fn health_handler(State(config): State<Arc<Config>>) -> impl IntoResponse {
    let (git, work_dir) = tokio::join!(check_git(), check_work_dir(&config.work_dir));

    let checks = HealthChecks { git, work_dir };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
