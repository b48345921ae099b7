//! Shared wire types for the deployment backend API.
//!
//! Field names and value vocabularies follow the backend's JSON contract;
//! timestamps stay as the RFC 3339 strings they arrive as and are only parsed
//! when formatted for display.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a deployment job.
///
/// Transitions are monotonic: `pending → running → {success, failed,
/// cancelled}`. Terminal statuses never transition again. The backend owns
/// every transition; this client only requests them and observes the result.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }

    /// Statuses from which the backend accepts an execute request.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_executable(&self) -> bool {
        matches!(self, DeploymentStatus::Pending | DeploymentStatus::Failed)
    }

    /// Cancellation is only meaningful while the job is running.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, DeploymentStatus::Running)
    }

    /// Check whether an observed status change is a legal transition.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn can_transition(from: &DeploymentStatus, to: &DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        match (from, to) {
            (from, _) if from.is_terminal() => false,
            (Pending, Running) => true,
            (Running, Success | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStatus::Pending => write!(f, "pending"),
            DeploymentStatus::Running => write!(f, "running"),
            DeploymentStatus::Success => write!(f, "success"),
            DeploymentStatus::Failed => write!(f, "failed"),
            DeploymentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "running" => Ok(DeploymentStatus::Running),
            "success" => Ok(DeploymentStatus::Success),
            "failed" => Ok(DeploymentStatus::Failed),
            "cancelled" => Ok(DeploymentStatus::Cancelled),
            other => anyhow::bail!(
                "Unknown deployment status '{}'. Use pending, running, success, failed or cancelled",
                other
            ),
        }
    }
}

/// What a deployment job applies to the target server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    #[default]
    NginxConfig,
    Package,
    Certificate,
}

impl std::fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentKind::NginxConfig => write!(f, "nginx_config"),
            DeploymentKind::Package => write!(f, "package"),
            DeploymentKind::Certificate => write!(f, "certificate"),
        }
    }
}

impl std::str::FromStr for DeploymentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nginx_config" => Ok(DeploymentKind::NginxConfig),
            "package" => Ok(DeploymentKind::Package),
            "certificate" => Ok(DeploymentKind::Certificate),
            other => anyhow::bail!(
                "Unknown deployment type '{}'. Use nginx_config, package or certificate",
                other
            ),
        }
    }
}

/// Status of a single execution step.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Running,
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Running => write!(f, "running"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A deployment job record as served by the backend.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Deployment {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: DeploymentKind,
    pub server_id: u64,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx_config_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<u64>,
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub backup_enabled: bool,
    #[serde(default)]
    pub backup_path: String,
    #[serde(default)]
    pub restart_service: bool,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub deploy_params: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Wall-clock seconds, set once the job reaches a terminal status.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default)]
    pub can_rollback: bool,
    /// Present on jobs created by a rollback; references the origin job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_from: Option<u64>,
    /// Step records, embedded on the detail endpoint only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<DeploymentLogEntry>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// One execution step of a deployment.
///
/// The executor re-emits an entry with the same `id` when the step's status
/// changes (running → success/failed); `id` is the identity for merging, never
/// the `step` ordinal, which collides when history is resent.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DeploymentLogEntry {
    pub id: u64,
    pub deployment_id: u64,
    #[serde(default)]
    pub step: i64,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error_msg: String,
    /// Milliseconds.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub created_at: String,
}

/// Uniform `{code, message, data, timestamp}` wrapper used by every
/// non-stream endpoint. `data` is absent on errors and the HTTP status
/// matches `code`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default)]
    pub timestamp: String,
}
