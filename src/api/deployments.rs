//! Deployment endpoints: listing, CRUD, lifecycle actions and step logs.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::decode_ack;
use super::decode_envelope;
use super::error::ApiError;
use super::models::{Deployment, DeploymentKind, DeploymentLogEntry, DeploymentStatus};

/// Server-side filters for the list endpoint. Pagination is always sent;
/// status and kind only when set.
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub status: Option<DeploymentStatus>,
    pub kind: Option<DeploymentKind>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for ListFilter {
    fn default() -> Self {
        ListFilter {
            status: None,
            kind: None,
            page: 1,
            page_size: 20,
        }
    }
}

/// One page of the deployment list.
#[derive(Debug, Deserialize)]
pub struct DeploymentPage {
    pub deployments: Vec<Deployment>,
    pub total: i64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

/// Payload for creating a deployment job. Fields left empty are filled with
/// the backend's per-type defaults (target path, service name).
#[derive(Debug, Serialize, Default)]
pub struct CreateDeployment {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: DeploymentKind,
    pub server_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx_config_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_path: String,
    pub backup_enabled: bool,
    pub restart_service: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub deploy_params: String,
}

#[derive(Deserialize)]
struct ActionData {
    message: String,
}

/// Result of a rollback request: the acknowledgement plus the freshly
/// created rollback job, which records its origin in `rolled_back_from`.
#[derive(Debug, Deserialize)]
pub struct RollbackOutcome {
    pub message: String,
    pub deployment: Deployment,
}

pub async fn list(
    client: &Client,
    base_url: &str,
    token: &str,
    filter: &ListFilter,
) -> Result<DeploymentPage, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let mut url = format!(
        "{}/api/v1/deployments?page={}&page_size={}",
        base_url, filter.page, filter.page_size
    );
    if let Some(status) = &filter.status {
        url.push_str(&format!("&status={}", status));
    }
    if let Some(kind) = &filter.kind {
        url.push_str(&format!("&type={}", kind));
    }

    let response = client.get(url).bearer_auth(token).send().await?;
    decode_envelope(response).await
}

/// Fetch one deployment with its step records embedded.
pub async fn get(
    client: &Client,
    base_url: &str,
    token: &str,
    id: u64,
) -> Result<Deployment, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .get(format!("{}/api/v1/deployments/{}", base_url, id))
        .bearer_auth(token)
        .send()
        .await?;
    decode_envelope(response).await
}

pub async fn create(
    client: &Client,
    base_url: &str,
    token: &str,
    request: &CreateDeployment,
) -> Result<Deployment, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .post(format!("{}/api/v1/deployments", base_url))
        .bearer_auth(token)
        .json(request)
        .send()
        .await?;
    decode_envelope(response).await
}

/// Delete a deployment record. The backend refuses while the job is running.
pub async fn delete(
    client: &Client,
    base_url: &str,
    token: &str,
    id: u64,
) -> Result<String, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .delete(format!("{}/api/v1/deployments/{}", base_url, id))
        .bearer_auth(token)
        .send()
        .await?;
    decode_ack(response).await
}

/// Start executing a deployment. Accepted only from `pending` or `failed`;
/// execution itself is asynchronous and must be observed separately.
pub async fn execute(
    client: &Client,
    base_url: &str,
    token: &str,
    id: u64,
) -> Result<String, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .post(format!("{}/api/v1/deployments/{}/execute", base_url, id))
        .bearer_auth(token)
        .send()
        .await?;
    let data: ActionData = decode_envelope(response).await?;
    Ok(data.message)
}

/// Request cancellation of a running deployment. The job finishes its
/// in-flight step before it lands in `cancelled`.
pub async fn cancel(
    client: &Client,
    base_url: &str,
    token: &str,
    id: u64,
) -> Result<String, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .post(format!("{}/api/v1/deployments/{}/cancel", base_url, id))
        .bearer_auth(token)
        .send()
        .await?;
    let data: ActionData = decode_envelope(response).await?;
    Ok(data.message)
}

/// Restore the pre-deployment backup by scheduling a new rollback job.
pub async fn rollback(
    client: &Client,
    base_url: &str,
    token: &str,
    id: u64,
) -> Result<RollbackOutcome, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .post(format!("{}/api/v1/deployments/{}/rollback", base_url, id))
        .bearer_auth(token)
        .send()
        .await?;
    decode_envelope(response).await
}

/// Fetch the full step history over plain HTTP, for finished deployments.
pub async fn logs(
    client: &Client,
    base_url: &str,
    token: &str,
    id: u64,
) -> Result<Vec<DeploymentLogEntry>, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .get(format!("{}/api/v1/deployments/{}/logs", base_url, id))
        .bearer_auth(token)
        .send()
        .await?;
    decode_envelope(response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Json, Path, RawQuery};
    use axum::http::StatusCode;
    use axum::routing::{get as axum_get, post};

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn deployment_json(id: u64, status: &str) -> String {
        format!(
            r#"{{"id":{},"name":"job-{}","type":"package","server_id":1,"status":"{}","target_path":"/tmp","created_at":"t","updated_at":"t"}}"#,
            id, id, status
        )
    }

    #[tokio::test]
    async fn test_list_sends_filters_as_query_params() {
        let app = axum::Router::new().route(
            "/api/v1/deployments",
            axum_get(|RawQuery(query): RawQuery| async move {
                let query = query.unwrap_or_default();
                assert!(query.contains("page=2"));
                assert!(query.contains("page_size=5"));
                assert!(query.contains("status=failed"));
                assert!(query.contains("type=package"));
                (
                    StatusCode::OK,
                    format!(
                        r#"{{"code":200,"message":"success","data":{{"deployments":[{}],"total":6,"page":2,"page_size":5}},"timestamp":"t"}}"#,
                        deployment_json(11, "failed")
                    ),
                )
            }),
        );
        let base = serve(app).await;

        let filter = ListFilter {
            status: Some(DeploymentStatus::Failed),
            kind: Some(DeploymentKind::Package),
            page: 2,
            page_size: 5,
        };
        let page = list(&Client::new(), &base, "tok", &filter).await.unwrap();
        assert_eq!(page.total, 6);
        assert_eq!(page.deployments.len(), 1);
        assert_eq!(page.deployments[0].id, 11);
    }

    #[tokio::test]
    async fn test_get_missing_deployment_is_not_found() {
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}",
            axum_get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    r#"{"code":404,"message":"deployment not found","timestamp":"t"}"#,
                )
            }),
        );
        let base = serve(app).await;

        let err = get(&Client::new(), &base, "tok", 99).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(ref m) if m == "deployment not found"));
    }

    #[tokio::test]
    async fn test_create_serializes_kind_under_type_key() {
        let app = axum::Router::new().route(
            "/api/v1/deployments",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["type"], "nginx_config");
                assert_eq!(body["server_id"], 3);
                // Empty optional fields stay absent so the backend applies
                // its per-type defaults.
                assert!(body.get("target_path").is_none());
                assert!(body.get("nginx_config_id").is_some());
                (
                    StatusCode::OK,
                    format!(
                        r#"{{"code":200,"message":"success","data":{},"timestamp":"t"}}"#,
                        deployment_json(12, "pending")
                    ),
                )
            }),
        );
        let base = serve(app).await;

        let request = CreateDeployment {
            name: "reload".into(),
            kind: DeploymentKind::NginxConfig,
            server_id: 3,
            nginx_config_id: Some(7),
            backup_enabled: true,
            ..Default::default()
        };
        let created = create(&Client::new(), &base, "tok", &request).await.unwrap();
        assert_eq!(created.id, 12);
        assert_eq!(created.status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_execute_returns_ack_and_rejects_wrong_state() {
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/execute",
            post(|Path(id): Path<u64>| async move {
                if id == 1 {
                    (
                        StatusCode::OK,
                        r#"{"code":200,"message":"success","data":{"message":"deployment started"},"timestamp":"t"}"#
                            .to_string(),
                    )
                } else {
                    (
                        StatusCode::BAD_REQUEST,
                        r#"{"code":400,"message":"deployment is already running","timestamp":"t"}"#
                            .to_string(),
                    )
                }
            }),
        );
        let base = serve(app).await;
        let client = Client::new();

        let message = execute(&client, &base, "tok", 1).await.unwrap();
        assert_eq!(message, "deployment started");

        let err = execute(&client, &base, "tok", 2).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidState(ref m) if m.contains("already running")));
    }

    #[tokio::test]
    async fn test_rollback_returns_the_new_job() {
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/rollback",
            post(|| async {
                (
                    StatusCode::OK,
                    r#"{"code":200,"message":"success","data":{"message":"rollback started","deployment":{"id":31,"name":"rollback of job-9","type":"package","server_id":1,"status":"pending","target_path":"/tmp","backup_enabled":false,"rolled_back_from":9,"created_at":"t","updated_at":"t"}},"timestamp":"t"}"#,
                )
            }),
        );
        let base = serve(app).await;

        let outcome = rollback(&Client::new(), &base, "tok", 9).await.unwrap();
        assert_eq!(outcome.message, "rollback started");
        assert_eq!(outcome.deployment.id, 31);
        assert_eq!(outcome.deployment.rolled_back_from, Some(9));
        assert!(!outcome.deployment.backup_enabled);
    }

    #[tokio::test]
    async fn test_logs_returns_step_entries() {
        let app = axum::Router::new().route(
            "/api/v1/deployments/{id}/logs",
            axum_get(|| async {
                (
                    StatusCode::OK,
                    r#"{"code":200,"message":"success","data":[{"id":1,"deployment_id":5,"step":1,"action":"backup","status":"success","output":"","error_msg":"","duration":20,"created_at":"t"},{"id":2,"deployment_id":5,"step":2,"action":"upload","status":"running","output":"","error_msg":"","duration":0,"created_at":"t"}],"timestamp":"t"}"#,
                )
            }),
        );
        let base = serve(app).await;

        let entries = logs(&Client::new(), &base, "tok", 5).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "backup");
        assert_eq!(entries[1].status, crate::api::models::StepStatus::Running);
    }

    #[tokio::test]
    async fn test_every_call_requires_a_token() {
        let client = Client::new();
        let base = "http://127.0.0.1:1";

        assert!(matches!(
            list(&client, base, "", &ListFilter::default()).await,
            Err(ApiError::NotAuthenticated)
        ));
        assert!(matches!(
            execute(&client, base, "", 1).await,
            Err(ApiError::NotAuthenticated)
        ));
        assert!(matches!(
            rollback(&client, base, "", 1).await,
            Err(ApiError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_connection_failure_is_a_transport_error() {
        // Nothing listens on port 1, so the request fails before any
        // HTTP exchange and never reaches the status-code mapping.
        let err = get(&Client::new(), "http://127.0.0.1:1", "tok", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }
}
