//! Typed clients for the coordinator, dispatcher and executor services

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{ClientError, ServiceClient};
use crate::config::CoordinatorConfig;
use crate::models::{ExecuteRequest, ExecuteResponse, JobContext, ResultsReport, Run, RunId};

/// Internal coordinator API used by the dispatcher and executors
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn job_context(&self, run_id: RunId) -> Result<JobContext, ClientError>;

    /// Returns the run as stored after the update
    async fn mark_dispatched(&self, run_id: RunId, shard_total: u32) -> Result<Run, ClientError>;

    async fn report(&self, run_id: RunId, report: &ResultsReport) -> Result<(), ClientError>;
}

#[derive(Serialize, Deserialize)]
pub struct DispatchedBody {
    pub shard_total: u32,
}

pub struct HttpCoordinator {
    client: ServiceClient,
}

impl HttpCoordinator {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    /// Client for the configured coordinator URL and secret
    pub fn from_config(settings: &CoordinatorConfig) -> anyhow::Result<Self> {
        let client = ServiceClient::new(&settings.url, settings.request_timeout_secs)
            .context("Failed to build coordinator client")?
            .with_secret(settings.internal_secret.as_deref())?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn job_context(&self, run_id: RunId) -> Result<JobContext, ClientError> {
        self.client
            .get_json(&format!("/internal/runs/{run_id}/job-context"))
            .await
    }

    async fn mark_dispatched(&self, run_id: RunId, shard_total: u32) -> Result<Run, ClientError> {
        self.client
            .post_json(
                &format!("/internal/runs/{run_id}/dispatched"),
                &DispatchedBody { shard_total },
            )
            .await
    }

    async fn report(&self, run_id: RunId, report: &ResultsReport) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .client
            .put_json(&format!("/internal/runs/{run_id}/results"), report)
            .await?;
        debug!("Reported {} for run {}", report.status, run_id);
        Ok(())
    }
}

/// How an executor answered a job
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutorAnswer {
    /// 200: the shard ran to an outcome
    Done(ExecuteResponse),
    /// 400: the job cannot run
    Rejected(String),
    /// 409: already executing there
    AlreadyRunning,
    /// 502: infrastructure failure
    InfraFailed(String),
    /// 504: hard timeout
    TimedOut,
}

/// Executor entrypoint seam
#[async_trait]
pub trait ExecutorEndpoint: Send + Sync {
    async fn execute(&self, request: &ExecuteRequest) -> Result<ExecutorAnswer, ClientError>;
}

pub struct HttpExecutor {
    client: ServiceClient,
}

impl HttpExecutor {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecutorEndpoint for HttpExecutor {
    async fn execute(&self, request: &ExecuteRequest) -> Result<ExecutorAnswer, ClientError> {
        let url = format!("{}/execute", self.client.base_url().trim_end_matches('/'));
        let response = self
            .client
            .send(Method::POST, "/execute", Some(request))
            .await?;

        match response.status_code {
            200..=299 => Ok(ExecutorAnswer::Done(response.json(&url)?)),
            400 => Ok(ExecutorAnswer::Rejected(response.body)),
            409 => Ok(ExecutorAnswer::AlreadyRunning),
            502 => Ok(ExecutorAnswer::InfraFailed(response.body)),
            504 => Ok(ExecutorAnswer::TimedOut),
            status => Err(ClientError::Status {
                status,
                url,
                body: response.body,
            }),
        }
    }
}

/// Dispatcher enqueue API used by the coordinator's trigger endpoint
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, run_id: RunId) -> Result<(), ClientError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub status: String,
    pub run_id: RunId,
}

pub struct HttpEnqueuer {
    client: ServiceClient,
}

impl HttpEnqueuer {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Enqueuer for HttpEnqueuer {
    async fn enqueue(&self, run_id: RunId) -> Result<(), ClientError> {
        let response: EnqueueResponse = self
            .client
            .post_json(&format!("/runs/{run_id}/enqueue"), &serde_json::json!({}))
            .await?;
        debug!("Dispatcher answered {} for run {}", response.status, run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobContext, Layer, RepoAuthMethod, ShardJob, ShardStatus};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    /// Executor whose answer depends on the shard index of the job
    async fn fake_execute(Json(request): Json<ExecuteRequest>) -> Response {
        let job = request.job;
        match job.shard_index {
            0 => Json(ExecuteResponse {
                status: "completed".to_string(),
                run_id: job.run_id,
                shard_index: job.shard_index,
                outcome: Some(ShardStatus::Completed),
            })
            .into_response(),
            1 => (StatusCode::BAD_REQUEST, "missing repo_url").into_response(),
            2 => (StatusCode::CONFLICT, "already running").into_response(),
            3 => (StatusCode::BAD_GATEWAY, "clone failed").into_response(),
            4 => (StatusCode::GATEWAY_TIMEOUT, "hard timeout").into_response(),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        }
    }

    async fn start_executor() -> HttpExecutor {
        let app = Router::new().route("/execute", post(fake_execute));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        HttpExecutor::new(ServiceClient::new(format!("http://{addr}"), 5).unwrap())
    }

    fn request(shard_index: u32) -> ExecuteRequest {
        ExecuteRequest {
            job: ShardJob {
                run_id: 3,
                shard_index,
                shard_total: 6,
            },
            context: JobContext {
                run_id: 3,
                project_id: 1,
                repo_url: "https://git.example.com/shop.git".to_string(),
                repo_auth_method: RepoAuthMethod::Token,
                branch: "HEAD".to_string(),
                commit: "HEAD".to_string(),
                suite_id: 1,
                suite_name: "smoke".to_string(),
                layer: Layer::E2e,
                tags: vec![],
                retries: 0,
                shard_count: Some(6),
                timeout_secs: None,
                environment_id: 1,
                environment_name: "staging".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_executor_status_mapping() {
        let executor = start_executor().await;

        match executor.execute(&request(0)).await.unwrap() {
            ExecutorAnswer::Done(response) => {
                assert_eq!(response.shard_index, 0);
                assert_eq!(response.outcome, Some(ShardStatus::Completed));
            }
            other => panic!("Expected Done, got {other:?}"),
        }
        assert_eq!(
            executor.execute(&request(1)).await.unwrap(),
            ExecutorAnswer::Rejected("missing repo_url".to_string())
        );
        assert_eq!(
            executor.execute(&request(2)).await.unwrap(),
            ExecutorAnswer::AlreadyRunning
        );
        assert_eq!(
            executor.execute(&request(3)).await.unwrap(),
            ExecutorAnswer::InfraFailed("clone failed".to_string())
        );
        assert_eq!(
            executor.execute(&request(4)).await.unwrap(),
            ExecutorAnswer::TimedOut
        );
    }

    #[tokio::test]
    async fn test_other_executor_errors_stay_retryable() {
        let executor = start_executor().await;
        let err = executor.execute(&request(5)).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_gateway_errors_are_retryable_for_plain_clients() {
        let app = Router::new().route(
            "/internal/runs/{run_id}/job-context",
            axum::routing::get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let coordinator =
            HttpCoordinator::new(ServiceClient::new(format!("http://{addr}"), 5).unwrap());
        let err = coordinator.job_context(3).await.unwrap_err();
        assert_eq!(err.status(), Some(502));
        assert!(err.is_transient());
    }
}
