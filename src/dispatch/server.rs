//! Dispatcher HTTP surface

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::queue::{JobQueue, QueueTask};
use crate::api::{health_routes, ApiError};
use crate::http::{ClientError, EnqueueResponse, Enqueuer};
use crate::models::RunId;

#[derive(Clone)]
pub struct DispatchState {
    pub queue: Arc<JobQueue>,
}

pub fn router(state: DispatchState) -> Router {
    Router::new()
        .route("/runs/{run_id}/enqueue", post(enqueue))
        .route("/queue", get(queue_depth))
        .merge(health_routes())
        .with_state(state)
}

/// Enqueues into a queue owned by the same process
pub struct LocalEnqueuer {
    queue: Arc<JobQueue>,
}

impl LocalEnqueuer {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Enqueuer for LocalEnqueuer {
    async fn enqueue(&self, run_id: RunId) -> Result<(), ClientError> {
        self.queue
            .enqueue(QueueTask::PlanRun { run_id })
            .map(|_| ())
            .map_err(|e| ClientError::RequestFailed(e.to_string()))
    }
}

async fn enqueue(
    State(state): State<DispatchState>,
    Path(run_id): Path<RunId>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let created = state
        .queue
        .enqueue(QueueTask::PlanRun { run_id })
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if created {
        info!("Run {} enqueued for dispatch", run_id);
    }
    Ok(Json(EnqueueResponse {
        status: "enqueued".to_string(),
        run_id,
    }))
}

async fn queue_depth(
    State(state): State<DispatchState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pending = state
        .queue
        .len()
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "pending": pending })))
}
