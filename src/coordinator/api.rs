//! Coordinator HTTP surface
//!
//! Public run endpoints plus the internal context, dispatch and results
//! endpoints used by the dispatcher and the executors.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::aggregator::Aggregator;
use super::audit::{actions, record_or_warn, AuditEvent};
use crate::api::{check_secret, health_routes, ApiError};
use crate::gate::DatasetGate;
use crate::http::{DispatchedBody, EnqueueResponse, Enqueuer};
use crate::models::{Catalog, JobContext, NewRun, ResultsReport, Run, RunId, RunStatus};
use crate::store::RunFilter;

#[derive(Clone)]
pub struct CoordinatorState {
    pub aggregator: Aggregator,
    pub gate: Arc<DatasetGate>,
    pub catalog: Arc<Catalog>,
    pub enqueuer: Arc<dyn Enqueuer>,
    pub internal_secret: Option<String>,
}

pub fn router(state: CoordinatorState) -> Router {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/trigger", post(trigger_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/internal/runs/{run_id}/job-context", get(job_context))
        .route("/internal/runs/{run_id}/dispatched", post(dispatched))
        .route("/internal/runs/{run_id}/results", put(results))
        .merge(health_routes())
        .with_state(state)
}

async fn create_run(
    State(state): State<CoordinatorState>,
    Json(request): Json<NewRun>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    if state.catalog.project(request.project_id).is_none() {
        return Err(ApiError::bad_request(format!(
            "Unknown project {}",
            request.project_id
        )));
    }

    let audit = state.aggregator.audit().clone();
    let version = match state.gate.check_run(&request) {
        Ok(version) => version,
        Err(e) => {
            record_or_warn(
                audit.as_ref(),
                AuditEvent::unbound(actions::REJECTED)
                    .actor(request.triggered_by.as_deref())
                    .detail(e.to_string()),
            );
            return Err(e.into());
        }
    };

    let actor = request.triggered_by.clone();
    let run = state
        .aggregator
        .store()
        .insert(request, version.map(|v| v.version))?;
    info!(
        "Run {} created for suite {} on environment {}",
        run.id, run.suite_id, run.environment_id
    );
    record_or_warn(
        audit.as_ref(),
        AuditEvent::new(actions::CREATED, run.id).actor(actor.as_deref()),
    );
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(
    State(state): State<CoordinatorState>,
    Query(filter): Query<RunFilter>,
) -> Result<Json<Vec<Run>>, ApiError> {
    Ok(Json(state.aggregator.store().list(&filter)?))
}

async fn get_run(
    State(state): State<CoordinatorState>,
    Path(run_id): Path<RunId>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.aggregator.store().get(run_id)?))
}

async fn trigger_run(
    State(state): State<CoordinatorState>,
    Path(run_id): Path<RunId>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let run = state.aggregator.store().get(run_id)?;
    if run.status != RunStatus::Queued {
        return Err(ApiError::conflict(format!(
            "Run {} is {} and cannot be triggered",
            run_id, run.status
        )));
    }

    if let Err(e) = state.enqueuer.enqueue(run_id).await {
        warn!("Dispatcher rejected run {}: {}", run_id, e);
        return Err(ApiError::bad_gateway(format!("Dispatcher unavailable: {e}")));
    }

    record_or_warn(
        state.aggregator.audit().as_ref(),
        AuditEvent::new(actions::TRIGGERED, run_id).actor(run.triggered_by.as_deref()),
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            status: "enqueued".to_string(),
            run_id,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    actor: Option<String>,
}

async fn cancel_run(
    State(state): State<CoordinatorState>,
    Path(run_id): Path<RunId>,
    body: Bytes,
) -> Result<Json<Run>, ApiError> {
    let request: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid cancel request: {e}")))?
    };
    let run = state
        .aggregator
        .cancel(run_id, request.reason, request.actor.as_deref())?;
    Ok(Json(run))
}

/// Assemble what an executor needs from the run and the catalog
pub fn build_context(catalog: &Catalog, run: &Run) -> Result<JobContext, ApiError> {
    let project = catalog
        .project(run.project_id)
        .ok_or_else(|| ApiError::not_found(format!("Project {} not found", run.project_id)))?;
    let suite = catalog
        .suite(run.suite_id)
        .ok_or_else(|| ApiError::not_found(format!("Suite {} not found", run.suite_id)))?;
    let environment = catalog.environment(run.environment_id).ok_or_else(|| {
        ApiError::not_found(format!("Environment {} not found", run.environment_id))
    })?;

    // HEAD leaves the choice to the remote's default branch
    let branch = run
        .branch
        .clone()
        .or_else(|| project.default_branch.clone())
        .unwrap_or_else(|| "HEAD".to_string());

    Ok(JobContext {
        run_id: run.id,
        project_id: project.id,
        repo_url: project.repo_url.clone(),
        repo_auth_method: project.repo_auth_method,
        branch,
        commit: run.commit.clone().unwrap_or_else(|| "HEAD".to_string()),
        suite_id: suite.id,
        suite_name: suite.name.clone(),
        layer: suite.layer,
        tags: suite.tags.clone(),
        retries: suite.retries,
        shard_count: suite.shards,
        timeout_secs: suite.timeout,
        environment_id: environment.id,
        environment_name: environment.name.clone(),
    })
}

async fn job_context(
    State(state): State<CoordinatorState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
) -> Result<Json<JobContext>, ApiError> {
    check_secret(&headers, state.internal_secret.as_deref())?;
    let run = state.aggregator.store().get(run_id)?;
    Ok(Json(build_context(&state.catalog, &run)?))
}

async fn dispatched(
    State(state): State<CoordinatorState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
    Json(body): Json<DispatchedBody>,
) -> Result<Json<Run>, ApiError> {
    check_secret(&headers, state.internal_secret.as_deref())?;
    Ok(Json(state.aggregator.mark_dispatched(run_id, body.shard_total)?))
}

async fn results(
    State(state): State<CoordinatorState>,
    Path(run_id): Path<RunId>,
    headers: HeaderMap,
    Json(report): Json<ResultsReport>,
) -> Result<Json<Run>, ApiError> {
    check_secret(&headers, state.internal_secret.as_deref())?;
    Ok(Json(state.aggregator.ingest(run_id, report)?))
}
