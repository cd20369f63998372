// REST handlers for generation runs
// Creating, listing, inspecting, and reviewing runs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use tracing::info;

use crate::api::auth::{AuthenticatedUser, Identity};
use crate::api::types::{
    ApiError, CreateGenerationRequest, GenerationResponse, HealthResponse, ListQuery,
    ReviewAccepted, ReviewRequest, RunPage, MAX_PER_PAGE,
};
use crate::api::AppState;
use crate::engine::interrupt::submit_decision;
use crate::engine::queue::EnqueueOutcome;
use crate::models::{GenerationJob, ReviewDecision, Run, RunId};
use crate::ForgeError;

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

/// Load a run the caller is allowed to see
pub(crate) async fn visible_run(
    state: &AppState,
    identity: &Identity,
    raw_id: &str,
) -> std::result::Result<Run, ForgeError> {
    let run_id = RunId::parse(raw_id)?;
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ForgeError::NotFound(format!("generation {}", run_id)))?;
    if !identity.can_access(&run.owner_id) {
        return Err(ForgeError::Forbidden(format!(
            "generation {} belongs to another user",
            run_id
        )));
    }
    Ok(run)
}

/// `POST /api/generations`
pub async fn create_generation(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Json(request): Json<CreateGenerationRequest>,
) -> ApiResult<(StatusCode, Json<GenerationResponse>)> {
    identity.require_write()?;
    request.validate()?;

    let run = Run::new(RunId::new(), identity.user_id.clone(), request);
    let run = state.store.create_run(run).await?;
    let outcome = state
        .queue
        .enqueue(GenerationJob::new(run.id.clone(), run.owner_id.clone(), run.request.clone()))?;
    info!(
        "📝 {} created generation {} ({:?})",
        identity.user_id, run.id, outcome
    );

    Ok((
        StatusCode::CREATED,
        Json(GenerationResponse {
            run,
            queued: outcome == EnqueueOutcome::Enqueued,
        }),
    ))
}

/// `GET /api/generations`
pub async fn list_generations(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<RunPage>> {
    let owner = (!identity.role.is_admin()).then_some(identity.user_id.as_str());
    let runs = state.store.list_runs(owner).await?;

    let page = query.page.max(1);
    let per_page = query.per_page.clamp(1, MAX_PER_PAGE);
    let total = runs.len();
    let data = runs
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();

    Ok(Json(RunPage {
        data,
        total,
        page,
        per_page,
        total_pages: (total + per_page - 1) / per_page,
    }))
}

/// `GET /api/generations/:id`
pub async fn get_generation(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Run>> {
    Ok(Json(visible_run(&state, &identity, &id).await?))
}

/// `POST /api/generations/:id/review`
///
/// Republishes the decision as `interrupt:response` on the run's channel. The waiting
/// worker, not this handler, decides what happens next.
pub async fn submit_review(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(id): Path<String>,
    Json(review): Json<ReviewRequest>,
) -> ApiResult<(StatusCode, Json<ReviewAccepted>)> {
    identity.require_write()?;
    if review.stage.trim().is_empty() {
        return Err(ForgeError::InvalidInput("stage is required".to_string()).into());
    }
    let decision = ReviewDecision::from_parts(review.action, review.feedback, review.updated_data)?;
    let run = visible_run(&state, &identity, &id).await?;
    if run.status.is_terminal() {
        return Err(ForgeError::InvalidInput(format!(
            "generation {} is already {}",
            run.id, run.status
        ))
        .into());
    }

    submit_decision(state.channel.as_ref(), &run.id, &review.stage, decision).await?;
    info!(
        "🗳️ {} sent {:?} for {} / {}",
        identity.user_id, review.action, run.id, review.stage
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ReviewAccepted {
            run_id: run.id.to_string(),
            stage: review.stage,
            action: review.action,
        }),
    ))
}

pub async fn not_found() -> ApiError {
    ForgeError::NotFound("route".to_string()).into()
}
