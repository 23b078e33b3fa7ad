use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use http::StatusCode;
use serde::Deserialize;
use tracing::instrument;

use crate::api::middleware::verify_external::VerifiedBody;
use crate::api::server::{AppState, JsonResult, RouteError};
use crate::db::prelude::*;
use crate::engine::EngineError;
use crate::engine::admin::{EnrollResult, NewInstructor, PointsCorrection};
use crate::engine::aggregate::ReconcileReport;
use crate::engine::badge::{BadgeCatalog, UserSummary};
use crate::engine::events::DomainEvent;

#[derive(Debug, Deserialize)]
pub struct BulkEnrollRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct CertificateRequest {
    pub user_id: UserId,
    pub course_id: CourseId,
}

#[derive(Debug, Deserialize)]
pub struct CorrectionRequest {
    pub delta: i64,
    pub note: String,
}

/// Accepts a signed event and queues it for the workers.
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    body: VerifiedBody,
) -> Result<StatusCode, RouteError> {
    let event: DomainEvent = body.as_json().map_err(RouteError::MalformedEvent)?;
    tracing::debug!(kind = event.kind(), user_id = %event.user_id(), "event accepted");

    state.queue.enqueue(event)?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip(state))]
pub async fn user_summary(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> JsonResult<UserSummary> {
    Ok(Json(state.engine.user_summary(&user_id.into()).await?))
}

#[instrument(skip(state))]
pub async fn user_ledger(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> JsonResult<Vec<LedgerEntry>> {
    let user = state.engine.require_user(&user_id.into()).await?;
    let entries = state
        .engine
        .store()
        .ledger_for_user(&user.id)
        .await
        .map_err(EngineError::from)?;

    Ok(Json(entries))
}

#[instrument(skip(state))]
pub async fn enrollment(
    State(state): State<Arc<AppState>>,
    Path((user_id, course_id)): Path<(String, String)>,
) -> JsonResult<Enrollment> {
    let (user_id, course_id) = (UserId::from(user_id), CourseId::from(course_id));

    match state
        .engine
        .store()
        .get_enrollment(&user_id, &course_id)
        .await
        .map_err(EngineError::from)?
    {
        Some(e) => Ok(Json(e)),
        None => Err(EngineError::MissingEnrollment {
            user: user_id,
            course: course_id,
        }
        .into()),
    }
}

#[instrument(skip(state))]
pub async fn course_stats(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
) -> JsonResult<CourseStats> {
    Ok(Json(state.engine.course_stats(&course_id.into()).await?))
}

/// Reads the Redis mirror when it is available and populated, the store
/// otherwise.
#[instrument(skip(state))]
pub async fn leaderboard(
    Query(param): Query<Pagination>,
    State(state): State<Arc<AppState>>,
) -> JsonResult<PaginatedResponse<LeaderboardEntry>> {
    let (limit, offset) = param.window();

    let cached = match state.engine.leaderboard_cache() {
        Some(cache) => match cache.top(limit, offset).await {
            Ok(entries) if !entries.is_empty() => Some(entries),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = ?e, "leaderboard cache read failed, using store");
                None
            }
        },
        None => None,
    };

    let items = match cached {
        Some(items) => items,
        None => state
            .engine
            .store()
            .top_users(limit, offset)
            .await
            .map_err(EngineError::from)?,
    };

    Ok(Json(PaginatedResponse::new(items, limit, param.page())))
}

pub async fn badges(State(state): State<Arc<AppState>>) -> Json<BadgeCatalog> {
    Json(state.engine.catalog().clone())
}

// ---
//  admin
// ---

#[instrument(skip(state, req))]
pub async fn create_instructor(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewInstructor>,
) -> Result<(StatusCode, Json<User>), RouteError> {
    let user = state.engine.create_instructor(req).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, req))]
pub async fn bulk_enroll(
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<String>,
    Json(req): Json<BulkEnrollRequest>,
) -> JsonResult<Vec<EnrollResult>> {
    Ok(Json(
        state
            .engine
            .bulk_enroll(&course_id.into(), &req.user_ids)
            .await?,
    ))
}

#[instrument(skip(state))]
pub async fn generate_certificate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CertificateRequest>,
) -> JsonResult<Certificate> {
    Ok(Json(
        state
            .engine
            .generate_certificate(&req.user_id, &req.course_id)
            .await?,
    ))
}

#[instrument(skip(state, req))]
pub async fn correct_points(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<CorrectionRequest>,
) -> JsonResult<PointsCorrection> {
    Ok(Json(
        state
            .engine
            .admin_correct_points(&user_id.into(), req.delta, &req.note)
            .await?,
    ))
}

#[instrument(skip(state))]
pub async fn reconcile(State(state): State<Arc<AppState>>) -> JsonResult<ReconcileReport> {
    Ok(Json(state.engine.reconcile_all().await?))
}
