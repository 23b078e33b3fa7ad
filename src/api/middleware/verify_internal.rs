use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::StatusCode;
use http::header::AUTHORIZATION;

use crate::api::server::AppState;
use crate::util::constant_time_cmp;

/// Admin routes require `Authorization: Bearer <INTERNAL_TOKEN>`.
pub async fn verify_internal_ident(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let authorized_header = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let token = authorized_header
        .strip_prefix("Bearer ")
        .unwrap_or(authorized_header)
        .trim();

    // an unset token disables the admin surface
    if state.internal_token.is_empty()
        || !constant_time_cmp(token.as_bytes(), state.internal_token.as_bytes())
    {
        tracing::warn!("rejected admin request with a bad token");
        Err(StatusCode::UNAUTHORIZED)
    } else {
        Ok(next.run(req).await)
    }
}
