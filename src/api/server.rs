use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use ring::hmac::Key;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::api::middleware::verify_external::{signing_key, verify_event_signature};
use crate::api::middleware::verify_internal::verify_internal_ident;
use crate::api::middleware::{MiddlewareErr, cors};
use crate::engine::admin::AdminError;
use crate::engine::events::EventQueue;
use crate::engine::{Engine, EngineError};
use crate::util::env::{EnvErr, Var};
use crate::var;

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub queue: EventQueue,
    pub signing_key: Key,
    pub internal_token: String,
}

impl AppState {
    pub fn new(engine: Engine, queue: EventQueue, signing_secret: &str, internal_token: &str) -> Self {
        Self {
            engine,
            queue,
            signing_key: signing_key(signing_secret),
            internal_token: internal_token.trim().to_owned(),
        }
    }

    pub async fn from_env(engine: Engine, queue: EventQueue) -> Result<Self, RouteError> {
        let secret = var!(Var::EventSigningSecret).await?;
        let token = var!(Var::InternalToken).await?;

        Ok(Self::new(engine, queue, secret, token))
    }
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    //
    // event log delivery
    let event_routes = Router::new()
        .route("/events", post(ingest_event))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            verify_event_signature,
        ));

    let admin_routes = Router::new()
        .route("/admin/instructors", post(create_instructor))
        .route("/admin/courses/{course_id}/enrollments", post(bulk_enroll))
        .route("/admin/certificates", post(generate_certificate))
        .route("/admin/users/{user_id}/points", post(correct_points))
        .route("/admin/reconcile", post(reconcile))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            verify_internal_ident,
        ));

    Router::new()
        .merge(event_routes)
        .merge(admin_routes)
        .route("/", get(|| async { Response::new(Body::empty()) }))
        //
        // learner-facing reads
        .route("/users/{user_id}", get(user_summary))
        .route("/users/{user_id}/ledger", get(user_ledger))
        .route("/users/{user_id}/enrollments/{course_id}", get(enrollment))
        .route("/courses/{course_id}/stats", get(course_stats))
        .route("/leaderboard", get(leaderboard))
        .route("/badges", get(badges))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(cors)
        .layer(from_fn(log_route_errors))
        .with_state(state)
}

/// Logs `RouteError`s that handlers attached to their responses.
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

/// Binds the API port and serves until ctrl-c.
#[instrument(skip(state))]
pub async fn start_server(state: Arc<AppState>, port: u16) -> Result<JoinHandle<()>, RouteError> {
    let app = router(state, cors().await?);

    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    tracing::info!(
        server_url = &format!("http://127.0.0.1:{}", listener.local_addr()?.port()),
        "server ready"
    );

    Ok(tokio::task::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            tracing::error!(error = ?e, "api server stopped");
        }
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }

    tracing::info!("shutdown requested");
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error("malformed event body: {0}")]
    MalformedEvent(#[source] serde_json::Error),

    #[error(transparent)]
    Middleware(#[from] MiddlewareErr),

    #[error(transparent)]
    EnvError(#[from] EnvErr),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        e if e.is_missing_entity() => StatusCode::NOT_FOUND,
        EngineError::QueueFull | EngineError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::CompletedOnCreate | EngineError::NegativeAward(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            message: String,
        }

        let status = match &self {
            RouteError::Engine(e) => engine_status(e),
            RouteError::Admin(admin) => match admin {
                AdminError::UnknownUser(_) | AdminError::UnknownCourse(_) => StatusCode::NOT_FOUND,
                AdminError::DuplicateUser(_) | AdminError::NotCompleted { .. } => {
                    StatusCode::CONFLICT
                }
                AdminError::NegativeTotal { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                AdminError::Invalid(_) => StatusCode::BAD_REQUEST,
                AdminError::Engine(e) => engine_status(e),
            },
            RouteError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
            RouteError::Middleware(_) | RouteError::EnvError(_) | RouteError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = self.to_string();
        let mut response = (status, Json(ErrorResponse { message })).into_response();

        // client mistakes are answered, not logged
        if status.is_server_error() {
            response.extensions_mut().insert(Arc::new(self));
        }

        response
    }
}
