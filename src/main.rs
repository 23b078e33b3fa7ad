use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;

use crate::api::server::{AppState, RouteError, start_server};
use crate::db::prelude::*;
use crate::db::redis::LeaderboardCache;
use crate::engine::events::{EventQueue, spawn_reconciler, spawn_workers};
use crate::engine::{Engine, EngineConfig, EngineError};
use crate::util::env::{Env, EnvErr};
use crate::util::telemetry;

mod api;
mod constants;
mod db;
mod engine;
mod util;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),
}

type Result<T> = core::result::Result<T, RunnerErr>;

/// Postgres when `DATABASE_URL` is set, otherwise an in-memory store
/// (optionally seeded from `SEED_PATH`).
async fn open_store(env: &Env) -> Result<Arc<dyn Store>> {
    if let Some(url) = env.database_url() {
        let pool = db::pg::db_pool(url).await?;
        tracing::info!("using postgres store");
        return Ok(Arc::new(PgStore::new(pool)));
    }

    let store = match env.seed_path.as_deref() {
        Some(path) => MemoryStore::from_seed_file(Path::new(path)).await?,
        None => MemoryStore::new(),
    };

    tracing::warn!("DATABASE_URL not set, state will not survive a restart");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = util::env::config().await?;
    let telemetry_registry = telemetry::Telemetry::new(env)?.register();

    tracing::info!("starting main application");

    let store = open_store(env).await?;
    let mut engine = Engine::new(store, EngineConfig::from_env(env)?);

    if let Some(url) = env.redis_url() {
        match LeaderboardCache::connect(url).await {
            Ok(cache) => engine = engine.with_leaderboard(cache),
            Err(e) => {
                tracing::warn!(error = ?e, "redis unavailable, leaderboard served from the store")
            }
        }
    }
    engine.warm_leaderboard_cache().await;

    let (queue, rx) = EventQueue::bounded(env.event_queue_capacity);
    let workers = spawn_workers(engine.clone(), rx, env.event_workers);
    let reconciler = spawn_reconciler(
        engine.clone(),
        Duration::from_secs(env.reconcile_interval_secs.max(1)),
    );

    let state = Arc::new(AppState::from_env(engine, queue.clone()).await?);
    let server = start_server(state, env.server_api_port).await?;

    if let Err(e) = server.await {
        tracing::error!(error = ?e, "api server task failed");
    }

    queue.close();
    reconciler.abort();
    _ = join_all(workers).await;
    tracing::info!("event queue drained, exiting");

    telemetry_registry.shutdown();
    Ok(())
}
