use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::instrument;

pub struct RedisPool {
    pub manager: ConnectionManager,
}

impl RedisPool {
    #[instrument(skip(redis_url))]
    pub async fn new(redis_url: &str) -> RedisResult<Self> {
        tracing::debug!("connecting to redis server");

        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self { manager })
    }
}

pub type RedisResult<T> = core::result::Result<T, RedisErr>;

#[derive(Debug, Error)]
pub enum RedisErr {
    #[error(transparent)]
    RedisClientError(#[from] redis::RedisError),

    #[error("leaderboard member '{0}' has a non-integral score")]
    BadScore(String),
}
