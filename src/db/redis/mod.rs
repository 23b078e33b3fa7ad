pub mod redis_pool;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::instrument;

use crate::constants::LEADERBOARD_KEY;
use crate::db::models::UserId;
use crate::db::models::user::LeaderboardEntry;
use crate::db::redis::redis_pool::{RedisErr, RedisPool, RedisResult};

/// Sorted-set mirror of user totals, used to serve the leaderboard without
/// ranking the whole user table on every read.
///
/// The cache is never the source of truth: writes are best effort and the
/// batch reconciler rewrites the top of the board plus any totals it
/// repairs, so a lost write is stale for at most one reconcile interval.
#[derive(Clone)]
pub struct LeaderboardCache {
    manager: ConnectionManager,
    key: String,
}

impl LeaderboardCache {
    pub async fn connect(redis_url: &str) -> RedisResult<Self> {
        let pool = RedisPool::new(redis_url).await?;
        Ok(Self::with_key(pool, LEADERBOARD_KEY))
    }

    pub fn with_key(pool: RedisPool, key: impl Into<String>) -> Self {
        Self {
            manager: pool.manager,
            key: key.into(),
        }
    }

    /// Overwrites the member's score. Used where a total may go down.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn record_total(&self, user_id: &UserId, total: i64) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.zadd::<_, _, _, ()>(&self.key, &user_id.0, total)
            .await?;

        Ok(())
    }

    /// `ZADD GT`: a stale, lower total from a slower writer never replaces a
    /// newer one.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn raise_total(&self, user_id: &UserId, total: i64) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        let (): () = redis::cmd("ZADD")
            .arg(&self.key)
            .arg("GT")
            .arg(total)
            .arg(&user_id.0)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    #[instrument(skip(self, totals), fields(key = %self.key, count = totals.len()))]
    pub async fn record_many(&self, totals: &[(UserId, i64)]) -> RedisResult<()> {
        if totals.is_empty() {
            return Ok(());
        }

        let items: Vec<(i64, &str)> = totals
            .iter()
            .map(|(id, total)| (*total, id.0.as_str()))
            .collect();

        let mut conn = self.manager.clone();
        conn.zadd_multiple::<_, _, _, ()>(&self.key, items.as_slice()).await?;

        Ok(())
    }

    /// Highest totals first; `ranking` is 1-based across pages.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn top(&self, limit: i64, offset: i64) -> RedisResult<Vec<LeaderboardEntry>> {
        let start = offset.max(0) as isize;
        let stop = start + limit.max(1) as isize - 1;

        let mut conn = self.manager.clone();
        let rows: Vec<(String, f64)> = conn.zrevrange_withscores(&self.key, start, stop).await?;

        rows.into_iter()
            .enumerate()
            .map(|(idx, (member, score))| {
                if score.fract() != 0.0 {
                    return Err(RedisErr::BadScore(member));
                }

                Ok(LeaderboardEntry {
                    user_id: member.into(),
                    total_points: score as i64,
                    ranking: offset + idx as i64 + 1,
                })
            })
            .collect()
    }
}
