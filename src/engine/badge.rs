use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::constants::BADGE_EVAL_RETRIES;
use crate::db::prelude::*;
use crate::engine::{Engine, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeTier {
    pub name: String,
    pub points_required: i64,
}

impl BadgeTier {
    pub fn new(name: impl Into<String>, points_required: i64) -> Self {
        Self {
            name: name.into(),
            points_required,
        }
    }
}

/// Badge tiers sorted by ascending threshold. Thresholds and names are unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BadgeCatalog {
    tiers: Vec<BadgeTier>,
}

impl Default for BadgeCatalog {
    fn default() -> Self {
        Self {
            tiers: vec![
                BadgeTier::new("Bronze", 100),
                BadgeTier::new("Silver", 500),
                BadgeTier::new("Gold", 1000),
                BadgeTier::new("Platinum", 2500),
            ],
        }
    }
}

impl BadgeCatalog {
    pub fn new(mut tiers: Vec<BadgeTier>) -> Result<Self, CatalogError> {
        tiers.sort_by_key(|t| t.points_required);

        for tier in &tiers {
            if tier.name.trim().is_empty() {
                return Err(CatalogError::EmptyName);
            }
            if tier.points_required < 0 {
                return Err(CatalogError::NegativeThreshold(tier.name.clone()));
            }
        }

        for pair in tiers.windows(2) {
            if pair[0].points_required == pair[1].points_required {
                return Err(CatalogError::DuplicateThreshold(pair[1].points_required));
            }
        }

        let mut names: Vec<&str> = tiers.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(CatalogError::DuplicateName(dup[0].to_owned()));
        }

        Ok(Self { tiers })
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let tiers: Vec<BadgeTier> = serde_json::from_str(raw)?;
        Self::new(tiers)
    }

    pub fn tiers(&self) -> &[BadgeTier] {
        &self.tiers
    }

    /// Highest tier whose threshold is at or below `points`.
    pub fn tier_for(&self, points: i64) -> Option<&BadgeTier> {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.points_required <= points)
    }

    /// First tier still out of reach.
    pub fn next_tier(&self, points: i64) -> Option<&BadgeTier> {
        self.tiers.iter().find(|t| t.points_required > points)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("badge catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("badge names must not be empty")]
    EmptyName,

    #[error("badge '{0}' has a negative threshold")]
    NegativeThreshold(String),

    #[error("two badges share the threshold {0}")]
    DuplicateThreshold(i64),

    #[error("badge name '{0}' is used twice")]
    DuplicateName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadgeChange {
    Unchanged,
    Changed {
        from: Option<String>,
        to: Option<String>,
    },
}

/// What the dashboards read for a single user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub total_points: i64,
    pub badge: Option<String>,
    pub next_badge: Option<String>,
    pub points_to_next_badge: Option<i64>,
}

impl Engine {
    /// Brings the stored badge in line with the user's current total.
    ///
    /// The write is conditional on the total it was computed from; if an
    /// award lands in between, the evaluation is redone against the new total.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn evaluate_badge(&self, user_id: &UserId) -> EngineResult<BadgeChange> {
        for _ in 0..BADGE_EVAL_RETRIES {
            let user = self.require_user(user_id).await?;
            let target = self
                .catalog()
                .tier_for(user.total_points)
                .map(|t| t.name.clone());

            if target == user.badge {
                return Ok(BadgeChange::Unchanged);
            }

            if self
                .store()
                .set_badge_if_total(user_id, target.as_deref(), user.total_points)
                .await?
            {
                tracing::info!(
                    from = ?user.badge,
                    to = ?target,
                    total_points = user.total_points,
                    "badge updated"
                );
                return Ok(BadgeChange::Changed {
                    from: user.badge,
                    to: target,
                });
            }

            tracing::debug!("total moved during badge evaluation, retrying");
        }

        // whichever award moved the total runs its own evaluation afterwards
        tracing::warn!("badge evaluation gave up under contention");
        Ok(BadgeChange::Unchanged)
    }

    #[instrument(skip(self))]
    pub async fn user_summary(&self, user_id: &UserId) -> EngineResult<UserSummary> {
        let user = self.require_user(user_id).await?;
        let next = self.catalog().next_tier(user.total_points);

        Ok(UserSummary {
            next_badge: next.map(|t| t.name.clone()),
            points_to_next_badge: next.map(|t| t.points_required - user.total_points),
            user_id: user.id,
            display_name: user.display_name,
            role: user.role,
            total_points: user.total_points,
            badge: user.badge,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::fixtures;

    #[test]
    fn test_tier_for_picks_highest_reached() {
        let catalog = BadgeCatalog::default();

        assert_eq!(catalog.tier_for(0), None);
        assert_eq!(catalog.tier_for(99), None);
        assert_eq!(catalog.tier_for(100).unwrap().name, "Bronze");
        assert_eq!(catalog.tier_for(999).unwrap().name, "Silver");
        assert_eq!(catalog.tier_for(1000).unwrap().name, "Gold");
        assert_eq!(catalog.tier_for(1_000_000).unwrap().name, "Platinum");
    }

    #[test]
    fn test_next_tier() {
        let catalog = BadgeCatalog::default();

        assert_eq!(catalog.next_tier(0).unwrap().name, "Bronze");
        assert_eq!(catalog.next_tier(500).unwrap().name, "Gold");
        assert!(catalog.next_tier(2500).is_none());
    }

    #[test]
    fn test_catalog_is_sorted_and_validated() {
        let catalog = BadgeCatalog::from_json(
            r#"[{"name":"Gold","points_required":50},{"name":"Tin","points_required":5}]"#,
        )
        .unwrap();
        assert_eq!(catalog.tiers()[0].name, "Tin");
        assert_eq!(catalog.tier_for(10).unwrap().name, "Tin");

        let dup = BadgeCatalog::new(vec![BadgeTier::new("A", 10), BadgeTier::new("B", 10)]);
        assert!(matches!(dup, Err(CatalogError::DuplicateThreshold(10))));

        let dup = BadgeCatalog::new(vec![BadgeTier::new("A", 10), BadgeTier::new("A", 20)]);
        assert!(matches!(dup, Err(CatalogError::DuplicateName(_))));

        let neg = BadgeCatalog::new(vec![BadgeTier::new("A", -1)]);
        assert!(matches!(neg, Err(CatalogError::NegativeThreshold(_))));

        assert!(BadgeCatalog::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn test_evaluate_promotes_and_is_idempotent() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();
        store.force_total(&user, 640).await;

        let change = engine.evaluate_badge(&user).await.unwrap();
        assert_eq!(
            change,
            BadgeChange::Changed {
                from: None,
                to: Some("Silver".into())
            }
        );
        assert_eq!(engine.evaluate_badge(&user).await.unwrap(), BadgeChange::Unchanged);

        let stored = store.get_user(&user).await.unwrap().unwrap();
        assert_eq!(stored.badge.as_deref(), Some("Silver"));
    }

    #[tokio::test]
    async fn test_evaluate_recomputes_downwards() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();

        store.force_total(&user, 1200).await;
        engine.evaluate_badge(&user).await.unwrap();

        store.force_total(&user, 40).await;
        let change = engine.evaluate_badge(&user).await.unwrap();
        assert_eq!(
            change,
            BadgeChange::Changed {
                from: Some("Gold".into()),
                to: None
            }
        );
    }

    #[tokio::test]
    async fn test_summary_reports_distance_to_next() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();
        store.force_total(&user, 120).await;
        engine.evaluate_badge(&user).await.unwrap();

        let summary = engine.user_summary(&user).await.unwrap();
        assert_eq!(summary.badge.as_deref(), Some("Bronze"));
        assert_eq!(summary.next_badge.as_deref(), Some("Silver"));
        assert_eq!(summary.points_to_next_badge, Some(380));
    }

    #[tokio::test]
    async fn test_evaluate_unknown_user() {
        let (engine, _) = fixtures::engine();
        let err = engine.evaluate_badge(&"ghost".into()).await.unwrap_err();
        assert!(err.is_missing_entity());
    }
}
