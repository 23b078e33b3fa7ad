use tracing::instrument;
use uuid::Uuid;

use crate::db::prelude::*;
use crate::engine::{Engine, EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwardOutcome {
    Applied { total: i64 },
    /// The reason key was already on the user's ledger.
    Duplicate { total: i64 },
    UnknownUser,
    /// Refused because the total would drop below zero.
    Rejected { total: i64 },
    /// Zero amount; nothing written.
    Skipped,
}

impl Engine {
    /// Credits `amount` to the user at most once per `reason`.
    ///
    /// A missing user is logged and reported, never raised: the event that
    /// asked for the award has already been written.
    #[instrument(skip(self), fields(user_id = %user_id, reason_key = %reason))]
    pub async fn award_points(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: ReasonKey,
    ) -> EngineResult<AwardOutcome> {
        if amount < 0 {
            return Err(EngineError::NegativeAward(amount));
        }
        if amount == 0 {
            tracing::debug!("zero award, no ledger entry");
            return Ok(AwardOutcome::Skipped);
        }

        self.apply_entry(LedgerEntry::new(user_id.clone(), reason, amount))
            .await
    }

    /// Administrative adjustment by `delta` (either sign), recorded with a note
    /// under a fresh reason key.
    #[instrument(skip(self, note), fields(user_id = %user_id))]
    pub async fn correct_points(
        &self,
        user_id: &UserId,
        delta: i64,
        note: &str,
    ) -> EngineResult<AwardOutcome> {
        let entry = LedgerEntry::new(
            user_id.clone(),
            ReasonKey::admin_correction(&Uuid::new_v4()),
            delta,
        )
        .with_note(note);

        self.apply_entry(entry).await
    }

    async fn apply_entry(&self, entry: LedgerEntry) -> EngineResult<AwardOutcome> {
        let outcome = match self.store().append_ledger(&entry).await? {
            LedgerWrite::Applied { total } => {
                tracing::info!(amount = entry.amount, total, "points applied");
                self.mirror_entry(&entry, total).await;
                AwardOutcome::Applied { total }
            }
            LedgerWrite::Duplicate { total } => {
                tracing::debug!("reason key already applied, skipping");
                AwardOutcome::Duplicate { total }
            }
            LedgerWrite::UnknownUser => {
                tracing::error!("award for unknown user dropped");
                return Ok(AwardOutcome::UnknownUser);
            }
            LedgerWrite::WouldGoNegative { total } => {
                tracing::warn!(amount = entry.amount, total, "ledger entry would make total negative");
                return Ok(AwardOutcome::Rejected { total });
            }
        };

        // also on duplicates, so a replay repairs a badge write lost mid-flight
        self.evaluate_badge(&entry.user_id).await?;

        Ok(outcome)
    }

    /// Write-through after an applied entry. The total is re-read since a
    /// concurrent entry may have committed after ours; credits only ever
    /// raise the cached score.
    async fn mirror_entry(&self, entry: &LedgerEntry, written: i64) {
        let Some(cache) = self.leaderboard_cache() else {
            return;
        };

        let total = match self.store().get_user(&entry.user_id).await {
            Ok(Some(user)) => user.total_points,
            _ => written,
        };
        let res = if entry.amount >= 0 {
            cache.raise_total(&entry.user_id, total).await
        } else {
            cache.record_total(&entry.user_id, total).await
        };

        if let Err(e) = res {
            tracing::warn!(error = ?e, user_id = %entry.user_id, "leaderboard cache write failed");
        }
    }

    /// Best-effort overwrite of one cached total.
    pub(crate) async fn mirror_total(&self, user_id: &UserId, total: i64) {
        if let Some(cache) = self.leaderboard_cache() {
            if let Err(e) = cache.record_total(user_id, total).await {
                tracing::warn!(error = ?e, user_id = %user_id, "leaderboard cache write failed");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::fixtures;

    #[tokio::test]
    async fn test_award_is_once_per_reason() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();
        let reason = ReasonKey::lesson_complete(&"l-1".into());

        let first = engine.award_points(&user, 10, reason.clone()).await.unwrap();
        let second = engine.award_points(&user, 10, reason).await.unwrap();

        assert_eq!(first, AwardOutcome::Applied { total: 10 });
        assert_eq!(second, AwardOutcome::Duplicate { total: 10 });
        assert_eq!(store.ledger_for_user(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_award_promotes_badge() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();

        engine
            .award_points(&user, 150, ReasonKey::course_bonus(&"c-1".into()))
            .await
            .unwrap();

        let stored = store.get_user(&user).await.unwrap().unwrap();
        assert_eq!(stored.total_points, 150);
        assert_eq!(stored.badge.as_deref(), Some("Bronze"));
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_an_error() {
        let (engine, _) = fixtures::engine();

        let outcome = engine
            .award_points(&"ghost".into(), 10, ReasonKey::course_bonus(&"c-1".into()))
            .await
            .unwrap();
        assert_eq!(outcome, AwardOutcome::UnknownUser);
    }

    #[tokio::test]
    async fn test_negative_award_refused() {
        let (engine, _) = fixtures::engine();

        let err = engine
            .award_points(&fixtures::LEARNER.into(), -5, ReasonKey::course_bonus(&"c".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NegativeAward(-5)));
    }

    #[tokio::test]
    async fn test_zero_award_leaves_no_entry() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();

        let outcome = engine
            .award_points(&user, 0, ReasonKey::quiz_attempt(&"a-1".into()))
            .await
            .unwrap();
        assert_eq!(outcome, AwardOutcome::Skipped);
        assert!(store.ledger_for_user(&user).await.unwrap().is_empty());

        // a later non-zero award under the same key still lands
        let outcome = engine
            .award_points(&user, 5, ReasonKey::quiz_attempt(&"a-1".into()))
            .await
            .unwrap();
        assert_eq!(outcome, AwardOutcome::Applied { total: 5 });
    }

    #[tokio::test]
    async fn test_corrections_can_lower_but_not_below_zero() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();

        engine
            .award_points(&user, 600, ReasonKey::course_bonus(&"c-1".into()))
            .await
            .unwrap();

        let lowered = engine.correct_points(&user, -550, "duplicate import").await.unwrap();
        assert_eq!(lowered, AwardOutcome::Applied { total: 50 });

        let stored = store.get_user(&user).await.unwrap().unwrap();
        assert_eq!(stored.badge, None);

        let refused = engine.correct_points(&user, -51, "too far").await.unwrap();
        assert_eq!(refused, AwardOutcome::Rejected { total: 50 });

        let ledger = store.ledger_for_user(&user).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].note.as_deref(), Some("duplicate import"));
    }

    #[tokio::test]
    async fn test_concurrent_awards_sum() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let engine = engine.clone();
                let user = user.clone();
                tokio::spawn(async move {
                    let reason = ReasonKey::quiz_attempt(&format!("a-{}", i % 10).into());
                    engine.award_points(&user, 5, reason).await.unwrap()
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        let stored = store.get_user(&user).await.unwrap().unwrap();
        assert_eq!(stored.total_points, 50);
    }
}
