use chrono::Utc;
use serde::Serialize;
use tracing::instrument;

use crate::constants::LEADERBOARD_WARM_SIZE;
use crate::db::prelude::*;
use crate::engine::{Engine, EngineResult};

/// `round(completed / total * 100)`, 0 for a course nobody enrolled in.
pub fn completion_rate(tally: EnrollmentTally) -> i32 {
    if tally.total <= 0 {
        return 0;
    }

    (tally.completed as f64 / tally.total as f64 * 100.0).round() as i32
}

pub fn average_score(mean: Option<f64>) -> i32 {
    mean.map_or(0, |m| m.round() as i32)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub courses: usize,
    pub failed_courses: usize,
    pub repaired_users: Vec<UserId>,
}

impl Engine {
    /// Course rollups as last written; a course without activity reads as zeros.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn course_stats(&self, course_id: &CourseId) -> EngineResult<CourseStats> {
        let course = self.require_course(course_id).await?;
        Ok(self
            .store()
            .get_course_stats(course_id)
            .await?
            .unwrap_or_else(|| CourseStats {
                lesson_count: course.lesson_ids.len() as i32,
                ..CourseStats::empty(course.id)
            }))
    }

    /// Incremental path for a new enrollment. Failures are logged only.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn on_enrollment_created(&self, course_id: &CourseId) {
        if let Err(e) = self.store().bump_enrollment_counters(course_id).await {
            tracing::warn!(error = ?e, "failed to bump enrollment counters");
        }

        self.best_effort_completion_rate(course_id).await;
    }

    /// Full-scan recompute of the completion rate.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn refresh_completion_rate(&self, course_id: &CourseId) -> EngineResult<i32> {
        let tally = self.store().enrollment_tally(course_id).await?;
        let rate = completion_rate(tally);
        self.store().set_completion_rate(course_id, rate).await?;

        tracing::debug!(
            total = tally.total,
            completed = tally.completed,
            rate,
            "completion rate refreshed"
        );
        Ok(rate)
    }

    /// Full-scan recompute of the mean attempt percentage.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn refresh_average_quiz_score(&self, course_id: &CourseId) -> EngineResult<i32> {
        let score = average_score(self.store().average_attempt_percentage(course_id).await?);
        self.store().set_average_quiz_score(course_id, score).await?;

        Ok(score)
    }

    pub(crate) async fn best_effort_completion_rate(&self, course_id: &CourseId) {
        if let Err(e) = self.refresh_completion_rate(course_id).await {
            tracing::warn!(error = ?e, course_id = %course_id, "completion rate refresh failed");
        }
    }

    pub(crate) async fn best_effort_average_score(&self, course_id: &CourseId) {
        if let Err(e) = self.refresh_average_quiz_score(course_id).await {
            tracing::warn!(error = ?e, course_id = %course_id, "average quiz score refresh failed");
        }
    }

    /// Rewrites the head of the Redis leaderboard from the store. No-op
    /// without a cache.
    pub async fn warm_leaderboard_cache(&self) {
        let Some(cache) = self.leaderboard_cache() else {
            return;
        };

        let totals = match self.store().top_users(LEADERBOARD_WARM_SIZE, 0).await {
            Ok(entries) => entries
                .into_iter()
                .map(|e| (e.user_id, e.total_points))
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(error = ?e, "unable to read totals for the leaderboard cache");
                return;
            }
        };

        match cache.record_many(&totals).await {
            Ok(()) => tracing::debug!(count = totals.len(), "leaderboard cache warmed"),
            Err(e) => tracing::warn!(error = ?e, "leaderboard cache warm-up failed"),
        }
    }

    /// Authoritative recompute of one course's rollups from source records.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn reconcile_course(&self, course_id: &CourseId) -> EngineResult<CourseStats> {
        let course = self.require_course(course_id).await?;
        let tally = self.store().enrollment_tally(course_id).await?;
        let average = self.store().average_attempt_percentage(course_id).await?;

        let stats = CourseStats {
            course_id: course.id,
            views_count: 0,
            enrollment_count: tally.total,
            completion_rate: completion_rate(tally),
            average_quiz_score: average_score(average),
            lesson_count: course.lesson_ids.len() as i32,
            updated_at: Utc::now(),
        };
        self.store().write_reconciled_stats(&stats).await?;

        Ok(stats)
    }

    /// Batch reconciliation: repairs drifted user totals from the ledger,
    /// then recomputes every course. One failing course does not stop the rest.
    #[instrument(skip(self))]
    pub async fn reconcile_all(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        report.repaired_users = self.store().repair_user_totals().await?;
        for user_id in &report.repaired_users {
            tracing::warn!(user_id = %user_id, "user total drifted from ledger, repaired");

            if let Err(e) = self.evaluate_badge(user_id).await {
                tracing::warn!(error = ?e, user_id = %user_id, "badge re-evaluation failed");
            }
            if let Ok(Some(user)) = self.store().get_user(user_id).await {
                self.mirror_total(user_id, user.total_points).await;
            }
        }

        self.warm_leaderboard_cache().await;

        for course_id in self.store().list_course_ids().await? {
            report.courses += 1;
            if let Err(e) = self.reconcile_course(&course_id).await {
                report.failed_courses += 1;
                tracing::error!(error = ?e, course_id = %course_id, "course reconciliation failed");
            }
        }

        tracing::info!(
            courses = report.courses,
            failed_courses = report.failed_courses,
            repaired_users = report.repaired_users.len(),
            "reconciliation finished"
        );

        Ok(report)
    }
}
