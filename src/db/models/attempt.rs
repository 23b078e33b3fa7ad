use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttemptId, CourseId, QuizId, UserId};

/// Result of grading one submission, before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptScore {
    pub raw_score: i32,
    pub total_questions: i32,
    pub percentage: i32,
    pub passed: bool,
    pub points_earned: i64,
}

/// A submission that has not yet been assigned an attempt number.
#[derive(Debug, Clone)]
pub struct AttemptDraft {
    pub id: AttemptId,
    pub user_id: UserId,
    pub quiz_id: QuizId,
    pub course_id: CourseId,
    pub submitted_at: DateTime<Utc>,
}

/// Persisted quiz attempt; immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuizAttempt {
    pub id: AttemptId,
    pub user_id: UserId,
    pub quiz_id: QuizId,
    pub course_id: CourseId,
    pub attempt_number: i32,
    pub raw_score: i32,
    pub percentage: i32,
    pub passed: bool,
    pub points_earned: i64,
    pub submitted_at: DateTime<Utc>,
}

impl QuizAttempt {
    pub fn from_draft(draft: &AttemptDraft, attempt_number: i32, score: AttemptScore) -> Self {
        Self {
            id: draft.id.clone(),
            user_id: draft.user_id.clone(),
            quiz_id: draft.quiz_id.clone(),
            course_id: draft.course_id.clone(),
            attempt_number,
            raw_score: score.raw_score,
            percentage: score.percentage,
            passed: score.passed,
            points_earned: score.points_earned,
            submitted_at: draft.submitted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptWrite {
    Created(QuizAttempt),
    /// The submission id was already recorded; carries the stored attempt.
    Existing(QuizAttempt),
}

impl AttemptWrite {
    pub fn attempt(&self) -> &QuizAttempt {
        match self {
            AttemptWrite::Created(a) | AttemptWrite::Existing(a) => a,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, AttemptWrite::Created(_))
    }
}
