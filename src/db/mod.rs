use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::models::attempt::{AttemptDraft, AttemptScore, AttemptWrite};
use crate::db::models::certificate::Certificate;
use crate::db::models::course::{Course, Quiz};
use crate::db::models::enrollment::{Enrollment, EnrollmentTally};
use crate::db::models::ledger::{LedgerEntry, LedgerWrite};
use crate::db::models::progress::LessonTransition;
use crate::db::models::stats::CourseStats;
use crate::db::models::user::{LeaderboardEntry, User};
use crate::db::models::{CourseId, LessonId, QuizId, UserId};
use crate::util::env;

pub mod memory;
pub mod models;
pub mod pg;
pub mod redis;

pub mod prelude {
    pub use crate::db::memory::MemoryStore;
    pub use crate::db::models::attempt::{AttemptDraft, AttemptScore, AttemptWrite, QuizAttempt};
    pub use crate::db::models::certificate::Certificate;
    pub use crate::db::models::course::{Course, Question, Quiz, QuizOption, RewardPolicy};
    pub use crate::db::models::enrollment::{Enrollment, EnrollmentStatus, EnrollmentTally};
    pub use crate::db::models::ledger::{LedgerEntry, LedgerWrite, ReasonKey};
    pub use crate::db::models::progress::{LessonProgress, LessonTransition};
    pub use crate::db::models::stats::CourseStats;
    pub use crate::db::models::user::{LeaderboardEntry, Role, User};
    pub use crate::db::models::{AttemptId, CourseId, LessonId, QuizId, UserId};
    pub use crate::db::models::{PaginatedResponse, Pagination};
    pub use crate::db::pg::PgStore;
    pub use crate::db::{Store, StoreError, StoreResult};
}

/// Grades a submission once its attempt number is known.
pub type ScoreFn<'a> = &'a (dyn Fn(i32) -> AttemptScore + Send + Sync);

/// Persistence seam for the engine.
///
/// Every method that guards a state transition reports whether *this* call
/// performed it, so handlers can be replayed under at-least-once delivery
/// without repeating side effects.
#[async_trait]
pub trait Store: Send + Sync {
    // users

    async fn get_user(&self, id: &UserId) -> StoreResult<Option<User>>;

    /// Inserts a user; `Ok(false)` if the id is taken.
    async fn insert_user(&self, user: &User) -> StoreResult<bool>;

    /// Writes `badge` only while the stored total still equals
    /// `observed_total`. Returns whether the write happened.
    async fn set_badge_if_total(
        &self,
        id: &UserId,
        badge: Option<&str>,
        observed_total: i64,
    ) -> StoreResult<bool>;

    async fn top_users(&self, limit: i64, offset: i64) -> StoreResult<Vec<LeaderboardEntry>>;

    // points ledger

    /// Appends an entry and moves the user's total by `entry.amount` in one
    /// atomic step. Duplicate `(user_id, reason_key)` pairs are not applied.
    async fn append_ledger(&self, entry: &LedgerEntry) -> StoreResult<LedgerWrite>;

    async fn ledger_for_user(&self, id: &UserId) -> StoreResult<Vec<LedgerEntry>>;

    /// Resets every user's total to the sum of their ledger; returns the ids
    /// whose stored total had drifted.
    async fn repair_user_totals(&self) -> StoreResult<Vec<UserId>>;

    // course structure

    async fn get_course(&self, id: &CourseId) -> StoreResult<Option<Course>>;

    async fn get_quiz(&self, id: &QuizId) -> StoreResult<Option<Quiz>>;

    async fn list_course_ids(&self) -> StoreResult<Vec<CourseId>>;

    // lesson progress

    async fn record_lesson_progress(
        &self,
        user: &UserId,
        course: &CourseId,
        lesson: &LessonId,
        completed: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<LessonTransition>;

    async fn completed_lessons(&self, user: &UserId, course: &CourseId)
    -> StoreResult<Vec<LessonId>>;

    // enrollment

    async fn get_enrollment(
        &self,
        user: &UserId,
        course: &CourseId,
    ) -> StoreResult<Option<Enrollment>>;

    /// Creates the enrollment row; `Ok(false)` if the pair already exists.
    async fn create_enrollment(&self, enrollment: &Enrollment) -> StoreResult<bool>;

    /// `not_started -> active`; returns whether this call moved it.
    async fn activate_enrollment(&self, user: &UserId, course: &CourseId) -> StoreResult<bool>;

    /// Stores progress for an enrollment that is not yet completed.
    async fn update_progress(
        &self,
        user: &UserId,
        course: &CourseId,
        completed_items: i32,
        total_items: i32,
        percentage: i32,
    ) -> StoreResult<()>;

    /// Moves the enrollment to `completed` (progress 100, timestamp set once).
    /// Returns `true` only for the call that performed the transition.
    async fn complete_enrollment(
        &self,
        user: &UserId,
        course: &CourseId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn enrollment_tally(&self, course: &CourseId) -> StoreResult<EnrollmentTally>;

    // quiz attempts

    /// Assigns the next attempt number for `(user, quiz)` and stores the
    /// graded attempt in a single serialized step.
    async fn create_attempt(&self, draft: &AttemptDraft, score: ScoreFn<'_>)
    -> StoreResult<AttemptWrite>;

    async fn passed_quizzes(&self, user: &UserId, course: &CourseId) -> StoreResult<Vec<QuizId>>;

    /// Mean attempt percentage over every attempt in the course.
    async fn average_attempt_percentage(&self, course: &CourseId) -> StoreResult<Option<f64>>;

    // course aggregates

    async fn get_course_stats(&self, course: &CourseId) -> StoreResult<Option<CourseStats>>;

    /// Adds one view and one enrollment to the course rollup.
    async fn bump_enrollment_counters(&self, course: &CourseId) -> StoreResult<()>;

    async fn set_completion_rate(&self, course: &CourseId, rate: i32) -> StoreResult<()>;

    async fn set_average_quiz_score(&self, course: &CourseId, score: i32) -> StoreResult<()>;

    /// Overwrites the reconcilable columns. `views_count` is only raised to
    /// the enrollment count, never lowered.
    async fn write_reconciled_stats(&self, stats: &CourseStats) -> StoreResult<()>;

    // certificates

    /// Stores the certificate unless one exists for the pair; returns the
    /// stored one either way.
    async fn issue_certificate(&self, certificate: &Certificate) -> StoreResult<Certificate>;
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    EnvError(#[from] env::EnvErr),

    #[error("unable to load seed data: {0}")]
    Seed(String),

    #[error("stored row violates an invariant: {0}")]
    Corrupt(String),
}
