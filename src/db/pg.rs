use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Result as SqlxResult, Transaction};
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::db::ScoreFn;
use crate::db::prelude::*;

static DB_POOL: LazyLock<OnceCell<Db>> = LazyLock::new(OnceCell::new);

/// Shared pool, connected and migrated on first use.
pub async fn db_pool(database_url: &str) -> StoreResult<&'static PgPool> {
    Ok(&DB_POOL
        .get_or_try_init(|| async { Db::new_pool(database_url).await })
        .await?
        .pool)
}

struct Db {
    pool: PgPool,
}

impl Db {
    #[instrument(skip(database_url))]
    async fn new_pool(database_url: &str) -> StoreResult<Self> {
        let pool = sqlx::PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("postgres pool ready, migrations applied");

        Ok(Self { pool })
    }
}

pub mod sql_fragment {
    pub const USER_FIELDS: &str = r#"
        id,
        display_name,
        email,
        role,
        total_points,
        badge,
        created_at,
        updated_at
    "#;

    pub const ENROLLMENT_FIELDS: &str = r#"
        user_id,
        course_id,
        status,
        progress_percentage,
        completed_items,
        total_items,
        enrolled_at,
        completed_at
    "#;

    pub const ATTEMPT_FIELDS: &str = r#"
        id,
        user_id,
        quiz_id,
        course_id,
        attempt_number,
        raw_score,
        percentage,
        passed,
        points_earned,
        submitted_at
    "#;

    pub const STATS_FIELDS: &str = r#"
        course_id,
        views_count,
        enrollment_count,
        completion_rate,
        average_quiz_score,
        lesson_count,
        updated_at
    "#;

    pub const CERTIFICATE_FIELDS: &str = r#"
        id,
        user_id,
        course_id,
        learner_name,
        course_title,
        issued_at
    "#;
}

/// Explicit transaction handle; dropping it without `commit` rolls back.
pub struct Tx {
    inner: Option<Transaction<'static, Postgres>>,
}

impl Tx {
    #[instrument(skip(pool))]
    pub async fn begin(pool: &'static PgPool) -> SqlxResult<Self> {
        let inner = pool.begin().await?;
        Ok(Self { inner: Some(inner) })
    }

    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.commit().await
        } else {
            Err(sqlx::Error::Protocol("Transaction already completed".into()))
        }
    }

    #[instrument(skip(self))]
    pub async fn rollback(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.rollback().await
        } else {
            Err(sqlx::Error::Protocol("Transaction already completed".into()))
        }
    }

    fn inner_mut(&mut self) -> SqlxResult<&mut Transaction<'static, Postgres>> {
        self.inner
            .as_mut()
            .ok_or_else(|| sqlx::Error::Protocol("Transaction already completed".into()))
    }

    /// Returns `Some(amount)` if the row was new; `None` on a duplicate key or
    /// an unknown user.
    #[instrument(skip(self, entry), fields(user_id = %entry.user_id, reason_key = %entry.reason_key))]
    pub async fn insert_ledger_row(&mut self, entry: &LedgerEntry) -> SqlxResult<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO points_ledger (
                user_id,
                reason_key,
                amount,
                note,
                created_at
            )
            SELECT $1::text, $2::text, $3::bigint, $4::text, $5::timestamptz
            WHERE EXISTS (SELECT 1 FROM app_user WHERE id = $1::text)
            ON CONFLICT (user_id, reason_key)
            DO NOTHING
            RETURNING amount
            "#,
        )
        .bind(&entry.user_id)
        .bind(&entry.reason_key)
        .bind(entry.amount)
        .bind(&entry.note)
        .bind(entry.created_at)
        .fetch_optional(&mut **self.inner_mut()?)
        .await
    }

    /// Atomic increment; `None` if the result would be negative.
    #[instrument(skip(self))]
    pub async fn increment_total(&mut self, user_id: &UserId, amount: i64) -> SqlxResult<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE app_user
            SET total_points = total_points + $2,
                updated_at = NOW()
            WHERE id = $1
            AND total_points + $2 >= 0
            RETURNING total_points
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut **self.inner_mut()?)
        .await
    }

    /// Row-locks the user until the transaction ends, so no ledger write can
    /// move the total in between.
    #[instrument(skip(self))]
    pub async fn lock_total(&mut self, user_id: &UserId) -> SqlxResult<Option<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT total_points FROM app_user WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **self.inner_mut()?)
            .await
    }

    #[instrument(skip(self))]
    pub async fn ledger_sum(&mut self, user_id: &UserId) -> SqlxResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(amount), 0)::bigint FROM points_ledger WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut **self.inner_mut()?)
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_total(&mut self, user_id: &UserId, total: i64) -> SqlxResult<()> {
        sqlx::query("UPDATE app_user SET total_points = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(total)
            .execute(&mut **self.inner_mut()?)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn find_attempt(&mut self, id: &AttemptId) -> SqlxResult<Option<QuizAttempt>> {
        sqlx::query_as::<_, QuizAttempt>(&format!(
            "SELECT {} FROM quiz_attempt WHERE id = $1",
            sql_fragment::ATTEMPT_FIELDS
        ))
        .bind(id)
        .fetch_optional(&mut **self.inner_mut()?)
        .await
    }

    /// Bumps the per-(user, quiz) counter. The row lock taken here is held
    /// until commit, which serializes concurrent submissions for the pair.
    #[instrument(skip(self))]
    pub async fn claim_attempt_number(&mut self, user_id: &UserId, quiz_id: &QuizId) -> SqlxResult<i32> {
        sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO quiz_attempt_counter (
                user_id,
                quiz_id,
                last_attempt
            )
            VALUES ($1, $2, 1)
            ON CONFLICT (user_id, quiz_id)
            DO UPDATE SET
                last_attempt = quiz_attempt_counter.last_attempt + 1
            RETURNING last_attempt
            "#,
        )
        .bind(user_id)
        .bind(quiz_id)
        .fetch_one(&mut **self.inner_mut()?)
        .await
    }

    #[instrument(skip(self, attempt), fields(attempt_id = %attempt.id))]
    pub async fn insert_attempt(&mut self, attempt: &QuizAttempt) -> SqlxResult<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO quiz_attempt (
                id,
                user_id,
                quiz_id,
                course_id,
                attempt_number,
                raw_score,
                percentage,
                passed,
                points_earned,
                submitted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id)
            DO NOTHING
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.user_id)
        .bind(&attempt.quiz_id)
        .bind(&attempt.course_id)
        .bind(attempt.attempt_number)
        .bind(attempt.raw_score)
        .bind(attempt.percentage)
        .bind(attempt.passed)
        .bind(attempt.points_earned)
        .bind(attempt.submitted_at)
        .execute(&mut **self.inner_mut()?)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: &'static PgPool,
}

impl PgStore {
    pub fn new(pool: &'static PgPool) -> Self {
        Self { pool }
    }

    async fn user_total(&self, id: &UserId) -> SqlxResult<Option<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT total_points FROM app_user WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool)
            .await
    }
}

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: String,
    title: String,
    lesson_ids: Vec<String>,
    quiz_ids: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct QuizRow {
    id: String,
    course_id: String,
    questions: Json<Vec<Question>>,
    pass_threshold: i16,
    reward: Json<RewardPolicy>,
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self))]
    async fn get_user(&self, id: &UserId) -> StoreResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM app_user WHERE id = $1",
            sql_fragment::USER_FIELDS
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn insert_user(&self, user: &User) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO app_user (
                id,
                display_name,
                email,
                role,
                total_points,
                badge,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, 0, NULL, $5, $6)
            ON CONFLICT
            DO NOTHING
            "#,
        )
        .bind(&user.id)
        .bind(&user.display_name)
        .bind(&user.email)
        .bind(user.role)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn set_badge_if_total(
        &self,
        id: &UserId,
        badge: Option<&str>,
        observed_total: i64,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE app_user
            SET badge = $2,
                updated_at = NOW()
            WHERE id = $1
            AND total_points = $3
            "#,
        )
        .bind(id)
        .bind(badge)
        .bind(observed_total)
        .execute(self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn top_users(&self, limit: i64, offset: i64) -> StoreResult<Vec<LeaderboardEntry>> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            r#"
            SELECT
                id,
                total_points,
                ROW_NUMBER() OVER (ORDER BY total_points DESC, created_at ASC, id ASC) AS ranking
            FROM app_user
            ORDER BY ranking ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, total_points, ranking)| LeaderboardEntry {
                user_id: id.into(),
                total_points,
                ranking,
            })
            .collect())
    }

    #[instrument(skip(self, entry), fields(user_id = %entry.user_id, reason_key = %entry.reason_key))]
    async fn append_ledger(&self, entry: &LedgerEntry) -> StoreResult<LedgerWrite> {
        let mut tx = Tx::begin(self.pool).await?;

        if tx.insert_ledger_row(entry).await?.is_none() {
            tx.rollback().await?;
            return Ok(match self.user_total(&entry.user_id).await? {
                Some(total) => LedgerWrite::Duplicate { total },
                None => LedgerWrite::UnknownUser,
            });
        }

        match tx.increment_total(&entry.user_id, entry.amount).await? {
            Some(total) => {
                tx.commit().await?;
                Ok(LedgerWrite::Applied { total })
            }
            None => {
                tx.rollback().await?;
                let total = self.user_total(&entry.user_id).await?.unwrap_or_default();
                Ok(LedgerWrite::WouldGoNegative { total })
            }
        }
    }

    #[instrument(skip(self))]
    async fn ledger_for_user(&self, id: &UserId) -> StoreResult<Vec<LedgerEntry>> {
        Ok(sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT
                user_id,
                reason_key,
                amount,
                note,
                created_at
            FROM points_ledger
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(id)
        .fetch_all(self.pool)
        .await?)
    }

    /// Drift is detected without locks, then each candidate is re-checked
    /// and rewritten under its own row lock. A ledger write racing the scan
    /// either commits before the lock (and is summed) or blocks on it and
    /// increments the repaired total.
    #[instrument(skip(self))]
    async fn repair_user_totals(&self) -> StoreResult<Vec<UserId>> {
        let candidates = sqlx::query_scalar::<_, String>(
            r#"
            SELECT u.id
            FROM app_user u
            LEFT JOIN points_ledger l ON l.user_id = u.id
            GROUP BY u.id, u.total_points
            HAVING u.total_points <> COALESCE(SUM(l.amount), 0)::bigint
            ORDER BY u.id
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        let mut repaired = Vec::new();
        for id in candidates.into_iter().map(UserId::from) {
            let mut tx = Tx::begin(self.pool).await?;

            let Some(total) = tx.lock_total(&id).await? else {
                tx.rollback().await?;
                continue;
            };
            let expected = tx.ledger_sum(&id).await?;

            if total == expected {
                tx.rollback().await?;
                continue;
            }

            tx.set_total(&id, expected).await?;
            tx.commit().await?;

            tracing::debug!(user_id = %id, total, expected, "user total rewritten from ledger");
            repaired.push(id);
        }

        Ok(repaired)
    }

    #[instrument(skip(self))]
    async fn get_course(&self, id: &CourseId) -> StoreResult<Option<Course>> {
        let row = sqlx::query_as::<_, CourseRow>(
            r#"
            SELECT
                c.id,
                c.title,
                ARRAY(
                    SELECT l.id FROM lesson l
                    WHERE l.course_id = c.id
                    ORDER BY l.position, l.id
                ) AS lesson_ids,
                ARRAY(
                    SELECT q.id FROM quiz q
                    WHERE q.course_id = c.id
                    ORDER BY q.id
                ) AS quiz_ids
            FROM course c
            WHERE c.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|r| Course {
            id: r.id.into(),
            title: r.title,
            lesson_ids: r.lesson_ids.into_iter().map(LessonId::from).collect(),
            quiz_ids: r.quiz_ids.into_iter().map(QuizId::from).collect(),
        }))
    }

    #[instrument(skip(self))]
    async fn get_quiz(&self, id: &QuizId) -> StoreResult<Option<Quiz>> {
        let row = sqlx::query_as::<_, QuizRow>(
            r#"
            SELECT
                id,
                course_id,
                questions,
                pass_threshold,
                reward
            FROM quiz
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| {
            let pass_threshold = u8::try_from(r.pass_threshold).map_err(|_| {
                StoreError::Corrupt(format!("quiz {} pass threshold {}", r.id, r.pass_threshold))
            })?;

            Ok(Quiz {
                id: r.id.into(),
                course_id: r.course_id.into(),
                questions: r.questions.0,
                pass_threshold,
                reward: r.reward.0,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn list_course_ids(&self) -> StoreResult<Vec<CourseId>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM course ORDER BY id")
            .fetch_all(self.pool)
            .await?;

        Ok(ids.into_iter().map(CourseId::from).collect())
    }

    #[instrument(skip(self))]
    async fn record_lesson_progress(
        &self,
        user: &UserId,
        course: &CourseId,
        lesson: &LessonId,
        completed: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<LessonTransition> {
        let created = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO lesson_progress (
                user_id,
                course_id,
                lesson_id,
                completed,
                completed_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, lesson_id)
            DO NOTHING
            RETURNING completed
            "#,
        )
        .bind(user)
        .bind(course)
        .bind(lesson)
        .bind(completed)
        .bind(completed.then_some(at))
        .fetch_optional(self.pool)
        .await?;

        if let Some(completed) = created {
            return Ok(if completed {
                LessonTransition::Completed { first_write: true }
            } else {
                LessonTransition::Created
            });
        }

        if !completed {
            return Ok(LessonTransition::Unchanged);
        }

        // the row lock makes exactly one concurrent writer observe `completed = FALSE`
        let res = sqlx::query(
            r#"
            UPDATE lesson_progress
            SET completed = TRUE,
                completed_at = $3
            WHERE user_id = $1
            AND lesson_id = $2
            AND completed = FALSE
            "#,
        )
        .bind(user)
        .bind(lesson)
        .bind(at)
        .execute(self.pool)
        .await?;

        Ok(if res.rows_affected() == 1 {
            LessonTransition::Completed { first_write: false }
        } else {
            LessonTransition::Unchanged
        })
    }

    #[instrument(skip(self))]
    async fn completed_lessons(
        &self,
        user: &UserId,
        course: &CourseId,
    ) -> StoreResult<Vec<LessonId>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT lesson_id
            FROM lesson_progress
            WHERE user_id = $1
            AND course_id = $2
            AND completed
            "#,
        )
        .bind(user)
        .bind(course)
        .fetch_all(self.pool)
        .await?;

        Ok(ids.into_iter().map(LessonId::from).collect())
    }

    #[instrument(skip(self))]
    async fn get_enrollment(
        &self,
        user: &UserId,
        course: &CourseId,
    ) -> StoreResult<Option<Enrollment>> {
        Ok(sqlx::query_as::<_, Enrollment>(&format!(
            "SELECT {} FROM enrollment WHERE user_id = $1 AND course_id = $2",
            sql_fragment::ENROLLMENT_FIELDS
        ))
        .bind(user)
        .bind(course)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self, enrollment), fields(user_id = %enrollment.user_id, course_id = %enrollment.course_id))]
    async fn create_enrollment(&self, enrollment: &Enrollment) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO enrollment (
                user_id,
                course_id,
                status,
                progress_percentage,
                completed_items,
                total_items,
                enrolled_at,
                completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, course_id)
            DO NOTHING
            "#,
        )
        .bind(&enrollment.user_id)
        .bind(&enrollment.course_id)
        .bind(enrollment.status)
        .bind(enrollment.progress_percentage)
        .bind(enrollment.completed_items)
        .bind(enrollment.total_items)
        .bind(enrollment.enrolled_at)
        .bind(enrollment.completed_at)
        .execute(self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn activate_enrollment(&self, user: &UserId, course: &CourseId) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE enrollment
            SET status = 'active'
            WHERE user_id = $1
            AND course_id = $2
            AND status = 'not_started'
            "#,
        )
        .bind(user)
        .bind(course)
        .execute(self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn update_progress(
        &self,
        user: &UserId,
        course: &CourseId,
        completed_items: i32,
        total_items: i32,
        percentage: i32,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE enrollment
            SET completed_items = $3,
                total_items = $4,
                progress_percentage = $5
            WHERE user_id = $1
            AND course_id = $2
            AND status <> 'completed'
            "#,
        )
        .bind(user)
        .bind(course)
        .bind(completed_items)
        .bind(total_items)
        .bind(percentage)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_enrollment(
        &self,
        user: &UserId,
        course: &CourseId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE enrollment
            SET status = 'completed',
                progress_percentage = 100,
                completed_items = total_items,
                completed_at = COALESCE(completed_at, $3)
            WHERE user_id = $1
            AND course_id = $2
            AND status <> 'completed'
            "#,
        )
        .bind(user)
        .bind(course)
        .bind(at)
        .execute(self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn enrollment_tally(&self, course: &CourseId) -> StoreResult<EnrollmentTally> {
        let (total, completed) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed
            FROM enrollment
            WHERE course_id = $1
            "#,
        )
        .bind(course)
        .fetch_one(self.pool)
        .await?;

        Ok(EnrollmentTally { total, completed })
    }

    #[instrument(skip(self, draft, score), fields(attempt_id = %draft.id, user_id = %draft.user_id, quiz_id = %draft.quiz_id))]
    async fn create_attempt(
        &self,
        draft: &AttemptDraft,
        score: ScoreFn<'_>,
    ) -> StoreResult<AttemptWrite> {
        let mut tx = Tx::begin(self.pool).await?;

        if let Some(existing) = tx.find_attempt(&draft.id).await? {
            tx.rollback().await?;
            return Ok(AttemptWrite::Existing(existing));
        }

        let attempt_number = tx.claim_attempt_number(&draft.user_id, &draft.quiz_id).await?;
        let attempt = QuizAttempt::from_draft(draft, attempt_number, score(attempt_number));

        if tx.insert_attempt(&attempt).await? {
            tx.commit().await?;
            return Ok(AttemptWrite::Created(attempt));
        }

        // a concurrent delivery of the same submission won; give back the number
        tx.rollback().await?;
        let mut tx = Tx::begin(self.pool).await?;
        let existing = tx.find_attempt(&draft.id).await?;
        tx.rollback().await?;

        existing
            .map(AttemptWrite::Existing)
            .ok_or_else(|| StoreError::Corrupt(format!("attempt {} lost after conflict", draft.id)))
    }

    #[instrument(skip(self))]
    async fn passed_quizzes(&self, user: &UserId, course: &CourseId) -> StoreResult<Vec<QuizId>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT quiz_id
            FROM quiz_attempt
            WHERE user_id = $1
            AND course_id = $2
            AND passed
            ORDER BY quiz_id
            "#,
        )
        .bind(user)
        .bind(course)
        .fetch_all(self.pool)
        .await?;

        Ok(ids.into_iter().map(QuizId::from).collect())
    }

    #[instrument(skip(self))]
    async fn average_attempt_percentage(&self, course: &CourseId) -> StoreResult<Option<f64>> {
        Ok(sqlx::query_scalar::<_, Option<f64>>(
            "SELECT AVG(percentage)::float8 FROM quiz_attempt WHERE course_id = $1",
        )
        .bind(course)
        .fetch_one(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn get_course_stats(&self, course: &CourseId) -> StoreResult<Option<CourseStats>> {
        Ok(sqlx::query_as::<_, CourseStats>(&format!(
            "SELECT {} FROM course_stats WHERE course_id = $1",
            sql_fragment::STATS_FIELDS
        ))
        .bind(course)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn bump_enrollment_counters(&self, course: &CourseId) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO course_stats (
                course_id,
                views_count,
                enrollment_count,
                updated_at
            )
            VALUES ($1, 1, 1, NOW())
            ON CONFLICT (course_id)
            DO UPDATE SET
                views_count = course_stats.views_count + 1,
                enrollment_count = course_stats.enrollment_count + 1,
                updated_at = NOW()
            "#,
        )
        .bind(course)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_completion_rate(&self, course: &CourseId, rate: i32) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO course_stats (course_id, completion_rate, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (course_id)
            DO UPDATE SET
                completion_rate = $2,
                updated_at = NOW()
            "#,
        )
        .bind(course)
        .bind(rate)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_average_quiz_score(&self, course: &CourseId, score: i32) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO course_stats (course_id, average_quiz_score, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (course_id)
            DO UPDATE SET
                average_quiz_score = $2,
                updated_at = NOW()
            "#,
        )
        .bind(course)
        .bind(score)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, stats), fields(course_id = %stats.course_id))]
    async fn write_reconciled_stats(&self, stats: &CourseStats) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO course_stats (
                course_id,
                views_count,
                enrollment_count,
                completion_rate,
                average_quiz_score,
                lesson_count,
                updated_at
            )
            VALUES ($1, $2, $2, $3, $4, $5, NOW())
            ON CONFLICT (course_id)
            DO UPDATE SET
                views_count = GREATEST(course_stats.views_count, $2),
                enrollment_count = $2,
                completion_rate = $3,
                average_quiz_score = $4,
                lesson_count = $5,
                updated_at = NOW()
            "#,
        )
        .bind(&stats.course_id)
        .bind(stats.enrollment_count)
        .bind(stats.completion_rate)
        .bind(stats.average_quiz_score)
        .bind(stats.lesson_count)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, certificate), fields(user_id = %certificate.user_id, course_id = %certificate.course_id))]
    async fn issue_certificate(&self, certificate: &Certificate) -> StoreResult<Certificate> {
        sqlx::query(
            r#"
            INSERT INTO certificate (
                id,
                user_id,
                course_id,
                learner_name,
                course_title,
                issued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, course_id)
            DO NOTHING
            "#,
        )
        .bind(&certificate.id)
        .bind(&certificate.user_id)
        .bind(&certificate.course_id)
        .bind(&certificate.learner_name)
        .bind(&certificate.course_title)
        .bind(certificate.issued_at)
        .execute(self.pool)
        .await?;

        Ok(sqlx::query_as::<_, Certificate>(&format!(
            "SELECT {} FROM certificate WHERE user_id = $1 AND course_id = $2",
            sql_fragment::CERTIFICATE_FIELDS
        ))
        .bind(&certificate.user_id)
        .bind(&certificate.course_id)
        .fetch_one(self.pool)
        .await?)
    }
}
