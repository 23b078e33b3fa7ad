use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::db::prelude::*;
use crate::engine::{Engine, EngineError, EngineResult};

/// How a course's quizzes count towards its completion items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizCompletionPolicy {
    /// All quizzes together are one item, satisfied by any passed quiz.
    #[default]
    SingleBucket,
    /// Every quiz is its own item.
    PerQuiz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressPlan {
    pub completed_items: i32,
    pub total_items: i32,
    pub percentage: i32,
    pub complete: bool,
}

/// Derives progress for one enrollment from the learner's records.
///
/// A course with nothing to complete stays at 0 % and is never complete.
pub fn plan(
    course: &Course,
    completed_lessons: &HashSet<LessonId>,
    passed_quizzes: &HashSet<QuizId>,
    policy: QuizCompletionPolicy,
) -> ProgressPlan {
    let lessons_total = course.lesson_ids.len();
    let lessons_done = course
        .lesson_ids
        .iter()
        .filter(|id| completed_lessons.contains(*id))
        .count();

    let quizzes_passed = course
        .quiz_ids
        .iter()
        .filter(|id| passed_quizzes.contains(*id))
        .count();
    let (quiz_total, quiz_done) = match policy {
        QuizCompletionPolicy::SingleBucket => (
            usize::from(course.has_quiz()),
            usize::from(quizzes_passed > 0),
        ),
        QuizCompletionPolicy::PerQuiz => (course.quiz_ids.len(), quizzes_passed),
    };

    let total = lessons_total + quiz_total;
    let done = lessons_done + quiz_done;
    let percentage = if total == 0 {
        0
    } else {
        (done as f64 / total as f64 * 100.0).round() as i32
    };

    ProgressPlan {
        completed_items: done as i32,
        total_items: total as i32,
        percentage,
        complete: total > 0 && done == total,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// The enrollment was already terminal; nothing recomputed beyond
    /// retrying the course bonus.
    AlreadyCompleted,
    Updated {
        plan: ProgressPlan,
        /// Whether this call moved the enrollment to `completed`.
        completed_now: bool,
    },
}

impl Engine {
    /// Recomputes an enrollment's progress and completes it once every item
    /// is done.
    #[instrument(skip(self), fields(user_id = %user_id, course_id = %course_id))]
    pub async fn refresh_progress(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
    ) -> EngineResult<ProgressOutcome> {
        let course = self.require_course(course_id).await?;
        let enrollment = self
            .store()
            .get_enrollment(user_id, course_id)
            .await?
            .ok_or_else(|| EngineError::MissingEnrollment {
                user: user_id.clone(),
                course: course_id.clone(),
            })?;

        if enrollment.status.is_terminal() {
            // the bonus is keyed per course, so this only pays if the write
            // after the transition was lost
            self.award_course_bonus(user_id, course_id).await?;
            return Ok(ProgressOutcome::AlreadyCompleted);
        }

        if enrollment.status == EnrollmentStatus::NotStarted
            && self.store().activate_enrollment(user_id, course_id).await?
        {
            tracing::info!("enrollment activated");
        }

        let lessons: HashSet<LessonId> = self
            .store()
            .completed_lessons(user_id, course_id)
            .await?
            .into_iter()
            .collect();
        let quizzes: HashSet<QuizId> = self
            .store()
            .passed_quizzes(user_id, course_id)
            .await?
            .into_iter()
            .collect();

        let plan = plan(&course, &lessons, &quizzes, self.config().quiz_policy);
        self.store()
            .update_progress(
                user_id,
                course_id,
                plan.completed_items,
                plan.total_items,
                plan.percentage,
            )
            .await?;

        tracing::debug!(
            completed_items = plan.completed_items,
            total_items = plan.total_items,
            percentage = plan.percentage,
            "progress recomputed"
        );

        let completed_now = plan.complete && self.enter_completed(user_id, course_id).await?;

        Ok(ProgressOutcome::Updated {
            plan,
            completed_now,
        })
    }

    /// Performs `-> completed`. Only the call that wins the transition pays
    /// the course bonus and refreshes the course completion rate.
    async fn enter_completed(&self, user_id: &UserId, course_id: &CourseId) -> EngineResult<bool> {
        if !self
            .store()
            .complete_enrollment(user_id, course_id, Utc::now())
            .await?
        {
            tracing::debug!("enrollment already completed by a concurrent handler");
            return Ok(false);
        }

        tracing::info!("enrollment completed");

        self.award_course_bonus(user_id, course_id).await?;
        self.best_effort_completion_rate(course_id).await;

        Ok(true)
    }

    async fn award_course_bonus(&self, user_id: &UserId, course_id: &CourseId) -> EngineResult<()> {
        self.award_points(
            user_id,
            self.config().course_bonus,
            ReasonKey::course_bonus(course_id),
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::events::DomainEvent;
    use crate::engine::fixtures;

    fn set<T: std::hash::Hash + Eq + Clone>(items: &[T]) -> HashSet<T> {
        items.iter().cloned().collect()
    }

    #[test]
    fn test_plan_counts_quiz_bucket_once() {
        let mut course = fixtures::course();
        course.quiz_ids.push("q-extra".into());
        let lessons = set(&fixtures::lessons());

        let before = plan(&course, &lessons, &HashSet::new(), QuizCompletionPolicy::SingleBucket);
        assert_eq!(before.total_items, 4);
        assert_eq!(before.completed_items, 3);
        assert_eq!(before.percentage, 75);
        assert!(!before.complete);

        let after = plan(
            &course,
            &lessons,
            &set(&["q-extra".into()]),
            QuizCompletionPolicy::SingleBucket,
        );
        assert_eq!(after.percentage, 100);
        assert!(after.complete);
    }

    #[test]
    fn test_plan_per_quiz() {
        let mut course = fixtures::course();
        course.quiz_ids.push("q-extra".into());
        let lessons = set(&fixtures::lessons());

        let partial = plan(
            &course,
            &lessons,
            &set(&[fixtures::QUIZ.into()]),
            QuizCompletionPolicy::PerQuiz,
        );
        assert_eq!(partial.total_items, 5);
        assert_eq!(partial.percentage, 80);
        assert!(!partial.complete);
    }

    #[test]
    fn test_plan_ignores_foreign_records_and_empty_courses() {
        let course = fixtures::course();
        let stray = plan(
            &course,
            &set(&["other-lesson".into()]),
            &set(&["other-quiz".into()]),
            QuizCompletionPolicy::SingleBucket,
        );
        assert_eq!(stray.completed_items, 0);

        let empty = Course {
            id: "c-empty".into(),
            title: "Nothing yet".into(),
            lesson_ids: vec![],
            quiz_ids: vec![],
        };
        let empty = plan(&empty, &HashSet::new(), &HashSet::new(), QuizCompletionPolicy::SingleBucket);
        assert_eq!(empty.percentage, 0);
        assert!(!empty.complete);
    }

    fn lesson_done(lesson: &str) -> DomainEvent {
        DomainEvent::LessonProgressWrite {
            user_id: fixtures::LEARNER.into(),
            course_id: fixtures::COURSE.into(),
            lesson_id: lesson.into(),
            completed: true,
        }
    }

    fn passing_attempt(id: &str) -> DomainEvent {
        DomainEvent::QuizAttemptCreate {
            attempt_id: id.into(),
            user_id: fixtures::LEARNER.into(),
            quiz_id: fixtures::QUIZ.into(),
            course_id: fixtures::COURSE.into(),
            answers: vec![Some(0); 5],
        }
    }

    #[tokio::test]
    async fn test_course_completes_once() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();
        let course: CourseId = fixtures::COURSE.into();

        engine
            .enroll(&user, &course, EnrollmentStatus::Active)
            .await
            .unwrap();

        for lesson in ["l-1", "l-2", "l-3"] {
            engine.handle(lesson_done(lesson)).await.unwrap();
        }

        let enrollment = store.get_enrollment(&user, &course).await.unwrap().unwrap();
        assert_eq!(enrollment.progress_percentage, 75);
        assert_eq!(enrollment.status, EnrollmentStatus::Active);

        // final event delivered twice
        engine.handle(passing_attempt("sub-1")).await.unwrap();
        engine.handle(passing_attempt("sub-1")).await.unwrap();

        let enrollment = store.get_enrollment(&user, &course).await.unwrap().unwrap();
        assert_eq!(enrollment.progress_percentage, 100);
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert!(enrollment.completed_at.is_some());

        let bonus = ReasonKey::course_bonus(&course);
        let ledger = store.ledger_for_user(&user).await.unwrap();
        assert_eq!(ledger.iter().filter(|e| e.reason_key == bonus).count(), 1);

        // 3 lessons * 10 + first attempt 10 + bonus 50
        let stored = store.get_user(&user).await.unwrap().unwrap();
        assert_eq!(stored.total_points, 90);

        let stats = store.get_course_stats(&course).await.unwrap().unwrap();
        assert_eq!(stats.completion_rate, 100);
    }

    #[tokio::test]
    async fn test_completed_enrollment_is_frozen() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();
        let course: CourseId = fixtures::COURSE.into();

        engine
            .enroll(&user, &course, EnrollmentStatus::Active)
            .await
            .unwrap();
        for lesson in ["l-1", "l-2", "l-3"] {
            engine.handle(lesson_done(lesson)).await.unwrap();
        }
        engine.handle(passing_attempt("sub-1")).await.unwrap();

        let outcome = engine.refresh_progress(&user, &course).await.unwrap();
        assert_eq!(outcome, ProgressOutcome::AlreadyCompleted);

        let enrollment = store.get_enrollment(&user, &course).await.unwrap().unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_completed_enrollment_without_bonus_is_paid_on_replay() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();
        let course: CourseId = fixtures::COURSE.into();

        engine
            .enroll(&user, &course, EnrollmentStatus::Active)
            .await
            .unwrap();
        for lesson in ["l-1", "l-2", "l-3"] {
            engine.handle(lesson_done(lesson)).await.unwrap();
        }

        // transition committed, bonus write lost
        assert!(
            store
                .complete_enrollment(&user, &course, Utc::now())
                .await
                .unwrap()
        );

        engine.handle(passing_attempt("sub-1")).await.unwrap();
        engine.handle(passing_attempt("sub-1")).await.unwrap();

        let bonus = ReasonKey::course_bonus(&course);
        let ledger = store.ledger_for_user(&user).await.unwrap();
        assert_eq!(ledger.iter().filter(|e| e.reason_key == bonus).count(), 1);

        // 3 lessons * 10 + first attempt 10 + bonus 50
        let stored = store.get_user(&user).await.unwrap().unwrap();
        assert_eq!(stored.total_points, 90);

        let outcome = engine.refresh_progress(&user, &course).await.unwrap();
        assert_eq!(outcome, ProgressOutcome::AlreadyCompleted);
        assert_eq!(store.get_user(&user).await.unwrap().unwrap().total_points, 90);
    }

    #[tokio::test]
    async fn test_first_lesson_activates() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();
        let course: CourseId = fixtures::COURSE.into();

        engine
            .enroll(&user, &course, EnrollmentStatus::NotStarted)
            .await
            .unwrap();
        engine
            .handle(DomainEvent::LessonProgressWrite {
                user_id: user.clone(),
                course_id: course.clone(),
                lesson_id: "l-1".into(),
                completed: false,
            })
            .await
            .unwrap();

        let enrollment = store.get_enrollment(&user, &course).await.unwrap().unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert_eq!(enrollment.progress_percentage, 0);
    }

    #[tokio::test]
    async fn test_missing_enrollment_is_reported() {
        let (engine, _) = fixtures::engine();

        let err = engine
            .refresh_progress(&fixtures::LEARNER.into(), &fixtures::COURSE.into())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingEnrollment { .. }));
    }
}
