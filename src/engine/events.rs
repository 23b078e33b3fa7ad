use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{Instrument, instrument};

use crate::db::prelude::*;
use crate::engine::progress::ProgressOutcome;
use crate::engine::scoring::score_attempt;
use crate::engine::{Engine, EngineError, EngineResult};

/// A write observed on the platform's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    LessonProgressWrite {
        user_id: UserId,
        course_id: CourseId,
        lesson_id: LessonId,
        completed: bool,
    },
    QuizAttemptCreate {
        /// Submission id; a redelivered submission carries the same one.
        attempt_id: AttemptId,
        user_id: UserId,
        quiz_id: QuizId,
        course_id: CourseId,
        #[serde(default)]
        answers: Vec<Option<usize>>,
    },
    EnrollmentWrite {
        user_id: UserId,
        course_id: CourseId,
        status: EnrollmentStatus,
        #[serde(default)]
        previous_status: Option<EnrollmentStatus>,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::LessonProgressWrite { .. } => "lesson_progress_write",
            DomainEvent::QuizAttemptCreate { .. } => "quiz_attempt_create",
            DomainEvent::EnrollmentWrite { .. } => "enrollment_write",
        }
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            DomainEvent::LessonProgressWrite { user_id, .. }
            | DomainEvent::QuizAttemptCreate { user_id, .. }
            | DomainEvent::EnrollmentWrite { user_id, .. } => user_id,
        }
    }
}

impl Engine {
    pub async fn handle(&self, event: DomainEvent) -> EngineResult<()> {
        match event {
            DomainEvent::LessonProgressWrite {
                user_id,
                course_id,
                lesson_id,
                completed,
            } => {
                self.on_lesson_progress(&user_id, &course_id, &lesson_id, completed)
                    .await
            }
            DomainEvent::QuizAttemptCreate {
                attempt_id,
                user_id,
                quiz_id,
                course_id,
                answers,
            } => {
                self.on_quiz_attempt(attempt_id, user_id, quiz_id, course_id, &answers)
                    .await
            }
            DomainEvent::EnrollmentWrite {
                user_id,
                course_id,
                status,
                previous_status,
            } => {
                self.on_enrollment_write(&user_id, &course_id, status, previous_status)
                    .await
            }
        }
    }

    #[instrument(skip(self), fields(user_id = %user_id, course_id = %course_id, lesson_id = %lesson_id))]
    async fn on_lesson_progress(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
        lesson_id: &LessonId,
        completed: bool,
    ) -> EngineResult<()> {
        self.require_user(user_id).await?;
        let course = self.require_course(course_id).await?;
        if !course.lesson_ids.contains(lesson_id) {
            return Err(EngineError::UnknownLesson {
                lesson: lesson_id.clone(),
                course: course_id.clone(),
            });
        }

        let transition = self
            .store()
            .record_lesson_progress(user_id, course_id, lesson_id, completed, Utc::now())
            .await?;
        tracing::debug!(?transition, "lesson progress recorded");

        if !completed && !transition.first_write() {
            return Ok(());
        }

        if completed {
            // replays land on the same reason key and are dropped by the ledger
            self.award_points(
                user_id,
                self.config().lesson_points,
                ReasonKey::lesson_complete(lesson_id),
            )
            .await?;
        }

        self.progress_step(user_id, course_id).await
    }

    #[instrument(skip(self, answers), fields(attempt_id = %attempt_id, user_id = %user_id, quiz_id = %quiz_id))]
    async fn on_quiz_attempt(
        &self,
        attempt_id: AttemptId,
        user_id: UserId,
        quiz_id: QuizId,
        course_id: CourseId,
        answers: &[Option<usize>],
    ) -> EngineResult<()> {
        self.require_user(&user_id).await?;
        let quiz = self
            .store()
            .get_quiz(&quiz_id)
            .await?
            .ok_or_else(|| EngineError::MissingQuiz(quiz_id.clone()))?;
        if quiz.course_id != course_id {
            return Err(EngineError::QuizCourseMismatch {
                quiz: quiz_id,
                course: course_id,
            });
        }

        let draft = AttemptDraft {
            id: attempt_id,
            user_id,
            quiz_id,
            course_id,
            submitted_at: Utc::now(),
        };
        let grade = |attempt_number: i32| score_attempt(&quiz, answers, attempt_number);

        let write = self.store().create_attempt(&draft, &grade).await?;
        let attempt = write.attempt();
        if write.is_created() {
            tracing::info!(
                attempt_number = attempt.attempt_number,
                percentage = attempt.percentage,
                passed = attempt.passed,
                points_earned = attempt.points_earned,
                "quiz attempt scored"
            );
        } else {
            tracing::debug!("submission already recorded, replaying follow-ups");
        }

        self.award_points(
            &attempt.user_id,
            attempt.points_earned,
            ReasonKey::quiz_attempt(&attempt.id),
        )
        .await?;

        self.best_effort_average_score(&attempt.course_id).await;

        self.progress_step(&attempt.user_id, &attempt.course_id)
            .await
    }

    #[instrument(skip(self), fields(user_id = %user_id, course_id = %course_id))]
    async fn on_enrollment_write(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
        status: EnrollmentStatus,
        previous_status: Option<EnrollmentStatus>,
    ) -> EngineResult<()> {
        if previous_status == Some(status) {
            tracing::debug!(?status, "status unchanged, nothing to do");
            return Ok(());
        }

        self.require_user(user_id).await?;
        self.require_course(course_id).await?;

        match status {
            EnrollmentStatus::NotStarted | EnrollmentStatus::Active => {
                let created = self.enroll(user_id, course_id, status).await?;
                if !created
                    && status == EnrollmentStatus::Active
                    && self.store().activate_enrollment(user_id, course_id).await?
                {
                    tracing::info!("enrollment activated");
                }
            }
            EnrollmentStatus::Completed => match self.refresh_progress(user_id, course_id).await? {
                ProgressOutcome::AlreadyCompleted => {
                    tracing::debug!("enrollment already completed");
                }
                ProgressOutcome::Updated { plan, .. } if !plan.complete => {
                    tracing::warn!(
                        completed_items = plan.completed_items,
                        total_items = plan.total_items,
                        "completion requested before all items are done, ignoring"
                    );
                }
                ProgressOutcome::Updated { .. } => {}
            },
        }

        Ok(())
    }

    /// Progress recompute after an award. A learner without an enrollment
    /// keeps the points but has no progress to track.
    async fn progress_step(&self, user_id: &UserId, course_id: &CourseId) -> EngineResult<()> {
        match self.refresh_progress(user_id, course_id).await {
            Ok(_) => Ok(()),
            Err(EngineError::MissingEnrollment { .. }) => {
                tracing::warn!(user_id = %user_id, course_id = %course_id, "no enrollment, progress skipped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Runs one event to completion and logs the outcome; never fails.
pub async fn dispatch(engine: &Engine, event: DomainEvent) {
    let span = tracing::info_span!("event", kind = event.kind(), user_id = %event.user_id());

    async move {
        match engine.handle(event).await {
            Ok(()) => tracing::debug!("event handled"),
            Err(e) if e.is_missing_entity() => {
                tracing::warn!(error = %e, "event references a missing entity, dropped")
            }
            Err(e) => tracing::error!(error = ?e, "event handler failed"),
        }
    }
    .instrument(span)
    .await
}

/// Producer side of the bounded event queue.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: Sender<DomainEvent>,
}

impl EventQueue {
    pub fn bounded(capacity: usize) -> (Self, Receiver<DomainEvent>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, event: DomainEvent) -> EngineResult<()> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::QueueFull,
            TrySendError::Closed(_) => EngineError::QueueClosed,
        })
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Stops intake; workers drain what is queued and exit.
    pub fn close(&self) {
        self.tx.close();
    }
}

pub fn spawn_workers(engine: Engine, rx: Receiver<DomainEvent>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let engine = engine.clone();
            let rx = rx.clone();

            tokio::spawn(async move {
                tracing::debug!(worker, "event worker started");
                while let Ok(event) = rx.recv().await {
                    dispatch(&engine, event).await;
                }
                tracing::debug!(worker, "event queue closed, worker exiting");
            })
        })
        .collect()
}

/// Periodic batch reconciliation. The first run happens one period after start.
pub fn spawn_reconciler(engine: Engine, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.tick().await;

        loop {
            tick.tick().await;
            if let Err(e) = engine.reconcile_all().await {
                tracing::error!(error = ?e, "scheduled reconciliation failed");
            }
        }
    })
}
