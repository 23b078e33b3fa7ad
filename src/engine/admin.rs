use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::db::prelude::*;
use crate::engine::ledger::AwardOutcome;
use crate::engine::{Engine, EngineError, EngineResult};

#[derive(Debug, Clone, Deserialize)]
pub struct NewInstructor {
    pub id: Option<UserId>,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Enrolled,
    AlreadyEnrolled,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollResult {
    pub user_id: UserId,
    #[serde(flatten)]
    pub outcome: EnrollOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointsCorrection {
    pub user_id: UserId,
    pub total_points: i64,
    pub badge: Option<String>,
}

impl Engine {
    /// Creates the enrollment row if missing. A new row feeds the course
    /// counters; returns whether this call created it.
    #[instrument(skip(self), fields(user_id = %user_id, course_id = %course_id))]
    pub async fn enroll(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
        status: EnrollmentStatus,
    ) -> EngineResult<bool> {
        if status.is_terminal() {
            return Err(EngineError::CompletedOnCreate);
        }

        let created = self
            .store()
            .create_enrollment(&Enrollment::new(user_id.clone(), course_id.clone(), status))
            .await?;

        if created {
            tracing::info!(?status, "enrollment created");
            self.on_enrollment_created(course_id).await;
        }

        Ok(created)
    }

    #[instrument(skip(self, req), fields(display_name = %req.display_name))]
    pub async fn create_instructor(&self, req: NewInstructor) -> AdminResult<User> {
        let display_name = req.display_name.trim();
        if display_name.is_empty() {
            return Err(AdminError::Invalid("display_name must not be empty".into()));
        }

        let email = req
            .email
            .map(|e| e.trim().to_owned())
            .filter(|e| !e.is_empty());
        if let Some(email) = &email {
            if !email.contains('@') {
                return Err(AdminError::Invalid(format!("'{email}' is not an email address")));
            }
        }

        let id = req
            .id
            .unwrap_or_else(|| UserId::from(Uuid::new_v4().to_string()));
        let user = User::new(id, display_name.to_owned(), email, Role::Instructor);

        if !self.store().insert_user(&user).await.map_err(EngineError::from)? {
            return Err(AdminError::DuplicateUser(user.id));
        }

        tracing::info!(user_id = %user.id, "instructor created");
        Ok(user)
    }

    /// Enrolls each user independently; one bad id does not fail the batch.
    #[instrument(skip(self, user_ids), fields(course_id = %course_id, count = user_ids.len()))]
    pub async fn bulk_enroll(
        &self,
        course_id: &CourseId,
        user_ids: &[UserId],
    ) -> AdminResult<Vec<EnrollResult>> {
        self.require_course(course_id).await.map_err(|e| match e {
            EngineError::MissingCourse(id) => AdminError::UnknownCourse(id),
            other => AdminError::Engine(other),
        })?;

        let mut results = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let outcome = match self.enroll_one(user_id, course_id).await {
                Ok(true) => EnrollOutcome::Enrolled,
                Ok(false) => EnrollOutcome::AlreadyEnrolled,
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "bulk enroll item failed");
                    EnrollOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };

            results.push(EnrollResult {
                user_id: user_id.clone(),
                outcome,
            });
        }

        Ok(results)
    }

    async fn enroll_one(&self, user_id: &UserId, course_id: &CourseId) -> AdminResult<bool> {
        if self.store().get_user(user_id).await.map_err(EngineError::from)?.is_none() {
            return Err(AdminError::UnknownUser(user_id.clone()));
        }

        Ok(self
            .enroll(user_id, course_id, EnrollmentStatus::NotStarted)
            .await?)
    }

    /// Issues (or returns the already issued) certificate for a completed
    /// enrollment.
    #[instrument(skip(self), fields(user_id = %user_id, course_id = %course_id))]
    pub async fn generate_certificate(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
    ) -> AdminResult<Certificate> {
        let store = self.store();
        let user = store
            .get_user(user_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| AdminError::UnknownUser(user_id.clone()))?;
        let course = store
            .get_course(course_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| AdminError::UnknownCourse(course_id.clone()))?;

        let completed = store
            .get_enrollment(user_id, course_id)
            .await
            .map_err(EngineError::from)?
            .is_some_and(|e| e.status == EnrollmentStatus::Completed);
        if !completed {
            return Err(AdminError::NotCompleted {
                user: user_id.clone(),
                course: course_id.clone(),
            });
        }

        let certificate = Certificate {
            id: Uuid::new_v4().to_string(),
            user_id: user.id,
            course_id: course.id,
            learner_name: user.display_name,
            course_title: course.title,
            issued_at: Utc::now(),
        };

        let stored = store
            .issue_certificate(&certificate)
            .await
            .map_err(EngineError::from)?;
        if stored.id == certificate.id {
            tracing::info!(certificate_id = %stored.id, "certificate issued");
        }

        Ok(stored)
    }

    #[instrument(skip(self, note), fields(user_id = %user_id))]
    pub async fn admin_correct_points(
        &self,
        user_id: &UserId,
        delta: i64,
        note: &str,
    ) -> AdminResult<PointsCorrection> {
        if delta == 0 {
            return Err(AdminError::Invalid("delta must not be zero".into()));
        }
        if note.trim().is_empty() {
            return Err(AdminError::Invalid("a note is required for corrections".into()));
        }

        match self.correct_points(user_id, delta, note.trim()).await? {
            AwardOutcome::UnknownUser => Err(AdminError::UnknownUser(user_id.clone())),
            AwardOutcome::Rejected { total } => Err(AdminError::NegativeTotal { total, delta }),
            AwardOutcome::Applied { .. }
            | AwardOutcome::Duplicate { .. }
            | AwardOutcome::Skipped => {
                let user = self.require_user(user_id).await?;
                Ok(PointsCorrection {
                    user_id: user.id,
                    total_points: user.total_points,
                    badge: user.badge,
                })
            }
        }
    }
}

pub type AdminResult<T> = core::result::Result<T, AdminError>;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("user {0} not found")]
    UnknownUser(UserId),

    #[error("course {0} not found")]
    UnknownCourse(CourseId),

    #[error("user {0} already exists")]
    DuplicateUser(UserId),

    #[error("user {user} has not completed course {course}")]
    NotCompleted { user: UserId, course: CourseId },

    #[error("correction of {delta} would take the total ({total}) below zero")]
    NegativeTotal { total: i64, delta: i64 },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::fixtures;

    fn instructor(name: &str, email: Option<&str>) -> NewInstructor {
        NewInstructor {
            id: None,
            display_name: name.into(),
            email: email.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_create_instructor() {
        let (engine, store) = fixtures::engine();

        let user = engine
            .create_instructor(instructor("  Grace ", Some("grace@example.com")))
            .await
            .unwrap();
        assert_eq!(user.role, Role::Instructor);
        assert_eq!(user.display_name, "Grace");
        assert!(store.get_user(&user.id).await.unwrap().is_some());

        let invalid = engine.create_instructor(instructor("", None)).await;
        assert!(matches!(invalid, Err(AdminError::Invalid(_))));

        let invalid = engine.create_instructor(instructor("Ada", Some("nope"))).await;
        assert!(matches!(invalid, Err(AdminError::Invalid(_))));

        let mut taken = instructor("Ferris again", None);
        taken.id = Some(fixtures::LEARNER.into());
        let dup = engine.create_instructor(taken).await;
        assert!(matches!(dup, Err(AdminError::DuplicateUser(_))));
    }

    #[tokio::test]
    async fn test_bulk_enroll_reports_per_item() {
        let (engine, store) = fixtures::engine();
        let course: CourseId = fixtures::COURSE.into();

        let results = engine
            .bulk_enroll(&course, &[fixtures::LEARNER.into(), "ghost".into()])
            .await
            .unwrap();
        assert_eq!(results[0].outcome, EnrollOutcome::Enrolled);
        assert!(matches!(results[1].outcome, EnrollOutcome::Failed { .. }));

        let again = engine
            .bulk_enroll(&course, &[fixtures::LEARNER.into()])
            .await
            .unwrap();
        assert_eq!(again[0].outcome, EnrollOutcome::AlreadyEnrolled);

        let stats = store.get_course_stats(&course).await.unwrap().unwrap();
        assert_eq!(stats.enrollment_count, 1);

        let missing = engine.bulk_enroll(&"nope".into(), &[]).await;
        assert!(matches!(missing, Err(AdminError::UnknownCourse(_))));
    }

    #[tokio::test]
    async fn test_certificate_requires_completion() {
        let (engine, store) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();
        let course: CourseId = fixtures::COURSE.into();

        engine
            .enroll(&user, &course, EnrollmentStatus::Active)
            .await
            .unwrap();
        let early = engine.generate_certificate(&user, &course).await;
        assert!(matches!(early, Err(AdminError::NotCompleted { .. })));

        store.complete_enrollment(&user, &course, Utc::now()).await.unwrap();

        let first = engine.generate_certificate(&user, &course).await.unwrap();
        let second = engine.generate_certificate(&user, &course).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.learner_name, "Ferris");
        assert_eq!(first.course_title, "Intro to Rust");
    }

    #[tokio::test]
    async fn test_admin_correction() {
        let (engine, _) = fixtures::engine();
        let user: UserId = fixtures::LEARNER.into();

        let raised = engine.admin_correct_points(&user, 120, "migration").await.unwrap();
        assert_eq!(raised.total_points, 120);
        assert_eq!(raised.badge.as_deref(), Some("Bronze"));

        let refused = engine.admin_correct_points(&user, -200, "oops").await;
        assert!(matches!(refused, Err(AdminError::NegativeTotal { total: 120, .. })));

        let empty = engine.admin_correct_points(&user, 5, " ").await;
        assert!(matches!(empty, Err(AdminError::Invalid(_))));

        let ghost = engine.admin_correct_points(&"ghost".into(), 5, "x").await;
        assert!(matches!(ghost, Err(AdminError::UnknownUser(_))));
    }
}
