use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CourseId, UserId};

/// Enrollment lifecycle. Variants are declared in lifecycle order so `Ord`
/// follows the only direction a status is allowed to move.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
pub enum EnrollmentStatus {
    NotStarted,
    Active,
    Completed,
}

impl EnrollmentStatus {
    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_advance_to(self, next: EnrollmentStatus) -> bool {
        next > self
    }

    pub fn is_terminal(self) -> bool {
        self == EnrollmentStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Enrollment {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub status: EnrollmentStatus,
    pub progress_percentage: i32,
    pub completed_items: i32,
    pub total_items: i32,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn new(user_id: UserId, course_id: CourseId, status: EnrollmentStatus) -> Self {
        Self {
            user_id,
            course_id,
            status,
            progress_percentage: 0,
            completed_items: 0,
            total_items: 0,
            enrolled_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnrollmentTally {
    pub total: i64,
    pub completed: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        use EnrollmentStatus::*;

        assert!(NotStarted.can_advance_to(Active));
        assert!(NotStarted.can_advance_to(Completed));
        assert!(Active.can_advance_to(Completed));

        assert!(!Active.can_advance_to(NotStarted));
        assert!(!Completed.can_advance_to(Active));
        assert!(!Completed.can_advance_to(Completed));
        assert!(Completed.is_terminal());
    }
}
