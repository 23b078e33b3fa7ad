use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CourseId, LessonId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LessonProgress {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub lesson_id: LessonId,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a lesson-progress write did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LessonTransition {
    /// First interaction; record created without completion.
    Created,
    /// The completed flag went false -> true on this write.
    Completed { first_write: bool },
    /// Nothing changed (duplicate or a non-completing touch).
    Unchanged,
}

impl LessonTransition {
    /// Whether this was the first write ever seen for the triple.
    pub fn first_write(self) -> bool {
        matches!(
            self,
            LessonTransition::Created | LessonTransition::Completed { first_write: true }
        )
    }
}
