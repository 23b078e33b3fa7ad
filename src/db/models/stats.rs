use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CourseId;

/// Derived per-course rollups. Never edited by hand; see `engine::aggregate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CourseStats {
    pub course_id: CourseId,
    pub views_count: i64,
    pub enrollment_count: i64,
    pub completion_rate: i32,
    pub average_quiz_score: i32,
    pub lesson_count: i32,
    pub updated_at: DateTime<Utc>,
}

impl CourseStats {
    pub fn empty(course_id: CourseId) -> Self {
        Self {
            course_id,
            views_count: 0,
            enrollment_count: 0,
            completion_rate: 0,
            average_quiz_score: 0,
            lesson_count: 0,
            updated_at: Utc::now(),
        }
    }
}
