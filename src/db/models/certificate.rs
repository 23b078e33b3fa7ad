use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CourseId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Certificate {
    pub id: String,
    pub user_id: UserId,
    pub course_id: CourseId,
    pub learner_name: String,
    pub course_title: String,
    pub issued_at: DateTime<Utc>,
}
