use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttemptId, CourseId, LessonId, UserId};

/// Deduplication key of a ledger entry; unique per user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ReasonKey(pub String);

impl ReasonKey {
    pub fn lesson_complete(lesson_id: &LessonId) -> Self {
        ReasonKey(format!("lesson:{lesson_id}:complete"))
    }

    pub fn quiz_attempt(attempt_id: &AttemptId) -> Self {
        ReasonKey(format!("quiz:{attempt_id}"))
    }

    pub fn course_bonus(course_id: &CourseId) -> Self {
        ReasonKey(format!("course:{course_id}:bonus"))
    }

    pub fn admin_correction(correction_id: &uuid::Uuid) -> Self {
        ReasonKey(format!("admin:{correction_id}"))
    }
}

impl fmt::Display for ReasonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub reason_key: ReasonKey,
    pub amount: i64,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(user_id: UserId, reason_key: ReasonKey, amount: i64) -> Self {
        Self {
            user_id,
            reason_key,
            amount,
            note: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Outcome of appending to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerWrite {
    Applied { total: i64 },
    Duplicate { total: i64 },
    UnknownUser,
    /// Rejected because the running total would drop below zero.
    WouldGoNegative { total: i64 },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reason_key_formats() {
        assert_eq!(
            ReasonKey::lesson_complete(&"l1".into()).0,
            "lesson:l1:complete"
        );
        assert_eq!(ReasonKey::quiz_attempt(&"a9".into()).0, "quiz:a9");
        assert_eq!(ReasonKey::course_bonus(&"c2".into()).0, "course:c2:bonus");
    }
}
