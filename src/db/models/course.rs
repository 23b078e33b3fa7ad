use serde::{Deserialize, Serialize};

use super::{CourseId, LessonId, QuizId};
use crate::constants::{DEFAULT_DECAY_FACTOR, DEFAULT_PASS_THRESHOLD};

/// Structural view of a course: the items a learner has to complete.
///
/// Content itself (titles, bodies, media) is owned elsewhere; the engine only
/// needs to know which lessons and quizzes exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Course {
    pub id: CourseId,
    pub title: String,
    pub lesson_ids: Vec<LessonId>,
    pub quiz_ids: Vec<QuizId>,
}

impl Course {
    pub fn has_quiz(&self) -> bool {
        !self.quiz_ids.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizOption {
    pub text: String,
    #[serde(default)]
    pub correct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub prompt: String,
    pub options: Vec<QuizOption>,
    #[serde(default = "default_question_points")]
    pub points: i64,
}

#[inline]
const fn default_question_points() -> i64 {
    1
}

#[inline]
const fn default_pass_threshold() -> u8 {
    DEFAULT_PASS_THRESHOLD
}

#[inline]
const fn default_decay_factor() -> f64 {
    DEFAULT_DECAY_FACTOR
}

/// How many points a quiz attempt is worth, chosen per quiz.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RewardPolicy {
    Bucketed {
        attempt1: i64,
        attempt2: i64,
        attempt3: i64,
        attempt4_plus: i64,
    },
    Decayed {
        base_points: i64,
        #[serde(default = "default_decay_factor")]
        decay_factor: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quiz {
    pub id: QuizId,
    pub course_id: CourseId,
    pub questions: Vec<Question>,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: u8,
    pub reward: RewardPolicy,
}
