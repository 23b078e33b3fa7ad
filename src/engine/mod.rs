//! Progression and gamification rules.
//!
//! Every handler is written against the [`Store`] seam and is safe to replay:
//! guards are either state comparisons performed by the store (lesson flag,
//! enrollment status, attempt id) or the ledger's `(user, reason_key)`
//! uniqueness.

use std::sync::Arc;

use thiserror::Error;

use crate::db::StoreError;
use crate::db::prelude::*;
use crate::db::redis::LeaderboardCache;
use crate::engine::badge::{BadgeCatalog, CatalogError};
use crate::engine::progress::QuizCompletionPolicy;
use crate::util::env::Env;

pub mod admin;
pub mod aggregate;
pub mod badge;
pub mod events;
pub mod ledger;
pub mod progress;
pub mod scoring;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lesson_points: i64,
    pub course_bonus: i64,
    pub quiz_policy: QuizCompletionPolicy,
    pub catalog: BadgeCatalog,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lesson_points: crate::constants::DEFAULT_LESSON_POINTS,
            course_bonus: crate::constants::DEFAULT_COURSE_BONUS,
            quiz_policy: QuizCompletionPolicy::default(),
            catalog: BadgeCatalog::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env(env: &Env) -> EngineResult<Self> {
        let catalog = match env.badge_catalog.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => BadgeCatalog::from_json(raw)?,
            _ => BadgeCatalog::default(),
        };

        if env.lesson_completion_points < 0 || env.course_completion_bonus < 0 {
            return Err(EngineError::NegativeAward(
                env.lesson_completion_points.min(env.course_completion_bonus),
            ));
        }

        Ok(Self {
            lesson_points: env.lesson_completion_points,
            course_bonus: env.course_completion_bonus,
            quiz_policy: env.quiz_completion_policy,
            catalog,
        })
    }
}

/// Shared handle to the rules engine; cheap to clone into workers and routes.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    leaderboard: Option<LeaderboardCache>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            leaderboard: None,
        }
    }

    pub fn with_leaderboard(mut self, cache: LeaderboardCache) -> Self {
        self.leaderboard = Some(cache);
        self
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &BadgeCatalog {
        &self.config.catalog
    }

    pub fn leaderboard_cache(&self) -> Option<&LeaderboardCache> {
        self.leaderboard.as_ref()
    }

    pub(crate) async fn require_course(&self, id: &CourseId) -> EngineResult<Course> {
        self.store
            .get_course(id)
            .await?
            .ok_or_else(|| EngineError::MissingCourse(id.clone()))
    }

    pub(crate) async fn require_user(&self, id: &UserId) -> EngineResult<User> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| EngineError::MissingUser(id.clone()))
    }
}

pub type EngineResult<T> = core::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("user {0} not found")]
    MissingUser(UserId),

    #[error("course {0} not found")]
    MissingCourse(CourseId),

    #[error("quiz {0} not found")]
    MissingQuiz(QuizId),

    #[error("user {user} is not enrolled in course {course}")]
    MissingEnrollment { user: UserId, course: CourseId },

    #[error("lesson {lesson} is not part of course {course}")]
    UnknownLesson { lesson: LessonId, course: CourseId },

    #[error("quiz {quiz} does not belong to course {course}")]
    QuizCourseMismatch { quiz: QuizId, course: CourseId },

    #[error("an enrollment cannot start out completed")]
    CompletedOnCreate,

    #[error("award amounts must be non-negative (got {0})")]
    NegativeAward(i64),

    #[error("event queue is full")]
    QueueFull,

    #[error("event queue is closed")]
    QueueClosed,
}

impl EngineError {
    /// Missing entities abort a handler but are not infrastructure failures.
    pub fn is_missing_entity(&self) -> bool {
        matches!(
            self,
            EngineError::MissingUser(_)
                | EngineError::MissingCourse(_)
                | EngineError::MissingQuiz(_)
                | EngineError::MissingEnrollment { .. }
                | EngineError::UnknownLesson { .. }
                | EngineError::QuizCourseMismatch { .. }
        )
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const LEARNER: &str = "u-learner";
    pub const COURSE: &str = "c-rust";
    pub const QUIZ: &str = "q-final";

    pub fn lessons() -> Vec<LessonId> {
        vec!["l-1".into(), "l-2".into(), "l-3".into()]
    }

    pub fn course() -> Course {
        Course {
            id: COURSE.into(),
            title: "Intro to Rust".into(),
            lesson_ids: lessons(),
            quiz_ids: vec![QUIZ.into()],
        }
    }

    pub fn option(text: &str, correct: bool) -> QuizOption {
        QuizOption {
            text: text.into(),
            correct,
        }
    }

    /// Five questions; option 0 is always the correct one.
    pub fn quiz(reward: RewardPolicy) -> Quiz {
        let questions = (0..5)
            .map(|i| Question {
                prompt: format!("question {i}"),
                options: vec![option("right", true), option("wrong", false)],
                points: 1,
            })
            .collect();

        Quiz {
            id: QUIZ.into(),
            course_id: COURSE.into(),
            questions,
            pass_threshold: 70,
            reward,
        }
    }

    pub fn bucketed() -> RewardPolicy {
        RewardPolicy::Bucketed {
            attempt1: 10,
            attempt2: 7,
            attempt3: 5,
            attempt4_plus: 3,
        }
    }

    pub fn learner() -> User {
        User::new(LEARNER.into(), "Ferris".into(), None, Role::Learner)
    }

    pub fn store() -> MemoryStore {
        MemoryStore::new()
            .with_user(learner())
            .with_course(course())
            .with_quiz(quiz(bucketed()))
    }

    pub fn engine_with(store: Arc<MemoryStore>) -> Engine {
        Engine::new(store, EngineConfig::default())
    }

    pub fn engine() -> (Engine, Arc<MemoryStore>) {
        let store = Arc::new(store());
        (engine_with(store.clone()), store)
    }
}
