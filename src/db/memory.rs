use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::db::prelude::*;
use crate::db::ScoreFn;

/// In-process `Store` used for development runs and tests.
///
/// A single mutex guards all state, so every trait method is atomic with
/// respect to every other one.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, User>,
    ledger: Vec<LedgerEntry>,
    ledger_keys: HashSet<(UserId, ReasonKey)>,
    courses: HashMap<CourseId, Course>,
    quizzes: HashMap<QuizId, Quiz>,
    lesson_progress: HashMap<(UserId, LessonId), LessonProgress>,
    enrollments: HashMap<(UserId, CourseId), Enrollment>,
    attempts: HashMap<AttemptId, QuizAttempt>,
    attempt_counters: HashMap<(UserId, QuizId), i32>,
    stats: HashMap<CourseId, CourseStats>,
    certificates: HashMap<(UserId, CourseId), Certificate>,
}

/// Fixture format accepted by `MemoryStore::from_seed_file`.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub courses: Vec<Course>,
    #[serde(default)]
    pub quizzes: Vec<Quiz>,
}

#[derive(Debug, Deserialize)]
pub struct SeedUser {
    pub id: UserId,
    pub display_name: String,
    pub email: Option<String>,
    #[serde(default = "default_seed_role")]
    pub role: Role,
}

#[inline]
const fn default_seed_role() -> Role {
    Role::Learner
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let mut store = Self::new();
        for user in seed.users {
            store = store.with_user(User::new(user.id, user.display_name, user.email, user.role));
        }
        for course in seed.courses {
            store = store.with_course(course);
        }
        for quiz in seed.quizzes {
            store = store.with_quiz(quiz);
        }

        store
    }

    #[instrument]
    pub async fn from_seed_file(path: &Path) -> StoreResult<Self> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::Seed(format!("{}: {e}", path.display())))?;
        let seed: Seed =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Seed(e.to_string()))?;

        tracing::info!(
            users = seed.users.len(),
            courses = seed.courses.len(),
            quizzes = seed.quizzes.len(),
            "loaded in-memory seed"
        );

        Ok(Self::from_seed(seed))
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.state.get_mut().users.insert(user.id.clone(), user);
        self
    }

    pub fn with_course(mut self, course: Course) -> Self {
        self.state.get_mut().courses.insert(course.id.clone(), course);
        self
    }

    pub fn with_quiz(mut self, quiz: Quiz) -> Self {
        self.state.get_mut().quizzes.insert(quiz.id.clone(), quiz);
        self
    }

    /// Overwrites a user's total without touching the ledger, to simulate drift.
    #[cfg(test)]
    pub async fn force_total(&self, id: &UserId, total: i64) {
        if let Some(user) = self.state.lock().await.users.get_mut(id) {
            user.total_points = total;
        }
    }

    /// Overwrites a course rollup, to simulate a lost incremental update.
    #[cfg(test)]
    pub async fn force_stats(&self, stats: CourseStats) {
        self.state
            .lock()
            .await
            .stats
            .insert(stats.course_id.clone(), stats);
    }
}

impl State {
    fn stats_entry(&mut self, course: &CourseId) -> &mut CourseStats {
        self.stats
            .entry(course.clone())
            .or_insert_with(|| CourseStats::empty(course.clone()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, id: &UserId) -> StoreResult<Option<User>> {
        Ok(self.state.lock().await.users.get(id).cloned())
    }

    async fn insert_user(&self, user: &User) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.users.contains_key(&user.id) {
            return Ok(false);
        }

        state.users.insert(user.id.clone(), user.clone());
        Ok(true)
    }

    async fn set_badge_if_total(
        &self,
        id: &UserId,
        badge: Option<&str>,
        observed_total: i64,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.users.get_mut(id) {
            Some(user) if user.total_points == observed_total => {
                user.badge = badge.map(str::to_string);
                user.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn top_users(&self, limit: i64, offset: i64) -> StoreResult<Vec<LeaderboardEntry>> {
        let state = self.state.lock().await;
        let mut users: Vec<&User> = state.users.values().collect();
        users.sort_by(|a, b| {
            b.total_points
                .cmp(&a.total_points)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(users
            .into_iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|(idx, u)| LeaderboardEntry {
                user_id: u.id.clone(),
                total_points: u.total_points,
                ranking: idx as i64 + 1,
            })
            .collect())
    }

    async fn append_ledger(&self, entry: &LedgerEntry) -> StoreResult<LedgerWrite> {
        let mut state = self.state.lock().await;
        let key = (entry.user_id.clone(), entry.reason_key.clone());

        let total = match state.users.get(&entry.user_id) {
            Some(user) => user.total_points,
            None => return Ok(LedgerWrite::UnknownUser),
        };

        if state.ledger_keys.contains(&key) {
            return Ok(LedgerWrite::Duplicate { total });
        }

        if total + entry.amount < 0 {
            return Ok(LedgerWrite::WouldGoNegative { total });
        }

        state.ledger_keys.insert(key);
        state.ledger.push(entry.clone());

        let user = state
            .users
            .get_mut(&entry.user_id)
            .ok_or_else(|| StoreError::Corrupt(format!("user {} vanished", entry.user_id)))?;
        user.total_points += entry.amount;
        user.updated_at = Utc::now();

        Ok(LedgerWrite::Applied {
            total: user.total_points,
        })
    }

    async fn ledger_for_user(&self, id: &UserId) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| &e.user_id == id)
            .cloned()
            .collect())
    }

    async fn repair_user_totals(&self) -> StoreResult<Vec<UserId>> {
        let mut state = self.state.lock().await;

        let mut sums: HashMap<UserId, i64> = HashMap::new();
        for entry in &state.ledger {
            *sums.entry(entry.user_id.clone()).or_default() += entry.amount;
        }

        let mut repaired = Vec::new();
        for user in state.users.values_mut() {
            let expected = sums.get(&user.id).copied().unwrap_or_default();
            if user.total_points != expected {
                user.total_points = expected;
                user.updated_at = Utc::now();
                repaired.push(user.id.clone());
            }
        }

        repaired.sort();
        Ok(repaired)
    }

    async fn get_course(&self, id: &CourseId) -> StoreResult<Option<Course>> {
        Ok(self.state.lock().await.courses.get(id).cloned())
    }

    async fn get_quiz(&self, id: &QuizId) -> StoreResult<Option<Quiz>> {
        Ok(self.state.lock().await.quizzes.get(id).cloned())
    }

    async fn list_course_ids(&self) -> StoreResult<Vec<CourseId>> {
        let mut ids: Vec<CourseId> = self.state.lock().await.courses.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn record_lesson_progress(
        &self,
        user: &UserId,
        course: &CourseId,
        lesson: &LessonId,
        completed: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<LessonTransition> {
        let mut state = self.state.lock().await;
        let key = (user.clone(), lesson.clone());

        match state.lesson_progress.get_mut(&key) {
            None => {
                state.lesson_progress.insert(
                    key,
                    LessonProgress {
                        user_id: user.clone(),
                        course_id: course.clone(),
                        lesson_id: lesson.clone(),
                        completed,
                        completed_at: completed.then_some(at),
                    },
                );

                Ok(if completed {
                    LessonTransition::Completed { first_write: true }
                } else {
                    LessonTransition::Created
                })
            }
            Some(record) if completed && !record.completed => {
                record.completed = true;
                record.completed_at = Some(at);
                Ok(LessonTransition::Completed { first_write: false })
            }
            Some(_) => Ok(LessonTransition::Unchanged),
        }
    }

    async fn completed_lessons(
        &self,
        user: &UserId,
        course: &CourseId,
    ) -> StoreResult<Vec<LessonId>> {
        let state = self.state.lock().await;
        Ok(state
            .lesson_progress
            .values()
            .filter(|p| &p.user_id == user && &p.course_id == course && p.completed)
            .map(|p| p.lesson_id.clone())
            .collect())
    }

    async fn get_enrollment(
        &self,
        user: &UserId,
        course: &CourseId,
    ) -> StoreResult<Option<Enrollment>> {
        let state = self.state.lock().await;
        Ok(state
            .enrollments
            .get(&(user.clone(), course.clone()))
            .cloned())
    }

    async fn create_enrollment(&self, enrollment: &Enrollment) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let key = (enrollment.user_id.clone(), enrollment.course_id.clone());
        if state.enrollments.contains_key(&key) {
            return Ok(false);
        }

        state.enrollments.insert(key, enrollment.clone());
        Ok(true)
    }

    async fn activate_enrollment(&self, user: &UserId, course: &CourseId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.enrollments.get_mut(&(user.clone(), course.clone())) {
            Some(e) if e.status == EnrollmentStatus::NotStarted => {
                e.status = EnrollmentStatus::Active;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(
        &self,
        user: &UserId,
        course: &CourseId,
        completed_items: i32,
        total_items: i32,
        percentage: i32,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(e) = state.enrollments.get_mut(&(user.clone(), course.clone())) {
            if !e.status.is_terminal() {
                e.completed_items = completed_items;
                e.total_items = total_items;
                e.progress_percentage = percentage;
            }
        }

        Ok(())
    }

    async fn complete_enrollment(
        &self,
        user: &UserId,
        course: &CourseId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.enrollments.get_mut(&(user.clone(), course.clone())) {
            Some(e) if !e.status.is_terminal() => {
                e.status = EnrollmentStatus::Completed;
                e.progress_percentage = 100;
                e.completed_items = e.total_items;
                e.completed_at = e.completed_at.or(Some(at));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn enrollment_tally(&self, course: &CourseId) -> StoreResult<EnrollmentTally> {
        let state = self.state.lock().await;
        Ok(state
            .enrollments
            .values()
            .filter(|e| &e.course_id == course)
            .fold(EnrollmentTally::default(), |mut tally, e| {
                tally.total += 1;
                if e.status == EnrollmentStatus::Completed {
                    tally.completed += 1;
                }
                tally
            }))
    }

    async fn create_attempt(
        &self,
        draft: &AttemptDraft,
        score: ScoreFn<'_>,
    ) -> StoreResult<AttemptWrite> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.attempts.get(&draft.id) {
            return Ok(AttemptWrite::Existing(existing.clone()));
        }

        let counter = state
            .attempt_counters
            .entry((draft.user_id.clone(), draft.quiz_id.clone()))
            .or_insert(0);
        *counter += 1;
        let attempt_number = *counter;

        let attempt = QuizAttempt::from_draft(draft, attempt_number, score(attempt_number));
        state.attempts.insert(attempt.id.clone(), attempt.clone());

        Ok(AttemptWrite::Created(attempt))
    }

    async fn passed_quizzes(&self, user: &UserId, course: &CourseId) -> StoreResult<Vec<QuizId>> {
        let state = self.state.lock().await;
        let mut ids: Vec<QuizId> = state
            .attempts
            .values()
            .filter(|a| &a.user_id == user && &a.course_id == course && a.passed)
            .map(|a| a.quiz_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        ids.sort();
        Ok(ids)
    }

    async fn average_attempt_percentage(&self, course: &CourseId) -> StoreResult<Option<f64>> {
        let state = self.state.lock().await;
        let scores: Vec<i32> = state
            .attempts
            .values()
            .filter(|a| &a.course_id == course)
            .map(|a| a.percentage)
            .collect();

        if scores.is_empty() {
            return Ok(None);
        }

        let sum: i64 = scores.iter().map(|s| *s as i64).sum();
        Ok(Some(sum as f64 / scores.len() as f64))
    }

    async fn get_course_stats(&self, course: &CourseId) -> StoreResult<Option<CourseStats>> {
        Ok(self.state.lock().await.stats.get(course).cloned())
    }

    async fn bump_enrollment_counters(&self, course: &CourseId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let stats = state.stats_entry(course);
        stats.views_count += 1;
        stats.enrollment_count += 1;
        stats.updated_at = Utc::now();
        Ok(())
    }

    async fn set_completion_rate(&self, course: &CourseId, rate: i32) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let stats = state.stats_entry(course);
        stats.completion_rate = rate;
        stats.updated_at = Utc::now();
        Ok(())
    }

    async fn set_average_quiz_score(&self, course: &CourseId, score: i32) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let stats = state.stats_entry(course);
        stats.average_quiz_score = score;
        stats.updated_at = Utc::now();
        Ok(())
    }

    async fn write_reconciled_stats(&self, reconciled: &CourseStats) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let stats = state.stats_entry(&reconciled.course_id);
        stats.enrollment_count = reconciled.enrollment_count;
        stats.views_count = stats.views_count.max(reconciled.enrollment_count);
        stats.completion_rate = reconciled.completion_rate;
        stats.average_quiz_score = reconciled.average_quiz_score;
        stats.lesson_count = reconciled.lesson_count;
        stats.updated_at = Utc::now();
        Ok(())
    }

    async fn issue_certificate(&self, certificate: &Certificate) -> StoreResult<Certificate> {
        let mut state = self.state.lock().await;
        Ok(state
            .certificates
            .entry((certificate.user_id.clone(), certificate.course_id.clone()))
            .or_insert_with(|| certificate.clone())
            .clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn learner(id: &str) -> User {
        User::new(id.into(), id.to_uppercase(), None, Role::Learner)
    }

    #[tokio::test]
    async fn test_ledger_rejects_duplicate_keys() {
        let store = MemoryStore::new().with_user(learner("u1"));
        let entry = LedgerEntry::new("u1".into(), ReasonKey("lesson:l1:complete".into()), 10);

        assert_eq!(
            store.append_ledger(&entry).await.unwrap(),
            LedgerWrite::Applied { total: 10 }
        );
        assert_eq!(
            store.append_ledger(&entry).await.unwrap(),
            LedgerWrite::Duplicate { total: 10 }
        );
        assert_eq!(store.ledger_for_user(&"u1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_unknown_user_and_negative_total() {
        let store = MemoryStore::new().with_user(learner("u1"));

        let ghost = LedgerEntry::new("ghost".into(), ReasonKey("x".into()), 5);
        assert_eq!(
            store.append_ledger(&ghost).await.unwrap(),
            LedgerWrite::UnknownUser
        );

        let debit = LedgerEntry::new("u1".into(), ReasonKey("admin:1".into()), -5);
        assert_eq!(
            store.append_ledger(&debit).await.unwrap(),
            LedgerWrite::WouldGoNegative { total: 0 }
        );
    }

    #[tokio::test]
    async fn test_lesson_progress_transitions() {
        let store = MemoryStore::new();
        let (u, c, l) = (UserId::from("u"), CourseId::from("c"), LessonId::from("l"));
        let now = Utc::now();

        let first = store
            .record_lesson_progress(&u, &c, &l, false, now)
            .await
            .unwrap();
        assert_eq!(first, LessonTransition::Created);

        let done = store
            .record_lesson_progress(&u, &c, &l, true, now)
            .await
            .unwrap();
        assert_eq!(done, LessonTransition::Completed { first_write: false });

        let again = store
            .record_lesson_progress(&u, &c, &l, true, now)
            .await
            .unwrap();
        assert_eq!(again, LessonTransition::Unchanged);

        // a later "not completed" write never reverts the flag
        let revert = store
            .record_lesson_progress(&u, &c, &l, false, now)
            .await
            .unwrap();
        assert_eq!(revert, LessonTransition::Unchanged);
        assert_eq!(store.completed_lessons(&u, &c).await.unwrap(), vec![l]);
    }

    #[tokio::test]
    async fn test_complete_enrollment_is_guarded() {
        let store = MemoryStore::new();
        let enrollment = Enrollment::new("u".into(), "c".into(), EnrollmentStatus::Active);
        assert!(store.create_enrollment(&enrollment).await.unwrap());
        assert!(!store.create_enrollment(&enrollment).await.unwrap());

        let first = Utc::now();
        assert!(
            store
                .complete_enrollment(&"u".into(), &"c".into(), first)
                .await
                .unwrap()
        );
        assert!(
            !store
                .complete_enrollment(&"u".into(), &"c".into(), Utc::now())
                .await
                .unwrap()
        );

        let stored = store
            .get_enrollment(&"u".into(), &"c".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, EnrollmentStatus::Completed);
        assert_eq!(stored.progress_percentage, 100);
        assert_eq!(stored.completed_at, Some(first));
    }

    #[tokio::test]
    async fn test_seed_parses() {
        let raw = r#"{
            "users": [{ "id": "u1", "display_name": "Ada" }],
            "courses": [{ "id": "c1", "title": "Intro", "lesson_ids": ["l1"], "quiz_ids": [] }]
        }"#;
        let seed: Seed = serde_json::from_str(raw).unwrap();
        let store = MemoryStore::from_seed(seed);

        let user = store.get_user(&"u1".into()).await.unwrap().unwrap();
        assert_eq!(user.role, Role::Learner);
        assert_eq!(store.list_course_ids().await.unwrap(), vec!["c1".into()]);
    }
}
