pub const SERVER_PORT: u16 = 3000;

pub const HMAC_PREFIX: &str = "sha256=";
pub const EVENT_MESSAGE_ID: &str = "Event-Message-Id";
pub const EVENT_MESSAGE_TIMESTAMP: &str = "Event-Message-Timestamp";
pub const EVENT_MESSAGE_SIGNATURE: &str = "Event-Message-Signature";

/// Signed events older (or further in the future) than this are refused.
pub const MAX_EVENT_AGE_SECS: i64 = 600;

pub const DEFAULT_SERVICE_NAME: &str = "course-progress";
pub const DEFAULT_LOG_FILTER: &str =
    "course_progress=debug,tower_http=debug,axum=debug,sqlx=info,info";

// scoring
pub const DEFAULT_PASS_THRESHOLD: u8 = 70;
pub const DEFAULT_DECAY_FACTOR: f64 = 0.8;

// awards
pub const DEFAULT_LESSON_POINTS: i64 = 10;
pub const DEFAULT_COURSE_BONUS: i64 = 50;

// event pipeline
pub const DEFAULT_EVENT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_RECONCILE_SECS: u64 = 300;

// pagination
pub const MAX_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE: i64 = 100_000;

pub const LEADERBOARD_KEY: &str = "course-progress:leaderboard";
pub const LEADERBOARD_WARM_SIZE: i64 = 1000;
pub const BADGE_EVAL_RETRIES: usize = 5;
