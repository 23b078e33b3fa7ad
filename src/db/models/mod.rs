use serde::{Deserialize, Serialize};

use crate::constants::{MAX_PAGE, MAX_PAGE_SIZE};

pub mod attempt;
pub mod certificate;
pub mod course;
pub mod enrollment;
pub mod ledger;
pub mod progress;
pub mod stats;
pub mod user;

/// Declares a string-backed identifier that binds to Postgres as `TEXT`.
macro_rules! string_id {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(
                Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
            )]
            #[serde(transparent)]
            #[sqlx(transparent)]
            pub struct $name(pub String);

            impl From<String> for $name {
                fn from(value: String) -> Self {
                    $name(value)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    $name(value.to_string())
                }
            }

            impl core::fmt::Display for $name {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

string_id!(UserId, CourseId, LessonId, QuizId, AttemptId);

#[inline]
const fn default_page() -> i64 {
    0
}

#[inline]
const fn default_limit() -> i64 {
    25
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_page")]
    pub page: i64,
}

impl Pagination {
    pub fn page(&self) -> i64 {
        self.page.clamp(0, MAX_PAGE)
    }

    /// Clamps the requested window to something the store can serve.
    pub fn window(&self) -> (i64, i64) {
        let limit = self.limit.clamp(1, MAX_PAGE_SIZE);
        (limit, self.page() * limit)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub page_size: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, page_size: i64, page: i64) -> Self {
        Self {
            items,
            page,
            page_size,
        }
    }
}
