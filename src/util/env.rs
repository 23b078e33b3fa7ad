//! Environment configuration.
//!
//! Variables are read once (after loading `.env` if present) and deserialized
//! into [`Env`] through a small map deserializer modelled on the [`envy`]
//! crate, which also lets `#[serde(rename/default)]` attributes behave as
//! they would for any other format.
//!
//! [`envy`]: https://github.com/softprops/envy

use std::sync::LazyLock;

use serde::Deserialize;
use serde::de::value::MapDeserializer;
use serde::de::{self, IntoDeserializer};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::constants::{
    DEFAULT_COURSE_BONUS, DEFAULT_EVENT_WORKERS, DEFAULT_LESSON_POINTS, DEFAULT_LOG_FILTER,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_RECONCILE_SECS, DEFAULT_SERVICE_NAME, SERVER_PORT,
};
use crate::engine::progress::QuizCompletionPolicy;

static ENV_VARS: LazyLock<OnceCell<Env>> = LazyLock::new(OnceCell::new);

/// Process-wide configuration, loaded on first access.
pub async fn config() -> EnvResult<&'static Env> {
    ENV_VARS.get_or_try_init(|| async { Env::new() }).await
}

pub async fn get_var(var: Var) -> EnvResult<&'static str> {
    let vars = config().await?;
    Ok(match var {
        Var::EventSigningSecret => &vars.event_signing_secret,
        Var::InternalToken => &vars.internal_token,
        Var::CorsAllowOrigins => &vars.cors_allow_origins,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Env {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub event_signing_secret: String,
    pub internal_token: String,
    #[serde(default = "default_port")]
    pub server_api_port: u16,
    #[serde(default = "default_cors")]
    pub cors_allow_origins: String,
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub api_service_name: String,
    #[serde(default = "default_service_name")]
    pub api_tracer_name: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_workers")]
    pub event_workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_lesson_points")]
    pub lesson_completion_points: i64,
    #[serde(default = "default_course_bonus")]
    pub course_completion_bonus: i64,
    #[serde(default)]
    pub quiz_completion_policy: QuizCompletionPolicy,
    /// JSON array of `{ "name": .., "points_required": .. }`.
    pub badge_catalog: Option<String>,
    pub seed_path: Option<String>,
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        // a missing .env file is fine; the process environment still applies
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(e.into());
            }
        }

        Ok(from_env::<Env>()?)
    }

    /// `DATABASE_URL`, treating an empty value as unset.
    pub fn database_url(&self) -> Option<&str> {
        non_empty(self.database_url.as_deref())
    }

    pub fn redis_url(&self) -> Option<&str> {
        non_empty(self.redis_url.as_deref())
    }

    pub fn otel_endpoint(&self) -> Option<&str> {
        non_empty(self.otel_exporter_otlp_endpoint.as_deref())
    }
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

fn default_port() -> u16 {
    SERVER_PORT
}
fn default_cors() -> String {
    String::from("*")
}
fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_owned()
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}
fn default_workers() -> usize {
    DEFAULT_EVENT_WORKERS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_reconcile_secs() -> u64 {
    DEFAULT_RECONCILE_SECS
}
fn default_lesson_points() -> i64 {
    DEFAULT_LESSON_POINTS
}
fn default_course_bonus() -> i64 {
    DEFAULT_COURSE_BONUS
}

#[derive(Debug)]
pub enum Var {
    EventSigningSecret,
    InternalToken,
    CorsAllowOrigins,
}

#[macro_export]
macro_rules! var {
    ($ev:expr) => {
        $crate::util::env::get_var($ev)
    };
}

// ---
//  Deserializer implementation
// ---

/// A single variable's value, tagged with its name for error messages.
struct EnvValue {
    key: String,
    raw: String,
}

struct EnvKey(String);

struct EnvPairs<I> {
    inner: I,
}

impl<I: Iterator<Item = (String, String)>> Iterator for EnvPairs<I> {
    type Item = (EnvKey, EnvValue);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(key, raw)| (EnvKey(key.clone()), EnvValue { key, raw }))
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for EnvValue {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for EnvKey {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

macro_rules! parse_scalars {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>
            {
                match self.raw.trim().parse::<$ty>() {
                    Ok(val) => val.into_deserializer().$method(visitor),
                    Err(e) => Err(de::Error::custom(format_args!(
                        "{}: cannot parse '{}' as {}",
                        self.key, self.raw, e
                    ))),
                }
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for EnvValue {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.raw.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(self.raw.trim().to_owned().into_deserializer())
    }

    // `usize` fields arrive through `deserialize_u64`
    parse_scalars! {
        u16 => deserialize_u16,
        u64 => deserialize_u64,
        i64 => deserialize_i64,
    }

    serde::forward_to_deserialize_any! {
        bool u8 u32 i8 i16 i32 f32 f64 char str string unit
        bytes byte_buf seq map newtype_struct unit_struct
        tuple_struct identifier tuple ignored_any struct
    }
}

impl<'de> de::Deserializer<'de> for EnvKey {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.0.into_deserializer().deserialize_any(visitor)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map newtype_struct
        unit_struct tuple_struct identifier tuple ignored_any
        bool u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 enum struct
    }
}

struct EnvMap<'de, I: Iterator<Item = (String, String)>> {
    inner: MapDeserializer<'de, EnvPairs<I>, EnvDeserializeError>,
}

impl<'de, I: Iterator<Item = (String, String)>> de::Deserializer<'de> for EnvMap<'de, I> {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_map(self.inner)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map
        newtype_struct unit_struct tuple_struct identifier
        tuple ignored_any bool u8 u16 u32 u64 i8 i16 i32 i64
        f32 f64 enum struct
    }
}

pub fn from_env<T>() -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
{
    from_iter(std::env::vars())
}

pub fn from_iter<I, T>(iter: I) -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
    I: IntoIterator<Item = (String, String)>,
{
    T::deserialize(EnvMap {
        inner: MapDeserializer::new(EnvPairs {
            inner: iter.into_iter(),
        }),
    })
}

impl de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.into())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    Dotenvy(#[from] dotenvy::Error),

    #[error(transparent)]
    DeserializationError(#[from] EnvDeserializeError),
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing required variable {0}")]
    MissingValue(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_apply() {
        let env: Env = from_iter(pairs(&[
            ("EVENT_SIGNING_SECRET", "s3cret"),
            ("INTERNAL_TOKEN", "tok"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();

        assert_eq!(env.server_api_port, SERVER_PORT);
        assert_eq!(env.cors_allow_origins, "*");
        assert_eq!(env.event_workers, DEFAULT_EVENT_WORKERS);
        assert_eq!(env.lesson_completion_points, DEFAULT_LESSON_POINTS);
        assert_eq!(env.log_format, LogFormat::Pretty);
        assert_eq!(env.quiz_completion_policy, QuizCompletionPolicy::SingleBucket);
        assert!(env.database_url().is_none());
        assert!(env.badge_catalog.is_none());
    }

    #[test]
    fn test_typed_values_parse() {
        let env: Env = from_iter(pairs(&[
            ("EVENT_SIGNING_SECRET", "s3cret"),
            ("INTERNAL_TOKEN", "tok"),
            ("SERVER_API_PORT", "8080"),
            ("EVENT_WORKERS", " 8 "),
            ("LOG_FORMAT", "json"),
            ("QUIZ_COMPLETION_POLICY", "per_quiz"),
            ("DATABASE_URL", "  "),
            ("REDIS_URL", "redis://localhost:6379"),
        ]))
        .unwrap();

        assert_eq!(env.server_api_port, 8080);
        assert_eq!(env.event_workers, 8);
        assert_eq!(env.log_format, LogFormat::Json);
        assert_eq!(env.quiz_completion_policy, QuizCompletionPolicy::PerQuiz);
        assert!(env.database_url().is_none());
        assert_eq!(env.redis_url(), Some("redis://localhost:6379"));
    }

    #[test]
    fn test_every_numeric_width_parses() {
        let env: Env = from_iter(pairs(&[
            ("EVENT_SIGNING_SECRET", "s3cret"),
            ("INTERNAL_TOKEN", "tok"),
            ("EVENT_QUEUE_CAPACITY", "16"),
            ("RECONCILE_INTERVAL_SECS", "60"),
            ("COURSE_COMPLETION_BONUS", "75"),
        ]))
        .unwrap();

        assert_eq!(env.event_queue_capacity, 16);
        assert_eq!(env.reconcile_interval_secs, 60);
        assert_eq!(env.course_completion_bonus, 75);
    }

    #[test]
    fn test_missing_secret_is_reported() {
        let err = from_iter::<_, Env>(pairs(&[("INTERNAL_TOKEN", "tok")])).unwrap_err();
        assert!(matches!(err, EnvDeserializeError::MissingValue(ref v) if v == "EVENT_SIGNING_SECRET"));
    }

    #[test]
    fn test_bad_number_names_the_variable() {
        let err = from_iter::<_, Env>(pairs(&[
            ("EVENT_SIGNING_SECRET", "s3cret"),
            ("INTERNAL_TOKEN", "tok"),
            ("SERVER_API_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SERVER_API_PORT"));
    }
}
