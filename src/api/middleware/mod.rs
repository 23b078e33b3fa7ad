pub mod verify_external;
pub mod verify_internal;

use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::request::Parts as ReqParts;
use http::{HeaderValue, Method};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::util::env::{EnvErr, Var};
use crate::var;

pub type MiddlewareResult<T> = core::result::Result<T, MiddlewareErr>;

#[derive(Debug, Error)]
pub enum MiddlewareErr {
    #[error(transparent)]
    EnvErr(#[from] EnvErr),

    #[error("CORS_ALLOW_ORIGINS does not name any origin")]
    EmptyOriginList,
}

/// CORS layer from `CORS_ALLOW_ORIGINS`.
pub async fn cors() -> MiddlewareResult<CorsLayer> {
    cors_for(var!(Var::CorsAllowOrigins).await?)
}

/// `*` allows any origin; otherwise a comma separated list of origin suffixes.
pub fn cors_for(allow_origins: &str) -> MiddlewareResult<CorsLayer> {
    let allowed = if allow_origins.trim() == "*" {
        AllowOrigin::any()
    } else {
        let suffixes: Vec<String> = allow_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if suffixes.is_empty() {
            return Err(MiddlewareErr::EmptyOriginList);
        }

        AllowOrigin::predicate(move |org: &HeaderValue, _: &ReqParts| {
            suffixes
                .iter()
                .any(|suffix| org.as_bytes().ends_with(suffix.as_bytes()))
        })
    };

    Ok(CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(allowed))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cors_origin_list() {
        assert!(cors_for("*").is_ok());
        assert!(cors_for("example.com, .school.edu").is_ok());
        assert!(matches!(cors_for(" , "), Err(MiddlewareErr::EmptyOriginList)));
    }
}
