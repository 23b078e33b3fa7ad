use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use ring::hmac::{self, Key};

use crate::api::server::AppState;
use crate::constants::{
    EVENT_MESSAGE_ID, EVENT_MESSAGE_SIGNATURE, EVENT_MESSAGE_TIMESTAMP, HMAC_PREFIX,
    MAX_EVENT_AGE_SECS,
};

/// Request body that passed signature verification.
#[derive(Clone)]
pub struct VerifiedBody(pub Bytes);

impl VerifiedBody {
    pub fn as_json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.0)
    }
}

pub fn signing_key(secret: &str) -> Key {
    Key::new(hmac::HMAC_SHA256, secret.as_bytes())
}

/// `sha256=<hex>` over `id ‖ timestamp ‖ body`.
pub fn sign_message(key: &Key, id: &str, timestamp: &str, body: &[u8]) -> String {
    let signed = hmac::sign(key, &rebuild_message(id, timestamp, body));
    format!("{}{}", HMAC_PREFIX, hex::encode(signed))
}

pub async fn verify_event_signature(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let headers = req.headers().clone();
    let body = match extract_body(&mut req).await {
        Ok(bytes) => bytes,
        Err(_) => return Err(StatusCode::BAD_REQUEST),
    };

    if let Err(status) = verify_signature(&state.signing_key, &headers, &body, Utc::now()) {
        tracing::error!(%status, "unable to verify event signature");
        return Err(status);
    }

    req.extensions_mut().insert(VerifiedBody(body));
    Ok(next.run(req).await)
}

async fn extract_body(request: &mut Request) -> Result<Bytes, axum::Error> {
    let body = std::mem::replace(request.body_mut(), Body::empty());
    axum::body::to_bytes(body, usize::MAX).await
}

fn verify_signature(
    key: &Key,
    headers: &HeaderMap,
    body: &Bytes,
    now: DateTime<Utc>,
) -> Result<(), StatusCode> {
    let (id, timestamp, extern_signature) = get_message_parts(headers)?;

    let sent_at = DateTime::parse_from_rfc3339(timestamp).map_err(|_| StatusCode::BAD_REQUEST)?;
    let age = now.signed_duration_since(sent_at).num_seconds().abs();
    if age > MAX_EVENT_AGE_SECS {
        tracing::warn!(message_id = id, age, "event timestamp outside the accepted window");
        return Err(StatusCode::FORBIDDEN);
    }

    let tag = extern_signature
        .strip_prefix(HMAC_PREFIX)
        .and_then(|h| hex::decode(h).ok())
        .ok_or(StatusCode::FORBIDDEN)?;

    hmac::verify(key, &rebuild_message(id, timestamp, body), &tag)
        .map_err(|_| StatusCode::FORBIDDEN)
}

fn rebuild_message(id: &str, ts: &str, body: &[u8]) -> Vec<u8> {
    let mut m = Vec::with_capacity(id.len() + ts.len() + body.len());
    m.extend_from_slice(id.as_bytes());
    m.extend_from_slice(ts.as_bytes());
    m.extend_from_slice(body);

    m
}

type MessageParts<'a> = (&'a str, &'a str, &'a str);
fn get_message_parts<'a>(headers: &'a HeaderMap) -> Result<MessageParts<'a>, StatusCode> {
    let part = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::BAD_REQUEST)
    };

    Ok((
        part(EVENT_MESSAGE_ID)?,
        part(EVENT_MESSAGE_TIMESTAMP)?,
        part(EVENT_MESSAGE_SIGNATURE)?,
    ))
}

impl<S> FromRequest<S> for VerifiedBody
where
    S: Send + Sync,
{
    type Rejection = StatusCode;
    async fn from_request(req: Request, _: &S) -> Result<Self, Self::Rejection> {
        req.extensions()
            .get::<VerifiedBody>()
            .cloned()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;
    use http::HeaderValue;

    use super::*;

    fn headers(id: &str, ts: &str, signature: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(EVENT_MESSAGE_ID, HeaderValue::from_str(id).unwrap());
        h.insert(EVENT_MESSAGE_TIMESTAMP, HeaderValue::from_str(ts).unwrap());
        h.insert(EVENT_MESSAGE_SIGNATURE, HeaderValue::from_str(signature).unwrap());
        h
    }

    #[test]
    fn test_signature_roundtrip() {
        let key = signing_key("shared-secret");
        let now = Utc::now();
        let ts = now.to_rfc3339();
        let body = Bytes::from_static(br#"{"type":"enrollment_write"}"#);

        let sig = sign_message(&key, "msg-1", &ts, &body);
        assert!(sig.starts_with(HMAC_PREFIX));
        assert_eq!(verify_signature(&key, &headers("msg-1", &ts, &sig), &body, now), Ok(()));

        // a different id changes the signed message
        assert_eq!(
            verify_signature(&key, &headers("msg-2", &ts, &sig), &body, now),
            Err(StatusCode::FORBIDDEN)
        );

        let other = signing_key("another-secret");
        assert_eq!(
            verify_signature(&other, &headers("msg-1", &ts, &sig), &body, now),
            Err(StatusCode::FORBIDDEN)
        );
    }

    #[test]
    fn test_stale_and_malformed_headers() {
        let key = signing_key("shared-secret");
        let now = Utc::now();
        let body = Bytes::from_static(b"{}");

        let stale = (now - Duration::seconds(MAX_EVENT_AGE_SECS + 5)).to_rfc3339();
        let sig = sign_message(&key, "msg-1", &stale, &body);
        assert_eq!(
            verify_signature(&key, &headers("msg-1", &stale, &sig), &body, now),
            Err(StatusCode::FORBIDDEN)
        );

        let sig = sign_message(&key, "msg-1", "yesterday", &body);
        assert_eq!(
            verify_signature(&key, &headers("msg-1", "yesterday", &sig), &body, now),
            Err(StatusCode::BAD_REQUEST)
        );

        let ts = now.to_rfc3339();
        assert_eq!(
            verify_signature(&key, &headers("msg-1", &ts, "deadbeef"), &body, now),
            Err(StatusCode::FORBIDDEN)
        );

        assert_eq!(
            verify_signature(&key, &HeaderMap::new(), &body, now),
            Err(StatusCode::BAD_REQUEST)
        );
    }
}
