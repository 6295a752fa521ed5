use crate::config::RateLimitConfig;
use crate::models::{ApiError, User};
use crate::store::Store;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Clone)]
pub struct AuthState {
    store: Arc<dyn Store>,
    limiter: Arc<TokenBuckets>,
}

/// The authenticated caller, inserted as a request extension.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

impl CurrentUser {
    pub fn id(&self) -> Uuid {
        self.0.id
    }
}

impl AuthState {
    pub fn new(store: Arc<dyn Store>, limits: RateLimitConfig) -> Self {
        Self {
            store,
            limiter: Arc::new(TokenBuckets::new(limits)),
        }
    }

    async fn consume(&self, user_id: Uuid) -> Result<RatePermit, RateExceeded> {
        self.limiter.consume(user_id).await
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        let response = unauthorized_response(
            "missing_api_key",
            "Provide Authorization: Bearer <key> or X-Api-Key",
        );
        return Ok(response);
    };

    let user = match state.store.user_by_api_key(&presented).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            let response = unauthorized_response("invalid_api_key", "Key not recognized");
            return Ok(response);
        }
        Err(err) => {
            error!(target = "buysmart.api", error = %err, "auth_lookup_failed");
            let payload = ApiError {
                error: "auth_unavailable".into(),
                detail: Some(err.to_string()),
            };
            return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(payload)).into_response());
        }
    };

    match state.consume(user.id).await {
        Ok(permit) => {
            debug!(target = "buysmart.api", user_id = %user.id, "authenticated");
            request.extensions_mut().insert(CurrentUser(user));
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = too_many_requests("rate_limited", "Too many requests");
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

/// Opaque bearer secret handed out at registration.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    format!("bs_{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && let Some((scheme, key)) = raw.split_once(' ')
        && scheme.eq_ignore_ascii_case("bearer")
    {
        return Some(key.trim().to_string()).filter(|key| !key.is_empty());
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn too_many_requests(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
}

/// Per-user token buckets refilled continuously at `rate_per_sec`.
struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<Uuid, BucketState>>,
}

impl TokenBuckets {
    fn new(limits: RateLimitConfig) -> Self {
        Self {
            rate_per_sec: limits.per_sec,
            capacity: limits.capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: Uuid) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

fn header_number(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Limit", header_number(self.capacity as u64));
        headers.insert("X-RateLimit-Remaining", header_number(remaining));
        headers.insert("X-RateLimit-Reset", header_number(reset));
    }
}

#[derive(Debug, Clone)]
struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(1.0) as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert(http::header::RETRY_AFTER, header_number(retry));
        headers.insert("X-RateLimit-Limit", header_number(self.capacity as u64));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        headers.insert("X-RateLimit-Reset", header_number(reset));
    }
}
