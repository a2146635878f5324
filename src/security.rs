use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const DEFAULT_API_KEYS: &str = "demo-seller:demo-key";

/// Seller API keys plus a per-seller token bucket.
#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
    limiter: Arc<RateLimiter>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub owner_id: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("API_KEYS").unwrap_or_else(|_| DEFAULT_API_KEYS.to_string());
        let limiter = RateLimiter::new(
            env_f64("RATE_LIMIT_PER_SEC").filter(|v| *v > 0.0).unwrap_or(5.0),
            env_f64("RATE_LIMIT_CAPACITY").filter(|v| *v >= 1.0).unwrap_or(10.0),
        );
        Self::new(&raw, limiter)
    }

    pub fn new(raw_keys: &str, limiter: RateLimiter) -> Self {
        let mut keys = parse_api_keys(raw_keys);
        if keys.is_empty() {
            warn!(
                target = "artisan.api",
                "API_KEYS produced no keys; falling back to demo credentials"
            );
            keys = parse_api_keys(DEFAULT_API_KEYS);
        } else {
            info!(target = "artisan.api", key_count = keys.len(), "loaded API keys");
        }
        Self {
            keys: Arc::new(keys),
            limiter: Arc::new(limiter),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.keys.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Artisan-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    let decision = state.limiter.check(&context.owner_id).await;
    if !decision.allowed {
        let mut response =
            error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many requests");
        decision.apply_headers(response.headers_mut());
        return Ok(response);
    }

    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    decision.apply_headers(response.headers_mut());
    Ok(response)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Artisan-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// Parses `owner:key` pairs separated by commas. Key ids are assigned by
/// position so logs never carry the secret itself.
fn parse_api_keys(raw: &str) -> HashMap<String, AuthContext> {
    let mut keys = HashMap::new();
    for (idx, entry) in raw.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once(':').map(|(o, k)| (o.trim(), k.trim())) {
            Some((owner, secret)) if !owner.is_empty() && !secret.is_empty() => {
                keys.insert(
                    secret.to_string(),
                    AuthContext {
                        owner_id: owner.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "artisan.api",
                entry = idx + 1,
                "ignored malformed API_KEYS entry"
            ),
        }
    }
    keys
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|value| value.parse::<f64>().ok())
}

pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Copy)]
struct RateDecision {
    allowed: bool,
    tokens: f64,
    capacity: f64,
    rate: f64,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn check(&self, owner: &str) -> RateDecision {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = guard.entry(owner.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        RateDecision {
            allowed,
            tokens: bucket.tokens,
            capacity: self.capacity,
            rate: self.rate_per_sec,
        }
    }
}

impl RateDecision {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let number = |value: u64| {
            HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
        };
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Limit", number(self.capacity as u64));
        headers.insert("X-RateLimit-Remaining", number(remaining));
        headers.insert("X-RateLimit-Reset", number(reset));
        if !self.allowed {
            let retry = ((1.0 - self.tokens) / self.rate).ceil().max(1.0) as u64;
            headers.insert(http::header::RETRY_AFTER, number(retry));
        }
    }
}
