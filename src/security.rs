//! API-key authentication and per-org rate limiting for the protected routes.

use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, HeaderMap, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
    limiter: Arc<TokenBuckets>,
}

/// Caller identity attached to authenticated requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub org_id: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("API_KEYS").unwrap_or_default();
        Self::from_key_list(&raw)
    }

    /// Keys from an `org:secret,org:secret` list, with rate limits from env.
    pub fn from_key_list(raw: &str) -> Self {
        Self {
            keys: Arc::new(parse_keys(raw)),
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Api-Key or Bearer token",
        ));
    };

    let Some(context) = state.keys.get(&presented).cloned() else {
        warn!(target = "oc.api", path = %request.uri().path(), "invalid_api_key");
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.limiter.consume(&context.org_id).await {
        Ok(quota) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            quota.write_headers(response.headers_mut());
            Ok(response)
        }
        Err(quota) => {
            warn!(target = "oc.api", org_id = %context.org_id, "rate_limited");
            let mut response = reject(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            );
            quota.write_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| {
            let (scheme, token) = raw.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });
    bearer
        .or_else(|| {
            headers
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        })
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// `org:secret` pairs separated by commas. Key ids are `key-NN`, numbered by
/// position in the list.
fn parse_keys(raw: &str) -> HashMap<String, AuthContext> {
    let mut keys = HashMap::new();
    for (idx, entry) in raw.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parsed = entry
            .split_once(':')
            .map(|(org, secret)| (org.trim(), secret.trim()))
            .filter(|(org, secret)| !org.is_empty() && !secret.is_empty());
        let Some((org, secret)) = parsed else {
            warn!(target = "oc.api", position = idx + 1, "malformed_api_key_entry");
            continue;
        };
        keys.insert(
            secret.to_string(),
            AuthContext {
                org_id: org.to_string(),
                api_key_id: format!("key-{:02}", idx + 1),
            },
        );
    }

    if keys.is_empty() {
        warn!(target = "oc.api", "no_api_keys_configured_using_local_key");
        keys.insert(
            "local-key".to_string(),
            AuthContext {
                org_id: "local-org".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(target = "oc.api", key_count = keys.len(), "api_keys_loaded");
    }
    keys
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Bucket state reported back to the caller in `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
struct Quota {
    limit: u64,
    remaining: u64,
    reset_secs: u64,
    retry_after_secs: Option<u64>,
}

impl Quota {
    fn write_headers(&self, headers: &mut HeaderMap) {
        let mut set = |name: &'static str, value: u64| {
            headers.insert(name, HeaderValue::from(value));
        };
        set("X-RateLimit-Limit", self.limit);
        set("X-RateLimit-Remaining", self.remaining);
        set("X-RateLimit-Reset", self.reset_secs);
        if let Some(retry) = self.retry_after_secs {
            headers.insert(http::header::RETRY_AFTER, HeaderValue::from(retry));
        }
    }
}

impl TokenBuckets {
    fn from_env() -> Self {
        Self::new(
            env_f64("RATE_LIMIT_PER_SEC").filter(|v| *v > 0.0).unwrap_or(5.0),
            env_f64("RATE_LIMIT_CAPACITY").filter(|v| *v >= 1.0).unwrap_or(10.0),
        )
    }

    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, org_id: &str) -> Result<Quota, Quota> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = guard.entry(org_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            refilled_at: now,
        });

        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.refilled_at = now;

        let admitted = bucket.tokens >= 1.0;
        if admitted {
            bucket.tokens -= 1.0;
        }
        let quota = Quota {
            limit: self.capacity as u64,
            remaining: bucket.tokens.max(0.0).floor() as u64,
            reset_secs: ((self.capacity - bucket.tokens) / self.rate_per_sec).ceil().max(0.0)
                as u64,
            retry_after_secs: (!admitted)
                .then(|| ((1.0 - bucket.tokens) / self.rate_per_sec).ceil().max(1.0) as u64),
        };
        if admitted { Ok(quota) } else { Err(quota) }
    }
}

fn env_f64(var: &str) -> Option<f64> {
    env::var(var).ok().and_then(|value| value.trim().parse::<f64>().ok())
}
