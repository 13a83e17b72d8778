use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::error::{ApiError, ApiErrorResponse};

const TOKEN_COOKIE: &str = "sb_token";

/// The single shared-secret gate every authenticated surface runs through.
///
/// Built once from config; an absent secret disables enforcement entirely.
/// Presented tokens are compared by SHA-256 hash.
pub struct SharedSecret {
    hash: Option<String>,
}

impl SharedSecret {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            hash: secret.map(hash_token),
        }
    }

    pub fn enabled(&self) -> bool {
        self.hash.is_some()
    }

    pub fn verify(&self, token: &str) -> bool {
        match &self.hash {
            Some(hash) => &hash_token(token) == hash,
            None => true,
        }
    }

    /// Authorize a plain HTTP request via bearer header or cookie.
    pub fn authorize_http(&self, headers: &HeaderMap) -> bool {
        if !self.enabled() {
            return true;
        }
        extract_bearer(headers)
            .or_else(|| extract_cookie_token(headers))
            .map(|token| self.verify(&token))
            .unwrap_or(false)
    }

    /// Authorize a connection upgrade, which may also carry the token as a
    /// query parameter (browsers cannot set headers on WebSocket opens).
    pub fn authorize_upgrade(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        if !self.enabled() {
            return true;
        }
        if let Some(token) = query_token {
            if self.verify(token) {
                return true;
            }
        }
        self.authorize_http(headers)
    }
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a fresh shared secret (32 random bytes, hex-encoded).
pub fn generate_secret() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

pub fn extract_cookie_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get("cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == TOKEN_COOKIE).then(|| value.to_string())
    })
}

/// Rejects unauthorized requests before they reach the control handlers.
pub async fn auth_middleware(
    state: axum::extract::State<crate::state::AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiErrorResponse> {
    if !state.secret.authorize_http(req.headers()) {
        return Err(ApiErrorResponse {
            status: StatusCode::UNAUTHORIZED,
            error: ApiError::unauthorized(),
        });
    }
    Ok(next.run(req).await)
}
