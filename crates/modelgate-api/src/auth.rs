// API key authentication and admin session checks

use std::collections::HashSet;
use std::net::IpAddr;

use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use modelgate_core::GatewayError;
use modelgate_storage::verify_api_key;
use uuid::Uuid;

use crate::state::AppState;

pub const SESSION_COOKIE: &str = "modelgate_session";
const MIN_TOKEN_LEN: usize = 12;
const PREFIX_LEN: usize = 8;

/// Authenticated principal on the serving path
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub key_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub scopes: HashSet<String>,
}

impl AuthContext {
    fn dev_bypass() -> Self {
        Self {
            key_id: None,
            user_id: None,
            org_id: None,
            scopes: ["chat", "completions", "embeddings"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope) || self.scopes.contains("*")
    }
}

/// Scope a serving path requires
pub fn required_scope(path: &str) -> &'static str {
    if path.ends_with("/embeddings") {
        "embeddings"
    } else if path.ends_with("/completions") && !path.ends_with("/chat/completions") {
        "completions"
    } else {
        "chat"
    }
}

pub fn require_scope(ctx: &AuthContext, path: &str) -> Result<(), GatewayError> {
    let needed = required_scope(path);
    if ctx.has_scope(needed) {
        Ok(())
    } else {
        Err(GatewayError::forbidden("insufficient_scope"))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = raw.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim().to_string())
    } else {
        None
    }
}

/// Resolve the caller's API key. Dev bypass admits requests without a valid
/// key but prefers real resolution when a token is supplied.
pub async fn require_api_key(
    state: &AppState,
    headers: &HeaderMap,
    client_ip: Option<IpAddr>,
) -> Result<AuthContext, GatewayError> {
    let dev_bypass = state.settings.dev_allow_all_keys;
    let metrics = &state.metrics;

    let token = match bearer_token(headers) {
        Some(token) => token,
        None => {
            if dev_bypass {
                metrics.key_auth_allowed.with_label_values(&["dev_bypass"]).inc();
                return Ok(AuthContext::dev_bypass());
            }
            metrics.key_auth_blocked.with_label_values(&["missing_token"]).inc();
            return Err(GatewayError::unauthorized("Missing bearer token"));
        }
    };

    if token.len() < MIN_TOKEN_LEN {
        if dev_bypass {
            metrics.key_auth_allowed.with_label_values(&["dev_bypass"]).inc();
            return Ok(AuthContext::dev_bypass());
        }
        metrics.key_auth_blocked.with_label_values(&["format"]).inc();
        return Err(GatewayError::unauthorized("Invalid API key format"));
    }

    let prefix = &token[..PREFIX_LEN];
    let row = state
        .db
        .find_api_key_by_prefix(prefix)
        .await
        .map_err(|_| GatewayError::unavailable("database unavailable"))?;

    let row = match row {
        Some(row) if !row.is_expired(Utc::now()) && verify_api_key(&token, &row.hash) => row,
        other => {
            if dev_bypass {
                metrics.key_auth_allowed.with_label_values(&["dev_bypass"]).inc();
                return Ok(AuthContext::dev_bypass());
            }
            let reason = match other {
                None => "not_found",
                Some(row) if row.is_expired(Utc::now()) => "expired",
                Some(_) => "hash_mismatch",
            };
            metrics.key_auth_blocked.with_label_values(&[reason]).inc();
            return Err(GatewayError::unauthorized("Invalid API key"));
        }
    };

    // Non-empty allowlist: caller IP must be on it
    let allowlist = row.allowlist();
    if !allowlist.is_empty() {
        let allowed = client_ip
            .map(|ip| allowlist.iter().any(|entry| entry == &ip.to_string()))
            .unwrap_or(false);
        if !allowed {
            metrics.key_auth_blocked.with_label_values(&["ip"]).inc();
            return Err(GatewayError::forbidden("IP not allowed"));
        }
    }

    // Best-effort bookkeeping; a failed touch never blocks the request
    if let Err(err) = state.db.touch_api_key_last_used(row.id).await {
        tracing::debug!(error = %err, "last_used_at update failed");
    }

    metrics.key_auth_allowed.with_label_values(&["ok"]).inc();
    Ok(AuthContext {
        key_id: Some(row.id),
        user_id: row.user_id,
        org_id: row.org_id,
        scopes: row.scope_set(),
    })
}

/// Caller identifier for rate limiting: key prefix when present, else IP
pub fn limiter_identifier(headers: &HeaderMap, client_ip: Option<IpAddr>) -> String {
    if let Some(token) = bearer_token(headers) {
        if token.len() >= PREFIX_LEN {
            return token[..PREFIX_LEN].to_string();
        }
    }
    client_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admin principal resolved from the session cookie
#[derive(Debug, Clone)]
pub struct AdminContext {
    pub username: String,
}

/// Require an authenticated administrator. The login flow itself lives in an
/// external collaborator; the gateway only honors its session cookie.
pub async fn require_admin(state: &AppState, jar: &CookieJar) -> Result<AdminContext, GatewayError> {
    let username = jar
        .get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .ok_or_else(|| GatewayError::unauthorized("unauthenticated"))?;

    let user = state
        .db
        .get_user_by_username(&username)
        .await
        .map_err(|_| GatewayError::unavailable("database unavailable"))?
        .ok_or_else(|| GatewayError::unauthorized("unauthenticated"))?;

    if !user.role.eq_ignore_ascii_case("admin") {
        return Err(GatewayError::forbidden("forbidden"));
    }
    Ok(AdminContext { username })
}
