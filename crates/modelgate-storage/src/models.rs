// Database models (internal rows, may differ from public DTOs)

use chrono::{DateTime, Utc};
use modelgate_core::EngineTuning;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// Model configuration
// ============================================

/// Model row from the database. The tuning block rides in a JSONB column so
/// knob additions do not need schema churn.
#[derive(Debug, Clone, FromRow)]
pub struct ModelRow {
    pub id: Uuid,
    pub name: String,
    pub served_model_name: String,
    pub repo_id: Option<String>,
    pub local_path: Option<String>,
    pub task: String,
    pub engine_type: String,
    pub device: Option<String>,
    /// Ordered GPU indices, e.g. [0, 1]
    pub selected_gpus: Option<Json<Vec<u32>>>,
    pub engine_image: Option<String>,
    pub tuning: Json<EngineTuning>,
    /// User-supplied extra CLI args, validated before use
    pub custom_args: Option<Json<Vec<String>>>,
    /// User-supplied extra env vars
    pub custom_env: Option<Json<std::collections::BTreeMap<String, String>>>,
    /// Never logged, never exported
    pub hf_token: Option<String>,
    pub state: String,
    pub archived: bool,
    pub container_name: Option<String>,
    pub port: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a model
#[derive(Debug, Clone)]
pub struct CreateModel {
    pub name: String,
    pub served_model_name: String,
    pub repo_id: Option<String>,
    pub local_path: Option<String>,
    pub task: String,
    pub engine_type: String,
    pub device: Option<String>,
    pub selected_gpus: Option<Vec<u32>>,
    pub engine_image: Option<String>,
    pub tuning: EngineTuning,
    pub custom_args: Option<Vec<String>>,
    pub custom_env: Option<std::collections::BTreeMap<String, String>>,
    pub hf_token: Option<String>,
}

/// Input for updating a model. Immutable fields (identity, local_path,
/// engine type) are rejected upstream and absent here.
#[derive(Debug, Clone, Default)]
pub struct UpdateModel {
    pub name: Option<String>,
    pub served_model_name: Option<String>,
    pub repo_id: Option<String>,
    pub task: Option<String>,
    pub device: Option<String>,
    pub selected_gpus: Option<Vec<u32>>,
    pub engine_image: Option<String>,
    pub tuning: Option<EngineTuning>,
    pub custom_args: Option<Vec<String>>,
    pub custom_env: Option<std::collections::BTreeMap<String, String>>,
    pub hf_token: Option<String>,
}

// ============================================
// API keys
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub prefix: String,
    pub hash: String,
    /// Comma-separated scope list
    pub scopes: String,
    /// Comma-separated literal IPs, empty = allow any
    pub ip_allowlist: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRow {
    pub fn scope_set(&self) -> std::collections::HashSet<String> {
        self.scopes
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn allowlist(&self) -> Vec<String> {
        self.ip_allowlist
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at < now).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct CreateApiKey {
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub prefix: String,
    pub hash: String,
    pub scopes: String,
    pub ip_allowlist: String,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================
// Usage ledger
// ============================================

/// Append-only; the gateway only ever writes. Reads belong to the external
/// analytics surfaces.
#[derive(Debug, Clone, Default)]
pub struct CreateUsage {
    pub org_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub key_id: Option<Uuid>,
    pub model_name: String,
    pub task: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub status_code: i32,
    pub req_id: String,
}

// ============================================
// Users (admin session check)
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub org_id: Option<Uuid>,
    pub username: String,
    pub role: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_row(scopes: &str, allowlist: &str) -> ApiKeyRow {
        ApiKeyRow {
            id: Uuid::nil(),
            user_id: None,
            org_id: None,
            prefix: "abcd1234".into(),
            hash: "h".into(),
            scopes: scopes.into(),
            ip_allowlist: allowlist.into(),
            expires_at: None,
            last_used_at: None,
            disabled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn scope_set_trims_and_drops_empties() {
        let row = key_row("chat, completions,,embeddings ", "");
        let scopes = row.scope_set();
        assert_eq!(scopes.len(), 3);
        assert!(scopes.contains("chat"));
        assert!(scopes.contains("embeddings"));
    }

    #[test]
    fn allowlist_parses_like_scopes() {
        let row = key_row("*", " 10.0.0.1 ,10.0.0.2,");
        assert_eq!(row.allowlist(), vec!["10.0.0.1", "10.0.0.2"]);
        assert!(key_row("*", "").allowlist().is_empty());
    }

    #[test]
    fn expiry_is_a_soft_property() {
        let mut row = key_row("*", "");
        assert!(!row.is_expired(Utc::now()));
        row.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(row.is_expired(Utc::now()));
    }
}
