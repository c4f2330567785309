// Repository layer for database operations

use anyhow::Result;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Dev bootstrap: create tables when missing. Production deployments run
    /// proper migrations; this keeps a bare compose stack working.
    pub async fn ensure_schema(&self) -> Result<()> {
        // raw_sql: the bootstrap script is multiple statements
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id UUID PRIMARY KEY,
                name VARCHAR(128) UNIQUE NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                org_id UUID REFERENCES organizations(id),
                username VARCHAR(255) UNIQUE NOT NULL,
                role VARCHAR(32) NOT NULL DEFAULT 'user',
                status VARCHAR(16) NOT NULL DEFAULT 'active',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS api_keys (
                id UUID PRIMARY KEY,
                user_id UUID REFERENCES users(id),
                org_id UUID REFERENCES organizations(id),
                prefix VARCHAR(16) UNIQUE NOT NULL,
                hash VARCHAR(256) NOT NULL,
                scopes VARCHAR(128) NOT NULL DEFAULT 'chat,completions,embeddings',
                ip_allowlist TEXT NOT NULL DEFAULT '',
                expires_at TIMESTAMPTZ,
                last_used_at TIMESTAMPTZ,
                disabled BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(prefix);
            CREATE TABLE IF NOT EXISTS models (
                id UUID PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                served_model_name VARCHAR(255) NOT NULL,
                repo_id VARCHAR(512),
                local_path VARCHAR(512),
                task VARCHAR(32) NOT NULL DEFAULT 'generate',
                engine_type VARCHAR(32) NOT NULL DEFAULT 'vllm',
                device VARCHAR(16),
                selected_gpus JSONB,
                engine_image VARCHAR(255),
                tuning JSONB NOT NULL DEFAULT '{}'::jsonb,
                custom_args JSONB,
                custom_env JSONB,
                hf_token VARCHAR(255),
                state VARCHAR(16) NOT NULL DEFAULT 'stopped',
                archived BOOLEAN NOT NULL DEFAULT FALSE,
                container_name VARCHAR(255),
                port INTEGER,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS usage (
                id UUID PRIMARY KEY,
                org_id UUID,
                user_id UUID,
                key_id UUID,
                model_name VARCHAR(255) NOT NULL,
                task VARCHAR(32) NOT NULL,
                prompt_tokens BIGINT NOT NULL DEFAULT 0,
                completion_tokens BIGINT NOT NULL DEFAULT 0,
                total_tokens BIGINT NOT NULL DEFAULT 0,
                latency_ms BIGINT NOT NULL DEFAULT 0,
                status_code INTEGER NOT NULL DEFAULT 0,
                req_id VARCHAR(64) NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS config_kv (
                key VARCHAR(128) PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recipes (
                id UUID PRIMARY KEY,
                model_id UUID REFERENCES models(id) ON DELETE CASCADE,
                name VARCHAR(255) NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================
    // Models
    // ============================================

    pub async fn create_model(&self, input: CreateModel) -> Result<ModelRow> {
        let row = sqlx::query_as::<_, ModelRow>(
            r#"
            INSERT INTO models (
                id, name, served_model_name, repo_id, local_path, task, engine_type,
                device, selected_gpus, engine_image, tuning, custom_args, custom_env, hf_token
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.name)
        .bind(&input.served_model_name)
        .bind(&input.repo_id)
        .bind(&input.local_path)
        .bind(&input.task)
        .bind(&input.engine_type)
        .bind(&input.device)
        .bind(input.selected_gpus.map(Json))
        .bind(&input.engine_image)
        .bind(Json(input.tuning))
        .bind(input.custom_args.map(Json))
        .bind(input.custom_env.map(Json))
        .bind(&input.hf_token)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_model(&self, id: Uuid) -> Result<Option<ModelRow>> {
        let row = sqlx::query_as::<_, ModelRow>("SELECT * FROM models WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Non-archived models, newest first
    pub async fn list_models(&self) -> Result<Vec<ModelRow>> {
        let rows = sqlx::query_as::<_, ModelRow>(
            "SELECT * FROM models WHERE archived = FALSE ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_running_models(&self) -> Result<Vec<ModelRow>> {
        let rows = sqlx::query_as::<_, ModelRow>(
            "SELECT * FROM models WHERE archived = FALSE AND state = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Whether a served name is taken by another non-archived model
    pub async fn served_name_taken(&self, name: &str, exclude: Option<Uuid>) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM models
            WHERE served_model_name = $1 AND archived = FALSE AND ($2::uuid IS NULL OR id != $2)
            "#,
        )
        .bind(name)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn update_model(&self, id: Uuid, input: UpdateModel) -> Result<Option<ModelRow>> {
        let row = sqlx::query_as::<_, ModelRow>(
            r#"
            UPDATE models
            SET
                name = COALESCE($2, name),
                served_model_name = COALESCE($3, served_model_name),
                repo_id = COALESCE($4, repo_id),
                task = COALESCE($5, task),
                device = COALESCE($6, device),
                selected_gpus = COALESCE($7, selected_gpus),
                engine_image = COALESCE($8, engine_image),
                tuning = COALESCE($9, tuning),
                custom_args = COALESCE($10, custom_args),
                custom_env = COALESCE($11, custom_env),
                hf_token = COALESCE($12, hf_token),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.served_model_name)
        .bind(&input.repo_id)
        .bind(&input.task)
        .bind(&input.device)
        .bind(input.selected_gpus.map(Json))
        .bind(&input.engine_image)
        .bind(input.tuning.map(Json))
        .bind(input.custom_args.map(Json))
        .bind(input.custom_env.map(Json))
        .bind(&input.hf_token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_model_state(&self, id: Uuid, state: &str) -> Result<()> {
        sqlx::query("UPDATE models SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set the runtime shadow after a container transition. `None` clears.
    pub async fn update_model_runtime(
        &self,
        id: Uuid,
        state: &str,
        container_name: Option<&str>,
        port: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE models
            SET state = $2, container_name = $3, port = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(container_name)
        .bind(port)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Soft delete: hide from lists, free the served name for reuse
    pub async fn archive_model(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE models SET archived = TRUE, state = 'stopped', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop the record and any recipes referencing it. Never touches files.
    pub async fn delete_model(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM recipes WHERE model_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM models WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // API keys
    // ============================================

    pub async fn create_api_key(&self, input: CreateApiKey) -> Result<ApiKeyRow> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            INSERT INTO api_keys (id, user_id, org_id, prefix, hash, scopes, ip_allowlist, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(input.org_id)
        .bind(&input.prefix)
        .bind(&input.hash)
        .bind(&input.scopes)
        .bind(&input.ip_allowlist)
        .bind(input.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Active key by its 8-char prefix
    pub async fn find_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKeyRow>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM api_keys WHERE prefix = $1 AND disabled = FALSE",
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn touch_api_key_last_used(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn disable_api_key(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET disabled = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Usage ledger
    // ============================================

    pub async fn insert_usage(&self, input: CreateUsage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage (
                id, org_id, user_id, key_id, model_name, task,
                prompt_tokens, completion_tokens, total_tokens,
                latency_ms, status_code, req_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.org_id)
        .bind(input.user_id)
        .bind(input.key_id)
        .bind(&input.model_name)
        .bind(&input.task)
        .bind(input.prompt_tokens)
        .bind(input.completion_tokens)
        .bind(input.total_tokens)
        .bind(input.latency_ms)
        .bind(input.status_code)
        .bind(&input.req_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================
    // Config KV
    // ============================================

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM config_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn put_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config_kv (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================
    // Users (admin session check)
    // ============================================

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, org_id, username, role, status, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Best-effort wrapper for ledger writes: failures are logged, never raised.
/// The serving response must not depend on the ledger.
pub async fn record_usage_best_effort(db: &Database, input: CreateUsage) {
    let model = input.model_name.clone();
    if let Err(err) = db.insert_usage(input).await {
        tracing::warn!(model = %model, error = %err, "usage record dropped");
    }
}
