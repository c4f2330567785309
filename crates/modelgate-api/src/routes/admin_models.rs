// Admin model lifecycle endpoints
//
// Session-authenticated operator surface. All container work goes through
// the lifecycle manager; these handlers only shape requests and responses.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use modelgate_core::{EngineTuning, GatewayError};
use modelgate_storage::models::{CreateModel, ModelRow, UpdateModel};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::require_admin;
use crate::error::{ApiError, ApiResult, RequestId};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/admin/models", get(list_models).post(create_model))
        .route(
            "/admin/models/:id",
            axum::routing::patch(update_model).delete(delete_model),
        )
        .route("/admin/models/:id/start", post(start_model))
        .route("/admin/models/:id/stop", post(stop_model))
        .route("/admin/models/:id/apply", post(apply_model))
        .route("/admin/models/:id/dry-run", post(dry_run_model))
        .route("/admin/models/:id/archive", post(archive_model))
        .route("/admin/models/:id/logs", get(model_logs))
        .route("/admin/models/:id/readiness", get(model_readiness))
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateModelRequest {
    pub name: String,
    pub served_model_name: String,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default = "default_engine")]
    pub engine_type: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub selected_gpus: Option<Vec<u32>>,
    #[serde(default)]
    pub engine_image: Option<String>,
    #[serde(default)]
    pub tuning: EngineTuning,
    #[serde(default)]
    pub custom_args: Option<Vec<String>>,
    #[serde(default)]
    pub custom_env: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    pub hf_token: Option<String>,
}

fn default_task() -> String {
    "generate".into()
}

fn default_engine() -> String {
    "vllm".into()
}

/// Patch body. Identity, local_path, and engine type are immutable after
/// creation; their presence here is rejected outright.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateModelRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub served_model_name: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub selected_gpus: Option<Vec<u32>>,
    #[serde(default)]
    pub engine_image: Option<String>,
    #[serde(default)]
    pub tuning: Option<EngineTuning>,
    #[serde(default)]
    pub custom_args: Option<Vec<String>>,
    #[serde(default)]
    pub custom_env: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    pub hf_token: Option<String>,
    // Immutable fields, present only to produce a clear rejection
    #[serde(default)]
    pub engine_type: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub id: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModelItem {
    pub id: Uuid,
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
    pub state: String,
    pub container_name: Option<String>,
    pub port: Option<i32>,
    pub hf_token_set: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ModelRow> for ModelItem {
    fn from(row: ModelRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            served_model_name: row.served_model_name,
            repo_id: row.repo_id,
            local_path: row.local_path,
            task: row.task,
            engine_type: row.engine_type,
            device: row.device,
            selected_gpus: row.selected_gpus.map(|g| g.0),
            engine_image: row.engine_image,
            tuning: row.tuning.0,
            custom_args: row.custom_args.map(|a| a.0),
            state: if row.archived {
                "archived".into()
            } else {
                row.state
            },
            container_name: row.container_name,
            port: row.port,
            hf_token_set: row.hf_token.is_some(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: usize,
}

fn default_tail() -> usize {
    1000
}

/// List non-archived models
#[utoipa::path(
    get,
    path = "/admin/models",
    responses(
        (status = 200, description = "Model configurations", body = Vec<ModelItem>),
        (status = 401, description = "No admin session")
    ),
    tag = "admin-models"
)]
pub async fn list_models(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
) -> ApiResult<Json<Vec<ModelItem>>> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    let rows = state
        .db
        .list_models()
        .await
        .map_err(|e| ApiError::new(GatewayError::Internal(e), &req_id))?;
    Ok(Json(rows.into_iter().map(ModelItem::from).collect()))
}

/// Create a model configuration in `stopped`
#[utoipa::path(
    post,
    path = "/admin/models",
    request_body = CreateModelRequest,
    responses(
        (status = 201, description = "Model created", body = ModelItem),
        (status = 400, description = "Invalid configuration"),
        (status = 409, description = "served_model_name already in use")
    ),
    tag = "admin-models"
)]
pub async fn create_model(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Json(req): Json<CreateModelRequest>,
) -> ApiResult<(StatusCode, Json<ModelItem>)> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;

    let input = CreateModel {
        name: req.name,
        served_model_name: req.served_model_name,
        repo_id: req.repo_id,
        local_path: req.local_path,
        task: req.task,
        engine_type: req.engine_type,
        device: req.device,
        selected_gpus: req.selected_gpus,
        engine_image: req.engine_image,
        tuning: req.tuning,
        custom_args: req.custom_args,
        custom_env: req.custom_env,
        hf_token: req.hf_token,
    };
    let row = state
        .lifecycle
        .create(input)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok((StatusCode::CREATED, Json(row.into())))
}

/// Merge mutations into a model configuration
#[utoipa::path(
    patch,
    path = "/admin/models/{id}",
    params(("id" = Uuid, Path, description = "Model ID")),
    request_body = UpdateModelRequest,
    responses(
        (status = 200, description = "Model updated", body = ModelItem),
        (status = 400, description = "Immutable field in patch"),
        (status = 404, description = "Model not found")
    ),
    tag = "admin-models"
)]
pub async fn update_model(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateModelRequest>,
) -> ApiResult<Json<ModelItem>> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;

    for (field, present) in [
        ("id", req.id.is_some()),
        ("engine_type", req.engine_type.is_some()),
        ("local_path", req.local_path.is_some()),
    ] {
        if present {
            return Err(ApiError::new(
                GatewayError::bad_request(format!("'{field}' is immutable after creation")),
                &req_id,
            ));
        }
    }

    let patch = UpdateModel {
        name: req.name,
        served_model_name: req.served_model_name,
        repo_id: req.repo_id,
        task: req.task,
        device: req.device,
        selected_gpus: req.selected_gpus,
        engine_image: req.engine_image,
        tuning: req.tuning,
        custom_args: req.custom_args,
        custom_env: req.custom_env,
        hf_token: req.hf_token,
    };
    let row = state
        .lifecycle
        .update(id, patch)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(Json(row.into()))
}

/// Delete the record and registry entry. Files on disk stay untouched.
#[utoipa::path(
    delete,
    path = "/admin/models/{id}",
    params(("id" = Uuid, Path, description = "Model ID")),
    responses(
        (status = 204, description = "Model deleted"),
        (status = 404, description = "Model not found")
    ),
    tag = "admin-models"
)]
pub async fn delete_model(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    state
        .lifecycle
        .delete(id)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/admin/models/{id}/start",
    params(("id" = Uuid, Path, description = "Model ID")),
    responses(
        (status = 200, description = "Engine started", body = ModelItem),
        (status = 400, description = "Validation failed"),
        (status = 504, description = "Container creation exceeded the budget")
    ),
    tag = "admin-models"
)]
pub async fn start_model(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ModelItem>> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    let row = state
        .lifecycle
        .start(id)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(Json(row.into()))
}

#[utoipa::path(
    post,
    path = "/admin/models/{id}/stop",
    params(("id" = Uuid, Path, description = "Model ID")),
    responses((status = 200, description = "Engine stopped", body = ModelItem)),
    tag = "admin-models"
)]
pub async fn stop_model(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ModelItem>> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    let row = state
        .lifecycle
        .stop(id)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(Json(row.into()))
}

/// Restart with the current configuration (stop + start)
#[utoipa::path(
    post,
    path = "/admin/models/{id}/apply",
    params(("id" = Uuid, Path, description = "Model ID")),
    responses((status = 200, description = "Engine restarted", body = ModelItem)),
    tag = "admin-models"
)]
pub async fn apply_model(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ModelItem>> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    let row = state
        .lifecycle
        .apply(id)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(Json(row.into()))
}

/// Effective command + VRAM estimate, no container involved
#[utoipa::path(
    post,
    path = "/admin/models/{id}/dry-run",
    params(("id" = Uuid, Path, description = "Model ID")),
    responses((status = 200, description = "Validation result")),
    tag = "admin-models"
)]
pub async fn dry_run_model(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    let result = state
        .lifecycle
        .dry_run(id)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(Json(result).into_response())
}

/// Soft delete: hide the record, free the served name
#[utoipa::path(
    post,
    path = "/admin/models/{id}/archive",
    params(("id" = Uuid, Path, description = "Model ID")),
    responses((status = 204, description = "Model archived")),
    tag = "admin-models"
)]
pub async fn archive_model(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    state
        .lifecycle
        .archive(id)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/admin/models/{id}/logs",
    params(("id" = Uuid, Path, description = "Model ID")),
    responses((status = 200, description = "Container log tail")),
    tag = "admin-models"
)]
pub async fn model_logs(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    let logs = state
        .lifecycle
        .logs(id, query.tail)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(Json(json!({ "logs": logs })))
}

/// Container + health-state readiness for one model
#[utoipa::path(
    get,
    path = "/admin/models/{id}/readiness",
    params(("id" = Uuid, Path, description = "Model ID")),
    responses((status = 200, description = "Readiness report")),
    tag = "admin-models"
)]
pub async fn model_readiness(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    jar: CookieJar,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    require_admin(&state, &jar)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    let report = state
        .lifecycle
        .readiness(id, &state.health)
        .await
        .map_err(|e| ApiError::new(e, &req_id))?;
    Ok(Json(report).into_response())
}
