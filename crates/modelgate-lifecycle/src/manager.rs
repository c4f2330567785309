// Engine lifecycle manager
//
// Owns the model state machine and the registry writes that accompany it.
// Validation failures leave the record untouched; only failures after the
// container work begins flip a model to `failed`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use modelgate_core::{
    EngineKind, GatewayError, HealthMap, LifecycleError, ModelRegistry, ModelState, ModelTask,
    RegistryEntry, Settings,
};
use modelgate_storage::models::{CreateModel, ModelRow, UpdateModel};
use modelgate_storage::Database;
use serde::Serialize;
use uuid::Uuid;

use crate::artifact::resolve_gguf_artifact;
use crate::command::{build_command, build_container_spec, container_name};
use crate::estimate::{detect_gpus, estimate_vram, VramEstimate};
use crate::runtime::{ensure_image, ContainerRuntime};
use crate::validate::{validate_model, Severity, ValidationWarning};

/// Budget for one admin container operation before surfacing 504
const CONTAINER_OP_BUDGET: Duration = Duration::from_secs(120);

const REGISTRY_CONFIG_KEY: &str = "model_registry";

#[derive(Debug, Serialize)]
pub struct DryRunResult {
    pub valid: bool,
    pub engine: String,
    pub command: Vec<String>,
    pub vram_estimate: VramEstimate,
    pub warnings: Vec<ValidationWarning>,
}

#[derive(Debug, Serialize)]
pub struct ReadinessReport {
    pub state: String,
    pub container_running: bool,
    pub healthy: bool,
    pub url: Option<String>,
}

pub struct LifecycleManager {
    db: Database,
    runtime: Arc<dyn ContainerRuntime>,
    registry: ModelRegistry,
    settings: Arc<Settings>,
}

impl LifecycleManager {
    pub fn new(
        db: Database,
        runtime: Arc<dyn ContainerRuntime>,
        registry: ModelRegistry,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            runtime,
            registry,
            settings,
        }
    }

    pub async fn create(&self, input: CreateModel) -> Result<ModelRow, GatewayError> {
        if input.served_model_name.trim().is_empty() {
            return Err(GatewayError::bad_request("served_model_name required"));
        }
        if input.repo_id.is_none() && input.local_path.is_none() {
            return Err(GatewayError::bad_request("repo_id or local_path required"));
        }
        if let Some(args) = &input.custom_args {
            crate::validate::check_forbidden_args(args)?;
        }
        if self
            .db
            .served_name_taken(&input.served_model_name, None)
            .await
            .map_err(GatewayError::Internal)?
        {
            return Err(GatewayError::conflict(format!(
                "served_model_name '{}' already in use",
                input.served_model_name
            )));
        }
        self.db.create_model(input).await.map_err(GatewayError::Internal)
    }

    pub async fn update(&self, id: Uuid, patch: UpdateModel) -> Result<ModelRow, GatewayError> {
        if let Some(name) = &patch.served_model_name {
            if self
                .db
                .served_name_taken(name, Some(id))
                .await
                .map_err(GatewayError::Internal)?
            {
                return Err(GatewayError::conflict(format!(
                    "served_model_name '{name}' already in use"
                )));
            }
        }
        if let Some(args) = &patch.custom_args {
            crate::validate::check_forbidden_args(args)?;
        }
        self.db
            .update_model(id, patch)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::not_found("model not found"))
    }

    async fn get_required(&self, id: Uuid) -> Result<ModelRow, GatewayError> {
        self.db
            .get_model(id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::not_found("model not found"))
    }

    /// Resolve the artifact a start/dry-run will load, when the engine needs
    /// one. Returns the path relative to the models mount.
    fn resolve_artifact(&self, model: &ModelRow) -> Result<Option<String>, LifecycleError> {
        if EngineKind::parse(&model.engine_type) != EngineKind::Llamacpp {
            return Ok(None);
        }
        let local_path = model.local_path.as_deref().ok_or_else(|| {
            LifecycleError::InvalidArtifact("GGUF engine requires local_path".into())
        })?;
        let resolved =
            resolve_gguf_artifact(std::path::Path::new(&self.settings.models_dir), local_path)?;
        Ok(Some(resolved.relative_path))
    }

    /// Start an engine container. Starting an already-running model restarts
    /// it (stop-then-start on the same canonical name).
    pub async fn start(&self, id: Uuid) -> Result<ModelRow, GatewayError> {
        let model = self.get_required(id).await?;
        if model.archived {
            return Err(GatewayError::bad_request("model is archived"));
        }

        // Pre-flight: everything that can fail cheaply fails here, with the
        // record left in its prior state.
        let artifact = self.resolve_artifact(&model)?;
        let estimate = estimate_vram(&model, &self.settings);
        let gpus = detect_gpus().await;
        let warnings = validate_model(&model, Some(&estimate), &gpus)?;
        if let Some(blocker) = warnings.iter().find(|w| w.severity == Severity::Error) {
            tracing::warn!(model = %model.served_model_name, issue = %blocker.message, "start blocked");
            return Err(LifecycleError::InsufficientVram {
                gpu_index: 0,
                required_gb: estimate.required_vram_gb,
                free_gb: gpus.first().map(|g| g.free_gb()).unwrap_or(0.0),
            }
            .into());
        }

        let command = build_command(&model, &self.settings, artifact.as_deref())?;
        let spec = build_container_spec(&model, &self.settings, command);
        ensure_image(self.runtime.as_ref(), &self.settings, &spec.image).await?;

        self.db
            .update_model_state(id, ModelState::Loading.as_str())
            .await
            .map_err(GatewayError::Internal)?;

        // Idempotent by canonical name: clear any stale container first
        self.runtime.stop_and_remove(&spec.name, 5).await?;

        let created = match tokio::time::timeout(
            CONTAINER_OP_BUDGET,
            self.runtime.create_container(&spec),
        )
        .await
        {
            Ok(Ok(created)) => created,
            Ok(Err(err)) => {
                self.fail_start(id).await;
                return Err(err.into());
            }
            Err(_) => {
                self.fail_start(id).await;
                return Err(GatewayError::OperationTimeout(
                    "container creation exceeded the operation budget".into(),
                ));
            }
        };

        self.db
            .update_model_runtime(
                id,
                ModelState::Running.as_str(),
                Some(&created.name),
                Some(created.host_port as i32),
            )
            .await
            .map_err(GatewayError::Internal)?;

        // Peer addressing via the shared network; readiness is probed
        // separately by the health poller.
        let url = format!("http://{}:8000", created.name);
        self.registry.register(
            &model.served_model_name,
            RegistryEntry {
                url,
                task: ModelTask::parse(&model.task),
                engine_type: EngineKind::parse(&model.engine_type),
            },
        );
        self.persist_registry().await;

        tracing::info!(
            model = %model.served_model_name,
            container = %created.name,
            port = created.host_port,
            "engine started"
        );
        self.get_required(id).await
    }

    async fn fail_start(&self, id: Uuid) {
        if let Err(err) = self
            .db
            .update_model_runtime(id, ModelState::Failed.as_str(), None, None)
            .await
        {
            tracing::error!(model_id = %id, error = %err, "could not record failed start");
        }
    }

    pub async fn stop(&self, id: Uuid) -> Result<ModelRow, GatewayError> {
        let model = self.get_required(id).await?;
        self.teardown(&model).await?;
        self.get_required(id).await
    }

    /// Stop container, clear the runtime shadow, unregister the endpoint
    async fn teardown(&self, model: &ModelRow) -> Result<(), GatewayError> {
        let engine = EngineKind::parse(&model.engine_type);
        let name = container_name(engine, model.id);
        let stop_timeout = match engine {
            EngineKind::Vllm => 5,
            EngineKind::Llamacpp => 10,
        };
        self.runtime.stop_and_remove(&name, stop_timeout).await?;
        self.db
            .update_model_runtime(model.id, ModelState::Stopped.as_str(), None, None)
            .await
            .map_err(GatewayError::Internal)?;
        self.registry.unregister(&model.served_model_name);
        self.persist_registry().await;
        Ok(())
    }

    /// Restart with the current configuration
    pub async fn apply(&self, id: Uuid) -> Result<ModelRow, GatewayError> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Validate + synthesize without touching the container runtime
    pub async fn dry_run(&self, id: Uuid) -> Result<DryRunResult, GatewayError> {
        let model = self.get_required(id).await?;
        let engine = EngineKind::parse(&model.engine_type).as_str().to_string();
        let estimate = estimate_vram(&model, &self.settings);
        let gpus = detect_gpus().await;

        let mut warnings = Vec::new();
        let mut valid = true;

        let artifact = match self.resolve_artifact(&model) {
            Ok(artifact) => artifact,
            Err(err) => {
                valid = false;
                warnings.push(ValidationWarning {
                    severity: Severity::Error,
                    category: "artifact".into(),
                    title: "Artifact Resolution Failed".into(),
                    message: err.to_string(),
                    fix: None,
                });
                None
            }
        };

        match validate_model(&model, Some(&estimate), &gpus) {
            Ok(mut more) => {
                if more.iter().any(|w| w.severity == Severity::Error) {
                    valid = false;
                }
                warnings.append(&mut more);
            }
            Err(err) => {
                valid = false;
                warnings.push(ValidationWarning {
                    severity: Severity::Error,
                    category: "config".into(),
                    title: "Configuration Rejected".into(),
                    message: err.to_string(),
                    fix: None,
                });
            }
        }

        let command = match build_command(&model, &self.settings, artifact.as_deref()) {
            Ok(cmd) => cmd,
            Err(err) => {
                valid = false;
                warnings.push(ValidationWarning {
                    severity: Severity::Error,
                    category: "config".into(),
                    title: "Command Synthesis Failed".into(),
                    message: err.to_string(),
                    fix: None,
                });
                Vec::new()
            }
        };

        Ok(DryRunResult {
            valid,
            engine,
            command,
            vram_estimate: estimate,
            warnings,
        })
    }

    /// Drop the record and registry entry. Model files on disk are never
    /// touched; offline hosts reuse them for the next configuration.
    pub async fn delete(&self, id: Uuid) -> Result<(), GatewayError> {
        let model = self.get_required(id).await?;
        self.teardown(&model).await?;
        self.db.delete_model(id).await.map_err(GatewayError::Internal)?;
        Ok(())
    }

    /// Soft delete: record persists read-only, the served name is freed
    pub async fn archive(&self, id: Uuid) -> Result<(), GatewayError> {
        let model = self.get_required(id).await?;
        self.teardown(&model).await?;
        self.db.archive_model(id).await.map_err(GatewayError::Internal)?;
        Ok(())
    }

    pub async fn logs(&self, id: Uuid, tail: usize) -> Result<String, GatewayError> {
        let model = self.get_required(id).await?;
        let name = container_name(EngineKind::parse(&model.engine_type), model.id);
        Ok(self.runtime.logs(&name, tail).await?)
    }

    /// Container + health view of one model, for the readiness endpoint
    pub async fn readiness(
        &self,
        id: Uuid,
        health: &HealthMap,
    ) -> Result<ReadinessReport, GatewayError> {
        let model = self.get_required(id).await?;
        let name = container_name(EngineKind::parse(&model.engine_type), model.id);
        let container_running = self.runtime.container_running(&name).await?;
        let url = self
            .registry
            .get(&model.served_model_name)
            .map(|entry| entry.url);
        let healthy = url
            .as_deref()
            .map(|u| health.is_fresh_ok(u, Utc::now(), self.settings.health_check_ttl_sec as i64))
            .unwrap_or(false);
        Ok(ReadinessReport {
            state: model.state,
            container_running,
            healthy,
            url,
        })
    }

    /// Load the persisted registry blob, called once at startup before the
    /// server accepts traffic
    pub async fn load_registry(&self) {
        match self.db.get_config(REGISTRY_CONFIG_KEY).await {
            Ok(Some(blob)) => {
                self.registry.load_persisted_json(&blob);
                tracing::info!(entries = self.registry.len(), "model registry restored");
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "could not load persisted registry"),
        }
    }

    /// Write-through persistence after every mutation; failures are logged
    /// and never abort the caller
    async fn persist_registry(&self) {
        let blob = self.registry.to_persisted_json();
        if let Err(err) = self.db.put_config(REGISTRY_CONFIG_KEY, &blob).await {
            tracing::error!(error = %err, "failed to persist model registry");
        }
    }

    /// Shutdown path: stop every running container and clear its shadow
    pub async fn stop_all_running(&self) {
        let running = match self.db.list_running_models().await {
            Ok(list) => list,
            Err(err) => {
                tracing::error!(error = %err, "cannot enumerate running models for shutdown");
                return;
            }
        };
        for model in running {
            if let Err(err) = self.teardown(&model).await {
                tracing::warn!(model = %model.served_model_name, error = %err, "shutdown teardown failed");
            }
        }
    }
}
