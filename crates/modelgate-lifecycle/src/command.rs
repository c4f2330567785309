// Engine CLI synthesis and container specs
//
// Commands are built by walking the tuning struct in a fixed order, so the
// output is deterministic for a given configuration. Sampling parameters
// (temperature, top_p, penalties) are request-time and never emitted here.

use std::collections::BTreeMap;
use std::time::Duration;

use modelgate_core::{EngineKind, LifecycleError, ModelTask, Settings};
use modelgate_storage::models::ModelRow;

/// GPU exposure for a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuRequest {
    None,
    All,
    Ids(Vec<u32>),
}

/// Everything the runtime needs to create an engine container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// host-path:container-path:mode bind strings
    pub binds: Vec<String>,
    pub gpus: GpuRequest,
    pub healthcheck_cmd: String,
    pub healthcheck_interval: Duration,
    pub healthcheck_timeout: Duration,
    pub healthcheck_retries: u64,
    pub healthcheck_start_grace: Duration,
    pub network: String,
    pub shm_size_bytes: i64,
}

pub fn container_name(engine: EngineKind, model_id: uuid::Uuid) -> String {
    format!("{}-model-{}", engine.container_prefix(), model_id)
}

/// Build the engine command line. `resolved_artifact` is the GGUF path
/// relative to the models mount, required for the GGUF engine.
pub fn build_command(
    model: &ModelRow,
    settings: &Settings,
    resolved_artifact: Option<&str>,
) -> Result<Vec<String>, LifecycleError> {
    match EngineKind::parse(&model.engine_type) {
        EngineKind::Vllm => build_vllm_command(model, settings),
        EngineKind::Llamacpp => {
            let artifact = resolved_artifact.ok_or_else(|| {
                LifecycleError::InvalidArtifact("GGUF engine requires a resolved artifact".into())
            })?;
            Ok(build_llamacpp_command(model, settings, artifact))
        }
    }
}

/// Args for the generation-engine image (flags only, no `serve` prefix)
fn build_vllm_command(model: &ModelRow, settings: &Settings) -> Result<Vec<String>, LifecycleError> {
    let tuning = &model.tuning.0;

    let model_arg = match (&model.repo_id, &model.local_path) {
        (Some(repo), None) => repo.clone(),
        (_, Some(path)) => format!("/models/{path}"),
        (None, None) => {
            return Err(LifecycleError::InvalidArtifact(
                "model requires repo_id or local_path".into(),
            ))
        }
    };

    let mut cmd: Vec<String> = vec![
        "--model".into(),
        model_arg.clone(),
        "--host".into(),
        "0.0.0.0".into(),
        "--port".into(),
        "8000".into(),
    ];

    // GGUF weights need an external tokenizer source
    if model_arg.to_lowercase().ends_with(".gguf") {
        if let Some(tok) = tuning.tokenizer.as_ref().or(tuning.hf_config_path.as_ref()) {
            cmd.extend(["--tokenizer".into(), tok.clone()]);
        }
        if let Some(cfg) = &tuning.hf_config_path {
            cmd.extend(["--hf-config-path".into(), cfg.clone()]);
        }
    }

    // Served name keeps routing stable through the registry
    cmd.extend(["--served-model-name".into(), model.served_model_name.clone()]);

    // Embedding models run on the pooling runner
    if ModelTask::parse(&model.task) == ModelTask::Embed {
        cmd.extend(["--runner".into(), "pooling".into()]);
    }

    if let Some(dtype) = &tuning.dtype {
        cmd.extend(["--dtype".into(), dtype.clone()]);
    }
    if let Some(tp) = tuning.tp_size.filter(|tp| *tp > 1) {
        cmd.extend(["--tensor-parallel-size".into(), tp.to_string()]);
    }
    if let Some(pp) = tuning.pipeline_parallel_size {
        cmd.extend(["--pipeline-parallel-size".into(), pp.to_string()]);
    }
    if let Some(util) = tuning.gpu_memory_utilization {
        cmd.extend(["--gpu-memory-utilization".into(), util.to_string()]);
    }
    if let Some(len) = tuning.max_model_len {
        cmd.extend(["--max-model-len".into(), len.to_string()]);
    }
    if let Some(tokens) = tuning.max_num_batched_tokens {
        cmd.extend(["--max-num-batched-tokens".into(), tokens.to_string()]);
    }
    if let Some(dtype) = &tuning.kv_cache_dtype {
        cmd.extend(["--kv-cache-dtype".into(), dtype.clone()]);
    }
    if let Some(quant) = &tuning.quantization {
        cmd.extend(["--quantization".into(), quant.clone()]);
    }
    if let Some(block) = tuning.block_size {
        cmd.extend(["--block-size".into(), block.to_string()]);
    }
    if let Some(swap) = tuning.swap_space_gb {
        cmd.extend(["--swap-space".into(), swap.to_string()]);
    }
    if tuning.enforce_eager == Some(true) {
        cmd.push("--enforce-eager".into());
    }
    if tuning.trust_remote_code == Some(true) {
        cmd.push("--trust-remote-code".into());
    }
    if let Some(offload) = tuning.cpu_offload_gb.filter(|gb| *gb > 0) {
        cmd.extend(["--cpu-offload-gb".into(), offload.to_string()]);
    }
    match tuning.enable_prefix_caching {
        Some(true) => cmd.push("--enable-prefix-caching".into()),
        Some(false) => cmd.push("--no-enable-prefix-caching".into()),
        None => {}
    }
    if let Some(algo) = &tuning.prefix_caching_hash_algo {
        cmd.extend(["--prefix-caching-hash-algo".into(), algo.clone()]);
    }
    if tuning.enable_chunked_prefill == Some(true) {
        cmd.push("--enable-chunked-prefill".into());
    }
    if let Some(seqs) = tuning.max_num_seqs {
        cmd.extend(["--max-num-seqs".into(), seqs.to_string()]);
    }
    if let Some(sizes) = &tuning.cuda_graph_sizes {
        let parts: Vec<String> = sizes
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if !parts.is_empty() {
            cmd.push("--cuda-graph-sizes".into());
            cmd.extend(parts);
        }
    }

    // Gateway authenticates to the engine with the shared internal key
    if !settings.internal_api_key.is_empty() {
        cmd.extend(["--api-key".into(), settings.internal_api_key.clone()]);
    }
    // Online mode shares the HF cache mount
    if model.local_path.is_none() && !settings.hf_cache_dir.is_empty() {
        cmd.extend(["--download-dir".into(), "/root/.cache/huggingface".into()]);
    }

    append_custom_args(&mut cmd, model);
    Ok(cmd)
}

/// Args for the GGUF engine image (ENTRYPOINT is the server binary)
fn build_llamacpp_command(model: &ModelRow, settings: &Settings, artifact: &str) -> Vec<String> {
    let tuning = &model.tuning.0;

    let context = tuning.context_size.unwrap_or(settings.llamacpp_default_context);
    let ngl = tuning.ngl.unwrap_or(settings.llamacpp_default_ngl);
    let batch = tuning.batch_size.unwrap_or(settings.llamacpp_default_batch_size);
    let ubatch = tuning.ubatch_size.unwrap_or(settings.llamacpp_default_ubatch_size);
    let threads = tuning.threads.unwrap_or(settings.llamacpp_default_threads);
    let parallel = tuning.parallel_slots.unwrap_or(settings.llamacpp_max_parallel);
    let cache_k = tuning
        .cache_type_k
        .clone()
        .unwrap_or_else(|| settings.llamacpp_cache_type_k.clone());
    let cache_v = tuning
        .cache_type_v
        .clone()
        .unwrap_or_else(|| settings.llamacpp_cache_type_v.clone());

    let mut cmd: Vec<String> = vec![
        "-m".into(),
        format!("/models/{artifact}"),
        "--host".into(),
        "0.0.0.0".into(),
        "--port".into(),
        "8000".into(),
        "-c".into(),
        context.to_string(),
        "-ngl".into(),
        ngl.to_string(),
        "-b".into(),
        batch.to_string(),
        "-ub".into(),
        ubatch.to_string(),
        "-t".into(),
        threads.to_string(),
    ];

    if let Some(split) = &tuning.tensor_split {
        cmd.extend(["--tensor-split".into(), split.clone()]);
    }
    if let Some(flash) = tuning.flash_attention {
        cmd.extend(["--flash-attn".into(), if flash { "on" } else { "off" }.into()]);
    }
    if tuning.mlock == Some(true) {
        cmd.push("--mlock".into());
    }
    if let Some(numa) = &tuning.numa_policy {
        cmd.extend(["--numa".into(), numa.clone()]);
    }
    if let Some(base) = tuning.rope_freq_base {
        cmd.extend(["--rope-freq-base".into(), base.to_string()]);
    }
    if let Some(scale) = tuning.rope_freq_scale {
        cmd.extend(["--rope-freq-scale".into(), scale.to_string()]);
    }

    // Server-side limits for multi-user stability
    cmd.extend(["--timeout".into(), settings.llamacpp_server_timeout.to_string()]);
    cmd.extend(["--parallel".into(), parallel.to_string()]);
    if settings.llamacpp_cont_batching {
        cmd.push("--cont-batching".into());
    }
    cmd.extend(["--cache-type-k".into(), cache_k]);
    cmd.extend(["--cache-type-v".into(), cache_v]);

    append_custom_args(&mut cmd, model);
    cmd
}

fn append_custom_args(cmd: &mut Vec<String>, model: &ModelRow) {
    if let Some(args) = &model.custom_args {
        cmd.extend(args.0.iter().cloned());
    }
}

/// Assemble the full container spec for a model
pub fn build_container_spec(
    model: &ModelRow,
    settings: &Settings,
    command: Vec<String>,
) -> ContainerSpec {
    let engine = EngineKind::parse(&model.engine_type);
    let name = container_name(engine, model.id);
    let image = model
        .engine_image
        .clone()
        .unwrap_or_else(|| match engine {
            EngineKind::Vllm => settings.vllm_image.clone(),
            EngineKind::Llamacpp => settings.llamacpp_image.clone(),
        });

    let mut env: BTreeMap<String, String> = BTreeMap::new();
    let mut binds: Vec<String> = Vec::new();

    // Models directory is always read-only inside the engine
    if model.local_path.is_some() || engine == EngineKind::Llamacpp {
        binds.push(format!("{}:/models:ro", settings.models_dir_host));
        env.insert("HF_HUB_OFFLINE".into(), "1".into());
    } else {
        // Online mode shares the HF cache read-write
        if !settings.hf_cache_dir_host.is_empty() {
            binds.push(format!(
                "{}:/root/.cache/huggingface:rw",
                settings.hf_cache_dir_host
            ));
        }
        if let Some(token) = &model.hf_token {
            env.insert("HUGGING_FACE_HUB_TOKEN".into(), token.clone());
            env.insert("HF_HUB_ENABLE_HF_TRANSFER".into(), "1".into());
        }
    }

    let cpu_only = model.device.as_deref() == Some("cpu")
        || (engine == EngineKind::Llamacpp && model.tuning.0.ngl == Some(0));
    let gpus = if cpu_only {
        GpuRequest::None
    } else {
        match model.selected_gpus.as_ref().map(|g| g.0.clone()) {
            Some(ids) if !ids.is_empty() => {
                env.insert(
                    "NVIDIA_VISIBLE_DEVICES".into(),
                    ids.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
                );
                GpuRequest::Ids(ids)
            }
            _ => {
                env.insert("NVIDIA_VISIBLE_DEVICES".into(), "all".into());
                GpuRequest::All
            }
        }
    };
    if gpus != GpuRequest::None {
        env.insert("NVIDIA_DRIVER_CAPABILITIES".into(), "compute,utility".into());
    }

    if engine == EngineKind::Vllm && gpus != GpuRequest::None {
        // NCCL/allocator defaults that survive containerized multi-GPU hosts
        env.entry("NCCL_P2P_DISABLE".into()).or_insert("1".into());
        env.entry("NCCL_IB_DISABLE".into()).or_insert("1".into());
        env.entry("NCCL_SHM_DISABLE".into()).or_insert("0".into());
        env.entry("PYTORCH_CUDA_ALLOC_CONF".into())
            .or_insert("expandable_segments:True".into());
    }

    if let Some(custom) = &model.custom_env {
        for (key, value) in custom.0.iter() {
            env.insert(key.clone(), value.clone());
        }
    }

    let (healthcheck_cmd, healthcheck_timeout, start_grace, shm) = match engine {
        EngineKind::Vllm => (
            "wget -qO- http://localhost:8000/health || exit 1".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(15),
            2i64 * 1024 * 1024 * 1024,
        ),
        EngineKind::Llamacpp => (
            "curl -f http://localhost:8000/v1/models || exit 1".to_string(),
            Duration::from_secs(8),
            Duration::from_secs(45),
            8i64 * 1024 * 1024 * 1024,
        ),
    };

    ContainerSpec {
        name,
        image,
        command,
        env,
        binds,
        gpus,
        healthcheck_cmd,
        healthcheck_interval: Duration::from_secs(10),
        healthcheck_timeout,
        healthcheck_retries: 3,
        healthcheck_start_grace: start_grace,
        network: settings.container_network.clone(),
        shm_size_bytes: shm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use modelgate_core::EngineTuning;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn base_model(engine: &str) -> ModelRow {
        ModelRow {
            id: Uuid::nil(),
            name: "Test".into(),
            served_model_name: "test-model".into(),
            repo_id: None,
            local_path: None,
            task: "generate".into(),
            engine_type: engine.into(),
            device: None,
            selected_gpus: None,
            engine_image: None,
            tuning: Json(EngineTuning::default()),
            custom_args: None,
            custom_env: None,
            hf_token: None,
            state: "stopped".into(),
            archived: false,
            container_name: None,
            port: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn settings() -> Settings {
        let mut s = Settings::from_env();
        s.internal_api_key = "internal-secret".into();
        s.models_dir_host = "/srv/models".into();
        s.hf_cache_dir = "/srv/hf".into();
        s.hf_cache_dir_host = "/srv/hf".into();
        s
    }

    #[test]
    fn vllm_command_is_deterministic_and_ordered() {
        let mut model = base_model("vllm");
        model.repo_id = Some("org/llama-7b".into());
        model.tuning = Json(EngineTuning {
            dtype: Some("bfloat16".into()),
            tp_size: Some(2),
            gpu_memory_utilization: Some(0.9),
            max_model_len: Some(8192),
            ..Default::default()
        });

        let cmd = build_command(&model, &settings(), None).unwrap();
        let expected_prefix = vec![
            "--model",
            "org/llama-7b",
            "--host",
            "0.0.0.0",
            "--port",
            "8000",
            "--served-model-name",
            "test-model",
            "--dtype",
            "bfloat16",
            "--tensor-parallel-size",
            "2",
            "--gpu-memory-utilization",
            "0.9",
            "--max-model-len",
            "8192",
        ];
        assert_eq!(&cmd[..expected_prefix.len()], expected_prefix.as_slice());
        assert_eq!(cmd, build_command(&model, &settings(), None).unwrap());
    }

    #[test]
    fn embed_task_gets_the_pooling_runner() {
        let mut model = base_model("vllm");
        model.repo_id = Some("org/bge-large".into());
        model.task = "embed".into();
        let cmd = build_command(&model, &settings(), None).unwrap();
        let pos = cmd.iter().position(|a| a == "--runner").unwrap();
        assert_eq!(cmd[pos + 1], "pooling");
    }

    #[test]
    fn tp_size_of_one_is_omitted() {
        let mut model = base_model("vllm");
        model.repo_id = Some("org/m".into());
        model.tuning = Json(EngineTuning {
            tp_size: Some(1),
            ..Default::default()
        });
        let cmd = build_command(&model, &settings(), None).unwrap();
        assert!(!cmd.contains(&"--tensor-parallel-size".to_string()));
    }

    #[test]
    fn internal_api_key_is_always_injected_when_configured() {
        let mut model = base_model("vllm");
        model.repo_id = Some("org/m".into());
        let cmd = build_command(&model, &settings(), None).unwrap();
        let pos = cmd.iter().position(|a| a == "--api-key").unwrap();
        assert_eq!(cmd[pos + 1], "internal-secret");
    }

    #[test]
    fn no_sampling_parameters_in_any_command() {
        let mut model = base_model("vllm");
        model.repo_id = Some("org/m".into());
        let cmd = build_command(&model, &settings(), None).unwrap();
        for flag in ["--temperature", "--top-p", "--top-k", "--repetition-penalty"] {
            assert!(!cmd.contains(&flag.to_string()), "{flag} must stay request-time");
        }
    }

    #[test]
    fn llamacpp_command_uses_defaults_and_artifact() {
        let model = base_model("llamacpp");
        let cmd = build_command(&model, &settings(), Some("llama/weights.gguf")).unwrap();
        assert_eq!(cmd[0], "-m");
        assert_eq!(cmd[1], "/models/llama/weights.gguf");
        assert!(cmd.contains(&"-ngl".to_string()));
        assert!(cmd.contains(&"--cont-batching".to_string()));
        let pos = cmd.iter().position(|a| a == "--cache-type-k").unwrap();
        assert_eq!(cmd[pos + 1], "q8_0");
    }

    #[test]
    fn llamacpp_without_artifact_is_an_error() {
        let model = base_model("llamacpp");
        assert!(build_command(&model, &settings(), None).is_err());
    }

    #[test]
    fn custom_args_land_last() {
        let mut model = base_model("vllm");
        model.repo_id = Some("org/m".into());
        model.custom_args = Some(Json(vec!["--seed".into(), "42".into()]));
        let cmd = build_command(&model, &settings(), None).unwrap();
        assert_eq!(&cmd[cmd.len() - 2..], ["--seed".to_string(), "42".to_string()]);
    }

    #[test]
    fn spec_mounts_models_readonly_for_local_weights() {
        let mut model = base_model("vllm");
        model.local_path = Some("llama-7b".into());
        let spec = build_container_spec(&model, &settings(), vec![]);
        assert!(spec.binds.contains(&"/srv/models:/models:ro".to_string()));
        assert_eq!(spec.env.get("HF_HUB_OFFLINE").map(String::as_str), Some("1"));
        assert_eq!(spec.name, format!("vllm-model-{}", Uuid::nil()));
    }

    #[test]
    fn spec_mounts_hf_cache_rw_for_online_mode() {
        let mut model = base_model("vllm");
        model.repo_id = Some("org/m".into());
        model.hf_token = Some("hf_secret".into());
        let spec = build_container_spec(&model, &settings(), vec![]);
        assert!(spec
            .binds
            .contains(&"/srv/hf:/root/.cache/huggingface:rw".to_string()));
        assert_eq!(
            spec.env.get("HUGGING_FACE_HUB_TOKEN").map(String::as_str),
            Some("hf_secret")
        );
    }

    #[test]
    fn selected_gpus_narrow_visibility() {
        let mut model = base_model("llamacpp");
        model.selected_gpus = Some(Json(vec![1, 3]));
        let spec = build_container_spec(&model, &settings(), vec![]);
        assert_eq!(spec.gpus, GpuRequest::Ids(vec![1, 3]));
        assert_eq!(
            spec.env.get("NVIDIA_VISIBLE_DEVICES").map(String::as_str),
            Some("1,3")
        );
    }

    #[test]
    fn cpu_device_disables_gpu_exposure() {
        let mut model = base_model("vllm");
        model.repo_id = Some("org/m".into());
        model.device = Some("cpu".into());
        let spec = build_container_spec(&model, &settings(), vec![]);
        assert_eq!(spec.gpus, GpuRequest::None);
        assert!(!spec.env.contains_key("NVIDIA_VISIBLE_DEVICES"));
    }

    #[test]
    fn healthchecks_differ_by_engine() {
        let mut vllm = base_model("vllm");
        vllm.repo_id = Some("org/m".into());
        let vllm_spec = build_container_spec(&vllm, &settings(), vec![]);
        assert!(vllm_spec.healthcheck_cmd.contains("/health"));
        assert_eq!(vllm_spec.healthcheck_start_grace, Duration::from_secs(15));

        let gguf = base_model("llamacpp");
        let gguf_spec = build_container_spec(&gguf, &settings(), vec![]);
        assert!(gguf_spec.healthcheck_cmd.contains("/v1/models"));
        assert_eq!(gguf_spec.healthcheck_start_grace, Duration::from_secs(45));
    }
}
