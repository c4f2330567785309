// Heuristic VRAM estimation
//
// Catches obviously-wrong configurations before a container burns minutes
// loading weights. Generation-engine numbers come from name/dtype
// heuristics; GGUF numbers come from the file on disk plus header metadata.

use std::path::Path;

use modelgate_core::{EngineKind, Settings};
use modelgate_storage::models::ModelRow;
use serde::Serialize;

use crate::gguf::read_gguf_metadata;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy)]
pub struct GpuInfo {
    pub index: u32,
    pub mem_total_mb: u64,
    pub mem_used_mb: u64,
}

impl GpuInfo {
    pub fn free_gb(&self) -> f64 {
        (self.mem_total_mb.saturating_sub(self.mem_used_mb)) as f64 / 1024.0
    }
}

/// Probe host GPUs through nvidia-smi. An absent binary or parse failure
/// yields an empty list, which skips the VRAM fit check.
pub async fn detect_gpus() -> Vec<GpuInfo> {
    let output = match tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
    {
        Ok(out) if out.status.success() => out,
        _ => return Vec::new(),
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            Some(GpuInfo {
                index: fields.next()?.parse().ok()?,
                mem_total_mb: fields.next()?.parse().ok()?,
                mem_used_mb: fields.next()?.parse().ok()?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VramEstimate {
    pub params_b: f64,
    pub model_weights_gb: f64,
    pub kv_cache_gb: f64,
    pub overhead_gb: f64,
    pub total_per_gpu_gb: f64,
    pub required_vram_gb: f64,
    pub gpu_count: usize,
    pub note: &'static str,
}

/// Parameter count guessed from the model's name or path, in billions
fn params_from_name(name: &str) -> f64 {
    let lower = name.to_lowercase();
    const HINTS: &[(&str, f64)] = &[
        ("120b", 120.0),
        ("70b", 70.0),
        ("72b", 70.0),
        ("30b", 30.0),
        ("34b", 30.0),
        ("20b", 20.0),
        ("13b", 13.0),
        ("14b", 13.0),
        ("8b", 8.0),
        ("9b", 8.0),
        ("7b", 7.0),
        ("3b", 3.0),
    ];
    for (hint, params) in HINTS {
        if lower.contains(hint) {
            return *params;
        }
    }
    7.0
}

/// Bytes per KV-cache element for a llama.cpp cache type
fn kv_cache_bytes(cache_type: &str) -> f64 {
    match cache_type.to_lowercase().as_str() {
        "f32" => 4.0,
        "f16" | "bf16" => 2.0,
        "q8_0" => 1.0,
        "q5_1" | "q5_0" => 0.5625,
        "q4_1" | "q4_0" => 0.5,
        _ => 2.0,
    }
}

pub fn estimate_vram(model: &ModelRow, settings: &Settings) -> VramEstimate {
    match EngineKind::parse(&model.engine_type) {
        EngineKind::Vllm => estimate_generation_vram(model),
        EngineKind::Llamacpp => estimate_gguf_vram(model, settings),
    }
}

fn estimate_generation_vram(model: &ModelRow) -> VramEstimate {
    let tuning = &model.tuning.0;
    let name_hint = model
        .local_path
        .as_deref()
        .or(model.repo_id.as_deref())
        .unwrap_or(&model.name);
    let params_b = params_from_name(name_hint);

    let dtype = tuning.dtype.as_deref().unwrap_or("bfloat16").to_lowercase();
    let mut bytes_per_param = if dtype.contains("fp32") {
        4.0
    } else if dtype.contains("fp8") || dtype.contains("int8") {
        1.0
    } else {
        2.0
    };

    let quant = tuning.quantization.as_deref().unwrap_or("").to_lowercase();
    if quant.contains("awq") || quant.contains("gptq") {
        bytes_per_param *= 0.25;
    } else if quant.contains("int8") || quant.contains("fp8") {
        bytes_per_param *= 0.5;
    }

    let mut model_weights_gb = params_b * 1e9 * bytes_per_param / GIB;

    let max_len = tuning.max_model_len.unwrap_or(8192) as f64;
    let max_seqs = tuning.max_num_seqs.unwrap_or(256) as f64;
    let kv_bytes_per_token = if tuning
        .kv_cache_dtype
        .as_deref()
        .unwrap_or("")
        .to_lowercase()
        .contains("fp8")
    {
        1.0
    } else {
        2.0
    };
    let mut kv_cache_gb = max_len * max_seqs * params_b * kv_bytes_per_token / GIB;

    let tp_size = tuning.tp_size.unwrap_or(1).max(1) as f64;
    if tp_size > 1.0 {
        model_weights_gb /= tp_size;
        kv_cache_gb /= tp_size;
    }

    let overhead_gb = (model_weights_gb + kv_cache_gb) * 0.15;
    let total_per_gpu_gb = model_weights_gb + kv_cache_gb + overhead_gb;
    let gpu_mem_util = tuning.gpu_memory_utilization.unwrap_or(0.9);
    let required_vram_gb = total_per_gpu_gb / gpu_mem_util;

    VramEstimate {
        params_b,
        model_weights_gb,
        kv_cache_gb,
        overhead_gb,
        total_per_gpu_gb,
        required_vram_gb,
        gpu_count: tp_size as usize,
        note: "Estimate only - actual usage may vary by ±20%",
    }
}

fn estimate_gguf_vram(model: &ModelRow, settings: &Settings) -> VramEstimate {
    let tuning = &model.tuning.0;

    // Conservative defaults when the file is unreadable
    let mut model_weights_gb = 7.0;
    let mut params_b = 7.0;
    let mut embedding_size = 4096u64;
    let mut num_layers = 32u64;

    if let Some(local_path) = &model.local_path {
        let host_path = Path::new(&settings.models_dir).join(local_path);
        let gguf_file = if local_path.to_lowercase().ends_with(".gguf") {
            host_path.is_file().then_some(host_path)
        } else if host_path.is_dir() {
            std::fs::read_dir(&host_path).ok().and_then(|entries| {
                let mut files: Vec<_> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.extension()
                            .and_then(|e| e.to_str())
                            .map(|e| e.eq_ignore_ascii_case("gguf"))
                            .unwrap_or(false)
                    })
                    .collect();
                files.sort();
                files.into_iter().next()
            })
        } else {
            None
        };

        if let Some(file) = gguf_file {
            if let Ok(meta) = std::fs::metadata(&file) {
                // Quantized weights: file size is close to the VRAM they take
                model_weights_gb = meta.len() as f64 / GIB;
                let quant_hint = local_path.to_lowercase();
                params_b = if quant_hint.contains("q8") || quant_hint.contains("f16") {
                    model_weights_gb
                } else if quant_hint.contains("q6") {
                    model_weights_gb * 1.33
                } else if quant_hint.contains("q5") {
                    model_weights_gb * 1.6
                } else if quant_hint.contains("q4") || quant_hint.contains("q3") {
                    model_weights_gb * 2.0
                } else {
                    model_weights_gb * 1.5
                };
            }
            if let Some(header) = read_gguf_metadata(&file) {
                if let Some(width) = header.embedding_length {
                    embedding_size = width;
                }
                if let Some(layers) = header.block_count {
                    num_layers = layers;
                }
            }
        }
    }

    let context = tuning.context_size.unwrap_or(settings.llamacpp_default_context) as f64;
    let parallel = tuning.parallel_slots.unwrap_or(settings.llamacpp_max_parallel) as f64;
    let head_dim = (embedding_size / 32).max(1) as f64;
    let kv_heads = (num_layers / 4).max(1) as f64;

    let cache_k = tuning
        .cache_type_k
        .as_deref()
        .unwrap_or(&settings.llamacpp_cache_type_k);
    let cache_v = tuning
        .cache_type_v
        .as_deref()
        .unwrap_or(&settings.llamacpp_cache_type_v);
    let bytes_kv = kv_cache_bytes(cache_k) + kv_cache_bytes(cache_v);

    let mut kv_cache_gb =
        context * parallel * num_layers as f64 * head_dim * kv_heads * bytes_kv / GIB;

    let ngl = tuning.ngl.unwrap_or(settings.llamacpp_default_ngl) as u64;
    if ngl == 0 {
        // CPU-only: nothing resident on the GPU
        model_weights_gb = 0.0;
        kv_cache_gb = 0.0;
    } else if ngl < num_layers {
        model_weights_gb *= ngl as f64 / num_layers as f64;
    }

    let gpu_count = model
        .selected_gpus
        .as_ref()
        .map(|g| g.0.len())
        .filter(|n| *n > 0)
        .unwrap_or(1);
    if gpu_count > 1 {
        model_weights_gb /= gpu_count as f64;
        kv_cache_gb /= gpu_count as f64;
    }

    let overhead_gb = (model_weights_gb + kv_cache_gb) * 0.15;
    let total_per_gpu_gb = model_weights_gb + kv_cache_gb + overhead_gb;
    // No utilization knob on this engine; add a flat safety margin instead
    let required_vram_gb = total_per_gpu_gb * 1.1;

    VramEstimate {
        params_b,
        model_weights_gb,
        kv_cache_gb,
        overhead_gb,
        total_per_gpu_gb,
        required_vram_gb,
        gpu_count,
        note: "Estimate only - actual usage may vary by ±20%",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use modelgate_core::EngineTuning;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn model(engine: &str, name: &str, tuning: EngineTuning) -> ModelRow {
        ModelRow {
            id: Uuid::nil(),
            name: name.into(),
            served_model_name: name.into(),
            repo_id: Some(name.into()),
            local_path: None,
            task: "generate".into(),
            engine_type: engine.into(),
            device: None,
            selected_gpus: None,
            engine_image: None,
            tuning: Json(tuning),
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

    fn settings_with_models_dir(dir: &str) -> Settings {
        let mut s = Settings::from_env();
        s.models_dir = dir.to_string();
        s
    }

    #[test]
    fn bf16_7b_lands_near_fourteen_gigabytes_of_weights() {
        let est = estimate_generation_vram(&model("vllm", "org/llama-7b", EngineTuning::default()));
        assert!((est.model_weights_gb - 13.0).abs() < 1.5, "got {}", est.model_weights_gb);
        assert_eq!(est.params_b, 7.0);
        assert!(est.required_vram_gb > est.total_per_gpu_gb, "utilization divisor applies");
    }

    #[test]
    fn tensor_parallel_shards_weights_and_cache() {
        let solo = estimate_generation_vram(&model("vllm", "org/llama-70b", EngineTuning::default()));
        let sharded = estimate_generation_vram(&model(
            "vllm",
            "org/llama-70b",
            EngineTuning {
                tp_size: Some(4),
                ..Default::default()
            },
        ));
        assert!((solo.model_weights_gb / sharded.model_weights_gb - 4.0).abs() < 0.01);
        assert_eq!(sharded.gpu_count, 4);
    }

    #[test]
    fn awq_quarters_the_weight_bytes() {
        let plain = estimate_generation_vram(&model("vllm", "org/m-7b", EngineTuning::default()));
        let awq = estimate_generation_vram(&model(
            "vllm",
            "org/m-7b-awq",
            EngineTuning {
                quantization: Some("awq".into()),
                ..Default::default()
            },
        ));
        assert!((plain.model_weights_gb / awq.model_weights_gb - 4.0).abs() < 0.01);
    }

    #[test]
    fn fp8_kv_cache_halves_cache_bytes() {
        let base = estimate_generation_vram(&model("vllm", "org/m-7b", EngineTuning::default()));
        let fp8 = estimate_generation_vram(&model(
            "vllm",
            "org/m-7b",
            EngineTuning {
                kv_cache_dtype: Some("fp8".into()),
                ..Default::default()
            },
        ));
        assert!((base.kv_cache_gb / fp8.kv_cache_gb - 2.0).abs() < 0.01);
    }

    #[test]
    fn gguf_weights_come_from_file_size() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("m-q4.gguf");
        std::fs::write(&path, vec![0u8; 2 * 1024 * 1024]).unwrap();

        let mut m = model("llamacpp", "m", EngineTuning::default());
        m.local_path = Some("m-q4.gguf".into());
        let est = estimate_gguf_vram(&m, &settings_with_models_dir(tmp.path().to_str().unwrap()));
        let expected_weights = 2.0 * 1024.0 * 1024.0 / GIB;
        assert!((est.model_weights_gb - expected_weights).abs() < 1e-9);
        // q4 hint: ~2B params per GB
        assert!((est.params_b - expected_weights * 2.0).abs() < 1e-9);
    }

    #[test]
    fn ngl_zero_means_no_vram() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("m.gguf"), vec![0u8; 1024]).unwrap();
        let mut m = model(
            "llamacpp",
            "m",
            EngineTuning {
                ngl: Some(0),
                ..Default::default()
            },
        );
        m.local_path = Some("m.gguf".into());
        let est = estimate_gguf_vram(&m, &settings_with_models_dir(tmp.path().to_str().unwrap()));
        assert_eq!(est.model_weights_gb, 0.0);
        assert_eq!(est.kv_cache_gb, 0.0);
    }

    #[test]
    fn partial_offload_scales_weights_by_layer_fraction() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("m.gguf"), vec![0u8; 1024 * 1024]).unwrap();
        let settings = settings_with_models_dir(tmp.path().to_str().unwrap());

        let mut full = model("llamacpp", "m", EngineTuning { ngl: Some(999), ..Default::default() });
        full.local_path = Some("m.gguf".into());
        let mut half = model("llamacpp", "m", EngineTuning { ngl: Some(16), ..Default::default() });
        half.local_path = Some("m.gguf".into());

        let full_est = estimate_gguf_vram(&full, &settings);
        let half_est = estimate_gguf_vram(&half, &settings);
        // Default layer count is 32, so ngl=16 halves resident weights
        assert!((full_est.model_weights_gb / half_est.model_weights_gb - 2.0).abs() < 0.01);
    }

    #[test]
    fn cache_type_multipliers_are_keyed_by_enum() {
        assert_eq!(kv_cache_bytes("f32"), 4.0);
        assert_eq!(kv_cache_bytes("F16"), 2.0);
        assert_eq!(kv_cache_bytes("q8_0"), 1.0);
        assert_eq!(kv_cache_bytes("q5_0"), 0.5625);
        assert_eq!(kv_cache_bytes("q4_0"), 0.5);
        assert_eq!(kv_cache_bytes("unknown"), 2.0);
    }
}
