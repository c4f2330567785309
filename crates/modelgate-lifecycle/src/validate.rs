// Pre-flight validation of model configurations
//
// Three classes of checks before a container is created:
//   1. custom startup args against a deny list (hard error)
//   2. typo detection for GGUF engine flags (warning with suggestion)
//   3. resource sanity: VRAM fit, GPU counts, context size, quantization

use modelgate_core::{EngineKind, LifecycleError};
use modelgate_storage::models::ModelRow;
use serde::Serialize;

use crate::estimate::{GpuInfo, VramEstimate};

/// Flags users may not override; the gateway owns these
const FORBIDDEN_CUSTOM_ARGS: &[&str] = &[
    "--port",
    "--host",
    "--api-key",
    "--served-model-name",
    "--model",
    "-m",
    "--ssl-keyfile",
    "--ssl-certfile",
];

/// Known GGUF engine flags, for typo suggestions on custom args
const KNOWN_LLAMACPP_FLAGS: &[&str] = &[
    "--alias",
    "--batch-size",
    "--cache-type-k",
    "--cache-type-v",
    "--chat-template",
    "--cont-batching",
    "--ctx-size",
    "--embedding",
    "--flash-attn",
    "--grp-attn-n",
    "--grp-attn-w",
    "--keep",
    "--lora",
    "--main-gpu",
    "--metrics",
    "--mirostat",
    "--mlock",
    "--mmproj",
    "--no-mmap",
    "--no-warmup",
    "--numa",
    "--parallel",
    "--predict",
    "--rope-freq-base",
    "--rope-freq-scale",
    "--rope-scaling",
    "--seed",
    "--slots",
    "--split-mode",
    "--tensor-split",
    "--threads",
    "--threads-batch",
    "--timeout",
    "--ubatch-size",
    "--verbose",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One finding from the pre-flight pass
#[derive(Debug, Clone, Serialize)]
pub struct ValidationWarning {
    pub severity: Severity,
    pub category: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

impl ValidationWarning {
    fn new(
        severity: Severity,
        category: &str,
        title: impl Into<String>,
        message: impl Into<String>,
        fix: Option<String>,
    ) -> Self {
        Self {
            severity,
            category: category.to_string(),
            title: title.into(),
            message: message.into(),
            fix,
        }
    }
}

/// Reject custom args on the deny list. Values may appear as `--flag` or
/// `--flag=value`; both forms are matched.
pub fn check_forbidden_args(args: &[String]) -> Result<(), LifecycleError> {
    for arg in args {
        let flag = arg.split('=').next().unwrap_or(arg);
        if FORBIDDEN_CUSTOM_ARGS.contains(&flag) {
            return Err(LifecycleError::ForbiddenCustomArg { flag: flag.into() });
        }
    }
    Ok(())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Closest known flag within edit distance 2, for "did you mean" hints
pub fn find_closest_flag(flag: &str) -> Option<&'static str> {
    KNOWN_LLAMACPP_FLAGS
        .iter()
        .map(|known| (levenshtein(flag, known), *known))
        .filter(|(distance, _)| *distance <= 2)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, known)| known)
}

/// Full pre-flight pass. Hard failures (forbidden args) come back as Err;
/// everything else is a warning in the returned list.
pub fn validate_model(
    model: &ModelRow,
    estimate: Option<&VramEstimate>,
    available_gpus: &[GpuInfo],
) -> Result<Vec<ValidationWarning>, LifecycleError> {
    let mut warnings = Vec::new();
    let engine = EngineKind::parse(&model.engine_type);
    let tuning = &model.tuning.0;

    if let Some(args) = &model.custom_args {
        check_forbidden_args(&args.0)?;

        if engine == EngineKind::Llamacpp {
            for arg in args.0.iter().filter(|a| a.starts_with("--")) {
                let flag = arg.split('=').next().unwrap_or(arg);
                if !KNOWN_LLAMACPP_FLAGS.contains(&flag) {
                    let fix = find_closest_flag(flag)
                        .map(|suggestion| format!("Did you mean '{suggestion}'?"));
                    warnings.push(ValidationWarning::new(
                        Severity::Warning,
                        "args",
                        "Unknown Flag",
                        format!("'{flag}' is not a recognized engine flag"),
                        fix,
                    ));
                }
            }
        }
    }

    // VRAM fit against each GPU the model will occupy
    if let Some(est) = estimate {
        let occupied = match engine {
            EngineKind::Vllm => tuning.tp_size.unwrap_or(1) as usize,
            EngineKind::Llamacpp => model
                .selected_gpus
                .as_ref()
                .map(|g| g.0.len().max(1))
                .unwrap_or(1),
        };
        for (index, gpu) in available_gpus.iter().take(occupied).enumerate() {
            let free_gb = gpu.free_gb();
            if est.required_vram_gb > free_gb {
                warnings.push(ValidationWarning::new(
                    Severity::Error,
                    "memory",
                    format!("Insufficient VRAM on GPU {index}"),
                    format!(
                        "Estimated need: {:.1} GB, Available: {:.1} GB",
                        est.required_vram_gb, free_gb
                    ),
                    Some(match engine {
                        EngineKind::Vllm => "Reduce GPU Memory Utilization, Max Context Length, or enable KV cache quantization".into(),
                        EngineKind::Llamacpp => "Reduce Context Size, Parallel Slots, or use more aggressive KV cache quantization (q4_0)".into(),
                    }),
                ));
            } else if est.required_vram_gb > free_gb * 0.9 {
                warnings.push(ValidationWarning::new(
                    Severity::Warning,
                    "memory",
                    format!("Tight VRAM on GPU {index}"),
                    format!(
                        "Estimated need: {:.1} GB, Available: {:.1} GB (little headroom)",
                        est.required_vram_gb, free_gb
                    ),
                    Some("Consider reducing settings slightly for safety margin".into()),
                ));
            }
        }
    }

    // Tensor parallel cannot exceed the GPUs it can shard over
    let tp_size = tuning.tp_size.unwrap_or(1);
    let gpu_count = model
        .selected_gpus
        .as_ref()
        .map(|g| g.0.len())
        .unwrap_or_else(|| available_gpus.len());
    if engine == EngineKind::Vllm && gpu_count > 0 && tp_size as usize > gpu_count {
        return Err(LifecycleError::GpuCountExceeded {
            tp_size,
            gpu_count,
        });
    }

    if tuning.max_model_len.unwrap_or(0) > 131_072 {
        warnings.push(ValidationWarning::new(
            Severity::Warning,
            "config",
            "Very Large Context",
            format!(
                "Max context length ({}) is extremely large and may cause OOM",
                tuning.max_model_len.unwrap_or(0)
            ),
            Some("Consider reducing to 32K-64K unless you specifically need larger context".into()),
        ));
    }

    // Quantization schemes that need matching pre-quantized weights
    let quant = tuning.quantization.as_deref().unwrap_or("").to_lowercase();
    let model_path = model
        .local_path
        .as_deref()
        .or(model.repo_id.as_deref())
        .unwrap_or(&model.name)
        .to_lowercase();
    match quant.as_str() {
        "awq" if !model_path.contains("awq") => warnings.push(ValidationWarning::new(
            Severity::Warning,
            "config",
            "AWQ Quantization Mismatch",
            "AWQ quantization selected but model name/path does not indicate AWQ weights",
            Some("AWQ requires a model pre-quantized with AWQ. Using AWQ with non-AWQ weights will fail.".into()),
        )),
        "gptq" if !model_path.contains("gptq") => warnings.push(ValidationWarning::new(
            Severity::Warning,
            "config",
            "GPTQ Quantization Mismatch",
            "GPTQ quantization selected but model name/path does not indicate GPTQ weights",
            Some("GPTQ requires a model pre-quantized with GPTQ. Using GPTQ with non-GPTQ weights will fail.".into()),
        )),
        "fp8" => warnings.push(ValidationWarning::new(
            Severity::Info,
            "config",
            "FP8 Quantization Note",
            "FP8 quantization requires Hopper (H100) or Ada (RTX 40xx) GPU with SM 8.9+",
            Some("If startup fails on an older GPU, try INT8 instead.".into()),
        )),
        _ => {}
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use modelgate_core::EngineTuning;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn model(engine: &str, tuning: EngineTuning) -> ModelRow {
        ModelRow {
            id: Uuid::nil(),
            name: "m".into(),
            served_model_name: "m".into(),
            repo_id: Some("org/m".into()),
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

    fn gpu(total_mb: u64, used_mb: u64) -> GpuInfo {
        GpuInfo {
            index: 0,
            mem_total_mb: total_mb,
            mem_used_mb: used_mb,
        }
    }

    #[test]
    fn forbidden_args_are_rejected_with_the_flag_named() {
        let err = check_forbidden_args(&["--seed".into(), "--port=9999".into()]).unwrap_err();
        match err {
            LifecycleError::ForbiddenCustomArg { flag } => assert_eq!(flag, "--port"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(check_forbidden_args(&["--seed".into(), "42".into()]).is_ok());
    }

    #[test]
    fn typo_detection_suggests_the_near_miss() {
        assert_eq!(find_closest_flag("--tensor-spilt"), Some("--tensor-split"));
        assert_eq!(find_closest_flag("--mlok"), Some("--mlock"));
        assert_eq!(find_closest_flag("--nothing-like-any-flag"), None);
    }

    #[test]
    fn unknown_llamacpp_flag_warns_with_suggestion() {
        let mut m = model("llamacpp", EngineTuning::default());
        m.custom_args = Some(Json(vec!["--mlok".into()]));
        let warnings = validate_model(&m, None, &[]).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, Severity::Warning);
        assert_eq!(warnings[0].fix.as_deref(), Some("Did you mean '--mlock'?"));
    }

    #[test]
    fn known_llamacpp_flag_passes_clean() {
        let mut m = model("llamacpp", EngineTuning::default());
        m.custom_args = Some(Json(vec!["--no-mmap".into()]));
        assert!(validate_model(&m, None, &[]).unwrap().is_empty());
    }

    #[test]
    fn tp_size_beyond_selected_gpus_is_an_error() {
        let mut m = model(
            "vllm",
            EngineTuning {
                tp_size: Some(4),
                ..Default::default()
            },
        );
        m.selected_gpus = Some(Json(vec![0, 1]));
        let err = validate_model(&m, None, &[]).unwrap_err();
        assert!(matches!(err, LifecycleError::GpuCountExceeded { tp_size: 4, gpu_count: 2 }));
    }

    #[test]
    fn vram_shortfall_is_an_error_and_tight_fit_a_warning() {
        let m = model("vllm", EngineTuning::default());
        let est = VramEstimate {
            required_vram_gb: 20.0,
            ..Default::default()
        };
        let short = validate_model(&m, Some(&est), &[gpu(16 * 1024, 0)]).unwrap();
        assert!(short.iter().any(|w| w.severity == Severity::Error));

        let tight = validate_model(&m, Some(&est), &[gpu(21 * 1024, 0)]).unwrap();
        assert!(tight.iter().any(|w| w.severity == Severity::Warning));

        let fine = validate_model(&m, Some(&est), &[gpu(48 * 1024, 0)]).unwrap();
        assert!(fine.is_empty());
    }

    #[test]
    fn awq_mismatch_warns_but_matching_name_does_not() {
        let m = model(
            "vllm",
            EngineTuning {
                quantization: Some("awq".into()),
                ..Default::default()
            },
        );
        assert!(!validate_model(&m, None, &[]).unwrap().is_empty());

        let mut matching = model(
            "vllm",
            EngineTuning {
                quantization: Some("awq".into()),
                ..Default::default()
            },
        );
        matching.repo_id = Some("TheBloke/llama-7b-AWQ".into());
        assert!(validate_model(&matching, None, &[]).unwrap().is_empty());
    }
}
