// Declarative model configuration
//
// One engine instance per record. The tuning block is a wide struct of
// optionals the gateway validates for type only; semantics are the engine's
// problem. Field order here is the CLI emission order, so keep it stable.

use serde::{Deserialize, Serialize};

/// Runtime state of a managed model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ModelState {
    #[default]
    Stopped,
    Loading,
    Running,
    Failed,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Stopped => "stopped",
            ModelState::Loading => "loading",
            ModelState::Running => "running",
            ModelState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> ModelState {
        match s {
            "loading" => ModelState::Loading,
            "running" => ModelState::Running,
            "failed" => ModelState::Failed,
            _ => ModelState::Stopped,
        }
    }
}

/// Engine tuning knobs, pass-through to the engine CLI.
///
/// The first block is the generation engine's; the second is the GGUF
/// engine's. Unset fields are omitted from the synthesized command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EngineTuning {
    // Generation engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_parallel_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_model_len: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_num_batched_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_cache_dtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_space_gb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforce_eager: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_remote_code: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_offload_gb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_prefix_caching: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_caching_hash_algo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_chunked_prefill: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_num_seqs: Option<u64>,
    /// Comma-separated capture sizes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_graph_sizes: Option<String>,

    // GGUF engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ngl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ubatch_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_slots: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_type_k: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_type_v: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tensor_split: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_attention: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mlock: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numa_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rope_freq_base: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rope_freq_scale: Option<f64>,

    // GGUF tokenizer plumbing for the generation engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_config_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_knobs_vanish_from_json() {
        let tuning = EngineTuning {
            dtype: Some("bfloat16".into()),
            tp_size: Some(2),
            ..Default::default()
        };
        let raw = serde_json::to_string(&tuning).unwrap();
        assert!(raw.contains("bfloat16"));
        assert!(!raw.contains("ngl"));
        assert!(!raw.contains("max_model_len"));

        let back: EngineTuning = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, tuning);
    }

    #[test]
    fn state_parsing_defaults_to_stopped() {
        assert_eq!(ModelState::parse("running"), ModelState::Running);
        assert_eq!(ModelState::parse("bogus"), ModelState::Stopped);
        assert_eq!(ModelState::parse("stopped").as_str(), "stopped");
    }
}
