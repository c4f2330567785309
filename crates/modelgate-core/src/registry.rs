// Dynamic model registry: served name -> upstream endpoint
//
// The registry is the routing source of truth. The lifecycle manager writes
// authoritative entries on start/stop; the health monitor's discovery pass
// writes best-effort entries and must not clobber authoritative fields.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// What a model does, from the router's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ModelTask {
    #[default]
    Generate,
    Embed,
}

impl ModelTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTask::Generate => "generate",
            ModelTask::Embed => "embed",
        }
    }

    pub fn parse(s: &str) -> ModelTask {
        if s.to_lowercase().starts_with("embed") {
            ModelTask::Embed
        } else {
            ModelTask::Generate
        }
    }
}

/// Engine family serving a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum EngineKind {
    #[default]
    Vllm,
    Llamacpp,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Vllm => "vllm",
            EngineKind::Llamacpp => "llamacpp",
        }
    }

    pub fn parse(s: &str) -> EngineKind {
        match s.to_lowercase().as_str() {
            "llamacpp" | "llama.cpp" | "llama_cpp" => EngineKind::Llamacpp,
            _ => EngineKind::Vllm,
        }
    }

    /// Canonical container name prefix for this engine
    pub fn container_prefix(&self) -> &'static str {
        match self {
            EngineKind::Vllm => "vllm",
            EngineKind::Llamacpp => "llamacpp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub url: String,
    pub task: ModelTask,
    pub engine_type: EngineKind,
}

/// Concurrent served-name -> endpoint map.
///
/// Cheap to clone; all clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: Arc<DashMap<String, RegistryEntry>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative registration from the lifecycle manager. Overwrites all
    /// fields for the served name.
    pub fn register(&self, served_name: &str, entry: RegistryEntry) {
        if served_name.is_empty() || entry.url.is_empty() {
            return;
        }
        self.entries.insert(served_name.to_string(), entry);
    }

    /// Best-effort registration from the health poller's discovery pass.
    ///
    /// Refreshes the URL and fills in a task only when none is known; never
    /// touches `engine_type` or an authoritative task on an existing entry.
    pub fn register_discovered(&self, served_name: &str, url: &str, task: ModelTask) {
        if served_name.is_empty() || url.is_empty() {
            return;
        }
        match self.entries.entry(served_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                existing.get_mut().url = url.to_string();
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    url: url.to_string(),
                    task,
                    engine_type: EngineKind::default(),
                });
            }
        }
    }

    pub fn unregister(&self, served_name: &str) {
        self.entries.remove(served_name);
    }

    pub fn get(&self, served_name: &str) -> Option<RegistryEntry> {
        self.entries.get(served_name).map(|e| e.clone())
    }

    pub fn contains(&self, served_name: &str) -> bool {
        self.entries.contains_key(served_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the whole map, name-sorted for stable rendering
    pub fn snapshot(&self) -> BTreeMap<String, RegistryEntry> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Distinct registered base URLs, sorted
    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.entries.iter().map(|e| e.value().url.clone()).collect();
        urls.sort();
        urls.dedup();
        urls
    }

    /// Serialize for the `config_kv["model_registry"]` blob
    pub fn to_persisted_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Replace contents from a persisted blob. Malformed entries are dropped;
    /// a malformed blob leaves the registry untouched.
    pub fn load_persisted_json(&self, raw: &str) {
        let parsed: BTreeMap<String, RegistryEntry> = match serde_json::from_str(raw) {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed persisted model registry");
                return;
            }
        };
        self.entries.clear();
        for (name, entry) in parsed {
            if !entry.url.is_empty() {
                self.entries.insert(name, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, task: ModelTask, engine: EngineKind) -> RegistryEntry {
        RegistryEntry {
            url: url.to_string(),
            task,
            engine_type: engine,
        }
    }

    #[test]
    fn authoritative_register_overwrites() {
        let reg = ModelRegistry::new();
        reg.register("m1", entry("http://a:8000", ModelTask::Generate, EngineKind::Vllm));
        reg.register("m1", entry("http://b:8000", ModelTask::Embed, EngineKind::Llamacpp));

        let got = reg.get("m1").unwrap();
        assert_eq!(got.url, "http://b:8000");
        assert_eq!(got.task, ModelTask::Embed);
        assert_eq!(got.engine_type, EngineKind::Llamacpp);
    }

    #[test]
    fn discovery_preserves_authoritative_fields() {
        let reg = ModelRegistry::new();
        reg.register(
            "m1",
            entry("http://a:8000", ModelTask::Embed, EngineKind::Llamacpp),
        );

        // Discovery sees the model on a new URL and guesses the wrong task
        reg.register_discovered("m1", "http://b:8000", ModelTask::Generate);

        let got = reg.get("m1").unwrap();
        assert_eq!(got.url, "http://b:8000", "URL refreshes on discovery");
        assert_eq!(got.task, ModelTask::Embed, "task must survive discovery");
        assert_eq!(got.engine_type, EngineKind::Llamacpp);
    }

    #[test]
    fn discovery_creates_missing_entries() {
        let reg = ModelRegistry::new();
        reg.register_discovered("found", "http://a:8000", ModelTask::Embed);
        let got = reg.get("found").unwrap();
        assert_eq!(got.task, ModelTask::Embed);
        assert_eq!(got.engine_type, EngineKind::Vllm);
    }

    #[test]
    fn urls_are_sorted_and_deduped() {
        let reg = ModelRegistry::new();
        reg.register("b", entry("http://b:8000", ModelTask::Generate, EngineKind::Vllm));
        reg.register("a", entry("http://a:8000", ModelTask::Generate, EngineKind::Vllm));
        reg.register("a2", entry("http://a:8000", ModelTask::Generate, EngineKind::Vllm));
        assert_eq!(reg.urls(), vec!["http://a:8000", "http://b:8000"]);
    }

    #[test]
    fn persisted_round_trip() {
        let reg = ModelRegistry::new();
        reg.register(
            "m1",
            entry("http://e1:8000", ModelTask::Generate, EngineKind::Vllm),
        );
        reg.register(
            "m2",
            entry("http://e2:8000", ModelTask::Embed, EngineKind::Llamacpp),
        );

        let blob = reg.to_persisted_json();
        let restored = ModelRegistry::new();
        restored.load_persisted_json(&blob);

        assert_eq!(restored.snapshot(), reg.snapshot());
    }

    #[test]
    fn malformed_blob_is_ignored() {
        let reg = ModelRegistry::new();
        reg.register("keep", entry("http://a:8000", ModelTask::Generate, EngineKind::Vllm));
        reg.load_persisted_json("not json at all");
        assert!(reg.contains("keep"));
    }

    #[test]
    fn empty_names_and_urls_are_rejected() {
        let reg = ModelRegistry::new();
        reg.register("", entry("http://a:8000", ModelTask::Generate, EngineKind::Vllm));
        reg.register("m", entry("", ModelTask::Generate, EngineKind::Vllm));
        reg.register_discovered("", "http://a:8000", ModelTask::Generate);
        assert!(reg.is_empty());
    }
}
