// Background health poller
//
// One long-running task: probes every known upstream each tick, maintains
// health snapshots and breaker state, and discovers served model IDs from
// healthy upstreams. Nothing in the loop body may kill the task.

use std::time::{Duration, Instant};

use chrono::Utc;
use modelgate_core::{ModelTask, ProbeOutcome, UpstreamTimeouts};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::AppState;

/// Discovery runs at most this often per healthy upstream
const DISCOVERY_INTERVAL_SEC: i64 = 60;

pub fn spawn(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let poll = Duration::from_secs(state.settings.health_poll_sec.max(1));
        tracing::info!(interval_sec = poll.as_secs(), "health monitor started");
        loop {
            tick(&state).await;
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("health monitor stopping");
                    break;
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    })
}

/// Static pools plus every registered URL, sorted and deduplicated
fn target_urls(state: &AppState) -> Vec<String> {
    let mut urls = state.settings.gen_urls();
    urls.extend(state.settings.emb_urls());
    urls.extend(state.registry.urls());
    urls.sort();
    urls.dedup();
    urls
}

async fn tick(state: &AppState) {
    for base in target_urls(state) {
        let ok = probe(state, &base).await;
        state
            .metrics
            .upstream_health
            .with_label_values(&[&base])
            .set(i64::from(ok));

        if ok {
            state.breaker.record_success(&base);
            if state
                .health
                .discovery_due(&base, Utc::now(), DISCOVERY_INTERVAL_SEC)
            {
                discover_models(state, &base).await;
            }
        } else if state.breaker.record_failure(&base, Utc::now()) {
            state.metrics.breaker_open.with_label_values(&[&base]).inc();
        }
    }
}

/// One health probe. Status in [200, 500) counts as alive; exceptions record
/// their class name for the status endpoints.
async fn probe(state: &AppState, base: &str) -> bool {
    let timeouts = UpstreamTimeouts::health_probe();
    let started = Instant::now();
    let result = state
        .http
        .get(format!("{base}{}", state.settings.health_check_path))
        .timeout(timeouts.attempt_budget())
        .send()
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;
    state
        .metrics
        .upstream_latency
        .with_label_values(&["/health"])
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            let ok = (200..500).contains(&status);
            state.health.record_probe(
                base,
                ProbeOutcome {
                    ts: Utc::now(),
                    ok,
                    latency_ms,
                    status_code: Some(status),
                },
                (!ok).then(|| format!("Http{status}")),
            );
            ok
        }
        Err(err) => {
            let class = if err.is_timeout() {
                "TimeoutError"
            } else if err.is_connect() {
                "ConnectError"
            } else {
                "RequestError"
            };
            state.health.record_probe(
                base,
                ProbeOutcome {
                    ts: Utc::now(),
                    ok: false,
                    latency_ms,
                    status_code: None,
                },
                Some(class.to_string()),
            );
            false
        }
    }
}

/// Ask a healthy upstream what it serves and register the IDs. Discovery is
/// best-effort and never overwrites an authoritative registration.
async fn discover_models(state: &AppState, base: &str) {
    let timeouts = UpstreamTimeouts::discovery_probe();
    let mut request = state
        .http
        .get(format!("{base}/v1/models"))
        .timeout(timeouts.attempt_budget());
    if !state.settings.internal_api_key.is_empty() {
        request = request.header(
            "authorization",
            format!("Bearer {}", state.settings.internal_api_key),
        );
    }

    let response = match request.send().await {
        Ok(response) if response.status().as_u16() < 500 => response,
        Ok(_) | Err(_) => return,
    };
    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(_) => return,
    };

    let ids: Vec<String> = body
        .get("data")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|model| model.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        return;
    }

    let category = infer_task(state, base);
    for id in &ids {
        state.registry.register_discovered(id, base, category);
    }
    state.health.note_discovery(base, ids, category);
}

/// Task for a discovered upstream: pool membership first, then any existing
/// registry entry pointing at it.
fn infer_task(state: &AppState, base: &str) -> ModelTask {
    if state.settings.emb_urls().iter().any(|url| url == base) {
        return ModelTask::Embed;
    }
    if state.settings.gen_urls().iter().any(|url| url == base) {
        return ModelTask::Generate;
    }
    state
        .registry
        .snapshot()
        .values()
        .find(|entry| entry.url == base)
        .map(|entry| entry.task)
        .unwrap_or(ModelTask::Generate)
}
