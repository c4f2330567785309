// Per-upstream health snapshots and circuit-breaker state
//
// Both maps are written by the health poller and, for the breaker, by the
// request path on upstream outcomes. Writes go through a per-URL entry lock
// (dashmap shard); last writer wins, which bounds drift between the two
// writers without a global critical section.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::registry::ModelTask;

/// Probes kept per upstream for the status endpoints
const PROBE_HISTORY_LEN: usize = 50;

/// One health probe result
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub ts: DateTime<Utc>,
    pub ok: bool,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
}

/// Rolling view of one upstream's recent health
#[derive(Debug, Clone, Serialize, Default)]
pub struct HealthSnapshot {
    pub ok: bool,
    pub last_probe_ts: Option<DateTime<Utc>>,
    pub last_ok_ts: Option<DateTime<Utc>>,
    pub last_fail_ts: Option<DateTime<Utc>>,
    pub consecutive_fails: u32,
    pub last_status_code: Option<u16>,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    /// Model IDs the upstream reported on /v1/models, if discovered
    pub discovered_models: Vec<String>,
    /// Task category inferred for UI grouping
    pub category: Option<ModelTask>,
    /// Last discovery attempt, throttled to once a minute per upstream
    #[serde(skip)]
    pub last_discovery_ts: Option<DateTime<Utc>>,
    pub history: VecDeque<ProbeOutcome>,
}

/// Shared health map, keyed by upstream base URL
#[derive(Debug, Clone, Default)]
pub struct HealthMap {
    inner: Arc<DashMap<String, HealthSnapshot>>,
}

impl HealthMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one probe. Success clears the failure counters, failure bumps
    /// them; either way the ring buffer advances.
    pub fn record_probe(&self, url: &str, probe: ProbeOutcome, error: Option<String>) {
        let mut snap = self.inner.entry(url.to_string()).or_default();
        snap.ok = probe.ok;
        snap.last_probe_ts = Some(probe.ts);
        snap.last_status_code = probe.status_code;
        snap.last_latency_ms = Some(probe.latency_ms);
        if probe.ok {
            snap.last_ok_ts = Some(probe.ts);
            snap.consecutive_fails = 0;
            snap.last_error = None;
        } else {
            snap.last_fail_ts = Some(probe.ts);
            snap.consecutive_fails += 1;
            snap.last_error = error;
        }
        snap.history.push_back(probe);
        while snap.history.len() > PROBE_HISTORY_LEN {
            snap.history.pop_front();
        }
    }

    pub fn note_discovery(&self, url: &str, models: Vec<String>, category: ModelTask) {
        let mut snap = self.inner.entry(url.to_string()).or_default();
        snap.discovered_models = models;
        snap.category = Some(category);
        snap.last_discovery_ts = Some(Utc::now());
    }

    /// Whether discovery should run for this upstream (healthy + not probed
    /// for models in the last `interval_sec`)
    pub fn discovery_due(&self, url: &str, now: DateTime<Utc>, interval_sec: i64) -> bool {
        match self.inner.get(url) {
            Some(snap) => {
                snap.ok
                    && snap
                        .last_discovery_ts
                        .map(|ts| (now - ts).num_seconds() > interval_sec)
                        .unwrap_or(true)
            }
            None => false,
        }
    }

    /// True when the last probe was ok and recent enough to trust
    pub fn is_fresh_ok(&self, url: &str, now: DateTime<Utc>, ttl_sec: i64) -> bool {
        self.inner
            .get(url)
            .map(|snap| {
                snap.ok
                    && snap
                        .last_probe_ts
                        .map(|ts| (now - ts).num_seconds() <= ttl_sec)
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn get(&self, url: &str) -> Option<HealthSnapshot> {
        self.inner.get(url).map(|s| s.clone())
    }

    pub fn snapshot(&self) -> Vec<(String, HealthSnapshot)> {
        let mut out: Vec<(String, HealthSnapshot)> = self
            .inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// Circuit breaker for one upstream
#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct BreakerState {
    pub fail_count: u32,
    /// Absolute time before which the URL is not selectable; epoch when closed
    pub open_until: Option<DateTime<Utc>>,
}

impl BreakerState {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.open_until.map(|until| now < until).unwrap_or(false)
    }
}

/// Shared breaker map, keyed by upstream base URL
#[derive(Debug, Clone, Default)]
pub struct BreakerMap {
    inner: Arc<DashMap<String, BreakerState>>,
    enabled: bool,
    failure_threshold: u32,
    cooldown_sec: i64,
}

impl BreakerMap {
    pub fn new(enabled: bool, failure_threshold: u32, cooldown_sec: u64) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            enabled,
            failure_threshold,
            cooldown_sec: cooldown_sec as i64,
        }
    }

    /// Whether the URL may be selected right now. Disabled breaker admits all.
    pub fn is_available(&self, url: &str, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }
        self.inner
            .get(url)
            .map(|state| !state.is_open(now))
            .unwrap_or(true)
    }

    /// One failure per request, after retries are exhausted. Returns true
    /// when this failure tripped the breaker open.
    pub fn record_failure(&self, url: &str, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let mut state = self.inner.entry(url.to_string()).or_default();
        state.fail_count += 1;
        if state.fail_count >= self.failure_threshold {
            let newly_open = !state.is_open(now);
            state.open_until = Some(now + chrono::Duration::seconds(self.cooldown_sec));
            newly_open
        } else {
            false
        }
    }

    pub fn record_success(&self, url: &str) {
        if !self.enabled {
            return;
        }
        let mut state = self.inner.entry(url.to_string()).or_default();
        state.fail_count = 0;
        state.open_until = None;
    }

    pub fn get(&self, url: &str) -> Option<BreakerState> {
        self.inner.get(url).map(|s| *s)
    }

    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let mut out: Vec<(String, BreakerState)> = self
            .inner
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn probe(ok: bool, ts: DateTime<Utc>) -> ProbeOutcome {
        ProbeOutcome {
            ts,
            ok,
            latency_ms: 5,
            status_code: if ok { Some(200) } else { None },
        }
    }

    #[test]
    fn breaker_trips_at_threshold_and_resets_on_success() {
        let breaker = BreakerMap::new(true, 3, 30);
        let now = Utc::now();

        assert!(breaker.is_available("http://u1", now));
        assert!(!breaker.record_failure("http://u1", now));
        assert!(!breaker.record_failure("http://u1", now));
        assert!(breaker.is_available("http://u1", now), "below threshold stays closed");

        assert!(breaker.record_failure("http://u1", now), "third failure trips");
        assert!(!breaker.is_available("http://u1", now));

        // Cooldown elapses
        let later = now + Duration::seconds(31);
        assert!(breaker.is_available("http://u1", later));

        // A success fully resets
        breaker.record_success("http://u1");
        let state = breaker.get("http://u1").unwrap();
        assert_eq!(state.fail_count, 0);
        assert!(state.open_until.is_none());
    }

    #[test]
    fn disabled_breaker_admits_everything() {
        let breaker = BreakerMap::new(false, 1, 30);
        let now = Utc::now();
        breaker.record_failure("http://u1", now);
        breaker.record_failure("http://u1", now);
        assert!(breaker.is_available("http://u1", now));
        assert!(breaker.get("http://u1").is_none());
    }

    #[test]
    fn repeat_failures_while_open_extend_the_window() {
        let breaker = BreakerMap::new(true, 1, 30);
        let now = Utc::now();
        assert!(breaker.record_failure("http://u1", now));
        // Already open: further failures keep it open but are not new trips
        assert!(!breaker.record_failure("http://u1", now + Duration::seconds(5)));
        let state = breaker.get("http://u1").unwrap();
        assert_eq!(state.fail_count, 2);
        assert!(state.is_open(now + Duration::seconds(34)));
    }

    #[test]
    fn health_probe_bookkeeping() {
        let health = HealthMap::new();
        let now = Utc::now();

        health.record_probe("http://u1", probe(false, now), Some("ConnectError".into()));
        health.record_probe("http://u1", probe(false, now), Some("ConnectError".into()));
        let snap = health.get("http://u1").unwrap();
        assert!(!snap.ok);
        assert_eq!(snap.consecutive_fails, 2);
        assert_eq!(snap.last_error.as_deref(), Some("ConnectError"));

        health.record_probe("http://u1", probe(true, now), None);
        let snap = health.get("http://u1").unwrap();
        assert!(snap.ok);
        assert_eq!(snap.consecutive_fails, 0);
        assert!(snap.last_error.is_none());
        assert_eq!(snap.history.len(), 3);
    }

    #[test]
    fn history_ring_buffer_caps_at_fifty() {
        let health = HealthMap::new();
        let now = Utc::now();
        for _ in 0..80 {
            health.record_probe("http://u1", probe(true, now), None);
        }
        assert_eq!(health.get("http://u1").unwrap().history.len(), 50);
    }

    #[test]
    fn freshness_respects_ttl() {
        let health = HealthMap::new();
        let now = Utc::now();
        health.record_probe("http://u1", probe(true, now - Duration::seconds(60)), None);
        assert!(health.is_fresh_ok("http://u1", now, 120));
        assert!(!health.is_fresh_ok("http://u1", now, 10));
        assert!(!health.is_fresh_ok("http://unknown", now, 120));
    }

    #[test]
    fn discovery_throttles_to_interval() {
        let health = HealthMap::new();
        let now = Utc::now();
        // Unknown upstreams are never due: probe first
        assert!(!health.discovery_due("http://u1", now, 60));

        health.record_probe("http://u1", probe(true, now), None);
        assert!(health.discovery_due("http://u1", now, 60));

        health.note_discovery("http://u1", vec!["m1".into()], ModelTask::Generate);
        assert!(!health.discovery_due("http://u1", Utc::now(), 60));

        // Sick upstreams are skipped even when the interval elapsed
        health.record_probe("http://u1", probe(false, now), None);
        assert!(!health.discovery_due("http://u1", now + Duration::seconds(120), 60));
    }
}
