// Healthy round-robin upstream selection
//
// Candidates are filtered to breaker-closed AND recently-ok upstreams; when
// that empties the pool we fall back to the full list rather than refuse.
// The rotation counter is keyed by the canonical (sorted, comma-joined) pool
// so the same set of URLs always shares one rotation regardless of caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{GatewayError, Result};
use crate::health::{BreakerMap, HealthMap};

#[derive(Debug, Clone, Default)]
pub struct LoadBalancer {
    index: Arc<DashMap<String, usize>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next upstream from `urls`. Strict round-robin among the
    /// filtered pool; errors only when `urls` itself is empty.
    pub fn choose(
        &self,
        urls: &[String],
        health: &HealthMap,
        breaker: &BreakerMap,
        now: DateTime<Utc>,
        health_ttl_sec: i64,
    ) -> Result<String> {
        let healthy: Vec<&String> = urls
            .iter()
            .filter(|u| breaker.is_available(u, now) && health.is_fresh_ok(u, now, health_ttl_sec))
            .collect();

        let pool: Vec<&String> = if healthy.is_empty() {
            urls.iter().collect()
        } else {
            healthy
        };
        if pool.is_empty() {
            return Err(GatewayError::NoUpstreams);
        }

        let mut key_parts: Vec<&str> = pool.iter().map(|u| u.as_str()).collect();
        key_parts.sort_unstable();
        let key = key_parts.join(",");

        let mut counter = self.index.entry(key).or_insert(0);
        let idx = *counter % pool.len();
        *counter += 1;
        Ok(pool[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ProbeOutcome;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn mark_ok(health: &HealthMap, url: &str, ts: DateTime<Utc>) {
        health.record_probe(
            url,
            ProbeOutcome {
                ts,
                ok: true,
                latency_ms: 1,
                status_code: Some(200),
            },
            None,
        );
    }

    fn mark_down(health: &HealthMap, url: &str, ts: DateTime<Utc>) {
        health.record_probe(
            url,
            ProbeOutcome {
                ts,
                ok: false,
                latency_ms: 1,
                status_code: None,
            },
            Some("ConnectError".into()),
        );
    }

    #[test]
    fn round_robin_over_healthy_pool_is_exact() {
        let lb = LoadBalancer::new();
        let health = HealthMap::new();
        let breaker = BreakerMap::new(true, 3, 30);
        let now = Utc::now();
        let pool = urls(&["http://u1", "http://u2", "http://u3"]);
        for u in &pool {
            mark_ok(&health, u, now);
        }

        let picks: Vec<String> = (0..6)
            .map(|_| lb.choose(&pool, &health, &breaker, now, 10).unwrap())
            .collect();
        assert_eq!(
            picks,
            vec![
                "http://u1", "http://u2", "http://u3", "http://u1", "http://u2", "http://u3"
            ]
        );
    }

    #[test]
    fn sick_upstream_is_ejected() {
        let lb = LoadBalancer::new();
        let health = HealthMap::new();
        let breaker = BreakerMap::new(true, 3, 30);
        let now = Utc::now();
        let pool = urls(&["http://u1", "http://u2"]);
        mark_down(&health, "http://u1", now);
        mark_ok(&health, "http://u2", now);

        for _ in 0..100 {
            assert_eq!(
                lb.choose(&pool, &health, &breaker, now, 10).unwrap(),
                "http://u2"
            );
        }
    }

    #[test]
    fn all_sick_falls_open_to_full_pool() {
        let lb = LoadBalancer::new();
        let health = HealthMap::new();
        let breaker = BreakerMap::new(true, 3, 30);
        let now = Utc::now();
        let pool = urls(&["http://u1", "http://u2"]);
        mark_down(&health, "http://u1", now);
        mark_down(&health, "http://u2", now);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(lb.choose(&pool, &health, &breaker, now, 10).unwrap());
        }
        assert_eq!(seen.len(), 2, "fail-open draws from the whole pool");
    }

    #[test]
    fn open_breaker_blocks_selection_until_cooldown() {
        let lb = LoadBalancer::new();
        let health = HealthMap::new();
        let breaker = BreakerMap::new(true, 2, 30);
        let now = Utc::now();
        let pool = urls(&["http://u1", "http://u2"]);
        mark_ok(&health, "http://u1", now);
        mark_ok(&health, "http://u2", now);

        breaker.record_failure("http://u1", now);
        breaker.record_failure("http://u1", now);

        for _ in 0..10 {
            assert_eq!(
                lb.choose(&pool, &health, &breaker, now, 10).unwrap(),
                "http://u2"
            );
        }

        // Past the cooldown the URL is selectable again
        let later = now + chrono::Duration::seconds(31);
        mark_ok(&health, "http://u1", later);
        mark_ok(&health, "http://u2", later);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(lb.choose(&pool, &health, &breaker, later, 10).unwrap());
        }
        assert!(seen.contains("http://u1"));
    }

    #[test]
    fn stale_health_counts_as_sick() {
        let lb = LoadBalancer::new();
        let health = HealthMap::new();
        let breaker = BreakerMap::new(true, 3, 30);
        let now = Utc::now();
        let pool = urls(&["http://u1", "http://u2"]);
        mark_ok(&health, "http://u1", now - chrono::Duration::seconds(60));
        mark_ok(&health, "http://u2", now);

        for _ in 0..10 {
            assert_eq!(
                lb.choose(&pool, &health, &breaker, now, 10).unwrap(),
                "http://u2"
            );
        }
    }

    #[test]
    fn empty_candidate_list_is_an_error() {
        let lb = LoadBalancer::new();
        let health = HealthMap::new();
        let breaker = BreakerMap::new(true, 3, 30);
        let err = lb
            .choose(&[], &health, &breaker, Utc::now(), 10)
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
    }
}
