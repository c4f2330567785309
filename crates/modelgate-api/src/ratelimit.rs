// Redis-backed rate limiting and streaming concurrency slots
//
// Two independent rules when enabled: a per-second bucket (rps + burst) and
// a sliding-window counter. Backend trouble always fails open; a limiter
// outage must not take the gateway down with it.

use std::sync::Arc;

use modelgate_core::{GatewayError, Settings};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::metrics::Metrics;

/// TTL guarding leaked concurrency slots if a release is lost
const STREAM_SLOT_TTL_SEC: i64 = 300;

enum Verdict {
    Allowed,
    Blocked(&'static str),
}

#[derive(Clone)]
pub struct RateLimiter {
    settings: Arc<Settings>,
    metrics: Arc<Metrics>,
    redis: Option<ConnectionManager>,
}

impl RateLimiter {
    /// Connect to Redis when limiting is configured; a failed connection
    /// degrades to a no-op limiter.
    pub async fn connect(settings: Arc<Settings>, metrics: Arc<Metrics>) -> Self {
        let wants_backend = settings.rate_limit_enabled || settings.concurrency_limit_enabled;
        let redis = if wants_backend {
            match redis::Client::open(settings.redis_url.as_str()) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => Some(conn),
                    Err(err) => {
                        tracing::warn!(error = %err, "redis unavailable, rate limiting disabled");
                        None
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "invalid redis url, rate limiting disabled");
                    None
                }
            }
        } else {
            None
        };
        Self {
            settings,
            metrics,
            redis,
        }
    }

    /// Enforce both rules for one request. Errors only with a definitive
    /// over-limit verdict; backend failures allow the request.
    pub async fn check(&self, identifier: &str) -> Result<(), GatewayError> {
        if !self.settings.rate_limit_enabled {
            return Ok(());
        }
        let Some(mut conn) = self.redis.clone() else {
            return Ok(());
        };

        let settings = &self.settings;
        let outcome: redis::RedisResult<Verdict> = async {
            // Sliding window over the identifier's recent requests
            if settings.rate_limit_window_sec > 0 && settings.rate_limit_max_requests > 0 {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let window_ms = (settings.rate_limit_window_sec * 1000) as i64;
                let zkey = format!("rl:sw:{identifier}");
                let _: () = conn.zrembyscore(&zkey, 0i64, now_ms - window_ms).await?;
                let count: u64 = conn.zcard(&zkey).await?;
                if count >= settings.rate_limit_max_requests {
                    return Ok(Verdict::Blocked("window"));
                }
                let member = chrono::Utc::now()
                    .timestamp_nanos_opt()
                    .unwrap_or(now_ms)
                    .to_string();
                let _: () = conn.zadd(&zkey, member, now_ms).await?;
                let _: () = conn
                    .expire(&zkey, (settings.rate_limit_window_sec * 2) as i64)
                    .await?;
            }

            // Fixed per-second bucket
            let now_sec = chrono::Utc::now().timestamp();
            let key = format!("rl:{identifier}:{now_sec}");
            let current: u64 = conn.incr(&key, 1u64).await?;
            if current == 1 {
                let _: () = conn.expire(&key, 2).await?;
            }
            let allowed = (settings.rate_limit_rps + settings.rate_limit_burst) as u64;
            if current > allowed {
                return Ok(Verdict::Blocked("bucket"));
            }
            Ok(Verdict::Allowed)
        }
        .await;

        match outcome {
            Ok(Verdict::Allowed) => {
                self.metrics
                    .ratelimit_allowed
                    .with_label_values(&["bucket"])
                    .inc();
                Ok(())
            }
            Ok(Verdict::Blocked(kind)) => {
                self.metrics.ratelimit_blocked.with_label_values(&[kind]).inc();
                Err(GatewayError::RateLimited(format!(
                    "rate limit exceeded ({kind})"
                )))
            }
            Err(err) => {
                tracing::debug!(error = %err, "rate limit backend error, failing open");
                Ok(())
            }
        }
    }

    /// Reserve a streaming slot for the identifier. True = proceed.
    pub async fn acquire_stream_slot(&self, identifier: &str) -> bool {
        if !self.settings.concurrency_limit_enabled {
            return true;
        }
        let Some(mut conn) = self.redis.clone() else {
            return true;
        };
        let key = format!("rl:conc:{identifier}");
        let result: redis::RedisResult<bool> = async {
            let current: i64 = conn.incr(&key, 1i64).await?;
            if current == 1 {
                let _: () = conn.expire(&key, STREAM_SLOT_TTL_SEC).await?;
            }
            if current > self.settings.max_concurrent_streams_per_id as i64 {
                // Over the cap: give the reservation back
                let _: () = conn.decr(&key, 1i64).await?;
                return Ok(false);
            }
            Ok(true)
        }
        .await;
        result.unwrap_or(true)
    }

    pub async fn release_stream_slot(&self, identifier: &str) {
        if !self.settings.concurrency_limit_enabled {
            return;
        }
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let key = format!("rl:conc:{identifier}");
        let result: redis::RedisResult<()> = conn.decr(&key, 1i64).await;
        if let Err(err) = result {
            tracing::debug!(error = %err, "stream slot release failed");
        }
    }
}
