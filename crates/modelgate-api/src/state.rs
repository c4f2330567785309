// App state shared across routes

use std::sync::Arc;

use modelgate_core::{BreakerMap, HealthMap, LoadBalancer, ModelRegistry, Settings};
use modelgate_lifecycle::LifecycleManager;
use modelgate_storage::Database;

use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub settings: Arc<Settings>,
    /// Shared upstream client; per-request timeouts override its defaults
    pub http: reqwest::Client,
    pub registry: ModelRegistry,
    pub health: HealthMap,
    pub breaker: BreakerMap,
    pub balancer: LoadBalancer,
    pub limiter: RateLimiter,
    pub metrics: Arc<Metrics>,
    pub lifecycle: Arc<LifecycleManager>,
}
