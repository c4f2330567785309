// Upstream timeout policy
//
// Read timeout scales with a size hint parsed from the model name and with
// the requested max_tokens. Connect/write/pool are fixed.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpstreamTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
    pub pool: Duration,
}

impl UpstreamTimeouts {
    /// Policy for a serving request. `max_tokens` scales the read timeout up
    /// to 3x; streaming requests get a longer base to cover generation time.
    pub fn for_request(model_name: &str, max_tokens: u64, is_streaming: bool) -> Self {
        let name = model_name.to_lowercase();
        let base_secs: f64 = if name.contains("120b") {
            if is_streaming { 180.0 } else { 120.0 }
        } else if name.contains("70b") || name.contains("72b") {
            if is_streaming { 120.0 } else { 90.0 }
        } else if name.contains("13b") || name.contains("14b") {
            if is_streaming { 90.0 } else { 60.0 }
        } else if is_streaming {
            60.0
        } else {
            45.0
        };

        let token_factor = (max_tokens as f64 / 1000.0).clamp(1.0, 3.0);

        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs_f64(base_secs * token_factor),
            write: Duration::from_secs(10),
            pool: Duration::from_secs(5),
        }
    }

    /// Fast probe timeouts used by the health poller
    pub fn health_probe() -> Self {
        Self {
            connect: Duration::from_secs(2),
            read: Duration::from_secs(3),
            write: Duration::from_secs(3),
            pool: Duration::from_secs(5),
        }
    }

    /// Slightly longer read for the /v1/models discovery call
    pub fn discovery_probe() -> Self {
        Self {
            connect: Duration::from_secs(2),
            read: Duration::from_secs(4),
            write: Duration::from_secs(3),
            pool: Duration::from_secs(5),
        }
    }

    /// Total budget for one attempt: connect plus read
    pub fn attempt_budget(&self) -> Duration {
        self.connect + self.read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_model_streaming_scales_to_the_cap() {
        let t = UpstreamTimeouts::for_request("org/gpt-oss-120b", 3000, true);
        assert_eq!(t.read, Duration::from_secs(540), "180s base x 3.0 factor");
        assert_eq!(t.connect, Duration::from_secs(5));
        assert_eq!(t.write, Duration::from_secs(10));
        assert_eq!(t.pool, Duration::from_secs(5));
    }

    #[test]
    fn default_hint_non_streaming_keeps_the_floor() {
        let t = UpstreamTimeouts::for_request("mistral-7b", 500, false);
        assert_eq!(t.read, Duration::from_secs(45), "45s base, factor floors at 1.0");
    }

    #[test]
    fn token_factor_caps_at_three() {
        let t = UpstreamTimeouts::for_request("llama-70b", 50_000, false);
        assert_eq!(t.read, Duration::from_secs(270), "90s base x capped 3.0");
    }

    #[test]
    fn mid_size_hints_pick_their_base() {
        assert_eq!(
            UpstreamTimeouts::for_request("x-13b", 1000, true).read,
            Duration::from_secs(90)
        );
        assert_eq!(
            UpstreamTimeouts::for_request("qwen-72B-instruct", 1000, true).read,
            Duration::from_secs(120)
        );
    }
}
