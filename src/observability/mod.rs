//! Prometheus metrics for the gateway.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Turn mode label values.
pub const MODE_CHAT: &str = "chat";
pub const MODE_STREAM: &str = "stream";

/// Process-wide counters exposed at `GET /metrics`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    turns_total: IntCounterVec,
    upstream_failures_total: IntCounterVec,
    resident_sessions: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let turns_total = IntCounterVec::new(
            Opts::new("clarity_turns_total", "Conversation turns started"),
            &["mode"],
        )?;
        let upstream_failures_total = IntCounterVec::new(
            Opts::new(
                "clarity_upstream_failures_total",
                "Turns that ended with a failure instead of a full reply",
            ),
            &["mode"],
        )?;
        let resident_sessions =
            IntGauge::new("clarity_resident_sessions", "Sessions currently held in memory")?;

        registry.register(Box::new(turns_total.clone()))?;
        registry.register(Box::new(upstream_failures_total.clone()))?;
        registry.register(Box::new(resident_sessions.clone()))?;

        Ok(Self {
            registry,
            turns_total,
            upstream_failures_total,
            resident_sessions,
        })
    }

    pub fn record_turn(&self, mode: &str) {
        self.turns_total.with_label_values(&[mode]).inc();
    }

    pub fn record_failure(&self, mode: &str) {
        self.upstream_failures_total.with_label_values(&[mode]).inc();
    }

    pub fn set_resident_sessions(&self, count: usize) {
        self.resident_sessions
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_turn(MODE_CHAT);
        metrics.record_turn(MODE_STREAM);
        metrics.record_turn(MODE_STREAM);
        metrics.record_failure(MODE_STREAM);
        metrics.set_resident_sessions(3);

        let text = metrics.render();
        assert!(text.contains("clarity_turns_total{mode=\"chat\"} 1"));
        assert!(text.contains("clarity_turns_total{mode=\"stream\"} 2"));
        assert!(text.contains("clarity_upstream_failures_total{mode=\"stream\"} 1"));
        assert!(text.contains("clarity_resident_sessions 3"));
    }

    #[test]
    fn separate_instances_do_not_share_state() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_turn(MODE_CHAT);
        assert!(!b.render().contains("clarity_turns_total{mode=\"chat\"} 1"));
    }
}
