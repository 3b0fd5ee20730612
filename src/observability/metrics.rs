use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::engine::matching::MatchingOutcome;
use crate::engine::notification::DispatchReport;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_cycles_total: IntCounterVec,
    pub dispatch_cycle_seconds: Histogram,
    pub matches_created_total: IntCounter,
    pub notifications_total: IntCounterVec,
    pub connected_sessions: IntGauge,
    pub broadcasts_total: IntCounter,
    pub sessions_evicted_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_cycles_total = IntCounterVec::new(
            Opts::new("dispatch_cycles_total", "Dispatch cycles by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_cycles_total metric");

        let dispatch_cycle_seconds = Histogram::with_opts(HistogramOpts::new(
            "dispatch_cycle_seconds",
            "Duration of one match/notify/broadcast cycle in seconds",
        ))
        .expect("valid dispatch_cycle_seconds metric");

        let matches_created_total =
            IntCounter::new("matches_created_total", "Match records created")
                .expect("valid matches_created_total metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "Push notifications by outcome"),
            &["outcome"],
        )
        .expect("valid notifications_total metric");

        let connected_sessions =
            IntGauge::new("connected_sessions", "Currently connected live clients")
                .expect("valid connected_sessions metric");

        let broadcasts_total = IntCounter::new(
            "broadcasts_total",
            "Change broadcasts sent to live clients",
        )
        .expect("valid broadcasts_total metric");

        let sessions_evicted_total = IntCounter::new(
            "sessions_evicted_total",
            "Sessions closed for missing heartbeats",
        )
        .expect("valid sessions_evicted_total metric");

        registry
            .register(Box::new(dispatch_cycles_total.clone()))
            .expect("register dispatch_cycles_total");
        registry
            .register(Box::new(dispatch_cycle_seconds.clone()))
            .expect("register dispatch_cycle_seconds");
        registry
            .register(Box::new(matches_created_total.clone()))
            .expect("register matches_created_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register notifications_total");
        registry
            .register(Box::new(connected_sessions.clone()))
            .expect("register connected_sessions");
        registry
            .register(Box::new(broadcasts_total.clone()))
            .expect("register broadcasts_total");
        registry
            .register(Box::new(sessions_evicted_total.clone()))
            .expect("register sessions_evicted_total");

        Self {
            registry,
            dispatch_cycles_total,
            dispatch_cycle_seconds,
            matches_created_total,
            notifications_total,
            connected_sessions,
            broadcasts_total,
            sessions_evicted_total,
        }
    }

    pub fn record_matching(&self, outcome: &MatchingOutcome) {
        self.matches_created_total.inc_by(outcome.created as u64);
    }

    pub fn record_dispatch(&self, report: &DispatchReport) {
        for (label, count) in [
            ("sent", report.sent),
            ("missing_token", report.missing_token),
            ("invalid_token", report.invalid_tokens),
            ("failed", report.failed),
        ] {
            self.notifications_total
                .with_label_values(&[label])
                .inc_by(count as u64);
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
