// SPDX-License-Identifier: AGPL-3.0-only
//! Prometheus metrics for server observability.

use prometheus::{CounterVec, Gauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global metrics registry singleton.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    registry: Registry,

    /// Open TCP connections.
    pub connections_active: Gauge,
    /// Requests by packet kind.
    pub requests_total: CounterVec,
    /// Replies by packet kind.
    pub replies_total: CounterVec,
    /// Multi-round conversations currently tracked in the state store.
    pub state_entries: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let connections_active = Gauge::with_opts(Opts::new(
            "tacplus_connections_active",
            "Number of active connections",
        ))
        .expect("metric can be created");

        let requests_total = CounterVec::new(
            Opts::new("tacplus_requests_total", "Requests by packet kind"),
            &["kind"],
        )
        .expect("metric can be created");

        let replies_total = CounterVec::new(
            Opts::new("tacplus_replies_total", "Replies by packet kind"),
            &["kind"],
        )
        .expect("metric can be created");

        let state_entries = Gauge::with_opts(Opts::new(
            "tacplus_state_entries",
            "Tracked multi-round conversations",
        ))
        .expect("metric can be created");

        registry
            .register(Box::new(connections_active.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(replies_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(state_entries.clone()))
            .expect("metric can be registered");

        Self {
            registry,
            connections_active,
            requests_total,
            replies_total,
            state_entries,
        }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}
