//! Prometheus metrics for the duo operator.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::crd::UpgradeState;
use crate::upgrade::CycleReport;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CycleLabels {
    pub policy: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
    pub policy: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub policy: String,
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub policy: String,
    pub from: String,
    pub to: String,
}

pub struct Metrics {
    pub cycles_total: Family<CycleLabels, Counter>,
    pub cycle_duration_seconds: Family<PolicyLabels, Histogram>,
    pub nodes: Family<StateLabels, Gauge>,
    pub node_transitions_total: Family<TransitionLabels, Counter>,
    pub step_failures_total: Family<StateLabels, Counter>,
    pub nodes_failed_total: Family<PolicyLabels, Counter>,
    pub rollout_duration_seconds: Family<PolicyLabels, Histogram>,
    /// When the current rollout first saw a node needing an upgrade.
    rollout_started: Mutex<Option<Instant>>,
}

const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// A rollout over a large fleet can take hours.
const ROLLOUT_BUCKETS: &[f64] = &[
    60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0, 86400.0,
];

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let cycles_total = Family::<CycleLabels, Counter>::default();
        registry.register(
            "duo_cycles",
            "Total number of upgrade cycles by result",
            cycles_total.clone(),
        );

        let cycle_duration_seconds = Family::<PolicyLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(CYCLE_BUCKETS.iter().copied())
        });
        registry.register(
            "duo_cycle_duration_seconds",
            "Duration of upgrade cycles in seconds",
            cycle_duration_seconds.clone(),
        );

        let nodes = Family::<StateLabels, Gauge>::default();
        registry.register(
            "duo_nodes",
            "Managed nodes per upgrade state after the last cycle",
            nodes.clone(),
        );

        let node_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "duo_node_transitions",
            "Total number of node state transitions",
            node_transitions_total.clone(),
        );

        let step_failures_total = Family::<StateLabels, Counter>::default();
        registry.register(
            "duo_step_failures",
            "Total number of failed node steps by the state they failed in",
            step_failures_total.clone(),
        );

        let nodes_failed_total = Family::<PolicyLabels, Counter>::default();
        registry.register(
            "duo_nodes_failed",
            "Total number of nodes that exhausted their retry budget",
            nodes_failed_total.clone(),
        );

        let rollout_duration_seconds =
            Family::<PolicyLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(ROLLOUT_BUCKETS.iter().copied())
            });
        registry.register(
            "duo_rollout_duration_seconds",
            "Time from the first pending node until every node settled",
            rollout_duration_seconds.clone(),
        );

        Self {
            cycles_total,
            cycle_duration_seconds,
            nodes,
            node_transitions_total,
            step_failures_total,
            nodes_failed_total,
            rollout_duration_seconds,
            rollout_started: Mutex::new(None),
        }
    }

    pub fn record_cycle_result(&self, policy: &str, result: &str) {
        self.cycles_total
            .get_or_create(&CycleLabels {
                policy: policy.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    /// Fold a finished cycle into the metric families.
    pub fn record_report(&self, policy: &str, report: &CycleReport, elapsed_seconds: f64) {
        let labels = PolicyLabels {
            policy: policy.to_string(),
        };
        self.record_cycle_result(policy, "success");
        self.cycle_duration_seconds
            .get_or_create(&labels)
            .observe(elapsed_seconds);

        for state in UpgradeState::ALL {
            self.nodes
                .get_or_create(&StateLabels {
                    policy: policy.to_string(),
                    state: state.to_string(),
                })
                .set(i64::from(report.count(state)));
        }
        for t in &report.transitions {
            self.node_transitions_total
                .get_or_create(&TransitionLabels {
                    policy: policy.to_string(),
                    from: t.from.to_string(),
                    to: t.to.to_string(),
                })
                .inc();
        }
        for e in &report.node_errors {
            self.step_failures_total
                .get_or_create(&StateLabels {
                    policy: policy.to_string(),
                    state: e.state.to_string(),
                })
                .inc();
        }
        if !report.newly_failed.is_empty() {
            self.nodes_failed_total
                .get_or_create(&labels)
                .inc_by(report.newly_failed.len() as u64);
        }

        self.track_rollout(&labels, report.is_settled());
    }

    /// Returns the observed rollout duration when this cycle settled one.
    fn track_rollout(&self, labels: &PolicyLabels, settled: bool) -> Option<f64> {
        let mut started = self
            .rollout_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !settled {
            started.get_or_insert_with(Instant::now);
            return None;
        }
        let duration = started.take()?.elapsed().as_secs_f64();
        self.rollout_duration_seconds
            .get_or_create(labels)
            .observe(duration);
        Some(duration)
    }
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "Metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
