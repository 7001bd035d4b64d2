//! duo - Driver Upgrade Operator.
//!
//! Watches a `DriverUpgradePolicy` and rolls new revisions of a driver
//! DaemonSet across the cluster's nodes in bounded batches, cordoning,
//! draining and uncordoning each node around the driver restart.

mod config;
mod controller;
mod crd;
mod error;
mod health;
mod k8s;
mod logging;
mod metrics;
mod notify;
mod status;
mod upgrade;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, CustomResourceExt};
use tracing::{error, info, warn};

use config::{Args, BUILD_DATE, COMMIT, Command, VERSION};
use controller::Context;
use crd::DriverUpgradePolicy;
use upgrade::{UncordonEngine, UpgradeStateStore};

/// Window in which bursts of node and DaemonSet events collapse into one cycle.
const TRIGGER_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init(args.log_format, &args.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }
    if let Err(e) = args.validate() {
        error!(error = %e, "Invalid configuration");
        std::process::exit(2);
    }

    let result = match args.command() {
        Command::Run => {
            info!(
                version = VERSION,
                commit = COMMIT,
                build_date = BUILD_DATE,
                "Starting duo"
            );
            run(&args).await
        }
        Command::ResetNode { node, uncordon } => reset_node(&node, uncordon).await,
        Command::Crd => print_crd(),
    };

    if let Err(e) = result {
        error!("duo failed: {e:#}");
        std::process::exit(1);
    }
}

fn print_crd() -> Result<()> {
    let yaml = serde_yaml::to_string(&DriverUpgradePolicy::crd())
        .context("Failed to render CustomResourceDefinition")?;
    print!("{yaml}");
    Ok(())
}

/// Clear a node's upgrade record so the next cycle re-evaluates it.
async fn reset_node(node: &str, uncordon: bool) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let store = k8s::store::NodeMetadataStore::new(client.clone());

    let record = store.get(node).await?;
    if record.is_tracked() {
        store.clear(node).await?;
        info!(
            node,
            state = %record.state,
            attempts = record.attempt_count,
            "Cleared upgrade record"
        );
    } else {
        info!(node, "Node has no upgrade record, nothing to reset");
    }

    if uncordon {
        if record.pre_cordoned() {
            warn!(node, "Node was cordoned before the upgrade, leaving it cordoned");
        } else {
            let outcome = k8s::node::KubeUncordonEngine::new(client)
                .uncordon(node)
                .await?;
            info!(node, ?outcome, "Uncordon requested");
        }
    }
    Ok(())
}

/// Main operator loop.
async fn run(args: &Args) -> Result<()> {
    let settings = args.settings();
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = health::HealthState::new();
    let health_port = settings.health_port;
    let health_for_server = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_for_server).await {
            error!(error = %e, "Health server failed");
        }
    });

    let metrics_port = settings.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_port, registry).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let slack = args.slack_webhook().map(|url| {
        info!("Slack notifications enabled");
        Arc::new(notify::SlackNotifier::new(url))
    });

    let policy_name = settings.policy_name.clone();
    let ctx = Arc::new(Context::new(
        client.clone(),
        settings,
        metrics,
        slack,
        health_state,
    ));

    let policies: Api<DriverUpgradePolicy> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let daemonsets: Api<DaemonSet> = Api::all(client);

    // Any node or DaemonSet change re-runs the cycle for the one managed policy.
    let node_target = policy_name.clone();
    let daemonset_target = policy_name.clone();

    ctx.health.set_ready(true);
    info!(policy = %policy_name, "Starting DriverUpgradePolicy controller");
    Controller::new(policies, WatcherConfig::default())
        .with_config(ControllerConfig::default().debounce(TRIGGER_DEBOUNCE))
        .watches(nodes, WatcherConfig::default(), move |_: Node| {
            Some(ObjectRef::<DriverUpgradePolicy>::new(&node_target))
        })
        .watches(daemonsets, WatcherConfig::default(), move |_: DaemonSet| {
            Some(ObjectRef::<DriverUpgradePolicy>::new(&daemonset_target))
        })
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::debug!(policy = %obj.name, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconcile failed"),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}
