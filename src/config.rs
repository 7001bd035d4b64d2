//! CLI configuration and argument parsing.

use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Environment variable names, shared by the flags and the deployment manifests.
pub mod env {
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const HEALTH_PORT: &str = "HEALTH_PORT";
    pub const METRICS_PORT: &str = "METRICS_PORT";
    pub const POLICY_NAME: &str = "POLICY_NAME";
    pub const CYCLE_TIMEOUT_SECONDS: &str = "CYCLE_TIMEOUT_SECONDS";
    pub const STEP_TIMEOUT_SECONDS: &str = "STEP_TIMEOUT_SECONDS";
    pub const REQUEUE_IN_PROGRESS_SECONDS: &str = "REQUEUE_IN_PROGRESS_SECONDS";
    pub const REQUEUE_STABLE_SECONDS: &str = "REQUEUE_STABLE_SECONDS";
    pub const SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the operator (default)
    Run,
    /// Clear a node's upgrade record so the next cycle re-evaluates it
    ResetNode {
        /// Node name
        node: String,
        /// Also uncordon the node if the operator cordoned it
        #[arg(long)]
        uncordon: bool,
    },
    /// Print the DriverUpgradePolicy CustomResourceDefinition as YAML
    Crd,
}

/// Driver Upgrade Operator.
///
/// Rolls new driver DaemonSet revisions across nodes in bounded batches,
/// cordoning and draining each node around the driver restart.
#[derive(Parser, Debug, Clone)]
#[command(name = "duo")]
#[command(about = "Batched, drain-aware driver rollouts across Kubernetes nodes")]
#[command(version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (commit: ",
    env!("BUILD_COMMIT"),
    ", build date: ",
    env!("BUILD_DATE"),
    ")"
))]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Log format
    #[arg(long, env = env::LOG_FORMAT, value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,

    /// Health check server port
    #[arg(long, env = env::HEALTH_PORT, default_value = "8080")]
    pub health_port: u16,

    /// Prometheus metrics server port
    #[arg(long, env = env::METRICS_PORT, default_value = "8081")]
    pub metrics_port: u16,

    /// Name of the DriverUpgradePolicy this instance reconciles
    #[arg(long, env = env::POLICY_NAME, default_value = "cluster")]
    pub policy_name: String,

    /// Upper bound on one upgrade cycle
    #[arg(long, env = env::CYCLE_TIMEOUT_SECONDS, default_value = "120")]
    pub cycle_timeout_seconds: u64,

    /// Upper bound on a single cordon, delete or uncordon call
    #[arg(long, env = env::STEP_TIMEOUT_SECONDS, default_value = "60")]
    pub step_timeout_seconds: u64,

    /// Requeue interval while any node is mid-rollout
    #[arg(long, env = env::REQUEUE_IN_PROGRESS_SECONDS, default_value = "15")]
    pub requeue_in_progress_seconds: u64,

    /// Requeue interval once every node is settled
    #[arg(long, env = env::REQUEUE_STABLE_SECONDS, default_value = "300")]
    pub requeue_stable_seconds: u64,

    /// Slack Incoming Webhook URL (notifications disabled when unset)
    #[arg(long, env = env::SLACK_WEBHOOK_URL, hide_env_values = true)]
    pub slack_webhook_url: Option<String>,
}

/// Operator settings derived from CLI args.
#[derive(Debug, Clone)]
pub struct Settings {
    pub policy_name: String,
    pub cycle_timeout: Duration,
    pub step_timeout: Duration,
    pub requeue_in_progress: Duration,
    pub requeue_stable: Duration,
    pub health_port: u16,
    pub metrics_port: u16,
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.policy_name.is_empty() {
            return Err("--policy-name must not be empty".to_string());
        }
        if self.cycle_timeout_seconds == 0 || self.step_timeout_seconds == 0 {
            return Err("cycle and step timeouts must be greater than zero".to_string());
        }
        if self.requeue_in_progress_seconds == 0 {
            return Err("--requeue-in-progress-seconds must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        Settings {
            policy_name: self.policy_name.clone(),
            cycle_timeout: Duration::from_secs(self.cycle_timeout_seconds),
            step_timeout: Duration::from_secs(self.step_timeout_seconds),
            requeue_in_progress: Duration::from_secs(self.requeue_in_progress_seconds),
            requeue_stable: Duration::from_secs(self.requeue_stable_seconds),
            health_port: self.health_port,
            metrics_port: self.metrics_port,
        }
    }

    /// Webhook URL as a secret; an empty value disables Slack.
    pub fn slack_webhook(&self) -> Option<SecretString> {
        self.slack_webhook_url
            .clone()
            .filter(|url| !url.is_empty())
            .map(SecretString::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("duo").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.command(), Command::Run);
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.policy_name, "cluster");
        assert!(args.validate().is_ok());

        let settings = args.settings();
        assert_eq!(settings.cycle_timeout, Duration::from_secs(120));
        assert_eq!(settings.step_timeout, Duration::from_secs(60));
        assert_eq!(settings.requeue_in_progress, Duration::from_secs(15));
        assert_eq!(settings.requeue_stable, Duration::from_secs(300));
        assert_eq!(settings.health_port, 8080);
        assert_eq!(settings.metrics_port, 8081);
    }

    #[test]
    fn test_reset_node_subcommand() {
        let args = parse(&["--log-format", "pretty", "reset-node", "gpu-07"]);
        assert_eq!(args.log_format, LogFormat::Pretty);
        assert_eq!(
            args.command(),
            Command::ResetNode {
                node: "gpu-07".to_string(),
                uncordon: false,
            }
        );

        let args = parse(&["reset-node", "gpu-07", "--uncordon"]);
        assert!(matches!(args.command(), Command::ResetNode { uncordon: true, .. }));
    }

    #[test]
    fn test_crd_subcommand() {
        assert_eq!(parse(&["crd"]).command(), Command::Crd);
    }

    #[test]
    fn test_empty_webhook_disables_slack() {
        let args = parse(&["--slack-webhook-url", ""]);
        assert!(args.slack_webhook().is_none());

        let args = parse(&["--slack-webhook-url", "https://hooks.slack.com/services/T/B/X"]);
        assert!(args.slack_webhook().is_some());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let args = parse(&["--step-timeout-seconds", "0"]);
        assert!(args.validate().is_err());

        let args = parse(&["--policy-name", ""]);
        assert!(args.validate().is_err());
    }
}
