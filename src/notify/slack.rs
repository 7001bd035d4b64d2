//! Slack notification support via Incoming Webhooks.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Slack rejects section fields longer than this.
const MAX_FIELD_CHARS: usize = 2000;
/// Slack allows at most this many fields per section block.
const MAX_FIELDS_PER_SECTION: usize = 10;

/// Structured Slack message for Block Kit rendering.
#[derive(Clone, Debug)]
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

pub struct SlackNotifier {
    webhook_url: SecretString,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: SecretString) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Send a Block Kit message. Errors are logged, never propagated.
    pub async fn send(&self, policy: &str, message: &SlackMessage) {
        let payload = build_blocks_payload(message);
        match self
            .client
            .post(self.webhook_url.expose_secret())
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                warn!(
                    policy,
                    status = %resp.status(),
                    "Slack webhook returned non-success status"
                );
            }
            Err(e) => {
                // reqwest errors carry the URL; strip it so the webhook secret stays out of logs.
                warn!(policy, error = %e.without_url(), "Failed to send Slack notification");
            }
            Ok(_) => {
                info!(
                    policy,
                    header = message.header.as_str(),
                    "Slack notification sent"
                );
            }
        }
    }
}

fn truncate(value: &str) -> String {
    if value.chars().count() <= MAX_FIELD_CHARS {
        return value.to_string();
    }
    let mut out: String = value.chars().take(MAX_FIELD_CHARS - 1).collect();
    out.push('…');
    out
}

fn build_blocks_payload(message: &SlackMessage) -> Value {
    let mut blocks: Vec<Value> = vec![json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": message.header,
            "emoji": true
        }
    })];

    let fields: Vec<Value> = message
        .fields
        .iter()
        .map(|(label, value)| {
            json!({
                "type": "mrkdwn",
                "text": truncate(&format!("*{label}*\n{value}"))
            })
        })
        .collect();
    for chunk in fields.chunks(MAX_FIELDS_PER_SECTION) {
        blocks.push(json!({
            "type": "section",
            "fields": chunk
        }));
    }

    blocks.push(json!({"type": "divider"}));
    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": message.context
        }]
    }));

    // Fallback for clients without Block Kit.
    let fallback = format!("{}\n{}", message.header, message.context);

    json!({
        "text": fallback,
        "blocks": blocks
    })
}
