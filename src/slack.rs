use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::SinkError;
use crate::types::Message;

/// Slack rejects section text longer than this.
const SECTION_TEXT_LIMIT: usize = 3000;

/// Outbound notification transport. Only the delivery queue calls `send`.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &Message) -> Result<(), SinkError>;
}

pub struct SlackSink {
    api_url: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

impl SlackSink {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Checks the token against `auth.test` and returns the workspace name.
    pub async fn verify(&self) -> Result<String, SinkError> {
        let response: SlackResponse = self
            .client
            .post(format!("{}/auth.test", self.api_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;
        if !response.ok {
            return Err(SinkError::Api(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        let team = response.team.unwrap_or_default();
        info!("Connected to Slack workspace: {}", team);
        Ok(team)
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, message: &Message) -> Result<(), SinkError> {
        let payload = json!({
            "channel": message.channel,
            "text": message.title,
            "blocks": render_blocks(message),
            "unfurl_links": false,
            "unfurl_media": false,
        });

        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.api_url))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SinkError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(SinkError::Send(format!(
                "Slack returned HTTP {}",
                response.status()
            )));
        }

        let body: SlackResponse = response.json().await?;
        if !body.ok {
            return Err(SinkError::Api(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        debug!(
            "Message sent to {}: {}",
            message.channel,
            body.ts.unwrap_or_default()
        );
        Ok(())
    }
}

/// Dry-run sink: prints each notification instead of posting it.
pub struct StdoutSink;

#[async_trait]
impl NotificationSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send(&self, message: &Message) -> Result<(), SinkError> {
        println!("[{}] {}", message.channel, message.to_text());
        Ok(())
    }
}

/// Block Kit layout: header, fields, divider, code-block body, context footer.
pub fn render_blocks(message: &Message) -> Value {
    let fields: Vec<Value> = message
        .fields
        .iter()
        .map(|f| json!({ "type": "mrkdwn", "text": format!("*{}:* {}", f.name, f.value) }))
        .collect();
    let body = format!(
        "```{}```",
        truncate_body(&message.body, SECTION_TEXT_LIMIT - 6)
    );

    json!([
        {
            "type": "header",
            "text": { "type": "plain_text", "text": strip_markup(&message.title), "emoji": true }
        },
        { "type": "section", "fields": fields },
        { "type": "divider" },
        { "type": "section", "text": { "type": "mrkdwn", "text": body } },
        {
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": message.footer }]
        }
    ])
}

fn strip_markup(text: &str) -> String {
    text.chars().filter(|c| !matches!(c, '*' | '_' | '`')).collect()
}

/// Cuts whole lines off the end of `body` until it fits in `limit` bytes.
pub fn truncate_body(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }

    let lines: Vec<&str> = body.lines().collect();
    let mut kept = String::new();
    for (i, line) in lines.iter().enumerate() {
        let note = format!("\n… ({} more lines)", lines.len() - i);
        if kept.len() + line.len() + 1 + note.len() > limit {
            if kept.is_empty() {
                let cut = line
                    .char_indices()
                    .map(|(idx, _)| idx)
                    .take_while(|idx| *idx + note.len() <= limit)
                    .last()
                    .unwrap_or(0);
                kept.push_str(&line[..cut]);
            }
            kept.push_str(&note);
            return kept;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
    }
    kept
}
