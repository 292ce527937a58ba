use super::traits::{Channel, ChannelMessage, MessageHandle, SendMessage};
use async_trait::async_trait;

/// Slack truncates chat messages around 3000 characters of visible text.
pub const SLACK_MAX_MESSAGE: usize = 3000;

/// Slack channel — polls conversations.history via Web API.
///
/// Authorization lives in the dispatcher; this adapter only moves
/// messages.
pub struct SlackChannel {
    bot_token: String,
    channel_id: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(bot_token: String, channel_id: Option<String>) -> Self {
        Self {
            bot_token,
            channel_id,
            client: reqwest::Client::new(),
        }
    }

    /// Get the bot's own user ID so we can ignore our own messages
    async fn get_bot_user_id(&self) -> Option<String> {
        let resp: serde_json::Value = self
            .client
            .get("https://slack.com/api/auth.test")
            .bearer_auth(&self.bot_token)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;

        resp.get("user_id")
            .and_then(|u| u.as_str())
            .map(String::from)
    }

    /// POST one Web API method. Slack returns 200 for most app-level
    /// errors, so the JSON `ok` field is checked as well as the status.
    async fn call(&self, method: &str, body: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .client
            .post(format!("https://slack.com/api/{method}"))
            .bearer_auth(&self.bot_token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));

        if !status.is_success() {
            anyhow::bail!("Slack {method} failed ({status}): {text}");
        }

        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        if parsed.get("ok") == Some(&serde_json::Value::Bool(false)) {
            let err = parsed
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            anyhow::bail!("Slack {method} failed: {err}");
        }

        Ok(parsed)
    }

    fn post_body(message: &SendMessage) -> serde_json::Value {
        let mut body = serde_json::json!({
            "channel": message.recipient,
            "text": message.content,
        });
        if let Some(thread_ts) = &message.thread {
            body["thread_ts"] = serde_json::Value::String(thread_ts.clone());
        }
        body
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    fn max_message_len(&self) -> usize {
        SLACK_MAX_MESSAGE
    }

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
        self.call("chat.postMessage", &Self::post_body(message))
            .await?;
        Ok(())
    }

    async fn send_tracked(&self, message: &SendMessage) -> anyhow::Result<Option<MessageHandle>> {
        let data = self
            .call("chat.postMessage", &Self::post_body(message))
            .await?;
        let handle = data
            .get("ts")
            .and_then(|t| t.as_str())
            .map(|ts| MessageHandle {
                recipient: message.recipient.clone(),
                id: ts.to_string(),
            });
        Ok(handle)
    }

    async fn update(&self, handle: &MessageHandle, content: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "channel": handle.recipient,
            "ts": handle.id,
            "text": content,
        });
        self.call("chat.update", &body).await?;
        Ok(())
    }

    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let channel_id = self
            .channel_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Slack channel_id required for listening"))?;

        let bot_user_id = self.get_bot_user_id().await.unwrap_or_default();
        let mut last_ts = String::new();

        tracing::info!("Slack channel listening on #{channel_id}...");

        loop {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;

            let mut params = vec![("channel", channel_id.clone()), ("limit", "10".to_string())];
            if !last_ts.is_empty() {
                params.push(("oldest", last_ts.clone()));
            }

            let resp = match self
                .client
                .get("https://slack.com/api/conversations.history")
                .bearer_auth(&self.bot_token)
                .query(&params)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Slack poll error: {e}");
                    continue;
                }
            };

            let data: serde_json::Value = match resp.json().await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("Slack parse error: {e}");
                    continue;
                }
            };

            if let Some(messages) = data.get("messages").and_then(|m| m.as_array()) {
                // Messages come newest-first, reverse to process oldest first
                for msg in messages.iter().rev() {
                    let ts = msg.get("ts").and_then(|t| t.as_str()).unwrap_or("");
                    let user = msg
                        .get("user")
                        .and_then(|u| u.as_str())
                        .unwrap_or("unknown");
                    let text = msg.get("text").and_then(|t| t.as_str()).unwrap_or("");

                    // Bot posts (including our own placeholders) are never
                    // fed back into the pipeline.
                    if user == bot_user_id || msg.get("bot_id").is_some() {
                        continue;
                    }

                    // Skip empty or already-seen
                    if text.is_empty() || ts <= last_ts.as_str() {
                        continue;
                    }

                    last_ts = ts.to_string();

                    let thread = msg
                        .get("thread_ts")
                        .and_then(|t| t.as_str())
                        .map(String::from);

                    let channel_msg = ChannelMessage {
                        id: format!("slack_{channel_id}_{ts}"),
                        sender: user.to_string(),
                        reply_target: channel_id.clone(),
                        content: text.to_string(),
                        channel: "slack".to_string(),
                        timestamp: std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs(),
                        thread,
                    };

                    if tx.send(channel_msg).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.client
            .get("https://slack.com/api/auth.test")
            .bearer_auth(&self.bot_token)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_channel_name() {
        let ch = SlackChannel::new("xoxb-fake".into(), None);
        assert_eq!(ch.name(), "slack");
    }

    #[test]
    fn slack_channel_with_channel_id() {
        let ch = SlackChannel::new("xoxb-fake".into(), Some("C12345".into()));
        assert_eq!(ch.channel_id, Some("C12345".to_string()));
    }

    #[test]
    fn slack_message_limit() {
        let ch = SlackChannel::new("xoxb-fake".into(), None);
        assert_eq!(ch.max_message_len(), 3000);
    }

    #[test]
    fn post_body_without_thread() {
        let body = SlackChannel::post_body(&SendMessage {
            content: "hi".into(),
            recipient: "C1".into(),
            thread: None,
        });
        assert_eq!(body["channel"], "C1");
        assert_eq!(body["text"], "hi");
        assert!(body.get("thread_ts").is_none());
    }

    #[test]
    fn post_body_carries_thread_ts() {
        let body = SlackChannel::post_body(&SendMessage {
            content: "hi".into(),
            recipient: "C1".into(),
            thread: Some("1700000000.000100".into()),
        });
        assert_eq!(body["thread_ts"], "1700000000.000100");
    }

    // ── Message ID edge cases ─────────────────────────────────────

    #[test]
    fn slack_message_id_format_includes_channel_and_ts() {
        // Verify that message IDs follow the format: slack_{channel_id}_{ts}
        let ts = "1234567890.123456";
        let channel_id = "C12345";
        let expected_id = format!("slack_{channel_id}_{ts}");
        assert_eq!(expected_id, "slack_C12345_1234567890.123456");
    }

    #[test]
    fn slack_message_id_is_deterministic() {
        // Same channel_id + same ts = same ID (prevents duplicates after restart)
        let ts = "1234567890.123456";
        let channel_id = "C12345";
        let id1 = format!("slack_{channel_id}_{ts}");
        let id2 = format!("slack_{channel_id}_{ts}");
        assert_eq!(id1, id2);
    }

    #[test]
    fn slack_message_id_different_ts_different_id() {
        let channel_id = "C12345";
        let id1 = format!("slack_{channel_id}_1234567890.123456");
        let id2 = format!("slack_{channel_id}_1234567890.123457");
        assert_ne!(id1, id2);
    }
}
