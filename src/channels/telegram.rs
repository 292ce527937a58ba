use super::traits::{Channel, ChannelMessage, MessageHandle, SendMessage};
use async_trait::async_trait;
use uuid::Uuid;

/// Telegram hard-limits message text to 4096 characters.
pub const TELEGRAM_MAX_MESSAGE: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram channel — long-polls the Bot API for updates.
///
/// Authorization lives in the dispatcher; this adapter only moves
/// messages. Replies are sent as plain text: agent output is full of
/// underscores and brackets that Telegram's Markdown parser rejects.
pub struct TelegramChannel {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String) -> Self {
        Self::with_api_base(bot_token, TELEGRAM_API_BASE.to_string())
    }

    /// Point the adapter at a different API host (tests).
    pub fn with_api_base(bot_token: String, api_base: String) -> Self {
        Self {
            bot_token,
            api_base,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// POST one Bot API method and return the parsed body after checking
    /// both the HTTP status and Telegram's own `ok` flag.
    async fn call(&self, method: &str, body: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let data: serde_json::Value = resp.json().await.unwrap_or_default();
        let ok = data.get("ok").and_then(serde_json::Value::as_bool).unwrap_or(false);
        if !status.is_success() || !ok {
            let description = data
                .get("description")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("no description");
            anyhow::bail!("Telegram {method} failed ({status}): {description}");
        }
        Ok(data)
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn max_message_len(&self) -> usize {
        TELEGRAM_MAX_MESSAGE
    }

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "chat_id": message.recipient,
            "text": message.content,
        });
        self.call("sendMessage", &body).await?;
        Ok(())
    }

    async fn send_tracked(&self, message: &SendMessage) -> anyhow::Result<Option<MessageHandle>> {
        let body = serde_json::json!({
            "chat_id": message.recipient,
            "text": message.content,
        });
        let data = self.call("sendMessage", &body).await?;
        let handle = data
            .get("result")
            .and_then(|r| r.get("message_id"))
            .and_then(serde_json::Value::as_i64)
            .map(|id| MessageHandle {
                recipient: message.recipient.clone(),
                id: id.to_string(),
            });
        Ok(handle)
    }

    async fn update(&self, handle: &MessageHandle, content: &str) -> anyhow::Result<()> {
        let message_id: i64 = handle
            .id
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid Telegram message id: {}", handle.id))?;
        let body = serde_json::json!({
            "chat_id": handle.recipient,
            "message_id": message_id,
            "text": content,
        });
        match self.call("editMessageText", &body).await {
            Ok(_) => Ok(()),
            // Editing to identical text is an error to Telegram but not to us.
            Err(e) if e.to_string().contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let mut offset: i64 = 0;

        tracing::info!("Telegram channel listening for messages...");

        loop {
            let url = self.api_url("getUpdates");
            let body = serde_json::json!({
                "offset": offset,
                "timeout": 30,
                "allowed_updates": ["message"]
            });

            let resp = match self.client.post(&url).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Telegram poll error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            let data: serde_json::Value = match resp.json().await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("Telegram parse error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            if let Some(results) = data.get("result").and_then(serde_json::Value::as_array) {
                for update in results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(message) = update.get("message") else {
                        continue;
                    };

                    let Some(text) = message.get("text").and_then(serde_json::Value::as_str) else {
                        continue;
                    };

                    let Some(chat_id) = message
                        .get("chat")
                        .and_then(|c| c.get("id"))
                        .and_then(serde_json::Value::as_i64)
                        .map(|id| id.to_string())
                    else {
                        continue;
                    };

                    // Sender identity is the numeric user id; group chats
                    // fall back to the chat id itself.
                    let sender = message
                        .get("from")
                        .and_then(|f| f.get("id"))
                        .and_then(serde_json::Value::as_i64)
                        .map_or_else(|| chat_id.clone(), |id| id.to_string());

                    let timestamp = message
                        .get("date")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or_else(|| {
                            std::time::SystemTime::now()
                                .duration_since(std::time::UNIX_EPOCH)
                                .unwrap_or_default()
                                .as_secs()
                        });

                    let msg = ChannelMessage {
                        id: Uuid::new_v4().to_string(),
                        sender,
                        reply_target: chat_id,
                        content: text.to_string(),
                        channel: "telegram".to_string(),
                        timestamp,
                        thread: None,
                    };

                    if tx.send(msg).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
