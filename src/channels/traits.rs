use async_trait::async_trait;

/// A message received from a channel, normalized for dispatch
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub id: String,
    /// Stable identity of the human sender (authorization, rate limits,
    /// session continuity).
    pub sender: String,
    /// Where replies go: chat id for Telegram, channel id for Slack.
    pub reply_target: String,
    pub content: String,
    pub channel: String,
    pub timestamp: u64,
    /// Platform thread marker (Slack `thread_ts`), echoed on replies.
    pub thread: Option<String>,
}

/// An outbound message
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub content: String,
    pub recipient: String,
    pub thread: Option<String>,
}

/// Identifies a previously sent message for in-place edits
#[derive(Debug, Clone)]
pub struct MessageHandle {
    pub recipient: String,
    pub id: String,
}

/// Core channel trait - implement for any messaging platform
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Hard platform limit for one outbound message, in characters.
    /// `0` means unlimited.
    fn max_message_len(&self) -> usize {
        0
    }

    /// Send a message through this channel
    async fn send(&self, message: &SendMessage) -> anyhow::Result<()>;

    /// Send a message and return a handle for later in-place edits.
    /// Channels without edit support send normally and return `None`.
    async fn send_tracked(&self, message: &SendMessage) -> anyhow::Result<Option<MessageHandle>> {
        self.send(message).await?;
        Ok(None)
    }

    /// Replace the content of a previously tracked message
    async fn update(&self, handle: &MessageHandle, content: &str) -> anyhow::Result<()> {
        let _ = (handle, content);
        anyhow::bail!("channel does not support message edits")
    }

    /// Start listening for incoming messages (long-running)
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()>;

    /// Check if channel is healthy
    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyChannel;

    #[async_trait]
    impl Channel for DummyChannel {
        fn name(&self) -> &str {
            "dummy"
        }

        async fn send(&self, _message: &SendMessage) -> anyhow::Result<()> {
            Ok(())
        }

        async fn listen(
            &self,
            tx: tokio::sync::mpsc::Sender<ChannelMessage>,
        ) -> anyhow::Result<()> {
            tx.send(ChannelMessage {
                id: "1".into(),
                sender: "tester".into(),
                reply_target: "tester".into(),
                content: "hello".into(),
                channel: "dummy".into(),
                timestamp: 123,
                thread: None,
            })
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
        }
    }

    fn outbound(text: &str) -> SendMessage {
        SendMessage {
            content: text.into(),
            recipient: "bob".into(),
            thread: None,
        }
    }

    #[test]
    fn channel_message_clone_preserves_fields() {
        let message = ChannelMessage {
            id: "42".into(),
            sender: "alice".into(),
            reply_target: "room-7".into(),
            content: "ping".into(),
            channel: "dummy".into(),
            timestamp: 999,
            thread: Some("th-1".into()),
        };

        let cloned = message.clone();
        assert_eq!(cloned.id, "42");
        assert_eq!(cloned.sender, "alice");
        assert_eq!(cloned.reply_target, "room-7");
        assert_eq!(cloned.content, "ping");
        assert_eq!(cloned.channel, "dummy");
        assert_eq!(cloned.timestamp, 999);
        assert_eq!(cloned.thread.as_deref(), Some("th-1"));
    }

    #[tokio::test]
    async fn default_trait_methods() {
        let channel = DummyChannel;

        assert!(channel.health_check().await);
        assert_eq!(channel.max_message_len(), 0);
        assert!(channel.send(&outbound("hello")).await.is_ok());
        // Without edit support there is no handle to update.
        let handle = channel.send_tracked(&outbound("hello")).await.unwrap();
        assert!(handle.is_none());
        let fake = MessageHandle {
            recipient: "bob".into(),
            id: "1".into(),
        };
        assert!(channel.update(&fake, "new").await.is_err());
    }

    #[tokio::test]
    async fn listen_sends_message_to_channel() {
        let channel = DummyChannel;
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);

        channel.listen(tx).await.unwrap();

        let received = rx.recv().await.expect("message should be sent");
        assert_eq!(received.sender, "tester");
        assert_eq!(received.content, "hello");
        assert_eq!(received.channel, "dummy");
    }
}
