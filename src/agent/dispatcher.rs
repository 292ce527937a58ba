use crate::agent::SessionStore;
use crate::channels::{Channel, ChannelMessage, MessageHandle, SendMessage};
use crate::coalesce::OutputCoalescer;
use crate::config::Config;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::runner::{AgentInvocation, AgentRunner, OutputEvent, RunHandle, RunReport};
use crate::sanitize::strip_ansi;
use crate::split::split_message;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

const PROCESSING_NOTICE: &str = "⏳ Processing...";
const SUCCESS_NO_OUTPUT_NOTICE: &str = "✅ Command completed successfully.";
const RESET_NOTICE: &str = "✨ New conversation started. Previous context has been cleared.";

const HELP_TEXT: &str = "🤖 Clawdio - your coding agent over chat\n\n\
    Send any message and it is forwarded to the agent as a prompt. \
    Replies stream back as the agent produces them.\n\n\
    Commands:\n\
    /new - start a fresh conversation (clears agent context)\n\
    /status - agent availability and session info\n\
    /help - this message";

/// Everything that can stop a message from producing agent output.
///
/// Each variant maps to exactly one notice sent back to the caller;
/// the [`Dispatcher::handle_message`] boundary guarantees nothing else
/// escapes to the listener loops.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("sender is not on the allow-list")]
    AuthorizationDenied,
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },
    #[error("input is {length} chars, limit is {limit}")]
    InputTooLong { length: usize, limit: usize },
    #[error("agent run exceeded {limit_secs}s")]
    Timeout { limit_secs: u64 },
    #[error("agent exited with code {code}")]
    NonZeroExit { code: i32 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DeliveryError {
    /// The single user-facing notice for this failure.
    pub fn notice(&self) -> String {
        match self {
            Self::AuthorizationDenied => {
                "⛔ You are not authorized to use this bot.".to_string()
            }
            Self::RateLimitExceeded { retry_after_secs } => {
                format!("⏱️ Rate limit exceeded. Try again in {retry_after_secs}s.")
            }
            Self::InputTooLong { length, limit } => {
                format!("❌ Message too long: {length} characters (limit {limit}).")
            }
            Self::Timeout { limit_secs } => {
                format!("⏱️ The agent did not finish within {limit_secs}s and was stopped.")
            }
            Self::NonZeroExit { code } => {
                format!("❌ The agent failed with exit code {code}.")
            }
            Self::Internal(_) => "❌ Internal error while handling your message.".to_string(),
        }
    }
}

/// Control commands callers can issue instead of a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    NewConversation,
    Status,
    Help,
}

/// Parse the leading token of a message as a control command.
///
/// Telegram group chats address bots as `/cmd@BotName`; the suffix is
/// ignored. Anything after the first whitespace is ignored too.
fn parse_command(content: &str) -> Option<ControlCommand> {
    let first = content.trim().split_whitespace().next()?;
    let bare = first.split('@').next()?;
    match bare {
        "/new" => Some(ControlCommand::NewConversation),
        "/status" => Some(ControlCommand::Status),
        "/help" | "/start" => Some(ControlCommand::Help),
        _ => None,
    }
}

/// Routes inbound chat messages through authorization, rate limiting
/// and the agent runner, then delivers output back through the channel.
///
/// One dispatcher serves every channel; per-caller state is keyed by
/// `channel:sender` so identities never collide across platforms.
pub struct Dispatcher {
    config: Arc<Config>,
    runner: Arc<AgentRunner>,
    limiter: RateLimiter,
    sessions: SessionStore,
}

struct CollectedRun {
    transcript: String,
    report: RunReport,
    last_preview: Option<String>,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, runner: Arc<AgentRunner>) -> Self {
        let limiter = RateLimiter::new(
            config.limits.rate_limit_requests,
            config.limits.rate_limit_window_secs,
        );
        Self {
            config,
            runner,
            limiter,
            sessions: SessionStore::new(),
        }
    }

    /// Handle one inbound message end to end. Never returns an error:
    /// every failure becomes a single notice to the caller.
    pub async fn handle_message(&self, channel: &dyn Channel, msg: &ChannelMessage) {
        if let Err(err) = self.process(channel, msg).await {
            match &err {
                DeliveryError::Internal(inner) => {
                    tracing::error!("[{}:{}] delivery failed: {inner:#}", msg.channel, msg.sender);
                }
                other => {
                    tracing::warn!("[{}:{}] {other}", msg.channel, msg.sender);
                }
            }
            self.send_plain(channel, msg, &err.notice()).await;
        }
    }

    async fn process(
        &self,
        channel: &dyn Channel,
        msg: &ChannelMessage,
    ) -> Result<(), DeliveryError> {
        let identity = format!("{}:{}", msg.channel, msg.sender);

        if !self.is_authorized(&msg.channel, &msg.sender) {
            return Err(DeliveryError::AuthorizationDenied);
        }

        // Control commands bypass the rate budget so a throttled caller
        // can still ask for /status or reset a wedged session.
        if let Some(command) = parse_command(&msg.content) {
            let reply = self.run_command(command, msg, &identity).await;
            self.send_plain(channel, msg, &reply).await;
            return Ok(());
        }

        if let RateDecision::Limited { retry_after_secs } = self.limiter.check(&identity) {
            return Err(DeliveryError::RateLimitExceeded { retry_after_secs });
        }

        let length = msg.content.chars().count();
        let limit = self.config.limits.max_input_chars;
        if length > limit {
            return Err(DeliveryError::InputTooLong { length, limit });
        }

        tracing::info!("[{identity}] {}", preview_of(&msg.content));

        // Placeholder failure is tolerated; output falls back to plain sends.
        let placeholder = match channel.send_tracked(&reply_to(msg, PROCESSING_NOTICE)).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("placeholder send failed on {}: {e:#}", msg.channel);
                None
            }
        };

        let continue_session = self.sessions.is_active(&identity);
        let invocation = AgentInvocation::query(
            &self.config.agent,
            &self.config.workspace_dir,
            &msg.content,
            continue_session,
        );
        let handle = self.runner.start(invocation);
        let run = self.collect_run(channel, placeholder.as_ref(), handle).await;

        let cleaned = strip_ansi(&run.transcript);
        let output = cleaned.trim();
        if output.is_empty() {
            let notice = if run.report.timed_out {
                let limit_secs = self.config.agent.timeout_secs;
                tracing::warn!("[{identity}] run timed out after {limit_secs}s");
                DeliveryError::Timeout { limit_secs }.notice()
            } else if run.report.success {
                SUCCESS_NO_OUTPUT_NOTICE.to_string()
            } else {
                let code = run.report.exit_code;
                tracing::warn!("[{identity}] run failed with exit code {code}");
                DeliveryError::NonZeroExit { code }.notice()
            };
            self.deliver_replacing(channel, msg, placeholder.as_ref(), None, &notice)
                .await;
        } else {
            let parts = split_message(output, channel.max_message_len());
            self.deliver_chunks(
                channel,
                msg,
                placeholder.as_ref(),
                run.last_preview.as_deref(),
                &parts,
            )
            .await;
        }

        // Only a clean exit makes the conversation continuable.
        if run.report.success {
            self.sessions.mark_active(&identity);
        }
        Ok(())
    }

    fn is_authorized(&self, channel_name: &str, sender: &str) -> bool {
        let allowed = self.config.allowed_users_for(channel_name);
        if allowed.is_empty() {
            tracing::warn!("no allow-list configured for {channel_name}; permitting {sender}");
            return true;
        }
        if allowed.iter().any(|u| u == "*" || u == sender) {
            true
        } else {
            tracing::warn!("unauthorized sender {sender} on {channel_name}");
            false
        }
    }

    async fn run_command(
        &self,
        command: ControlCommand,
        msg: &ChannelMessage,
        identity: &str,
    ) -> String {
        match command {
            ControlCommand::NewConversation => {
                let existed = self.sessions.reset(identity);
                tracing::info!("[{identity}] conversation reset (was active: {existed})");
                RESET_NOTICE.to_string()
            }
            ControlCommand::Status => self.status_text(msg, identity).await,
            ControlCommand::Help => HELP_TEXT.to_string(),
        }
    }

    async fn status_text(&self, msg: &ChannelMessage, identity: &str) -> String {
        let probe = AgentInvocation::version_probe(&self.config.agent, &self.config.workspace_dir);
        let agent_line = match self.runner.version_probe(probe).await {
            Ok(version) => format!("✅ available ({version})"),
            Err(e) => {
                tracing::warn!("version probe failed: {e:#}");
                "❌ not available".to_string()
            }
        };
        let session = if self.sessions.is_active(identity) {
            "yes"
        } else {
            "no"
        };
        format!(
            "📊 Status\n\nAgent CLI: {agent_line}\nWorkspace: {}\nYour ID: {}\nAuthorized: yes\nSession active: {session}",
            self.config.workspace_dir.display(),
            msg.sender,
        )
    }

    /// Drain run output. With coalescing enabled, quiet-period batches
    /// drive best-effort edits of the placeholder so the caller sees
    /// progress; without it, events are appended directly.
    async fn collect_run(
        &self,
        channel: &dyn Channel,
        placeholder: Option<&MessageHandle>,
        mut handle: RunHandle,
    ) -> CollectedRun {
        let quiet_ms = self.config.agent.coalesce_ms;
        let mut transcript = String::new();
        let mut last_preview: Option<String> = None;

        if quiet_ms == 0 {
            while let Some(event) = handle.next_event().await {
                transcript.push_str(&render_event(&event));
            }
        } else {
            let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
            let coalescer = OutputCoalescer::new(Duration::from_millis(quiet_ms), batch_tx);
            loop {
                tokio::select! {
                    event = handle.next_event() => match event {
                        Some(event) => coalescer.append(&render_event(&event)),
                        None => break,
                    },
                    Some(batch) = batch_rx.recv() => {
                        transcript.push_str(&batch);
                        self.edit_preview(channel, placeholder, &transcript, &mut last_preview)
                            .await;
                    }
                }
            }
            // The stream is done; collect whatever the timer still holds.
            coalescer.flush();
            batch_rx.close();
            while let Ok(batch) = batch_rx.try_recv() {
                transcript.push_str(&batch);
            }
        }

        let report = handle.wait().await;
        CollectedRun {
            transcript,
            report,
            last_preview,
        }
    }

    async fn edit_preview(
        &self,
        channel: &dyn Channel,
        placeholder: Option<&MessageHandle>,
        transcript: &str,
        last_preview: &mut Option<String>,
    ) {
        let Some(handle) = placeholder else { return };
        let preview = preview_tail(transcript, channel.max_message_len());
        if preview.is_empty() || last_preview.as_deref() == Some(preview.as_str()) {
            return;
        }
        // Progress edits are cosmetic; a failed one is not worth a notice.
        match channel.update(handle, &preview).await {
            Ok(()) => *last_preview = Some(preview),
            Err(e) => tracing::debug!("progress edit failed on {}: {e:#}", channel.name()),
        }
    }

    /// Put `text` where the placeholder sits, or send it plain when
    /// there is no placeholder or the edit fails.
    async fn deliver_replacing(
        &self,
        channel: &dyn Channel,
        msg: &ChannelMessage,
        placeholder: Option<&MessageHandle>,
        skip_if_shown: Option<&str>,
        text: &str,
    ) {
        if let Some(handle) = placeholder {
            if skip_if_shown == Some(text) {
                // The live preview already displays exactly this.
                return;
            }
            match channel.update(handle, text).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!("placeholder update failed on {}: {e:#}", channel.name());
                }
            }
        }
        self.send_plain(channel, msg, text).await;
    }

    async fn deliver_chunks(
        &self,
        channel: &dyn Channel,
        msg: &ChannelMessage,
        placeholder: Option<&MessageHandle>,
        last_preview: Option<&str>,
        parts: &[String],
    ) {
        let Some((first, rest)) = parts.split_first() else {
            return;
        };
        self.deliver_replacing(channel, msg, placeholder, last_preview, first)
            .await;
        for part in rest {
            self.send_plain(channel, msg, part).await;
        }
    }

    async fn send_plain(&self, channel: &dyn Channel, msg: &ChannelMessage, text: &str) {
        if let Err(e) = channel.send(&reply_to(msg, text)).await {
            tracing::error!("send failed on {}: {e:#}", channel.name());
        }
    }
}

/// Build the outbound reply for an inbound message, preserving the
/// thread so platforms with threading keep the exchange together.
fn reply_to(msg: &ChannelMessage, text: &str) -> SendMessage {
    SendMessage {
        content: text.to_string(),
        recipient: msg.reply_target.clone(),
        thread: msg.thread.clone(),
    }
}

/// One transcript fragment per event. Stderr lines are logged and carry
/// a warning marker so they stand out in chat.
fn render_event(event: &OutputEvent) -> String {
    match event {
        OutputEvent::Stdout(line) => format!("{line}\n"),
        OutputEvent::Stderr(line) => {
            tracing::warn!("agent stderr: {line}");
            format!("⚠️ {line}\n")
        }
    }
}

/// Tail of the transcript sized to one platform message, prefixed with
/// an ellipsis when truncated. A zero limit means unlimited.
fn preview_tail(transcript: &str, max_chars: usize) -> String {
    let text = transcript.trim_end();
    if max_chars == 0 {
        return text.to_string();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars + 1;
    let tail: String = text.chars().skip(skip).collect();
    format!("…{tail}")
}

/// First line's worth of a prompt for the info log.
fn preview_of(content: &str) -> String {
    const MAX_CHARS: usize = 80;
    let flat = content.replace('\n', " ");
    if flat.chars().count() <= MAX_CHARS {
        flat
    } else {
        let head: String = flat.chars().take(MAX_CHARS).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::AgentRunner;

    fn dispatcher_with(config: Config) -> Dispatcher {
        Dispatcher::new(Arc::new(config), Arc::new(AgentRunner::new()))
    }

    fn base_config() -> Config {
        toml::from_str("").unwrap()
    }

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_command("/new"), Some(ControlCommand::NewConversation));
        assert_eq!(parse_command("/status"), Some(ControlCommand::Status));
        assert_eq!(parse_command("/help"), Some(ControlCommand::Help));
        assert_eq!(parse_command("/start"), Some(ControlCommand::Help));
    }

    #[test]
    fn tolerates_bot_name_suffix_and_arguments() {
        assert_eq!(
            parse_command("/new@ClawdioBot"),
            Some(ControlCommand::NewConversation)
        );
        assert_eq!(
            parse_command("/status@ClawdioBot please"),
            Some(ControlCommand::Status)
        );
        assert_eq!(parse_command("  /help extra words  "), Some(ControlCommand::Help));
    }

    #[test]
    fn rejects_non_commands() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/unknown"), None);
        assert_eq!(parse_command("/NEW"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("fix the /new button"), None);
    }

    #[test]
    fn authorization_defaults_open_when_list_is_empty() {
        let config = base_config();
        let dispatcher = dispatcher_with(config);
        assert!(dispatcher.is_authorized("telegram", "12345"));
        assert!(dispatcher.is_authorized("cli", "user"));
    }

    #[test]
    fn authorization_enforces_allow_list() {
        let mut config = base_config();
        config.channels.telegram = Some(crate::config::TelegramConfig {
            bot_token: "t".into(),
            allowed_users: vec!["42".into()],
        });
        let dispatcher = dispatcher_with(config);
        assert!(dispatcher.is_authorized("telegram", "42"));
        assert!(!dispatcher.is_authorized("telegram", "43"));
    }

    #[test]
    fn authorization_wildcard_admits_everyone() {
        let mut config = base_config();
        config.channels.slack = Some(crate::config::SlackConfig {
            bot_token: "t".into(),
            channel_id: None,
            allowed_users: vec!["*".into()],
        });
        let dispatcher = dispatcher_with(config);
        assert!(dispatcher.is_authorized("slack", "anyone"));
    }

    #[test]
    fn notices_carry_the_numbers() {
        let rate = DeliveryError::RateLimitExceeded {
            retry_after_secs: 17,
        };
        assert!(rate.notice().contains("17s"));
        let long = DeliveryError::InputTooLong {
            length: 12000,
            limit: 10000,
        };
        assert!(long.notice().contains("12000"));
        assert!(long.notice().contains("10000"));
        let timeout = DeliveryError::Timeout { limit_secs: 1800 };
        assert!(timeout.notice().contains("1800s"));
        let exit = DeliveryError::NonZeroExit { code: 3 };
        assert!(exit.notice().contains("code 3"));
    }

    #[test]
    fn stderr_events_get_a_warning_marker() {
        assert_eq!(render_event(&OutputEvent::Stdout("ok".into())), "ok\n");
        assert_eq!(
            render_event(&OutputEvent::Stderr("boom".into())),
            "⚠️ boom\n"
        );
    }

    #[test]
    fn preview_tail_keeps_short_transcripts_whole() {
        assert_eq!(preview_tail("hello\n", 100), "hello");
        assert_eq!(preview_tail("hello", 0), "hello");
    }

    #[test]
    fn preview_tail_truncates_from_the_front() {
        let preview = preview_tail("abcdefghij", 5);
        assert_eq!(preview, "…ghij");
        assert_eq!(preview.chars().count(), 5);
    }

    #[test]
    fn preview_tail_counts_chars_not_bytes() {
        let preview = preview_tail("😀😀😀😀", 3);
        assert_eq!(preview, "…😀😀");
    }

    #[test]
    fn prompt_preview_flattens_and_truncates() {
        assert_eq!(preview_of("fix\nthe bug"), "fix the bug");
        let long = "x".repeat(200);
        let preview = preview_of(&long);
        assert_eq!(preview.chars().count(), 81);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn replies_preserve_thread_and_target() {
        let msg = ChannelMessage {
            id: "1".into(),
            sender: "42".into(),
            reply_target: "C123".into(),
            content: "hi".into(),
            channel: "slack".into(),
            timestamp: 0,
            thread: Some("169.42".into()),
        };
        let reply = reply_to(&msg, "done");
        assert_eq!(reply.content, "done");
        assert_eq!(reply.recipient, "C123");
        assert_eq!(reply.thread.as_deref(), Some("169.42"));
    }
}
