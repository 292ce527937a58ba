pub mod cli;
pub mod slack;
pub mod telegram;
pub mod traits;

pub use cli::CliChannel;
pub use slack::SlackChannel;
pub use telegram::TelegramChannel;
pub use traits::{Channel, ChannelMessage, MessageHandle, SendMessage};

use crate::agent::Dispatcher;
use crate::config::Config;
use crate::runner::{AgentInvocation, AgentRunner};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const CHANNEL_INITIAL_BACKOFF_SECS: u64 = 2;
const CHANNEL_MAX_BACKOFF_SECS: u64 = 60;
const MESSAGE_BUS_CAPACITY: usize = 100;
const MIN_IN_FLIGHT_MESSAGES: usize = 4;
const MAX_IN_FLIGHT_MESSAGES: usize = 16;

/// Instantiate every channel the config enables. Channels with a blank
/// token are skipped with a warning rather than failing the whole
/// service.
fn build_channels(config: &Config) -> Vec<Arc<dyn Channel>> {
    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();

    if let Some(telegram) = &config.channels.telegram {
        if telegram.bot_token.is_empty() {
            tracing::warn!("Telegram configured without a bot token; skipping");
        } else {
            channels.push(Arc::new(TelegramChannel::new(telegram.bot_token.clone())));
        }
    }

    if let Some(slack) = &config.channels.slack {
        if slack.bot_token.is_empty() {
            tracing::warn!("Slack configured without a bot token; skipping");
        } else {
            channels.push(Arc::new(SlackChannel::new(
                slack.bot_token.clone(),
                slack.channel_id.clone(),
            )));
        }
    }

    if config.channels.cli {
        channels.push(Arc::new(CliChannel::new()));
    }

    channels
}

fn compute_max_in_flight_messages() -> usize {
    let cores = std::thread::available_parallelism().map_or(4, |n| n.get());
    (cores * 2).clamp(MIN_IN_FLIGHT_MESSAGES, MAX_IN_FLIGHT_MESSAGES)
}

/// Keep one channel listening forever. Errors restart the listener with
/// doubling backoff; a clean return means the listener is done for good
/// (CLI `/quit`, closed bus).
fn spawn_supervised_listener(channel: Arc<dyn Channel>, tx: mpsc::Sender<ChannelMessage>) {
    tokio::spawn(async move {
        let mut backoff = CHANNEL_INITIAL_BACKOFF_SECS;
        loop {
            let result = channel.listen(tx.clone()).await;
            if tx.is_closed() {
                break;
            }
            match result {
                Ok(()) => {
                    tracing::info!("{} listener finished", channel.name());
                    break;
                }
                Err(e) => tracing::error!("{} listener error: {e:#}; restarting in {backoff}s", channel.name()),
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double backoff AFTER sleeping so the first error uses the initial value
            backoff = backoff.saturating_mul(2).min(CHANNEL_MAX_BACKOFF_SECS);
        }
    });
}

async fn run_message_dispatch_loop(
    mut rx: mpsc::Receiver<ChannelMessage>,
    channels_by_name: Arc<HashMap<String, Arc<dyn Channel>>>,
    dispatcher: Arc<Dispatcher>,
) {
    let max_in_flight = compute_max_in_flight_messages();
    tracing::info!("dispatch loop ready (up to {max_in_flight} messages in flight)");
    let semaphore = Arc::new(tokio::sync::Semaphore::new(max_in_flight));
    let mut workers: JoinSet<()> = JoinSet::new();

    while let Some(msg) = rx.recv().await {
        let Some(channel) = channels_by_name.get(&msg.channel).cloned() else {
            tracing::warn!("dropping message from unknown channel '{}'", msg.channel);
            continue;
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let worker_dispatcher = Arc::clone(&dispatcher);
        workers.spawn(async move {
            let _permit = permit;
            worker_dispatcher.handle_message(channel.as_ref(), &msg).await;
        });

        while let Some(result) = workers.try_join_next() {
            log_worker_join_result(result);
        }
    }

    while let Some(result) = workers.join_next().await {
        log_worker_join_result(result);
    }
}

fn log_worker_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        tracing::error!("message worker crashed: {error}");
    }
}

/// Start every configured channel and pump messages until the bus closes
/// or Ctrl+C arrives. Live agent runs are killed on the way out.
pub async fn start_channels(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let channels = build_channels(&config);
    if channels.is_empty() {
        anyhow::bail!(
            "No channels configured. Enable [channels] cli or add telegram/slack credentials in {}",
            config.config_path.display()
        );
    }

    let runner = Arc::new(AgentRunner::new());
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config), Arc::clone(&runner)));

    // All channels feed one bus; workers fan back out by channel name.
    let (tx, rx) = mpsc::channel::<ChannelMessage>(MESSAGE_BUS_CAPACITY);

    let mut channels_by_name: HashMap<String, Arc<dyn Channel>> = HashMap::new();
    for channel in &channels {
        channels_by_name.insert(channel.name().to_string(), Arc::clone(channel));
        spawn_supervised_listener(Arc::clone(channel), tx.clone());
        tracing::info!("✅ {} channel started", channel.name());
    }
    drop(tx); // Drop our copy so rx closes when all listeners stop

    let dispatch = run_message_dispatch_loop(rx, Arc::new(channels_by_name), Arc::clone(&dispatcher));

    tokio::select! {
        () = dispatch => {
            tracing::info!("all channel listeners stopped");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("ctrl-c handler failed: {e}");
            }
            tracing::info!("shutting down...");
        }
    }

    runner.shutdown().await;
    Ok(())
}

/// Health summary for the agent binary and every configured adapter.
pub async fn doctor_channels(config: &Config) -> Result<()> {
    let runner = AgentRunner::new();
    let probe = AgentInvocation::version_probe(&config.agent, &config.workspace_dir);
    match runner.version_probe(probe).await {
        Ok(version) => println!("✅ agent CLI: {version}"),
        Err(e) => println!("❌ agent CLI ({}): {e:#}", config.agent.cli_path),
    }

    let channels = build_channels(config);
    if channels.is_empty() {
        println!("⚠️  no channels configured");
        return Ok(());
    }
    for channel in channels {
        let healthy = tokio::time::timeout(Duration::from_secs(10), channel.health_check())
            .await
            .unwrap_or(false);
        if healthy {
            println!("✅ {}: healthy", channel.name());
        } else {
            println!("❌ {}: unhealthy or timed out", channel.name());
        }
    }
    Ok(())
}
