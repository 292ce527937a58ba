#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use clawdio::channels;
use clawdio::config::Config;
use clawdio::runner::{AgentInvocation, AgentRunner, OutputEvent};

/// `Clawdio` - your coding agent, reachable from any chat.
#[derive(Parser, Debug)]
#[command(name = "clawdio")]
#[command(version)]
#[command(about = "Bridge chat channels to a local coding agent CLI.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start all configured channels and serve messages (default)
    Start,

    /// Send one prompt to the agent and print its output
    Ask {
        /// The prompt to forward
        prompt: String,

        /// Continue the most recent agent conversation
        #[arg(short = 'c', long = "continue")]
        continue_session: bool,
    },

    /// Run health checks for the agent CLI and configured channels
    Doctor,

    /// Show configuration summary
    Status,

    /// Print the config file path
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    let config = Config::load_or_init()?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => channels::start_channels(config).await,

        Commands::Ask {
            prompt,
            continue_session,
        } => ask(&config, &prompt, continue_session).await,

        Commands::Doctor => channels::doctor_channels(&config).await,

        Commands::Status => {
            println!("🦀 Clawdio Status");
            println!();
            println!("Version:     {}", env!("CARGO_PKG_VERSION"));
            println!("Workspace:   {}", config.workspace_dir.display());
            println!("Config:      {}", config.config_path.display());
            println!();
            println!("🤖 Agent CLI:  {}", config.agent.cli_path);
            println!("   Timeout:    {}s", config.agent.timeout_secs);
            println!(
                "   Coalesce:   {}",
                if config.agent.coalesce_ms == 0 {
                    "off".to_string()
                } else {
                    format!("{}ms", config.agent.coalesce_ms)
                }
            );
            println!();
            println!("Channels:");
            for (name, configured) in [
                ("CLI", config.channels.cli),
                ("Telegram", config.channels.telegram.is_some()),
                ("Slack", config.channels.slack.is_some()),
            ] {
                println!(
                    "  {name:9} {}",
                    if configured {
                        "✅ configured"
                    } else {
                        "❌ not configured"
                    }
                );
            }
            Ok(())
        }

        Commands::ConfigPath => {
            println!("{}", config.config_path.display());
            Ok(())
        }
    }
}

/// One-shot terminal mode: stream the agent's output and mirror its
/// exit status into ours.
async fn ask(config: &Config, prompt: &str, continue_session: bool) -> Result<()> {
    let runner = AgentRunner::new();
    let invocation = AgentInvocation::query(
        &config.agent,
        &config.workspace_dir,
        prompt,
        continue_session,
    );
    let mut handle = runner.start(invocation);
    while let Some(event) = handle.next_event().await {
        match event {
            OutputEvent::Stdout(line) => println!("{line}"),
            OutputEvent::Stderr(line) => eprintln!("⚠️  {line}"),
        }
    }
    let report = handle.wait().await;
    if report.timed_out {
        bail!("agent timed out after {}s", config.agent.timeout_secs);
    }
    if !report.success {
        bail!("agent exited with code {}", report.exit_code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }
}
