use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::new(),
            config_path: PathBuf::new(),
            agent: AgentConfig::default(),
            limits: LimitsConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

// ── Agent CLI ─────────────────────────────────────────────────────

/// How the local coding-agent CLI is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent executable; a bare name resolved via PATH, or an absolute
    /// or `~`-prefixed path.
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    /// Pass `--dangerously-skip-permissions` so the agent never stops to
    /// ask. Turn off to send a tool allow-list instead.
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// Comma-separated tool list for `--allowedTools` when
    /// `skip_permissions` is off. `"*"` (or empty) sends no restriction.
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: String,
    /// Wall-clock budget per run, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Quiet window for coalescing streamed output, in milliseconds.
    /// `0` disables coalescing and live progress edits.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            skip_permissions: default_true(),
            allowed_tools: default_allowed_tools(),
            timeout_secs: default_timeout_secs(),
            coalesce_ms: default_coalesce_ms(),
        }
    }
}

fn default_cli_path() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

fn default_allowed_tools() -> String {
    "*".to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_coalesce_ms() -> u64 {
    1500
}

// ── Abuse limits ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Longest accepted prompt, in characters.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    /// Accepted requests per sender per window.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: usize,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_input_chars: default_max_input_chars(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

fn default_max_input_chars() -> usize {
    10_000
}

fn default_rate_limit_requests() -> usize {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

// ── Channels ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Interactive terminal channel.
    #[serde(default = "default_true")]
    pub cli: bool,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            cli: true,
            telegram: None,
            slack: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Telegram user ids (or `"*"`) permitted to talk to the agent.
    /// Empty means everyone, with a startup warning.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Channel to poll for messages. Unset polls nothing but still
    /// allows outbound delivery.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Slack user ids (or `"*"`) permitted to talk to the agent.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

// ── Load / save ───────────────────────────────────────────────────

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let clawdio_dir = home.join(".clawdio");
        let config_path = clawdio_dir.join("config.toml");

        if !clawdio_dir.exists() {
            fs::create_dir_all(&clawdio_dir).context("Failed to create .clawdio directory")?;
        }
        fs::create_dir_all(clawdio_dir.join("workspace"))
            .context("Failed to create workspace directory")?;

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path.clone();
            config.workspace_dir = clawdio_dir.join("workspace");
            config.apply_env_overrides();
            Ok(config)
        } else {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.workspace_dir = clawdio_dir.join("workspace");
            config.save()?;
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Workspace directory: CLAWDIO_WORKSPACE
        if let Ok(workspace) = std::env::var("CLAWDIO_WORKSPACE") {
            if !workspace.is_empty() {
                self.workspace_dir = PathBuf::from(shellexpand::tilde(&workspace).into_owned());
            }
        }

        // Agent executable: CLAWDIO_CLI_PATH
        if let Ok(cli_path) = std::env::var("CLAWDIO_CLI_PATH") {
            if !cli_path.is_empty() {
                self.agent.cli_path = cli_path;
            }
        }

        // Run budget: CLAWDIO_TIMEOUT_SECS
        if let Ok(timeout_str) = std::env::var("CLAWDIO_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout_str.parse::<u64>() {
                if timeout > 0 {
                    self.agent.timeout_secs = timeout;
                }
            }
        }

        // Bot tokens: CLAWDIO_TELEGRAM_TOKEN / CLAWDIO_SLACK_TOKEN.
        // A token alone is enough to enable the channel.
        if let Ok(token) = std::env::var("CLAWDIO_TELEGRAM_TOKEN") {
            if !token.is_empty() {
                self.channels
                    .telegram
                    .get_or_insert_with(TelegramConfig::default)
                    .bot_token = token;
            }
        }
        if let Ok(token) = std::env::var("CLAWDIO_SLACK_TOKEN") {
            if !token.is_empty() {
                self.channels
                    .slack
                    .get_or_insert_with(SlackConfig::default)
                    .bot_token = token;
            }
        }
    }

    /// Allow-list for one channel. Channels without a configured list
    /// (including the local CLI) return an empty slice.
    pub fn allowed_users_for(&self, channel: &str) -> &[String] {
        match channel {
            "telegram" => self
                .channels
                .telegram
                .as_ref()
                .map_or(&[], |c| c.allowed_users.as_slice()),
            "slack" => self
                .channels
                .slack
                .as_ref()
                .map_or(&[], |c| c.allowed_users.as_slice()),
            _ => &[],
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let backup_path = parent_dir.join(format!("{file_name}.bak"));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path).with_context(|| {
                format!(
                    "Failed to create config backup before atomic replace: {}",
                    backup_path.display()
                )
            })?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            if had_existing_config && backup_path.exists() {
                let _ = fs::copy(&backup_path, &self.config_path);
            }
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)?;

        if had_existing_config {
            let _ = fs::remove_file(&backup_path);
        }

        Ok(())
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex, MutexGuard};
    use tempfile::TempDir;

    // Env mutation is process-global; serialize the tests that touch it.
    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sets a variable for the duration of a scope, restoring the prior
    /// value on drop.
    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = std::env::var(key).ok();
            // SAFETY: all env-mutating tests hold ENV_LOCK, so no other
            // thread is reading or writing the environment concurrently.
            unsafe { std::env::set_var(key, value) };
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            // SAFETY: same serialization argument as in `set`.
            unsafe {
                match self.previous.take() {
                    Some(value) => std::env::set_var(self.key, value),
                    None => std::env::remove_var(self.key),
                }
            }
        }
    }

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.agent.cli_path, "claude");
        assert!(c.agent.skip_permissions);
        assert_eq!(c.agent.allowed_tools, "*");
        assert_eq!(c.agent.timeout_secs, 1800);
        assert_eq!(c.agent.coalesce_ms, 1500);
        assert_eq!(c.limits.max_input_chars, 10_000);
        assert_eq!(c.limits.rate_limit_requests, 10);
        assert_eq!(c.limits.rate_limit_window_secs, 60);
        assert!(c.channels.cli);
        assert!(c.channels.telegram.is_none());
        assert!(c.channels.slack.is_none());
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.agent.cli_path, "claude");
        assert_eq!(c.limits.rate_limit_requests, 10);
        assert!(c.channels.cli);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let c: Config = toml::from_str(
            r#"
            [agent]
            cli_path = "/usr/local/bin/claude"
            timeout_secs = 120

            [channels.telegram]
            bot_token = "tok"
            allowed_users = ["42"]
            "#,
        )
        .unwrap();
        assert_eq!(c.agent.cli_path, "/usr/local/bin/claude");
        assert_eq!(c.agent.timeout_secs, 120);
        // Untouched fields keep their defaults.
        assert!(c.agent.skip_permissions);
        assert_eq!(c.limits.max_input_chars, 10_000);
        let telegram = c.channels.telegram.unwrap();
        assert_eq!(telegram.bot_token, "tok");
        assert_eq!(telegram.allowed_users, vec!["42"]);
    }

    // ── Allow-lists ──────────────────────────────────────────

    #[test]
    fn allowed_users_for_unconfigured_channel_is_empty() {
        let c = Config::default();
        assert!(c.allowed_users_for("telegram").is_empty());
        assert!(c.allowed_users_for("slack").is_empty());
        assert!(c.allowed_users_for("cli").is_empty());
    }

    #[test]
    fn allowed_users_for_reads_the_right_channel() {
        let mut c = Config::default();
        c.channels.telegram = Some(TelegramConfig {
            bot_token: "t".into(),
            allowed_users: vec!["1".into(), "2".into()],
        });
        c.channels.slack = Some(SlackConfig {
            bot_token: "s".into(),
            channel_id: None,
            allowed_users: vec!["U1".into()],
        });
        assert_eq!(c.allowed_users_for("telegram"), ["1", "2"]);
        assert_eq!(c.allowed_users_for("slack"), ["U1"]);
    }

    // ── Env overrides ────────────────────────────────────────

    #[test]
    fn env_overrides_workspace_and_cli_path() {
        let _lock = env_lock();
        let _workspace = EnvGuard::set("CLAWDIO_WORKSPACE", "/tmp/clawdio-test-ws");
        let _cli = EnvGuard::set("CLAWDIO_CLI_PATH", "/opt/agent");
        let mut c = Config::default();
        c.apply_env_overrides();
        assert_eq!(c.workspace_dir, PathBuf::from("/tmp/clawdio-test-ws"));
        assert_eq!(c.agent.cli_path, "/opt/agent");
    }

    #[test]
    fn env_timeout_must_be_a_positive_integer() {
        let _lock = env_lock();
        {
            let _guard = EnvGuard::set("CLAWDIO_TIMEOUT_SECS", "90");
            let mut c = Config::default();
            c.apply_env_overrides();
            assert_eq!(c.agent.timeout_secs, 90);
        }
        {
            let _guard = EnvGuard::set("CLAWDIO_TIMEOUT_SECS", "0");
            let mut c = Config::default();
            c.apply_env_overrides();
            assert_eq!(c.agent.timeout_secs, 1800);
        }
        {
            let _guard = EnvGuard::set("CLAWDIO_TIMEOUT_SECS", "soon");
            let mut c = Config::default();
            c.apply_env_overrides();
            assert_eq!(c.agent.timeout_secs, 1800);
        }
    }

    #[test]
    fn env_token_enables_a_channel() {
        let _lock = env_lock();
        let _guard = EnvGuard::set("CLAWDIO_TELEGRAM_TOKEN", "tg-token");
        let mut c = Config::default();
        assert!(c.channels.telegram.is_none());
        c.apply_env_overrides();
        assert_eq!(c.channels.telegram.unwrap().bot_token, "tg-token");
    }

    #[test]
    fn env_token_overrides_configured_token_but_keeps_allow_list() {
        let _lock = env_lock();
        let _guard = EnvGuard::set("CLAWDIO_SLACK_TOKEN", "xoxb-new");
        let mut c = Config::default();
        c.channels.slack = Some(SlackConfig {
            bot_token: "xoxb-old".into(),
            channel_id: Some("C1".into()),
            allowed_users: vec!["U1".into()],
        });
        c.apply_env_overrides();
        let slack = c.channels.slack.unwrap();
        assert_eq!(slack.bot_token, "xoxb-new");
        assert_eq!(slack.channel_id.as_deref(), Some("C1"));
        assert_eq!(slack.allowed_users, vec!["U1"]);
    }

    // ── Save / reload ────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut c = Config::default();
        c.config_path = dir.path().join("config.toml");
        c.workspace_dir = dir.path().join("workspace");
        c.agent.timeout_secs = 77;
        c.channels.telegram = Some(TelegramConfig {
            bot_token: "tok".into(),
            allowed_users: vec!["9".into()],
        });
        c.save().unwrap();

        let contents = fs::read_to_string(&c.config_path).unwrap();
        let reloaded: Config = toml::from_str(&contents).unwrap();
        assert_eq!(reloaded.agent.timeout_secs, 77);
        assert_eq!(reloaded.channels.telegram.unwrap().bot_token, "tok");
        // Computed paths are not serialized.
        assert!(!contents.contains("config_path"));
        assert!(!contents.contains("workspace_dir"));
    }

    #[test]
    fn save_replaces_existing_file_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut c = Config::default();
        c.config_path = dir.path().join("config.toml");
        c.save().unwrap();
        c.agent.cli_path = "second".into();
        c.save().unwrap();

        let contents = fs::read_to_string(&c.config_path).unwrap();
        assert!(contents.contains("second"));
        // No temp or backup files left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "config.toml")
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    }
}
