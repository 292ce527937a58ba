use crate::config::AgentConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit sentinel: the agent executable could not be spawned.
pub const EXIT_LAUNCH_FAILED: i32 = -1;
/// Exit sentinel: the run exceeded its time budget and was killed.
pub const EXIT_TIMED_OUT: i32 = -2;
/// Exit sentinel: killed by shutdown or terminated by a signal.
pub const EXIT_KILLED: i32 = -3;

/// A fully resolved agent command: program, argv, working directory, and
/// time budget. Built once per run so every flag decision lives in one
/// place.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

impl AgentInvocation {
    /// One-shot query in the agent's non-interactive mode.
    ///
    /// Flag order matters to the CLI: the continuation flag comes first,
    /// then permission handling, then `-p <prompt>` last. Tool
    /// restrictions are only sent when permission prompts are live and a
    /// concrete list (not the `*` wildcard) is configured.
    pub fn query(cfg: &AgentConfig, workdir: &Path, prompt: &str, continue_session: bool) -> Self {
        let mut args = Vec::new();
        if continue_session {
            args.push("-c".to_string());
        }
        if cfg.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        } else if !cfg.allowed_tools.is_empty() && cfg.allowed_tools != "*" {
            args.push("--allowedTools".to_string());
            args.push(cfg.allowed_tools.clone());
        }
        args.push("-p".to_string());
        args.push(prompt.to_string());
        Self {
            program: shellexpand::tilde(&cfg.cli_path).into_owned(),
            args,
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    /// `--version` probe with a short fixed budget (status and doctor).
    pub fn version_probe(cfg: &AgentConfig, workdir: &Path) -> Self {
        Self {
            program: shellexpand::tilde(&cfg.cli_path).into_owned(),
            args: vec!["--version".to_string()],
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(skip_permissions: bool, allowed_tools: &str) -> AgentConfig {
        AgentConfig {
            cli_path: "claude".to_string(),
            skip_permissions,
            allowed_tools: allowed_tools.to_string(),
            timeout_secs: 1800,
            coalesce_ms: 1500,
        }
    }

    #[test]
    fn continuation_flag_comes_first() {
        let inv = AgentInvocation::query(&cfg(true, "*"), Path::new("/tmp"), "hi", true);
        assert_eq!(inv.args, vec!["-c", "--dangerously-skip-permissions", "-p", "hi"]);
    }

    #[test]
    fn fresh_session_omits_continuation() {
        let inv = AgentInvocation::query(&cfg(true, "*"), Path::new("/tmp"), "hi", false);
        assert_eq!(inv.args, vec!["--dangerously-skip-permissions", "-p", "hi"]);
    }

    #[test]
    fn tool_list_sent_only_when_permissions_are_live() {
        let inv = AgentInvocation::query(&cfg(false, "Read,Edit"), Path::new("/tmp"), "q", false);
        assert_eq!(inv.args, vec!["--allowedTools", "Read,Edit", "-p", "q"]);
    }

    #[test]
    fn wildcard_tool_list_sends_no_restriction() {
        let inv = AgentInvocation::query(&cfg(false, "*"), Path::new("/tmp"), "q", false);
        assert_eq!(inv.args, vec!["-p", "q"]);
        let inv = AgentInvocation::query(&cfg(false, ""), Path::new("/tmp"), "q", false);
        assert_eq!(inv.args, vec!["-p", "q"]);
    }

    #[test]
    fn skip_permissions_wins_over_tool_list() {
        let inv = AgentInvocation::query(&cfg(true, "Read"), Path::new("/tmp"), "q", false);
        assert_eq!(inv.args, vec!["--dangerously-skip-permissions", "-p", "q"]);
    }

    #[test]
    fn version_probe_has_a_short_budget() {
        let inv = AgentInvocation::version_probe(&cfg(true, "*"), Path::new("/work"));
        assert_eq!(inv.args, vec!["--version"]);
        assert_eq!(inv.timeout, Duration::from_secs(5));
        assert_eq!(inv.workdir, PathBuf::from("/work"));
    }

    #[test]
    fn home_prefix_is_expanded() {
        let mut config = cfg(true, "*");
        config.cli_path = "~/bin/claude".to_string();
        let inv = AgentInvocation::query(&config, Path::new("/tmp"), "q", false);
        assert!(!inv.program.starts_with('~'));
        assert!(inv.program.ends_with("/bin/claude"));
    }
}
