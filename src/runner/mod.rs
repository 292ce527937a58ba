//! Agent subprocess supervision.
//!
//! [`AgentRunner`] spawns the local coding-agent CLI, drains both pipes
//! concurrently into sanitized line events, enforces the run time budget,
//! and tracks every live child so shutdown can kill stragglers.

mod invocation;
mod process;

pub use invocation::{AgentInvocation, EXIT_KILLED, EXIT_LAUNCH_FAILED, EXIT_TIMED_OUT};
pub use process::{AgentRunner, OutputEvent, RunHandle, RunReport};
