//! Terminal escape stripping for agent output.
//!
//! CLI coding agents decorate their output with ANSI color and cursor
//! sequences. None of that survives the trip to a chat platform, so every
//! line is sanitized before it reaches a channel.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Two-character escapes (`ESC @` through `ESC _`) plus full CSI sequences
/// (`ESC [`, parameter bytes, intermediate bytes, one final byte).
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI escape pattern is valid")
});

/// Remove terminal escape sequences from `input`.
///
/// Returns the input borrowed when it contains no escapes, so the common
/// clean-line case allocates nothing. Applying it to already-sanitized
/// text is a no-op, and non-escape content (including multi-byte
/// characters) passes through untouched.
pub fn strip_ansi(input: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(input, "")
}
