//! Semantic styling constants for terminal output.
//!
//! Uses the anstyle ecosystem:
//! - anstream for auto-detecting color support
//! - anstyle for composable styling
//!
//! ## stdout vs stderr principle
//!
//! - **stdout**: operator-facing status lines (one per target) and the run summary
//! - **stderr**: diagnostics via the `log` facade, plus fatal startup errors

// Re-exports from anstream (auto-detecting output)
pub use anstream::{eprintln, println};
use anstyle::{AnsiColor, Color, Style};

pub const ERROR: Style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red)));

pub const ERROR_EMOJI: &str = "❌";
pub const WARNING_EMOJI: &str = "⚠️";
pub const SUCCESS_EMOJI: &str = "✅";
pub const INFO_EMOJI: &str = "ℹ️";
pub const FINDINGS_EMOJI: &str = "🔑";
pub const TIMEOUT_EMOJI: &str = "⏱️";
pub const SKIP_EMOJI: &str = "⏭️";
