//! Runner layer: everything needed to turn a job into a subprocess.
//!
//! - `settings`: per-room runner settings (tagged per runner)
//! - `command`: pure argv construction
//! - `session_token`: continuation token extraction from runner output
//! - `process`: subprocess execution with timeout and output capture

pub mod command;
pub mod process;
pub mod session_token;
pub mod settings;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

pub use command::CommandBuilder;
pub use process::{Invocation, ProcessError, ProcessOutcome};
pub use session_token::{HeaderStream, PatternExtractor, SessionTokenExtractor, TokenExtractors};
pub use settings::{ClaudeSettings, CodexSettings, GeminiSettings, RoomSettings, RunnerSettings};

/// A supported coding-agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runner {
    Claude,
    Codex,
    Gemini,
}

impl Runner {
    /// All supported runners.
    pub const ALL: [Runner; 3] = [Runner::Claude, Runner::Codex, Runner::Gemini];

    /// Wire / executable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runner {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            other => Err(JobError::UnsupportedRunner(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_runners() {
        for runner in Runner::ALL {
            assert_eq!(runner.as_str().parse::<Runner>().unwrap(), runner);
        }
    }

    #[test]
    fn parse_rejects_unknown_and_case_variants() {
        assert!(matches!(
            "llama".parse::<Runner>(),
            Err(JobError::UnsupportedRunner(name)) if name == "llama"
        ));
        assert!("Claude".parse::<Runner>().is_err());
        assert!("".parse::<Runner>().is_err());
    }

    #[test]
    fn serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Runner::Codex).unwrap(), "\"codex\"");
        let parsed: Runner = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(parsed, Runner::Gemini);
    }
}
