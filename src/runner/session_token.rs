//! Continuation token extraction from runner output.
//!
//! Each runner prints its conversation id in its own way, and none of them
//! promise a stable format. Extraction is best-effort: `None` means "keep
//! whatever token is already stored".

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::Runner;

/// `"session_id": "<id>"` as emitted by JSON output modes.
static JSON_SESSION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""session_id"\s*:\s*"([0-9A-Za-z-]{8,})""#).expect("valid regex")
});

/// `session id: <id>` header lines.
static SESSION_ID_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*session[ _-]?id:\s*([0-9A-Za-z-]{8,})\s*$").expect("valid regex")
});

/// Pulls a continuation token out of a finished run.
pub trait SessionTokenExtractor: Send + Sync {
    fn extract(&self, stdout: &str, stderr: &str) -> Option<String>;
}

/// Which captured stream a runner prints its session header on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStream {
    Stdout,
    Stderr,
}

/// Regex-based extractor. The last match wins; the header stream is searched
/// first and the other one only if it has no match.
pub struct PatternExtractor {
    patterns: Vec<Regex>,
    header: HeaderStream,
}

impl PatternExtractor {
    pub fn new(patterns: Vec<Regex>, header: HeaderStream) -> Self {
        Self { patterns, header }
    }

    /// Default patterns for a runner.
    pub fn for_runner(runner: Runner) -> Self {
        match runner {
            Runner::Claude => Self::new(
                vec![JSON_SESSION_ID.clone(), SESSION_ID_LINE.clone()],
                HeaderStream::Stdout,
            ),
            // stdout is the agent's answer, which may quote a header line.
            Runner::Codex | Runner::Gemini => {
                Self::new(vec![SESSION_ID_LINE.clone()], HeaderStream::Stderr)
            }
        }
    }

    fn last_match(&self, text: &str) -> Option<String> {
        self.patterns
            .iter()
            .flat_map(|re| re.captures_iter(text))
            .filter_map(|caps| caps.get(1).map(|m| (m.start(), m.as_str())))
            .max_by_key(|(start, _)| *start)
            .map(|(_, token)| token.to_string())
    }
}

impl SessionTokenExtractor for PatternExtractor {
    fn extract(&self, stdout: &str, stderr: &str) -> Option<String> {
        let (first, second) = match self.header {
            HeaderStream::Stdout => (stdout, stderr),
            HeaderStream::Stderr => (stderr, stdout),
        };
        self.last_match(first).or_else(|| self.last_match(second))
    }
}

/// Extractor registry, one entry per runner.
#[derive(Clone)]
pub struct TokenExtractors {
    by_runner: HashMap<Runner, Arc<dyn SessionTokenExtractor>>,
}

impl TokenExtractors {
    /// Replace the extractor used for `runner`.
    pub fn set(&mut self, runner: Runner, extractor: Arc<dyn SessionTokenExtractor>) {
        self.by_runner.insert(runner, extractor);
    }

    pub fn extract(&self, runner: Runner, stdout: &str, stderr: &str) -> Option<String> {
        self.by_runner
            .get(&runner)
            .and_then(|extractor| extractor.extract(stdout, stderr))
    }
}

impl Default for TokenExtractors {
    fn default() -> Self {
        let by_runner = Runner::ALL
            .into_iter()
            .map(|runner| {
                let extractor: Arc<dyn SessionTokenExtractor> =
                    Arc::new(PatternExtractor::for_runner(runner));
                (runner, extractor)
            })
            .collect();
        Self { by_runner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codex_header_line() {
        let stderr = "OpenAI Codex v0.63.0\n--------\nworkdir: /tmp/ws\nmodel: gpt-5.1\nsession id: 0199a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b\n--------\n";
        let token = TokenExtractors::default().extract(Runner::Codex, "done", stderr);
        assert_eq!(token.as_deref(), Some("0199a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b"));
    }

    #[test]
    fn claude_json_session_id() {
        let stdout = r#"{"type":"result","result":"hi","session_id": "4f1c2d3e-aaaa-bbbb-cccc-1234567890ab"}"#;
        let token = TokenExtractors::default().extract(Runner::Claude, stdout, "");
        assert_eq!(token.as_deref(), Some("4f1c2d3e-aaaa-bbbb-cccc-1234567890ab"));
    }

    #[test]
    fn last_match_wins() {
        let stdout = "Session ID: first-token-1\nworking...\nsession id: second-token-2\n";
        let token = PatternExtractor::for_runner(Runner::Gemini).extract(stdout, "");
        assert_eq!(token.as_deref(), Some("second-token-2"));
    }

    #[test]
    fn claude_prefers_stdout() {
        let token = PatternExtractor::for_runner(Runner::Claude)
            .extract("session id: from-stdout-1", "session id: from-stderr-2");
        assert_eq!(token.as_deref(), Some("from-stdout-1"));
    }

    #[test]
    fn codex_answer_cannot_override_header() {
        let stdout = "Here is the log you asked about:\nsession id: abcdefgh-1234\n";
        let stderr = "OpenAI Codex v0.63.0\nsession id: 0199a1b2-real-token\n";
        for runner in [Runner::Codex, Runner::Gemini] {
            let token = PatternExtractor::for_runner(runner).extract(stdout, stderr);
            assert_eq!(token.as_deref(), Some("0199a1b2-real-token"));
        }
    }

    #[test]
    fn stdout_is_fallback_without_header() {
        let token = PatternExtractor::for_runner(Runner::Gemini).extract("session id: only-stdout-1", "");
        assert_eq!(token.as_deref(), Some("only-stdout-1"));
    }

    #[test]
    fn no_token_found() {
        let extractors = TokenExtractors::default();
        for runner in Runner::ALL {
            assert!(extractors.extract(runner, "plain answer", "").is_none());
        }
    }

    #[test]
    fn mid_sentence_mentions_are_not_tokens() {
        let stdout = "I stored the session id: abcdefgh-1234 in a file for you.";
        assert!(PatternExtractor::for_runner(Runner::Codex).extract(stdout, "").is_none());
    }

    #[test]
    fn custom_extractor_overrides_default() {
        struct Fixed;
        impl SessionTokenExtractor for Fixed {
            fn extract(&self, _stdout: &str, _stderr: &str) -> Option<String> {
                Some("fixed".into())
            }
        }

        let mut extractors = TokenExtractors::default();
        extractors.set(Runner::Gemini, Arc::new(Fixed));
        assert_eq!(extractors.extract(Runner::Gemini, "", "").as_deref(), Some("fixed"));
        assert!(extractors.extract(Runner::Codex, "", "").is_none());
    }
}
