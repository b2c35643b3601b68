//! Dialect tags and the dialect-neutral request/response facts.
//!
//! A dialect is the upstream wire protocol family a provider speaks. It
//! determines how inbound bodies are inspected, which path and headers the
//! upstream call uses, and how the response stream is parsed for usage.

use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::sse::LineBuffer;
use crate::{anthropic, openai};

/// Upstream wire protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

impl Dialect {
    /// The tag stored in provider records and emitted into chat logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
        }
    }

    /// Parse a provider `type` tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "openai" => Some(Dialect::OpenAi),
            "anthropic" => Some(Dialect::Anthropic),
            _ => None,
        }
    }

    /// Path of the chat endpoint relative to a provider's base URL.
    pub fn chat_path(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "/chat/completions",
            Dialect::Anthropic => "/messages",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the router needs to know about an inbound request body.
///
/// Produced by [`inspect`]; the body is carried along as bytes (possibly
/// rewritten by the preprocessor) so the gateway never re-serializes the
/// caller's JSON more than necessary.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    /// Logical model name requested by the caller.
    pub model: String,
    /// Whether the caller asked for a streamed response.
    pub stream: bool,
    /// The request carries a non-empty `tools` array.
    pub wants_tool_call: bool,
    /// The request asks for structured output.
    pub wants_structured_output: bool,
    /// Some user message carries an image content part.
    pub wants_image: bool,
    /// The (possibly rewritten) request body.
    pub body: Vec<u8>,
}

/// Inspect a raw request body in the given dialect.
pub fn inspect(dialect: Dialect, body: &[u8]) -> Result<RequestFacts, UpstreamError> {
    match dialect {
        Dialect::OpenAi => openai::inspect(body),
        Dialect::Anthropic => anthropic::inspect(body),
    }
}

/// Overwrite the body's top-level `model` field with the upstream model
/// name. All other fields pass through untouched.
pub fn rewrite_model(body: &[u8], upstream_model: &str) -> Result<Vec<u8>, UpstreamError> {
    let mut value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::bad_request(format!("invalid JSON body: {e}")))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| UpstreamError::bad_request("request body must be a JSON object"))?;
    object.insert(
        "model".to_string(),
        serde_json::Value::String(upstream_model.to_string()),
    );
    serde_json::to_vec(&value).map_err(|e| UpstreamError::bad_request(e.to_string()))
}

/// Token usage extracted from an upstream response.
///
/// The cache fields are Anthropic-specific and carried through to the chat
/// log even though they do not participate in TPS math.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cache_creation_tokens: Option<u32>,
    pub cache_read_tokens: Option<u32>,
}

/// Result of scanning one response stream.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Usage reported by the upstream, if any frame carried it.
    pub usage: Option<TokenUsage>,
    /// First hard error observed while parsing, if any.
    pub error: Option<String>,
}

enum UsageParser {
    OpenAi(openai::StreamParser),
    Anthropic(anthropic::StreamParser),
}

/// Incremental usage scanner over a teed copy of an upstream stream.
///
/// Feed it raw bytes as they arrive; it splits them into SSE lines and
/// hands each line to the dialect's parser. `frames()` counts parseable
/// frames so the caller can stamp first-chunk time.
pub struct StreamScanner {
    lines: LineBuffer,
    parser: UsageParser,
    frames: u64,
}

impl StreamScanner {
    pub fn new(dialect: Dialect) -> Self {
        let parser = match dialect {
            Dialect::OpenAi => UsageParser::OpenAi(openai::StreamParser::new()),
            Dialect::Anthropic => UsageParser::Anthropic(anthropic::StreamParser::new()),
        };
        Self {
            lines: LineBuffer::new(),
            parser,
            frames: 0,
        }
    }

    /// Feed a chunk of raw stream bytes.
    ///
    /// Fails only on frame-size overflow; JSON-level problems are recorded
    /// in the outcome instead so partial metrics survive.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), UpstreamError> {
        for line in self.lines.push(chunk)? {
            if self.feed_line(&line) {
                self.frames += 1;
            }
        }
        Ok(())
    }

    /// Number of parseable frames seen so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Flush any unterminated trailing line and return the scan outcome.
    pub fn finish(mut self) -> ScanOutcome {
        if let Some(tail) = self.lines.take_tail() {
            if self.feed_line(&tail) {
                self.frames += 1;
            }
        }
        match self.parser {
            UsageParser::OpenAi(p) => p.into_outcome(),
            UsageParser::Anthropic(p) => p.into_outcome(),
        }
    }

    fn feed_line(&mut self, line: &str) -> bool {
        match &mut self.parser {
            UsageParser::OpenAi(p) => p.feed_line(line),
            UsageParser::Anthropic(p) => p.feed_line(line),
        }
    }
}

/// Parse the usage object out of a complete (non-streamed) response body.
pub fn parse_body_usage(dialect: Dialect, body: &[u8]) -> Result<TokenUsage, UpstreamError> {
    match dialect {
        Dialect::OpenAi => openai::parse_body_usage(body),
        Dialect::Anthropic => anthropic::parse_body_usage(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_tags_round_trip() {
        for dialect in [Dialect::OpenAi, Dialect::Anthropic] {
            assert_eq!(Dialect::parse(dialect.as_str()), Some(dialect));
        }
        assert_eq!(Dialect::parse("gemini"), None);
    }

    #[test]
    fn rewrite_model_replaces_only_the_model_field() {
        let body = br#"{"model":"gpt-x","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
        let rewritten = rewrite_model(body, "gpt-4o-mini").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["stream"], true);
        assert_eq!(value["messages"][0]["content"], "hi");
    }

    #[test]
    fn rewrite_model_rejects_non_objects() {
        assert!(rewrite_model(b"[1,2,3]", "m").is_err());
        assert!(rewrite_model(b"not json", "m").is_err());
    }
}
