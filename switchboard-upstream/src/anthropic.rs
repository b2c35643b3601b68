//! Anthropic-dialect preprocessing and stream parsing.

use serde_json::Value;

use crate::dialect::{RequestFacts, ScanOutcome, TokenUsage};
use crate::error::UpstreamError;

/// Default `anthropic-version` header sent when the provider config does
/// not pin one.
pub const DEFAULT_VERSION: &str = "2023-06-01";

/// Inspect an Anthropic-style messages body. No rewriting happens here;
/// Anthropic streams always carry usage in `message_delta` events.
///
/// Anthropic conflates tool use and structured output for routing, so
/// `wants_structured_output` mirrors `wants_tool_call`.
pub fn inspect(body: &[u8]) -> Result<RequestFacts, UpstreamError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::bad_request(format!("invalid JSON body: {e}")))?;
    if !value.is_object() {
        return Err(UpstreamError::bad_request("request body must be a JSON object"));
    }

    let model = value
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if model.is_empty() {
        return Err(UpstreamError::bad_request("model is required"));
    }

    let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let wants_tool_call = value
        .get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| !tools.is_empty());
    let wants_image = user_content_has_part(&value, "image");

    Ok(RequestFacts {
        model,
        stream,
        wants_tool_call,
        wants_structured_output: wants_tool_call,
        wants_image,
        body: body.to_vec(),
    })
}

fn user_content_has_part(body: &Value, part_type: &str) -> bool {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return false;
    };
    messages.iter().any(|message| {
        message.get("role").and_then(Value::as_str) == Some("user")
            && message
                .get("content")
                .and_then(Value::as_array)
                .is_some_and(|parts| {
                    parts
                        .iter()
                        .any(|part| part.get("type").and_then(Value::as_str) == Some(part_type))
                })
    })
}

/// Incremental parser for Anthropic `event:`/`data:` SSE streams.
///
/// The event name arrives on its own line and applies to the following
/// `data:` frame. `message_start` carries the input-side usage (including
/// the cache token fields), `message_delta` carries cumulative output
/// usage. Total tokens are input + output.
#[derive(Debug, Default)]
pub struct StreamParser {
    current_event: Option<String>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    cache_creation_tokens: Option<u32>,
    cache_read_tokens: Option<u32>,
    error: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one SSE line. Returns whether the line was a parseable frame.
    pub fn feed_line(&mut self, line: &str) -> bool {
        if let Some(name) = line.strip_prefix("event:") {
            self.current_event = Some(name.trim().to_string());
            return true;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return false;
        };
        let data = data.trim();
        if data.is_empty() {
            return false;
        }

        let frame: Value = match serde_json::from_str(data) {
            Ok(frame) => frame,
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(format!("unparseable stream frame: {e}"));
                }
                return false;
            }
        };

        match self.current_event.as_deref() {
            Some("message_start") => {
                if let Some(usage) = frame.pointer("/message/usage") {
                    self.absorb_usage(usage);
                }
            }
            Some("message_delta") => {
                if let Some(usage) = frame.get("usage") {
                    self.absorb_usage(usage);
                }
            }
            Some("error") => self.record_error(&frame),
            _ => {
                if frame.get("type").and_then(Value::as_str) == Some("error") {
                    self.record_error(&frame);
                }
            }
        }
        true
    }

    fn absorb_usage(&mut self, usage: &Value) {
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(|n| n as u32);
        if let Some(input) = field("input_tokens") {
            self.input_tokens = Some(input);
        }
        if let Some(output) = field("output_tokens") {
            self.output_tokens = Some(output);
        }
        if let Some(creation) = field("cache_creation_input_tokens") {
            self.cache_creation_tokens = Some(creation);
        }
        if let Some(read) = field("cache_read_input_tokens") {
            self.cache_read_tokens = Some(read);
        }
    }

    fn record_error(&mut self, frame: &Value) {
        if self.error.is_some() {
            return;
        }
        let message = frame
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| frame.to_string());
        self.error = Some(message);
    }

    pub fn into_outcome(self) -> ScanOutcome {
        let usage = if self.input_tokens.is_some() || self.output_tokens.is_some() {
            let input = self.input_tokens.unwrap_or(0);
            let output = self.output_tokens.unwrap_or(0);
            Some(TokenUsage {
                prompt_tokens: input,
                completion_tokens: output,
                total_tokens: input + output,
                cache_creation_tokens: self.cache_creation_tokens,
                cache_read_tokens: self.cache_read_tokens,
            })
        } else {
            None
        };
        ScanOutcome {
            usage,
            error: self.error,
        }
    }
}

/// Read the top-level `usage` object of a non-streamed messages response.
pub fn parse_body_usage(body: &[u8]) -> Result<TokenUsage, UpstreamError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| UpstreamError::TelemetryParse {
        message: format!("invalid response body: {e}"),
    })?;
    let usage = value
        .get("usage")
        .filter(|u| !u.is_null())
        .ok_or_else(|| UpstreamError::TelemetryParse {
            message: "response carries no usage object".to_string(),
        })?;
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(|n| n as u32);
    let input = field("input_tokens").unwrap_or(0);
    let output = field("output_tokens").unwrap_or(0);
    Ok(TokenUsage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
        cache_creation_tokens: field("cache_creation_input_tokens"),
        cache_read_tokens: field("cache_read_input_tokens"),
    })
}
