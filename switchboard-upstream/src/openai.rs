//! OpenAI-dialect preprocessing and stream parsing.

use serde_json::{json, Value};

use crate::dialect::{RequestFacts, ScanOutcome, TokenUsage};
use crate::error::UpstreamError;

/// Inspect an OpenAI-style chat completion body.
///
/// Streamed requests are rewritten to force
/// `stream_options.include_usage = true`, so the upstream emits a final
/// usage chunk the telemetry consumer can read. Everything else passes
/// through byte-for-meaning.
pub fn inspect(body: &[u8]) -> Result<RequestFacts, UpstreamError> {
    let mut value: Value = serde_json::from_slice(body)
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
    let wants_structured_output = value
        .get("response_format")
        .is_some_and(|format| !format.is_null());
    let wants_image = user_content_has_part(&value, "image_url");

    let body = if stream {
        if let Some(object) = value.as_object_mut() {
            let options = object.entry("stream_options").or_insert_with(|| json!({}));
            match options.as_object_mut() {
                Some(options) => {
                    options.insert("include_usage".to_string(), Value::Bool(true));
                }
                None => {
                    *options = json!({"include_usage": true});
                }
            }
        }
        serde_json::to_vec(&value)
            .map_err(|e| UpstreamError::bad_request(e.to_string()))?
    } else {
        body.to_vec()
    };

    Ok(RequestFacts {
        model,
        stream,
        wants_tool_call,
        wants_structured_output,
        wants_image,
        body,
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

fn read_usage(usage: &Value) -> TokenUsage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0) as u32;
    TokenUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
        cache_creation_tokens: None,
        cache_read_tokens: None,
    }
}

/// Incremental parser for `data: `-framed OpenAI chat completion streams.
///
/// The stream terminates on the literal `[DONE]` chunk; the last JSON chunk
/// before it carries `usage` when `include_usage` was requested. A chunk
/// whose top level has an `error` field is a hard error.
#[derive(Debug, Default)]
pub struct StreamParser {
    usage: Option<TokenUsage>,
    error: Option<String>,
    done: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one SSE line. Returns whether the line was a parseable frame.
    pub fn feed_line(&mut self, line: &str) -> bool {
        let Some(data) = line.strip_prefix("data:") else {
            return false;
        };
        let data = data.trim();
        if data.is_empty() || self.done {
            return false;
        }
        if data == "[DONE]" {
            self.done = true;
            return true;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(chunk) => {
                if let Some(error) = chunk.get("error").filter(|e| !e.is_null()) {
                    if self.error.is_none() {
                        self.error = Some(error_text(error));
                    }
                }
                if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
                    self.usage = Some(read_usage(usage));
                }
                true
            }
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(format!("unparseable stream chunk: {e}"));
                }
                false
            }
        }
    }

    pub fn into_outcome(self) -> ScanOutcome {
        ScanOutcome {
            usage: self.usage,
            error: self.error,
        }
    }
}

fn error_text(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

/// Read the top-level `usage` object of a non-streamed response body.
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
    Ok(read_usage(usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_extracts_request_facts() {
        let body = br#"{
            "model": "m1",
            "stream": false,
            "tools": [{"type": "function", "function": {"name": "f"}}],
            "response_format": {"type": "json_object"},
            "messages": [{"role": "user", "content": "hi"}]
        }"#;
        let facts = inspect(body).unwrap();
        assert_eq!(facts.model, "m1");
        assert!(!facts.stream);
        assert!(facts.wants_tool_call);
        assert!(facts.wants_structured_output);
        assert!(!facts.wants_image);
        assert_eq!(facts.body, body.to_vec());
    }

    #[test]
    fn inspect_rejects_missing_model() {
        assert!(inspect(br#"{"messages":[]}"#).is_err());
        assert!(inspect(br#"{"model":"","messages":[]}"#).is_err());
    }

    #[test]
    fn inspect_ignores_empty_tools() {
        let facts = inspect(br#"{"model":"m1","tools":[],"messages":[]}"#).unwrap();
        assert!(!facts.wants_tool_call);
    }

    #[test]
    fn inspect_detects_image_parts_in_user_messages() {
        let body = br#"{
            "model": "m1",
            "messages": [
                {"role": "assistant", "content": [{"type": "image_url", "image_url": {"url": "u"}}]},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:..."}}
                ]}
            ]
        }"#;
        assert!(inspect(body).unwrap().wants_image);

        let text_only = br#"{"model":"m1","messages":[{"role":"user","content":"plain"}]}"#;
        assert!(!inspect(text_only).unwrap().wants_image);
    }

    #[test]
    fn streaming_bodies_get_include_usage_injected() {
        let body = br#"{"model":"m1","stream":true,"temperature":0.5,"messages":[]}"#;
        let facts = inspect(body).unwrap();
        assert!(facts.stream);
        let value: Value = serde_json::from_slice(&facts.body).unwrap();
        assert_eq!(value["stream_options"]["include_usage"], true);
        assert_eq!(value["temperature"], 0.5);
        assert_eq!(value["model"], "m1");
    }

    #[test]
    fn include_usage_injection_keeps_existing_stream_options() {
        let body = br#"{"model":"m1","stream":true,"stream_options":{"include_usage":false,"other":1}}"#;
        let facts = inspect(body).unwrap();
        let value: Value = serde_json::from_slice(&facts.body).unwrap();
        assert_eq!(value["stream_options"]["include_usage"], true);
        assert_eq!(value["stream_options"]["other"], 1);
    }

    #[test]
    fn stream_parser_reads_usage_from_final_chunk() {
        let mut parser = StreamParser::new();
        assert!(parser.feed_line(r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#));
        assert!(parser.feed_line(r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#));
        assert!(parser.feed_line(
            r#"data: {"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":5,"total_tokens":12}}"#
        ));
        assert!(parser.feed_line("data: [DONE]"));

        let outcome = parser.into_outcome();
        let usage = outcome.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 12);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn stream_parser_records_mid_stream_errors() {
        let mut parser = StreamParser::new();
        parser.feed_line(r#"data: {"error":{"message":"server exploded"}}"#);
        let outcome = parser.into_outcome();
        assert_eq!(outcome.error.as_deref(), Some("server exploded"));
    }

    #[test]
    fn stream_parser_ignores_non_data_lines() {
        let mut parser = StreamParser::new();
        assert!(!parser.feed_line(": keep-alive"));
        assert!(!parser.feed_line(""));
    }

    #[test]
    fn parse_body_usage_reads_top_level_usage() {
        let body = br#"{"id":"x","usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        let usage = parse_body_usage(body).unwrap();
        assert_eq!(usage.total_tokens, 7);
        assert!(parse_body_usage(br#"{"id":"x"}"#).is_err());
    }
}
