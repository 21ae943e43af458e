//! Anthropic-style messages wire format.

use serde::{Deserialize, Serialize};

use super::sse::SseEvent;
use super::{ClientError, Completion, RequestOptions, StreamStep};

pub const API_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory for this API.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    pub messages: Vec<Message<'a>>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thinking {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub budget_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: MessageStart },
    ContentBlockDelta { delta: BlockDelta },
    MessageDelta { usage: Option<Usage> },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

pub fn encode(
    model: &str,
    prompt: &str,
    stream: bool,
    options: &RequestOptions,
) -> Result<Vec<u8>, serde_json::Error> {
    let thinking = options.thinking.then_some(Thinking {
        kind: "enabled",
        budget_tokens: options.thinking_budget,
    });
    let mut max_tokens = options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    // The thinking budget must stay below max_tokens
    if let Some(thinking) = &thinking
        && max_tokens <= thinking.budget_tokens
    {
        max_tokens = thinking.budget_tokens.saturating_add(DEFAULT_MAX_TOKENS);
    }

    let request = MessagesRequest {
        model,
        max_tokens,
        messages: vec![Message {
            role: "user",
            content: prompt,
        }],
        stream,
        thinking,
    };
    serde_json::to_vec(&request)
}

fn apply_usage(usage: &Usage, completion: &mut Completion) {
    if let Some(input) = usage.input_tokens {
        completion.prompt_tokens = Some(input);
    }
    if let Some(output) = usage.output_tokens {
        completion.output_tokens = Some(output);
    }
}

pub fn decode_event(event: &SseEvent, completion: &mut Completion) -> Result<StreamStep, ClientError> {
    let data = event.data.trim();
    if data.is_empty() {
        return Ok(StreamStep::Continue);
    }

    let parsed: StreamEvent = serde_json::from_str(data)
        .map_err(|e| ClientError::Parse(format!("invalid stream event: {}", e)))?;

    match parsed {
        StreamEvent::MessageStart { message } => {
            if let Some(usage) = &message.usage {
                apply_usage(usage, completion);
            }
            Ok(StreamStep::Continue)
        }
        StreamEvent::ContentBlockDelta { delta } => match delta {
            BlockDelta::TextDelta { text } if !text.is_empty() => {
                completion.text.push_str(&text);
                Ok(StreamStep::Content)
            }
            BlockDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                completion.thinking.push_str(&thinking);
                Ok(StreamStep::Content)
            }
            _ => Ok(StreamStep::Continue),
        },
        StreamEvent::MessageDelta { usage } => {
            if let Some(usage) = &usage {
                apply_usage(usage, completion);
            }
            Ok(StreamStep::Continue)
        }
        StreamEvent::MessageStop => Ok(StreamStep::Done),
        StreamEvent::Error { error } => Err(ClientError::Api(format!(
            "{}: {}",
            error.kind, error.message
        ))),
        StreamEvent::Other => Ok(StreamStep::Continue),
    }
}

pub fn decode_body(body: &[u8], completion: &mut Completion) -> Result<(), ClientError> {
    let response: MessagesResponse = serde_json::from_slice(body)
        .map_err(|e| ClientError::Parse(format!("invalid message body: {}", e)))?;

    if let Some(usage) = &response.usage {
        apply_usage(usage, completion);
    }
    for block in response.content {
        match block {
            ContentBlock::Text { text } => completion.text.push_str(&text),
            ContentBlock::Thinking { thinking } => completion.thinking.push_str(&thinking),
            ContentBlock::Other => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            event: Some(name.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_encode_with_thinking() {
        let options = RequestOptions {
            max_tokens: Some(1024),
            thinking: true,
            thinking_budget: 2048,
        };
        let body = encode("claude-sonnet-4", "Why?", true, &options).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["thinking"]["type"], "enabled");
        assert_eq!(json["thinking"]["budget_tokens"], 2048);
        assert!(json["max_tokens"].as_u64().unwrap() > 2048);
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_encode_defaults_max_tokens() {
        let body = encode("claude", "Hi", false, &RequestOptions::default()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["max_tokens"], DEFAULT_MAX_TOKENS);
        assert!(json.get("thinking").is_none());
    }

    #[test]
    fn test_encode_huge_thinking_budget_saturates() {
        let options = RequestOptions {
            max_tokens: None,
            thinking: true,
            thinking_budget: u32::MAX - 1,
        };
        let body = encode("claude", "Hi", false, &options).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["max_tokens"], u32::MAX);
        assert_eq!(json["thinking"]["budget_tokens"], u32::MAX - 1);
    }

    #[test]
    fn test_decode_stream() {
        let mut completion = Completion::default();
        let events = [
            event(
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":25,"output_tokens":1}}}"#,
            ),
            event(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            ),
            event(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Hmm."}}"#,
            ),
            event(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"abc"}}"#,
            ),
            event("ping", r#"{"type":"ping"}"#),
            event(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hello"}}"#,
            ),
            event(
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":15}}"#,
            ),
        ];
        let steps: Vec<StreamStep> = events
            .iter()
            .map(|e| decode_event(e, &mut completion).unwrap())
            .collect();
        assert_eq!(
            steps,
            vec![
                StreamStep::Continue,
                StreamStep::Continue,
                StreamStep::Content,
                StreamStep::Continue,
                StreamStep::Continue,
                StreamStep::Content,
                StreamStep::Continue,
            ]
        );
        let stop = event("message_stop", r#"{"type":"message_stop"}"#);
        assert_eq!(
            decode_event(&stop, &mut completion).unwrap(),
            StreamStep::Done
        );

        assert_eq!(completion.text, "Hello");
        assert_eq!(completion.thinking, "Hmm.");
        assert_eq!(completion.prompt_tokens, Some(25));
        assert_eq!(completion.output_tokens, Some(15));
        assert_eq!(completion.thinking_tokens, None);
    }

    #[test]
    fn test_decode_stream_error() {
        let mut completion = Completion::default();
        let error = event(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        let err = decode_event(&error, &mut completion).unwrap_err();
        assert_eq!(err.to_string(), "API error: overloaded_error: Overloaded");
    }

    #[test]
    fn test_decode_body() {
        let body = br#"{
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "step", "signature": "x"},
                {"type": "text", "text": "Answer"}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 42}
        }"#;
        let mut completion = Completion::default();
        decode_body(body, &mut completion).unwrap();
        assert_eq!(completion.text, "Answer");
        assert_eq!(completion.thinking, "step");
        assert_eq!(completion.prompt_tokens, Some(10));
        assert_eq!(completion.output_tokens, Some(42));
    }
}
