//! OpenAI-style chat completions wire format.

use serde::{Deserialize, Serialize};

use super::sse::SseEvent;
use super::{ClientError, Completion, RequestOptions, StreamStep};

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    // vLLM and DeepSeek use `reasoning_content`, some gateways `reasoning`
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

pub fn encode(
    model: &str,
    prompt: &str,
    stream: bool,
    options: &RequestOptions,
) -> Result<Vec<u8>, serde_json::Error> {
    let request = ChatCompletionRequest {
        model,
        messages: vec![Message {
            role: "user",
            content: prompt,
        }],
        max_tokens: options.max_tokens,
        stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    };
    serde_json::to_vec(&request)
}

fn apply_usage(usage: &Usage, completion: &mut Completion) {
    completion.prompt_tokens = Some(usage.prompt_tokens);
    completion.output_tokens = Some(usage.completion_tokens);
    if let Some(details) = &usage.completion_tokens_details {
        completion.thinking_tokens = Some(details.reasoning_tokens);
    }
}

/// Returns true when the message carried any generated text.
fn append_message(message: ResponseMessage, completion: &mut Completion) -> bool {
    let mut produced = false;
    if let Some(text) = message.content
        && !text.is_empty()
    {
        completion.text.push_str(&text);
        produced = true;
    }
    if let Some(reasoning) = message.reasoning_content
        && !reasoning.is_empty()
    {
        completion.thinking.push_str(&reasoning);
        produced = true;
    }
    produced
}

pub fn decode_event(event: &SseEvent, completion: &mut Completion) -> Result<StreamStep, ClientError> {
    let data = event.data.trim();
    if data == "[DONE]" {
        return Ok(StreamStep::Done);
    }
    if data.is_empty() {
        return Ok(StreamStep::Continue);
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| ClientError::Parse(format!("invalid stream chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(ClientError::Api(error.message));
    }
    if let Some(usage) = &chunk.usage {
        apply_usage(usage, completion);
    }

    let mut produced = false;
    for choice in chunk.choices {
        produced |= append_message(choice.delta, completion);
    }

    Ok(if produced {
        StreamStep::Content
    } else {
        StreamStep::Continue
    })
}

pub fn decode_body(body: &[u8], completion: &mut Completion) -> Result<(), ClientError> {
    let response: ChatCompletionResponse = serde_json::from_slice(body)
        .map_err(|e| ClientError::Parse(format!("invalid completion body: {}", e)))?;

    if let Some(error) = response.error {
        return Err(ClientError::Api(error.message));
    }
    if let Some(usage) = &response.usage {
        apply_usage(usage, completion);
    }
    for choice in response.choices {
        append_message(choice.message, completion);
    }
    Ok(())
}
