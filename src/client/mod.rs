//! Instrumented protocol clients.
//!
//! [`LlmClient`] performs one HTTP exchange per call on a fresh connection and
//! returns a [`ResponseMetrics`] whether or not the exchange succeeded. Wire
//! encoding is delegated to a [`Protocol`] chosen once at construction.

mod anthropic;
mod discovery;
mod openai;
mod sse;
mod transport;

use bytes::Bytes;
use http::header::{ACCEPT, CONNECTION, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use log::{debug, info};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{ConfigError, RunConfig};
use crate::metrics::ErrorType;
use crate::response::ResponseMetrics;
use crate::tokenizer::Tokenizer;

pub use discovery::{Model, check_server_ready, detect_model, list_models};
pub use sse::{SseDecoder, SseEvent};
pub use transport::{Endpoint, Transport};

/// Log target for request payloads and stream events in verbose mode.
pub const TRACE_TARGET: &str = "llm_api_bench::trace";

/// Upper bound on how much of an error body is kept in the error message.
const MAX_ERROR_BODY: usize = 256;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status} client error: {message}")]
    Http4xx { status: u16, message: String },

    #[error("HTTP {status} server error: {message}")]
    Http5xx { status: u16, message: String },

    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// Error reported by the server inside an otherwise successful response
    #[error("API error: {0}")]
    Api(String),

    #[error("Empty response: no content received")]
    Empty,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
        match status {
            400..=499 => ClientError::Http4xx { status, message },
            500..=599 => ClientError::Http5xx { status, message },
            _ => ClientError::HttpStatus { status, message },
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            ClientError::Dns(_) => ErrorType::Dns,
            ClientError::Connection(_) => ErrorType::Connection,
            ClientError::Tls(_) => ErrorType::Tls,
            ClientError::Timeout(_) => ErrorType::Timeout,
            ClientError::Http4xx { status, .. } => ErrorType::Http4xx(*status),
            ClientError::Http5xx { status, .. } => ErrorType::Http5xx(*status),
            ClientError::Parse(_) => ErrorType::Parse,
            ClientError::Empty => ErrorType::Empty,
            ClientError::HttpStatus { .. } | ClientError::Api(_) | ClientError::InvalidRequest(_) => {
                ErrorType::Other
            }
        }
    }
}

/// A failed request together with whatever was measured before it failed.
///
/// `metrics` is `None` when nothing reached the transport.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct RequestFailure {
    pub metrics: Option<ResponseMetrics>,
    pub error: ClientError,
}

impl RequestFailure {
    pub fn absent(error: ClientError) -> Self {
        Self {
            metrics: None,
            error,
        }
    }
}

/// The capability the runner drives: send one prompt, name the protocol and
/// the model.
///
/// Implementations must be safe to call concurrently.
pub trait ProtocolClient: Send + Sync + 'static {
    fn request(
        &self,
        prompt: &str,
        stream: bool,
    ) -> impl Future<Output = Result<ResponseMetrics, RequestFailure>> + Send;

    fn protocol(&self) -> &str;

    fn model(&self) -> &str;
}

/// Per-request generation options shared by both wire formats.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub max_tokens: Option<u32>,
    pub thinking: bool,
    pub thinking_budget: u32,
}

/// Reply accumulated while decoding a body or stream.
///
/// Token counts are `None` until the server reports them.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub thinking: String,
    pub prompt_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub thinking_tokens: Option<u64>,
}

impl Completion {
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.thinking.is_empty()
    }
}

/// What a decoded stream event meant for the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStep {
    /// Carried generated text
    Content,
    /// Metadata, keep-alive or usage
    Continue,
    /// Termination signal
    Done,
}

/// Supported wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Anthropic,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Protocol::OpenAi),
            "anthropic" => Ok(Protocol::Anthropic),
            _ => Err(ConfigError::UnknownProtocol(s.to_string())),
        }
    }
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Anthropic => "anthropic",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, Protocol::Anthropic)
    }

    /// Path of an API resource below the base URL's path.
    ///
    /// Anthropic endpoints are versioned under `/v1`, which is added when the
    /// base URL does not already end with it.
    pub fn api_path(&self, base_path: &str, resource: &str) -> String {
        let base_path = base_path.trim_end_matches('/');
        match self {
            Protocol::Anthropic if !base_path.ends_with("/v1") => {
                format!("{}/v1/{}", base_path, resource)
            }
            _ => format!("{}/{}", base_path, resource),
        }
    }

    fn completion_resource(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "chat/completions",
            Protocol::Anthropic => "messages",
        }
    }

    pub fn auth_headers(&self, api_key: Option<&str>) -> Vec<(&'static str, String)> {
        match self {
            Protocol::OpenAi => api_key
                .map(|key| vec![("authorization", format!("Bearer {}", key))])
                .unwrap_or_default(),
            Protocol::Anthropic => {
                let mut headers = vec![("anthropic-version", anthropic::API_VERSION.to_string())];
                if let Some(key) = api_key {
                    headers.push(("x-api-key", key.to_string()));
                }
                headers
            }
        }
    }

    fn encode(
        &self,
        model: &str,
        prompt: &str,
        stream: bool,
        options: &RequestOptions,
    ) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Protocol::OpenAi => openai::encode(model, prompt, stream, options),
            Protocol::Anthropic => anthropic::encode(model, prompt, stream, options),
        }
    }

    fn decode_event(
        &self,
        event: &SseEvent,
        completion: &mut Completion,
    ) -> Result<StreamStep, ClientError> {
        match self {
            Protocol::OpenAi => openai::decode_event(event, completion),
            Protocol::Anthropic => anthropic::decode_event(event, completion),
        }
    }

    fn decode_body(&self, body: &[u8], completion: &mut Completion) -> Result<(), ClientError> {
        match self {
            Protocol::OpenAi => openai::decode_body(body, completion),
            Protocol::Anthropic => anthropic::decode_body(body, completion),
        }
    }
}

/// HTTP client for one model on one endpoint.
pub struct LlmClient {
    protocol: Protocol,
    model: String,
    api_key: Option<String>,
    endpoint: Endpoint,
    path: String,
    transport: Transport,
    timeout: Duration,
    options: RequestOptions,
    tokenizer: Arc<Tokenizer>,
    run_id: String,
    trace: bool,
}

impl LlmClient {
    pub fn new(config: &RunConfig) -> Result<Self, ConfigError> {
        let protocol: Protocol = config.protocol.parse()?;
        let endpoint =
            Endpoint::parse(&config.base_url).map_err(|reason| ConfigError::InvalidBaseUrl {
                url: config.base_url.clone(),
                reason,
            })?;
        let api_key = config.api_key.clone().filter(|key| !key.trim().is_empty());
        if protocol.requires_api_key() && api_key.is_none() {
            return Err(ConfigError::MissingApiKey(protocol.name().to_string()));
        }
        let tokenizer =
            Tokenizer::new(&config.model).map_err(|e| ConfigError::Tokenizer(e.to_string()))?;
        let path = protocol.api_path(&endpoint.base_path, protocol.completion_resource());

        Ok(Self {
            protocol,
            model: config.model.clone(),
            api_key,
            endpoint,
            path,
            transport: Transport::new(),
            timeout: config.timeout,
            options: RequestOptions {
                max_tokens: config.max_tokens,
                thinking: config.thinking,
                thinking_budget: config.thinking_budget,
            },
            tokenizer: Arc::new(tokenizer),
            run_id: config.run_id.clone(),
            trace: config.verbose,
        })
    }

    fn build_request(&self, body: Vec<u8>, stream: bool) -> Result<Request<Full<Bytes>>, ClientError> {
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.path.as_str())
            .header(HOST, self.endpoint.authority.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .header(USER_AGENT, concat!("llm-api-bench/", env!("CARGO_PKG_VERSION")))
            .header(CONNECTION, "close");
        if !self.run_id.is_empty() {
            builder = builder.header("x-run-id", self.run_id.as_str());
        }
        for (name, value) in self.protocol.auth_headers(self.api_key.as_deref()) {
            builder = builder.header(name, value);
        }

        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))
    }

    async fn execute(&self, prompt: &str, stream: bool) -> Result<ResponseMetrics, RequestFailure> {
        let body = self
            .protocol
            .encode(&self.model, prompt, stream, &self.options)
            .map_err(|e| RequestFailure::absent(ClientError::InvalidRequest(e.to_string())))?;
        if self.trace {
            info!(
                target: TRACE_TARGET,
                "[{}] POST {} {}",
                self.run_id,
                self.path,
                String::from_utf8_lossy(&body)
            );
        }
        let request = self.build_request(body, stream).map_err(RequestFailure::absent)?;

        let mut metrics = ResponseMetrics::default();
        let mut completion = Completion::default();
        let start = Instant::now();

        let exchange = self.exchange(request, stream, start, &mut metrics, &mut completion);
        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        };
        metrics.total_time = start.elapsed();

        match result.and_then(|()| self.account_tokens(prompt, &completion, &mut metrics)) {
            Ok(()) => {
                debug!(
                    "{} {} ok: total {:?} ttft {:?} output tokens {}",
                    self.protocol.name(),
                    self.model,
                    metrics.total_time,
                    metrics.ttft,
                    metrics.output_tokens
                );
                Ok(metrics)
            }
            Err(error) => {
                debug!("{} {} failed: {}", self.protocol.name(), self.model, error);
                metrics.error = error.to_string();
                Err(RequestFailure {
                    metrics: Some(metrics),
                    error,
                })
            }
        }
    }

    async fn exchange(
        &self,
        request: Request<Full<Bytes>>,
        stream: bool,
        start: Instant,
        metrics: &mut ResponseMetrics,
        completion: &mut Completion,
    ) -> Result<(), ClientError> {
        let mut sender = self.transport.connect(&self.endpoint, metrics).await?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClientError::Connection(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response.into_body();
        if !status.is_success() {
            let bytes = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            return Err(ClientError::from_status(
                status.as_u16(),
                &String::from_utf8_lossy(&bytes),
            ));
        }

        if stream {
            self.read_stream(body, start, metrics, completion).await
        } else {
            let bytes = body
                .collect()
                .await
                .map_err(|e| ClientError::Connection(format!("reading body: {}", e)))?
                .to_bytes();
            if self.trace {
                info!(
                    target: TRACE_TARGET,
                    "[{}] response {}",
                    self.run_id,
                    String::from_utf8_lossy(&bytes)
                );
            }
            self.protocol.decode_body(&bytes, completion)
        }
    }

    async fn read_stream(
        &self,
        mut body: Incoming,
        start: Instant,
        metrics: &mut ResponseMetrics,
        completion: &mut Completion,
    ) -> Result<(), ClientError> {
        let mut decoder = SseDecoder::new();

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| ClientError::Connection(format!("reading stream: {}", e)))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            for event in decoder.push(&data) {
                if self.handle_event(&event, start, metrics, completion)? == StreamStep::Done {
                    return Ok(());
                }
            }
        }

        // Unterminated streams are judged by content in account_tokens
        if let Some(event) = decoder.finish() {
            self.handle_event(&event, start, metrics, completion)?;
        }
        Ok(())
    }

    fn handle_event(
        &self,
        event: &SseEvent,
        start: Instant,
        metrics: &mut ResponseMetrics,
        completion: &mut Completion,
    ) -> Result<StreamStep, ClientError> {
        if self.trace {
            info!(
                target: TRACE_TARGET,
                "[{}] event {} {}",
                self.run_id,
                event.event.as_deref().unwrap_or("message"),
                event.data
            );
        }
        let step = self.protocol.decode_event(event, completion)?;
        if step == StreamStep::Content && metrics.ttft.is_zero() {
            metrics.ttft = start.elapsed();
        }
        Ok(step)
    }

    /// Fill token counts, preferring server usage and falling back to the
    /// local tokenizer.
    fn account_tokens(
        &self,
        prompt: &str,
        completion: &Completion,
        metrics: &mut ResponseMetrics,
    ) -> Result<(), ClientError> {
        if !completion.has_content() {
            return Err(ClientError::Empty);
        }

        let count = |text: &str| self.tokenizer.count_tokens(text) as u64;
        let output_tokens = match completion.output_tokens {
            Some(reported) if reported > 0 => reported,
            _ => count(&completion.text) + count(&completion.thinking),
        };
        if output_tokens == 0 {
            return Err(ClientError::Empty);
        }

        metrics.output_tokens = output_tokens;
        metrics.prompt_tokens = completion.prompt_tokens.unwrap_or_else(|| count(prompt));
        if self.options.thinking {
            metrics.thinking_tokens = completion
                .thinking_tokens
                .unwrap_or_else(|| count(&completion.thinking));
        }
        Ok(())
    }
}

impl ProtocolClient for LlmClient {
    fn request(
        &self,
        prompt: &str,
        stream: bool,
    ) -> impl Future<Output = Result<ResponseMetrics, RequestFailure>> + Send {
        self.execute(prompt, stream)
    }

    fn protocol(&self) -> &str {
        self.protocol.name()
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn run_config(protocol: &str, base_url: &str) -> RunConfig {
        RunConfig {
            protocol: protocol.to_string(),
            base_url: base_url.to_string(),
            api_key: Some("test-key".to_string()),
            model: "test-model".to_string(),
            concurrency: 1,
            count: 1,
            stream: true,
            timeout: Duration::from_secs(5),
            thinking: false,
            verbose: false,
            max_tokens: Some(32),
            thinking_budget: 1024,
            run_id: "run-1".to_string(),
        }
    }

    async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serve one canned response and hand back the raw request.
    async fn serve_once(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });
        (format!("http://{}", addr), handle)
    }

    /// Same as [`serve_once`] behind TLS with the test certificate.
    async fn serve_once_tls(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = transport::fixtures::acceptor().accept(tcp).await.unwrap();
            let request = read_request(&mut stream).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            request
        });
        (format!("https://{}", addr), handle)
    }

    fn tls_client(config: &RunConfig) -> LlmClient {
        let mut client = LlmClient::new(config).unwrap();
        client.transport = transport::fixtures::trusting_transport();
        client
    }

    fn sse_response(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{}",
            body
        )
    }

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("openai".parse::<Protocol>().unwrap(), Protocol::OpenAi);
        assert_eq!("Anthropic".parse::<Protocol>().unwrap(), Protocol::Anthropic);
        assert!(matches!(
            "grpc".parse::<Protocol>(),
            Err(ConfigError::UnknownProtocol(p)) if p == "grpc"
        ));
    }

    #[test]
    fn test_api_paths() {
        assert_eq!(
            Protocol::OpenAi.api_path("/v1", "chat/completions"),
            "/v1/chat/completions"
        );
        assert_eq!(Protocol::Anthropic.api_path("/v1", "messages"), "/v1/messages");
        assert_eq!(Protocol::Anthropic.api_path("", "messages"), "/v1/messages");
        assert_eq!(
            Protocol::Anthropic.api_path("/proxy/", "models"),
            "/proxy/v1/models"
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            ClientError::from_status(429, "slow down").error_type(),
            ErrorType::Http4xx(429)
        );
        assert_eq!(
            ClientError::from_status(503, "").error_type(),
            ErrorType::Http5xx(503)
        );
        assert_eq!(
            ClientError::from_status(302, "").error_type(),
            ErrorType::Other
        );
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = run_config("smtp", "http://localhost");
        assert!(matches!(
            LlmClient::new(&config),
            Err(ConfigError::UnknownProtocol(_))
        ));

        let mut config = run_config("anthropic", "https://api.anthropic.com");
        config.api_key = None;
        assert!(matches!(
            LlmClient::new(&config),
            Err(ConfigError::MissingApiKey(_))
        ));

        let config = run_config("openai", "localhost:8080");
        assert!(matches!(
            LlmClient::new(&config),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));

        let mut config = run_config("openai", "http://localhost:8080/v1");
        config.api_key = None;
        assert!(LlmClient::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_openai_stream_success() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
        );
        let (base_url, server) = serve_once(sse_response(body)).await;
        let client = LlmClient::new(&run_config("openai", &format!("{}/v1", base_url))).unwrap();

        let metrics = client.request("Say hello", true).await.unwrap();
        assert!(metrics.is_success());
        assert_eq!(metrics.prompt_tokens, 7);
        assert_eq!(metrics.output_tokens, 3);
        assert_eq!(metrics.thinking_tokens, 0);
        assert!(!metrics.ttft.is_zero());
        assert!(metrics.ttft <= metrics.total_time);
        assert_eq!(metrics.target_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(metrics.tls_handshake_time.is_zero());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions HTTP/1.1"));
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("authorization: bearer test-key"));
        assert!(lower.contains("x-run-id: run-1"));
        assert!(lower.contains("connection: close"));
        assert!(request.contains("\"stream\":true"));
    }

    #[tokio::test]
    async fn test_stream_without_usage_falls_back_to_tokenizer() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"one two three\"}}]}\n\n";
        let (base_url, _server) = serve_once(sse_response(body)).await;
        let client = LlmClient::new(&run_config("openai", &base_url)).unwrap();

        let metrics = client.request("count", true).await.unwrap();
        assert!(metrics.output_tokens > 0);
        assert!(metrics.prompt_tokens > 0);
    }

    #[tokio::test]
    async fn test_empty_stream_is_failure() {
        let (base_url, _server) = serve_once(sse_response("data: [DONE]\n\n")).await;
        let client = LlmClient::new(&run_config("openai", &base_url)).unwrap();

        let failure = client.request("hello", true).await.unwrap_err();
        assert!(matches!(failure.error, ClientError::Empty));
        let metrics = failure.metrics.unwrap();
        assert_eq!(metrics.output_tokens, 0);
        assert!(!metrics.error.is_empty());
        assert!(metrics.target_ip.is_some());
    }

    #[tokio::test]
    async fn test_server_error_keeps_network_timing() {
        let response = json_response(
            "500 Internal Server Error",
            r#"{"error":{"message":"boom"}}"#,
        );
        let (base_url, _server) = serve_once(response).await;
        let client = LlmClient::new(&run_config("openai", &base_url)).unwrap();

        let failure = client.request("hello", true).await.unwrap_err();
        assert!(matches!(
            failure.error,
            ClientError::Http5xx { status: 500, .. }
        ));
        let metrics = failure.metrics.unwrap();
        assert_eq!(metrics.target_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(metrics.output_tokens, 0);
        assert!(metrics.error.contains("500"));
        assert!(!metrics.total_time.is_zero());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LlmClient::new(&run_config("openai", &format!("http://{}", addr))).unwrap();
        let failure = client.request("hello", true).await.unwrap_err();
        assert!(matches!(failure.error, ClientError::Connection(_)));
        let metrics = failure.metrics.unwrap();
        assert!(metrics.connect_time.is_zero());
        assert_eq!(metrics.target_ip, None);
        assert_eq!(failure.error.error_type(), ErrorType::Connection);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_metrics() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut config = run_config("openai", &format!("http://{}", addr));
        config.timeout = Duration::from_millis(200);
        let client = LlmClient::new(&config).unwrap();

        let failure = client.request("hello", true).await.unwrap_err();
        assert!(matches!(failure.error, ClientError::Timeout(_)));
        let metrics = failure.metrics.unwrap();
        assert_eq!(metrics.target_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(metrics.total_time >= Duration::from_millis(200));
        assert!(metrics.error.starts_with("Timeout"));
    }

    #[test]
    fn test_verbose_enables_trace() {
        let mut config = run_config("openai", "http://localhost:8080/v1");
        assert!(!LlmClient::new(&config).unwrap().trace);
        config.verbose = true;
        assert!(LlmClient::new(&config).unwrap().trace);
    }

    #[tokio::test]
    async fn test_garbage_body_keeps_network_timing() {
        let response = json_response("200 OK", "<html>upstream returned garbage</html>");
        let (base_url, _server) = serve_once(response).await;
        let client = LlmClient::new(&run_config("openai", &base_url)).unwrap();

        let failure = client.request("hello", false).await.unwrap_err();
        assert!(matches!(failure.error, ClientError::Parse(_)));
        assert_eq!(failure.error.error_type(), ErrorType::Parse);
        let metrics = failure.metrics.unwrap();
        assert!(metrics.has_network_timing());
        assert!(!metrics.connect_time.is_zero());
        assert_eq!(metrics.target_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(metrics.output_tokens, 0);
        assert!(metrics.error.starts_with("Parse error"));
    }

    #[tokio::test]
    async fn test_garbage_stream_chunk_is_parse_failure() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {broken\n\n",
        );
        let (base_url, _server) = serve_once(sse_response(body)).await;
        let client = LlmClient::new(&run_config("openai", &base_url)).unwrap();

        let failure = client.request("hello", true).await.unwrap_err();
        assert!(matches!(failure.error, ClientError::Parse(_)));
        let metrics = failure.metrics.unwrap();
        // The first chunk arrived before the broken one
        assert!(!metrics.ttft.is_zero());
        assert_eq!(metrics.output_tokens, 0);
        assert!(!metrics.error.is_empty());
    }

    #[tokio::test]
    async fn test_tls_stream_success() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"secure\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":1}}\n\n",
            "data: [DONE]\n\n",
        );
        let (base_url, server) = serve_once_tls(sse_response(body)).await;
        let client = tls_client(&run_config("openai", &base_url));

        let metrics = client.request("hello", true).await.unwrap();
        assert_eq!(metrics.output_tokens, 1);
        assert!(!metrics.connect_time.is_zero());
        assert!(!metrics.tls_handshake_time.is_zero());
        assert!(metrics.tls_handshake_time <= metrics.total_time);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /chat/completions HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_tls_parse_failure_keeps_handshake_timing() {
        let response = json_response("200 OK", "{\"choices\": [oops");
        let (base_url, _server) = serve_once_tls(response).await;
        let client = tls_client(&run_config("openai", &base_url));

        let failure = client.request("hello", false).await.unwrap_err();
        assert!(matches!(failure.error, ClientError::Parse(_)));
        let metrics = failure.metrics.unwrap();
        assert!(!metrics.connect_time.is_zero());
        assert!(!metrics.tls_handshake_time.is_zero());
        assert_eq!(metrics.target_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!metrics.error.is_empty());
    }

    #[tokio::test]
    async fn test_openai_buffered_error_object() {
        let body = r#"{"error":{"message":"model not loaded","type":"server_error"}}"#;
        let (base_url, _server) = serve_once(json_response("200 OK", body)).await;
        let client = LlmClient::new(&run_config("openai", &base_url)).unwrap();

        let failure = client.request("hello", false).await.unwrap_err();
        assert!(matches!(&failure.error, ClientError::Api(msg) if msg == "model not loaded"));
        let metrics = failure.metrics.unwrap();
        assert_eq!(metrics.error, "API error: model not loaded");
    }

    #[tokio::test]
    async fn test_anthropic_buffered_success() {
        let body = r#"{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Hi"}],"usage":{"input_tokens":12,"output_tokens":40}}"#;
        let (base_url, server) = serve_once(json_response("200 OK", body)).await;
        let mut config = run_config("anthropic", &base_url);
        config.thinking = true;
        let client = LlmClient::new(&config).unwrap();

        let metrics = client.request("Think", false).await.unwrap();
        assert!(metrics.ttft.is_zero());
        assert_eq!(metrics.prompt_tokens, 12);
        assert_eq!(metrics.output_tokens, 40);
        assert!(metrics.thinking_tokens > 0);
        assert_eq!(client.protocol(), "anthropic");
        assert_eq!(client.model(), "test-model");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/messages HTTP/1.1"));
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("x-api-key: test-key"));
        assert!(lower.contains("anthropic-version: 2023-06-01"));
        assert!(request.contains("\"budget_tokens\":1024"));
    }

    #[tokio::test]
    async fn test_anthropic_stream_error_event() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3}}}\n\n",
            "event: error\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        let (base_url, _server) = serve_once(sse_response(body)).await;
        let client = LlmClient::new(&run_config("anthropic", &base_url)).unwrap();

        let failure = client.request("hi", true).await.unwrap_err();
        assert!(matches!(failure.error, ClientError::Api(_)));
        let metrics = failure.metrics.unwrap();
        assert_eq!(metrics.output_tokens, 0);
        assert_eq!(metrics.prompt_tokens, 0);
        assert!(metrics.error.contains("Overloaded"));
    }
}
