use metriken::{AtomicHistogram, Counter, Gauge, LazyCounter, LazyGauge, metric};
use std::time::Duration;

use crate::response::ResponseMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Dns,
    Connection,
    Tls,
    Timeout,
    Http4xx(u16),
    Http5xx(u16),
    Parse,
    Empty,
    Other,
}

// Process-wide totals across every run in this invocation

#[metric(
    name = "requests",
    description = "Total number of requests",
    metadata = { status = "sent" }
)]
pub static REQUESTS_SENT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Successful requests",
    metadata = { status = "success" }
)]
pub static REQUESTS_SUCCESS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Failed requests",
    metadata = { status = "failed" }
)]
pub static REQUESTS_FAILED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Timed out requests",
    metadata = { status = "timeout" }
)]
pub static REQUESTS_TIMEOUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "DNS resolution errors",
    metadata = { "type" = "dns" }
)]
pub static ERRORS_DNS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Connection errors",
    metadata = { "type" = "connection" }
)]
pub static ERRORS_CONNECTION: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "TLS handshake errors",
    metadata = { "type" = "tls" }
)]
pub static ERRORS_TLS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "HTTP 4xx errors",
    metadata = { "type" = "http_4xx" }
)]
pub static ERRORS_HTTP_4XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "HTTP 5xx errors",
    metadata = { "type" = "http_5xx" }
)]
pub static ERRORS_HTTP_5XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Parse errors",
    metadata = { "type" = "parse" }
)]
pub static ERRORS_PARSE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Responses without content",
    metadata = { "type" = "empty" }
)]
pub static ERRORS_EMPTY: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Other errors",
    metadata = { "type" = "other" }
)]
pub static ERRORS_OTHER: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens",
    description = "Input tokens processed",
    metadata = { direction = "input" }
)]
pub static TOKENS_INPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens",
    description = "Output tokens generated",
    metadata = { direction = "output" }
)]
pub static TOKENS_OUTPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens",
    description = "Thinking tokens generated",
    metadata = { direction = "thinking" }
)]
pub static TOKENS_THINKING: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_inflight",
    description = "Current number of requests in flight"
)]
pub static REQUESTS_INFLIGHT: LazyGauge = LazyGauge::new(Gauge::default);

// Latency histograms in nanoseconds (grouping_power=5, max_value_power=64)

#[metric(
    name = "ttft",
    description = "Time to first token in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static TTFT: AtomicHistogram = AtomicHistogram::new(5, 64);

#[metric(
    name = "tpot",
    description = "Time per output token in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static TPOT: AtomicHistogram = AtomicHistogram::new(5, 64);

#[metric(
    name = "request_latency",
    description = "Total request latency in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static REQUEST_LATENCY: AtomicHistogram = AtomicHistogram::new(5, 64);

pub struct Metrics;

impl Metrics {
    pub fn record_request_sent() {
        REQUESTS_SENT.increment();
        REQUESTS_INFLIGHT.increment();
    }

    pub fn record_success(metrics: &ResponseMetrics) {
        REQUESTS_INFLIGHT.decrement();
        REQUESTS_SUCCESS.increment();
        Self::record_sample(metrics);
    }

    pub fn record_failure(error_type: ErrorType, metrics: Option<&ResponseMetrics>) {
        REQUESTS_INFLIGHT.decrement();
        REQUESTS_FAILED.increment();
        match error_type {
            ErrorType::Dns => ERRORS_DNS.increment(),
            ErrorType::Connection => ERRORS_CONNECTION.increment(),
            ErrorType::Tls => ERRORS_TLS.increment(),
            ErrorType::Timeout => REQUESTS_TIMEOUT.increment(),
            ErrorType::Http4xx(_) => ERRORS_HTTP_4XX.increment(),
            ErrorType::Http5xx(_) => ERRORS_HTTP_5XX.increment(),
            ErrorType::Parse => ERRORS_PARSE.increment(),
            ErrorType::Empty => ERRORS_EMPTY.increment(),
            ErrorType::Other => ERRORS_OTHER.increment(),
        };
        if let Some(metrics) = metrics {
            Self::record_latency(metrics.total_time);
        }
    }

    fn record_sample(metrics: &ResponseMetrics) {
        TOKENS_INPUT.add(metrics.prompt_tokens);
        TOKENS_OUTPUT.add(metrics.output_tokens);
        TOKENS_THINKING.add(metrics.thinking_tokens);
        if !metrics.ttft.is_zero() {
            let _ = TTFT.increment(metrics.ttft.as_nanos() as u64);
        }
        if let Some(tpot) = metrics.tpot() {
            let _ = TPOT.increment(tpot.as_nanos() as u64);
        }
        Self::record_latency(metrics.total_time);
    }

    fn record_latency(duration: Duration) {
        let _ = REQUEST_LATENCY.increment(duration.as_nanos() as u64);
    }

    /// p50/p90/p99 in milliseconds, `None` when the histogram is empty.
    pub fn percentiles_ms(histogram: &AtomicHistogram) -> Option<[f64; 3]> {
        let loaded = histogram.load()?;
        let percentiles = loaded.percentiles(&[50.0, 90.0, 99.0]).ok()??;
        if percentiles.len() < 3 {
            return None;
        }
        let value = |i: usize| percentiles[i].1.end() as f64 / 1_000_000.0;
        Some([value(0), value(1), value(2)])
    }
}
