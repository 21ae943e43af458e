use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use crate::metrics::REQUESTS_INFLIGHT;
use crate::response::ResponseMetrics;

/// Running statistics for one benchmark run.
///
/// Owned by the runner's aggregation point. Index `i` of every per-request
/// sequence refers to the same request.
#[derive(Debug, Clone)]
pub struct StatsData {
    /// Requests that completed successfully
    pub completed: usize,
    pub failed: usize,
    pub ttfts: Vec<Duration>,
    pub total_times: Vec<Duration>,
    pub dns_times: Vec<Duration>,
    pub connect_times: Vec<Duration>,
    pub tls_handshake_times: Vec<Duration>,
    pub input_tokens: Vec<u64>,
    pub output_tokens: Vec<u64>,
    pub thinking_tokens: Vec<u64>,
    /// Non-empty error messages in completion order
    pub errors: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
}

impl StatsData {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            completed: 0,
            failed: 0,
            ttfts: Vec::new(),
            total_times: Vec::new(),
            dns_times: Vec::new(),
            connect_times: Vec::new(),
            tls_handshake_times: Vec::new(),
            input_tokens: Vec::new(),
            output_tokens: Vec::new(),
            thinking_tokens: Vec::new(),
            errors: Vec::new(),
            start_time,
            elapsed: Duration::ZERO,
        }
    }

    /// Requests finished so far, successful or not.
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    /// Number of requests with recorded metrics.
    pub fn samples(&self) -> usize {
        self.total_times.len()
    }

    pub fn record_success(&mut self, metrics: &ResponseMetrics) {
        self.completed += 1;
        self.push_metrics(metrics);
    }

    /// Record a failure. Metrics, when present, still feed the sequences so
    /// network timings survive content failures.
    pub fn record_failure(&mut self, metrics: Option<&ResponseMetrics>, error: &str) {
        self.failed += 1;
        if !error.is_empty() {
            self.errors.push(error.to_string());
        }
        if let Some(metrics) = metrics {
            self.push_metrics(metrics);
        }
    }

    fn push_metrics(&mut self, metrics: &ResponseMetrics) {
        self.ttfts.push(metrics.ttft);
        self.total_times.push(metrics.total_time);
        self.dns_times.push(metrics.dns_time);
        self.connect_times.push(metrics.connect_time);
        self.tls_handshake_times.push(metrics.tls_handshake_time);
        self.input_tokens.push(metrics.prompt_tokens);
        self.output_tokens.push(metrics.output_tokens);
        self.thinking_tokens.push(metrics.thinking_tokens);
    }

    /// Mean TTFT over requests that reported one.
    pub fn mean_ttft(&self) -> Option<Duration> {
        let (sum, n) = self
            .ttfts
            .iter()
            .filter(|t| !t.is_zero())
            .fold((Duration::ZERO, 0u32), |(sum, n), t| (sum + *t, n + 1));
        (n > 0).then(|| sum / n)
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.output_tokens.iter().sum()
    }
}

/// Console progress sink for [`crate::BenchmarkRunner::run_with_progress`].
///
/// Prints at most once per `interval`, plus once when the last request finishes.
pub struct ProgressPrinter {
    total: usize,
    interval: Duration,
    last_print: Option<Instant>,
}

impl ProgressPrinter {
    pub fn new(total: usize, interval: Duration) -> Self {
        Self {
            total,
            interval,
            last_print: None,
        }
    }

    pub fn update(&mut self, stats: &StatsData) {
        let done = stats.finished() >= self.total;
        let due = self
            .last_print
            .is_none_or(|last| last.elapsed() >= self.interval);
        if !done && !due {
            return;
        }
        self.last_print = Some(Instant::now());

        let secs = stats.elapsed.as_secs_f64();
        let tokens_per_sec = if secs > 0.0 {
            stats.total_output_tokens() as f64 / secs
        } else {
            0.0
        };
        let ttft = stats
            .mean_ttft()
            .map(|t| format!("{:.0}", t.as_secs_f64() * 1000.0))
            .unwrap_or_else(|| "-".to_string());

        output!(
            "Progress: {}/{} Ok: {} Err: {} In-flight: {} Elapsed: {:.1}s TTFT (ms): {} Output tokens/s: {:.1}",
            stats.finished(),
            self.total,
            stats.completed,
            stats.failed,
            REQUESTS_INFLIGHT.value(),
            secs,
            ttft,
            tokens_per_sec
        );
        if let Some(last_error) = stats.errors.last()
            && done
        {
            output!("Last error: {}", last_error);
        }
    }
}
