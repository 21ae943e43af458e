use std::net::IpAddr;
use std::time::Duration;

/// Outcome of a single request attempt.
///
/// Produced by a protocol client and handed to the runner by value. It may be
/// partially populated when the request failed: transport phases that were
/// reached keep their timings even if a later phase errored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMetrics {
    /// Time from request start until the exchange finished or failed
    pub total_time: Duration,
    /// Time to the first content-bearing chunk (zero when not streaming)
    pub ttft: Duration,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    /// Reasoning tokens, zero unless thinking mode was requested
    pub thinking_tokens: u64,
    pub dns_time: Duration,
    pub connect_time: Duration,
    pub tls_handshake_time: Duration,
    pub target_ip: Option<IpAddr>,
    /// Empty on success
    pub error: String,
}

impl ResponseMetrics {
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }

    /// True when the request produced usable model output.
    pub fn has_content(&self) -> bool {
        self.output_tokens > 0
    }

    /// True when at least one transport phase was timed.
    pub fn has_network_timing(&self) -> bool {
        !self.dns_time.is_zero() || !self.connect_time.is_zero() || !self.tls_handshake_time.is_zero()
    }

    /// Time per output token after the first one.
    ///
    /// `None` when fewer than two output tokens were produced.
    pub fn tpot(&self) -> Option<Duration> {
        if self.output_tokens <= 1 {
            return None;
        }
        let generation = self.total_time.saturating_sub(self.ttft);
        let nanos = generation.as_nanos() / u128::from(self.output_tokens - 1);
        Some(Duration::from_nanos(nanos as u64))
    }

    /// Output tokens per second of total request time.
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs > 0.0 {
            self.output_tokens as f64 / secs
        } else {
            0.0
        }
    }
}
