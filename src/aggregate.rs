//! Reduction of per-request outcomes into a single [`ReportData`].

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::report::{CountStats, DurationStats, RateStats, ReportData};
use crate::response::ResponseMetrics;

/// Configuration echoed into the report.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub model: String,
    pub protocol: String,
    pub base_url: String,
    pub timestamp: DateTime<Utc>,
    pub concurrency: usize,
    /// Configured request count, the denominator of both rates
    pub total_requests: usize,
    pub stream: bool,
    pub thinking: bool,
}

/// Reduce outcomes into a report.
///
/// `None` entries are requests whose transport never produced metrics. Network
/// statistics use every outcome that timed at least one transport phase,
/// content statistics only outcomes that produced output tokens.
///
/// An empty or all-absent outcome list yields a report with every statistic
/// and both rates at zero.
pub fn calculate_result(
    info: &RunInfo,
    outcomes: &[Option<ResponseMetrics>],
    total_elapsed: Duration,
) -> ReportData {
    let present: Vec<&ResponseMetrics> = outcomes.iter().flatten().collect();
    if present.is_empty() {
        return ReportData::empty(info, total_elapsed);
    }

    let network: Vec<&ResponseMetrics> = present
        .iter()
        .copied()
        .filter(|m| m.has_network_timing())
        .collect();
    let content: Vec<&ResponseMetrics> = present
        .iter()
        .copied()
        .filter(|m| m.has_content())
        .collect();

    let durations = |set: &[&ResponseMetrics], field: fn(&ResponseMetrics) -> Duration| {
        let samples: Vec<Duration> = set.iter().map(|m| field(m)).collect();
        DurationStats::from_samples(&samples)
    };
    let counts = |field: fn(&ResponseMetrics) -> u64| {
        let samples: Vec<u64> = content.iter().map(|m| field(m)).collect();
        CountStats::from_samples(&samples)
    };

    let tpot_samples: Vec<Duration> = content.iter().filter_map(|m| m.tpot()).collect();
    let tps_samples: Vec<f64> = content.iter().map(|m| m.tokens_per_second()).collect();

    let (success_rate, error_rate) = if info.total_requests > 0 {
        let total = info.total_requests as f64;
        let succeeded = content.len() as f64;
        (
            succeeded / total * 100.0,
            (total - succeeded) / total * 100.0,
        )
    } else {
        (0.0, 0.0)
    };

    let mut report = ReportData::empty(info, total_elapsed);
    report.request_time = durations(&network, |m| m.total_time);
    report.dns_time = durations(&network, |m| m.dns_time);
    report.connect_time = durations(&network, |m| m.connect_time);
    report.tls_handshake_time = durations(&network, |m| m.tls_handshake_time);
    report.target_ip = network.iter().find_map(|m| m.target_ip);

    report.ttft = durations(&content, |m| m.ttft);
    report.tpot = DurationStats::from_samples(&tpot_samples);
    report.input_tokens = counts(|m| m.prompt_tokens);
    report.output_tokens = counts(|m| m.output_tokens);
    report.thinking_tokens = counts(|m| m.thinking_tokens);
    report.tokens_per_second = RateStats::from_samples(&tps_samples);

    report.success_rate = success_rate;
    report.error_rate = error_rate;
    report
}
