use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::config::{OutputConfig, OutputFormat};

/// Average, minimum and maximum of a set of durations.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DurationStats {
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl DurationStats {
    pub fn from_samples(samples: &[Duration]) -> Self {
        let (Some(min), Some(max)) = (samples.iter().min(), samples.iter().max()) else {
            return Self::default();
        };
        let total: u128 = samples.iter().map(Duration::as_nanos).sum();
        let avg = Duration::from_nanos((total / samples.len() as u128) as u64);
        Self {
            avg,
            min: *min,
            max: *max,
        }
    }
}

/// Token count summary. The average is fractional, the bounds are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CountStats {
    pub avg: f64,
    pub min: u64,
    pub max: u64,
}

impl CountStats {
    pub fn from_samples(samples: &[u64]) -> Self {
        let (Some(min), Some(max)) = (samples.iter().min(), samples.iter().max()) else {
            return Self::default();
        };
        let total: u64 = samples.iter().sum();
        Self {
            avg: total as f64 / samples.len() as f64,
            min: *min,
            max: *max,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl RateStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            avg: samples.iter().sum::<f64>() / samples.len() as f64,
            min,
            max,
        }
    }
}

/// Final result of one benchmark run against one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportData {
    // Configuration echo
    pub model: String,
    pub protocol: String,
    pub base_url: String,
    pub timestamp: DateTime<Utc>,
    pub concurrency: usize,
    pub total_requests: usize,
    pub stream: bool,
    pub thinking: bool,

    /// Wall-clock time from first dispatch to last completion
    pub total_time: Duration,

    // Network statistics (every outcome that reached the transport)
    pub request_time: DurationStats,
    pub dns_time: DurationStats,
    pub connect_time: DurationStats,
    pub tls_handshake_time: DurationStats,
    pub target_ip: Option<IpAddr>,

    // Content statistics (outcomes that produced output)
    pub ttft: DurationStats,
    pub tpot: DurationStats,
    pub input_tokens: CountStats,
    pub output_tokens: CountStats,
    pub thinking_tokens: CountStats,
    pub tokens_per_second: RateStats,

    /// Percentages of the configured request count
    pub success_rate: f64,
    pub error_rate: f64,
}

impl ReportData {
    /// A report with the configuration echoed and every statistic at zero.
    pub fn empty(info: &crate::aggregate::RunInfo, total_time: Duration) -> Self {
        Self {
            model: info.model.clone(),
            protocol: info.protocol.clone(),
            base_url: info.base_url.clone(),
            timestamp: info.timestamp,
            concurrency: info.concurrency,
            total_requests: info.total_requests,
            stream: info.stream,
            thinking: info.thinking,
            total_time,
            request_time: DurationStats::default(),
            dns_time: DurationStats::default(),
            connect_time: DurationStats::default(),
            tls_handshake_time: DurationStats::default(),
            target_ip: None,
            ttft: DurationStats::default(),
            tpot: DurationStats::default(),
            input_tokens: CountStats::default(),
            output_tokens: CountStats::default(),
            thinking_tokens: CountStats::default(),
            tokens_per_second: RateStats::default(),
            success_rate: 0.0,
            error_rate: 0.0,
        }
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// A report value, or the placeholder used when the value is meaningless for
/// the run (TTFT and TPOT of non-streaming runs).
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
enum Cell {
    Value(f64),
    Placeholder(&'static str),
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Value(v) => write!(f, "{:.2}", v),
            Cell::Placeholder(p) => f.write_str(p),
        }
    }
}

const PLACEHOLDER: &str = "-";

#[derive(Debug, Serialize)]
struct Triple<T> {
    avg: T,
    min: T,
    max: T,
}

impl Triple<f64> {
    fn millis(stats: &DurationStats) -> Self {
        Self {
            avg: ms(stats.avg),
            min: ms(stats.min),
            max: ms(stats.max),
        }
    }

    fn tokens(stats: &CountStats) -> Self {
        Self {
            avg: stats.avg,
            min: stats.min as f64,
            max: stats.max as f64,
        }
    }

    fn rate(stats: &RateStats) -> Self {
        Self {
            avg: stats.avg,
            min: stats.min,
            max: stats.max,
        }
    }
}

impl Triple<Cell> {
    fn streamed(stats: &DurationStats, stream: bool) -> Self {
        let cell = |d: Duration| {
            if stream {
                Cell::Value(ms(d))
            } else {
                Cell::Placeholder(PLACEHOLDER)
            }
        };
        Self {
            avg: cell(stats.avg),
            min: cell(stats.min),
            max: cell(stats.max),
        }
    }
}

/// Serialized shape of a report. Durations are milliseconds.
#[derive(Debug, Serialize)]
struct ReportView<'a> {
    model: &'a str,
    protocol: &'a str,
    base_url: &'a str,
    timestamp: String,
    concurrency: usize,
    total_requests: usize,
    stream: bool,
    thinking: bool,
    total_time_ms: f64,
    success_rate: f64,
    error_rate: f64,
    target_ip: String,
    request_time_ms: Triple<f64>,
    dns_time_ms: Triple<f64>,
    connect_time_ms: Triple<f64>,
    tls_handshake_time_ms: Triple<f64>,
    ttft_ms: Triple<Cell>,
    tpot_ms: Triple<Cell>,
    input_tokens: Triple<f64>,
    output_tokens: Triple<f64>,
    thinking_tokens: Triple<f64>,
    tokens_per_second: Triple<f64>,
}

impl<'a> ReportView<'a> {
    fn new(report: &'a ReportData) -> Self {
        Self {
            model: &report.model,
            protocol: &report.protocol,
            base_url: &report.base_url,
            timestamp: report.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            concurrency: report.concurrency,
            total_requests: report.total_requests,
            stream: report.stream,
            thinking: report.thinking,
            total_time_ms: ms(report.total_time),
            success_rate: report.success_rate,
            error_rate: report.error_rate,
            target_ip: report
                .target_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            request_time_ms: Triple::millis(&report.request_time),
            dns_time_ms: Triple::millis(&report.dns_time),
            connect_time_ms: Triple::millis(&report.connect_time),
            tls_handshake_time_ms: Triple::millis(&report.tls_handshake_time),
            ttft_ms: Triple::streamed(&report.ttft, report.stream),
            tpot_ms: Triple::streamed(&report.tpot, report.stream),
            input_tokens: Triple::tokens(&report.input_tokens),
            output_tokens: Triple::tokens(&report.output_tokens),
            thinking_tokens: Triple::tokens(&report.thinking_tokens),
            tokens_per_second: Triple::rate(&report.tokens_per_second),
        }
    }

    fn csv_row(&self) -> Vec<String> {
        let mut row = vec![
            csv_escape(self.model),
            csv_escape(self.protocol),
            csv_escape(self.base_url),
            self.timestamp.clone(),
            self.concurrency.to_string(),
            self.total_requests.to_string(),
            self.stream.to_string(),
            self.thinking.to_string(),
            format!("{:.2}", self.total_time_ms),
            format!("{:.2}", self.success_rate),
            format!("{:.2}", self.error_rate),
            self.target_ip.clone(),
        ];
        for triple in [
            &self.request_time_ms,
            &self.dns_time_ms,
            &self.connect_time_ms,
            &self.tls_handshake_time_ms,
        ] {
            push_triple(&mut row, triple);
        }
        for triple in [&self.ttft_ms, &self.tpot_ms] {
            push_triple(&mut row, triple);
        }
        for triple in [
            &self.input_tokens,
            &self.output_tokens,
            &self.thinking_tokens,
            &self.tokens_per_second,
        ] {
            push_triple(&mut row, triple);
        }
        row
    }
}

fn push_triple<T: std::fmt::Display>(row: &mut Vec<String>, triple: &Triple<T>) {
    row.push(format!("{:.2}", triple.avg));
    row.push(format!("{:.2}", triple.min));
    row.push(format!("{:.2}", triple.max));
}

const CSV_PREFIX: &[&str] = &[
    "model",
    "protocol",
    "base_url",
    "timestamp",
    "concurrency",
    "total_requests",
    "stream",
    "thinking",
    "total_time_ms",
    "success_rate",
    "error_rate",
    "target_ip",
];

const CSV_TRIPLES: &[&str] = &[
    "request_time_ms",
    "dns_time_ms",
    "connect_time_ms",
    "tls_handshake_time_ms",
    "ttft_ms",
    "tpot_ms",
    "input_tokens",
    "output_tokens",
    "thinking_tokens",
    "tokens_per_second",
];

fn csv_header() -> Vec<String> {
    let mut header: Vec<String> = CSV_PREFIX.iter().map(|s| s.to_string()).collect();
    for name in CSV_TRIPLES {
        for stat in ["avg", "min", "max"] {
            header.push(format!("{}_{}", name, stat));
        }
    }
    header
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render reports as a pretty JSON array.
pub fn to_json(reports: &[ReportData]) -> Result<String> {
    let views: Vec<ReportView> = reports.iter().map(ReportView::new).collect();
    Ok(serde_json::to_string_pretty(&views)?)
}

/// Render reports as CSV, one row per report.
pub fn to_csv(reports: &[ReportData]) -> String {
    let mut out = csv_header().join(",");
    out.push('\n');
    for report in reports {
        out.push_str(&ReportView::new(report).csv_row().join(","));
        out.push('\n');
    }
    out
}

pub fn print_console_report(report: &ReportData) {
    let view = ReportView::new(report);

    output!();
    output!("-----");
    output!(
        "Benchmark Complete: {} ({}) {}",
        report.model,
        report.protocol,
        report.base_url
    );
    output!(
        "Duration: {:.1}s Concurrency: {} Requests: {} Stream: {} Thinking: {}",
        report.total_time.as_secs_f64(),
        report.concurrency,
        report.total_requests,
        report.stream,
        report.thinking
    );
    output!(
        "Responses: Success: {:.2}% Error: {:.2}%",
        report.success_rate,
        report.error_rate
    );
    if let Some(ip) = report.target_ip {
        output!("Target IP: {}", ip);
    }
    output!(
        "Network (ms): DNS: {:.2} Connect: {:.2} TLS: {:.2}",
        view.dns_time_ms.avg,
        view.connect_time_ms.avg,
        view.tls_handshake_time_ms.avg
    );
    output!(
        "Request Latency (ms): avg: {:.2} min: {:.2} max: {:.2}",
        view.request_time_ms.avg,
        view.request_time_ms.min,
        view.request_time_ms.max
    );
    output!(
        "TTFT (ms): avg: {} min: {} max: {}",
        view.ttft_ms.avg,
        view.ttft_ms.min,
        view.ttft_ms.max
    );
    output!(
        "TPOT (ms): avg: {} min: {} max: {}",
        view.tpot_ms.avg,
        view.tpot_ms.min,
        view.tpot_ms.max
    );
    output!(
        "Tokens: Input: {:.1} Output: {:.1} Thinking: {:.1}",
        report.input_tokens.avg,
        report.output_tokens.avg,
        report.thinking_tokens.avg
    );
    output!(
        "Throughput (tokens/s): avg: {:.2} min: {:.2} max: {:.2}",
        report.tokens_per_second.avg,
        report.tokens_per_second.min,
        report.tokens_per_second.max
    );
}

/// Emit reports in the configured format, to a file or stdout.
pub async fn render(reports: &[ReportData], output: &OutputConfig) -> Result<()> {
    let rendered = match output.format {
        OutputFormat::Console => {
            for report in reports {
                print_console_report(report);
            }
            return Ok(());
        }
        OutputFormat::Json => to_json(reports)?,
        OutputFormat::Csv => to_csv(reports),
    };

    match &output.file {
        Some(path) => {
            write_file(path, &rendered).await?;
            if !output.quiet {
                for report in reports {
                    print_console_report(report);
                }
                output!("Report written to {}", path.display());
            }
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

async fn write_file(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(stream: bool) -> ReportData {
        let info = crate::aggregate::RunInfo {
            model: "gpt-4o-mini".to_string(),
            protocol: "openai".to_string(),
            base_url: "https://api.example.com/v1".to_string(),
            timestamp: Utc::now(),
            concurrency: 2,
            total_requests: 4,
            stream,
            thinking: false,
        };
        let mut report = ReportData::empty(&info, Duration::from_secs(3));
        report.ttft = DurationStats::from_samples(&[Duration::from_millis(120)]);
        report.success_rate = 75.0;
        report.error_rate = 25.0;
        report
    }

    #[test]
    fn test_duration_stats() {
        let stats = DurationStats::from_samples(&[
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::from_millis(200),
        ]);
        assert_eq!(stats.avg, Duration::from_millis(200));
        assert_eq!(stats.min, Duration::from_millis(100));
        assert_eq!(stats.max, Duration::from_millis(300));
        assert_eq!(DurationStats::from_samples(&[]), DurationStats::default());
    }

    #[test]
    fn test_count_and_rate_stats() {
        let counts = CountStats::from_samples(&[3, 4]);
        assert_eq!(counts.avg, 3.5);
        assert_eq!((counts.min, counts.max), (3, 4));

        let rates = RateStats::from_samples(&[10.0, 30.0]);
        assert_eq!(rates.avg, 20.0);
        assert_eq!((rates.min, rates.max), (10.0, 30.0));
        assert_eq!(RateStats::from_samples(&[]), RateStats::default());
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_csv_row_matches_header() {
        let csv = to_csv(&[sample(true), sample(false)]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        let columns = lines[0].split(',').count();
        // base_url has no commas so a naive split is safe here
        assert_eq!(lines[1].split(',').count(), columns);
        assert_eq!(lines[2].split(',').count(), columns);
    }

    #[test]
    fn test_non_streaming_uses_placeholder() {
        let json = to_json(&[sample(false)]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["ttft_ms"]["avg"], "-");
        assert_eq!(parsed[0]["tpot_ms"]["max"], "-");
        assert_eq!(parsed[0]["success_rate"], 75.0);

        let csv = to_csv(&[sample(false)]);
        assert!(csv.lines().nth(1).unwrap().contains(",-,-,-,"));
    }

    #[test]
    fn test_streaming_reports_values() {
        let json = to_json(&[sample(true)]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["ttft_ms"]["avg"], 120.0);
        assert_eq!(parsed[0]["model"], "gpt-4o-mini");
    }
}
