/// Print with timestamp prefix
#[macro_export]
macro_rules! output {
    () => {{
        let now = chrono::Utc::now();
        println!("{}", now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false));
    }};
    ($($arg:tt)*) => {{
        let now = chrono::Utc::now();
        print!("{} ", now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false));
        println!($($arg)*);
    }};
}

pub mod aggregate;
pub mod benchmark;
pub mod cli;
pub mod client;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod prompt;
pub mod report;
pub mod response;
pub mod stats;
pub mod tokenizer;

pub use aggregate::calculate_result;
pub use benchmark::BenchmarkRunner;
pub use cli::Cli;
pub use client::{ClientError, LlmClient, ProtocolClient, RequestFailure};
pub use config::{Config, ConfigError, RunConfig};
pub use metrics::Metrics;
pub use report::ReportData;
pub use response::ResponseMetrics;
pub use stats::StatsData;
