//! Logger setup on top of ringlog.

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use log::{LevelFilter, Metadata, Record};
use ringlog::{File, LogBuilder, MultiLogBuilder, Output, Stderr};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use crate::client::TRACE_TARGET;
use crate::config::Config;

/// Maximum log file size before rotation (10MB)
const LOG_FILE_MAX_SIZE: u64 = 1024 * 1024 * 10;

const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Parse filter strings like "hyper=info" into (module prefix, level) pairs.
/// Malformed entries are skipped.
pub fn parse_log_filters(filters: &[String]) -> Vec<(String, LevelFilter)> {
    let mut parsed = Vec::new();
    for filter in filters {
        let Some((module, level)) = filter.split_once('=') else {
            continue;
        };
        let level = match level.trim().to_lowercase().as_str() {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            "off" => LevelFilter::Off,
            _ => continue,
        };
        parsed.push((module.trim().to_string(), level));
    }
    parsed
}

/// Level for `target`: the longest matching prefix wins, otherwise `default`.
fn level_for(target: &str, filters: &[(String, LevelFilter)], default: LevelFilter) -> LevelFilter {
    filters
        .iter()
        .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, level)| *level)
        .unwrap_or(default)
}

/// Writes straight to a ringlog output with per-module levels.
struct FilteredLogger {
    output: Mutex<Box<dyn Output>>,
    default_level: LevelFilter,
    filters: Vec<(String, LevelFilter)>,
}

impl log::Log for FilteredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= level_for(metadata.target(), &self.filters, self.default_level)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut output) = self.output.lock() {
            let message = format!(
                "{} {} [{}] {}\n",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, false),
                record.level(),
                record.target(),
                record.args()
            );
            let _ = output.write_all(message.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

fn open_output(config: &Config) -> Result<Box<dyn Output>> {
    Ok(match &config.output.trace_log {
        Some(log_file) => {
            let backup_file = log_file.with_extension("old");
            Box::new(File::new(log_file.clone(), backup_file, LOG_FILE_MAX_SIZE)?)
        }
        None => Box::new(Stderr::new()),
    })
}

/// Install the global logger.
///
/// Verbose mode always lets the request trace through, whatever the global
/// level.
pub fn init(config: &Config) -> Result<()> {
    let default_level = config.log.level.to_level_filter();
    let mut filters = parse_log_filters(&config.log.filter);
    if config.output.verbose {
        filters.push((TRACE_TARGET.to_string(), LevelFilter::Info));
    }
    let output = open_output(config)?;

    if filters.is_empty() {
        let base_log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(|e| anyhow!("failed to initialize logger: {:?}", e))?;

        let mut drain = MultiLogBuilder::new()
            .level_filter(default_level)
            .default(base_log)
            .build()
            .start();

        std::thread::Builder::new()
            .name("log-flush".to_string())
            .spawn(move || {
                loop {
                    std::thread::sleep(FLUSH_INTERVAL);
                    let _ = drain.flush();
                }
            })?;
    } else {
        let max_level = filters
            .iter()
            .map(|(_, level)| *level)
            .chain(std::iter::once(default_level))
            .max()
            .unwrap_or(default_level);
        let logger = FilteredLogger {
            output: Mutex::new(output),
            default_level,
            filters,
        };

        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| anyhow!("failed to set logger: {}", e))?;
        log::set_max_level(max_level);
    }

    Ok(())
}
