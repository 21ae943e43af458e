use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};

use crate::aggregate::{RunInfo, calculate_result};
use crate::client::{LlmClient, ProtocolClient, RequestFailure};
use crate::config::{ConfigError, RunConfig};
use crate::metrics::Metrics;
use crate::prompt::PromptSource;
use crate::report::ReportData;
use crate::response::ResponseMetrics;
use crate::stats::StatsData;

/// Result of one dispatched request as seen by the aggregation point.
struct Outcome {
    index: usize,
    result: Result<ResponseMetrics, RequestFailure>,
}

/// Drives `count` requests through a protocol client with at most
/// `concurrency` in flight and reduces the outcomes into a [`ReportData`].
///
/// Workers never touch shared state. Each sends its outcome over a channel to
/// the single task that owns the [`StatsData`], so the per-request sequences
/// stay index-aligned and every progress view is self-consistent.
///
/// # Examples
///
/// ```no_run
/// use llm_api_bench::{BenchmarkRunner, Config};
/// use llm_api_bench::prompt::StaticPrompts;
/// use std::sync::Arc;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::load("bench.toml".as_ref())?;
/// let run = config.run_config("llama-3.1-8b", "run-1");
/// let runner = BenchmarkRunner::new(run, Arc::new(StaticPrompts::from_text("Hello")))?;
/// let report = runner.run().await;
/// println!("success rate: {:.1}%", report.success_rate);
/// # Ok(())
/// # }
/// ```
pub struct BenchmarkRunner<C: ProtocolClient = LlmClient> {
    config: RunConfig,
    client: Arc<C>,
    prompts: Arc<dyn PromptSource>,
}

impl BenchmarkRunner<LlmClient> {
    /// Build a runner with an HTTP client for `config.protocol`.
    pub fn new(config: RunConfig, prompts: Arc<dyn PromptSource>) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = LlmClient::new(&config)?;
        Self::with_client(config, client, prompts)
    }
}

impl<C: ProtocolClient> BenchmarkRunner<C> {
    pub fn with_client(
        config: RunConfig,
        client: C,
        prompts: Arc<dyn PromptSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            client: Arc::new(client),
            prompts,
        })
    }

    pub async fn run(&self) -> ReportData {
        self.run_with_progress(|_| {}).await
    }

    /// Run the benchmark, showing `progress` the running statistics after
    /// every finished request. Views arrive in order and never go backwards.
    pub async fn run_with_progress<F>(&self, mut progress: F) -> ReportData
    where
        F: FnMut(&StatsData),
    {
        let info = RunInfo {
            model: self.client.model().to_string(),
            protocol: self.client.protocol().to_string(),
            base_url: self.config.base_url.clone(),
            timestamp: Utc::now(),
            concurrency: self.config.concurrency,
            total_requests: self.config.count,
            stream: self.config.stream,
            thinking: self.config.thinking,
        };

        info!(
            "Running {} requests against {} ({}) with concurrency {}",
            info.total_requests, info.model, info.protocol, info.concurrency
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.client),
            Arc::clone(&self.prompts),
            self.config.count,
            self.config.concurrency,
            self.config.stream,
            tx,
        ));

        let mut stats = StatsData::new(info.timestamp);
        let mut outcomes: Vec<Option<ResponseMetrics>> = Vec::with_capacity(self.config.count);

        while let Some(Outcome { index, result }) = rx.recv().await {
            match result {
                Ok(metrics) => {
                    debug!("Request {} succeeded in {:?}", index, metrics.total_time);
                    Metrics::record_success(&metrics);
                    stats.record_success(&metrics);
                    outcomes.push(Some(metrics));
                }
                Err(failure) => {
                    debug!("Request {} failed: {}", index, failure.error);
                    Metrics::record_failure(failure.error.error_type(), failure.metrics.as_ref());
                    stats.record_failure(failure.metrics.as_ref(), &failure.error.to_string());
                    outcomes.push(failure.metrics);
                }
            }
            stats.elapsed = start.elapsed();
            progress(&stats);
        }

        if let Err(e) = dispatcher.await {
            warn!("Request dispatcher stopped early: {}", e);
        }
        let total_elapsed = start.elapsed();

        if outcomes.len() != self.config.count {
            warn!(
                "Collected {} outcomes for {} requests",
                outcomes.len(),
                self.config.count
            );
        }
        info!(
            "Finished {} requests in {:.1}s ({} ok, {} failed)",
            stats.finished(),
            total_elapsed.as_secs_f64(),
            stats.completed,
            stats.failed
        );

        calculate_result(&info, &outcomes, total_elapsed)
    }
}

/// Launch exactly `count` requests, never more than `concurrency` at once.
async fn dispatch<C: ProtocolClient>(
    client: Arc<C>,
    prompts: Arc<dyn PromptSource>,
    count: usize,
    concurrency: usize,
    stream: bool,
    tx: mpsc::UnboundedSender<Outcome>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    for index in 0..count {
        // The semaphore is never closed
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let prompt = prompts.prompt_at(index);
        let client = Arc::clone(&client);
        let tx = tx.clone();

        Metrics::record_request_sent();
        tokio::spawn(async move {
            let result = client.request(&prompt, stream).await;
            drop(permit);
            let _ = tx.send(Outcome { index, result });
        });
    }
}
