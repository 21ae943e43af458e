use anyhow::Result;
use llm_api_bench::client::{check_server_ready, detect_model};
use llm_api_bench::config::OutputFormat;
use llm_api_bench::metrics::{REQUEST_LATENCY, TPOT, TTFT};
use llm_api_bench::stats::ProgressPrinter;
use llm_api_bench::tokenizer::Tokenizer;
use llm_api_bench::{BenchmarkRunner, Cli, Config, Metrics, logging, output, prompt, report};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let mut config = Config::load(&cli.config)?;
    config.apply_overrides(&cli.models, cli.verbose, cli.quiet);
    config.validate()?;

    logging::init(&config)?;

    // One id per invocation, shared by every model's run
    let run_id = Uuid::now_v7().to_string();

    // Progress lines would corrupt a report piped to stdout
    let report_to_stdout =
        config.output.format != OutputFormat::Console && config.output.file.is_none();
    let show_progress = !config.output.quiet && !report_to_stdout;

    if show_progress {
        println!("LLM API Benchmark");
        println!("   Config: {}", cli.config.display());
        println!(
            "   Target: {} ({})",
            config.endpoint.base_url, config.endpoint.protocol
        );
        println!("   Concurrency: {}", config.load.concurrency);
        println!("   Requests: {}", config.load.requests);
        println!(
            "   Mode: {}",
            if config.request.stream { "streaming" } else { "buffered" }
        );
        println!("   Run ID: {}", run_id);
        println!();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async { run_benchmarks(config, run_id, show_progress).await })
}

async fn run_benchmarks(config: Config, run_id: String, show_progress: bool) -> Result<()> {
    let protocol = config.protocol()?;
    let base_url = config.endpoint.base_url.as_str();
    let api_key = config.endpoint.api_key.as_deref();

    if config.endpoint.health_check_timeout > 0 {
        check_server_ready(
            protocol,
            base_url,
            api_key,
            Duration::from_secs(config.endpoint.health_check_timeout),
            Duration::from_secs(config.endpoint.health_check_interval),
        )
        .await?;
    }

    let models = if config.endpoint.models.is_empty() {
        info!("Model not specified, querying server for available models");
        let detected = detect_model(
            protocol,
            base_url,
            api_key,
            Duration::from_secs(config.endpoint.timeout),
        )
        .await?;
        vec![detected]
    } else {
        config.endpoint.models.clone()
    };

    let tokenizer = Tokenizer::new(&models[0])?;
    let prompts = prompt::from_config(&config.input, &tokenizer)?;
    debug!("Prompt source holds {} prompts", prompts.count());

    let mut reports = Vec::with_capacity(models.len());
    for model in &models {
        let run = config.run_config(model, &run_id);
        let runner = BenchmarkRunner::new(run, Arc::clone(&prompts))?;

        let report = if show_progress {
            output!("Benchmarking {}", model);
            let mut printer = ProgressPrinter::new(config.load.requests, PROGRESS_INTERVAL);
            runner
                .run_with_progress(|stats| printer.update(stats))
                .await
        } else {
            runner.run().await
        };
        reports.push(report);
    }

    report::render(&reports, &config.output).await?;

    if show_progress {
        print_percentiles();
    }
    Ok(())
}

/// Latency percentiles across every run in this invocation.
fn print_percentiles() {
    output!();
    for (name, histogram) in [
        ("TTFT", &TTFT),
        ("TPOT", &TPOT),
        ("Request Latency", &REQUEST_LATENCY),
    ] {
        if let Some([p50, p90, p99]) = Metrics::percentiles_ms(histogram) {
            output!(
                "{} (ms): p50: {:.1} p90: {:.1} p99: {:.1}",
                name,
                p50,
                p90,
                p99
            );
        }
    }
}
