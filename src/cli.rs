use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "llm-api-bench")]
#[command(author, version, about = "Benchmark OpenAI and Anthropic compatible LLM APIs", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    pub config: PathBuf,

    /// Model to benchmark, repeatable. Replaces `endpoint.models`
    #[arg(short, long = "model", value_name = "MODEL")]
    pub models: Vec<String>,

    /// Log request payloads and stream events
    #[arg(short, long)]
    pub verbose: bool,

    /// Only print the final report
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
