use clap::{Parser, ValueEnum};

use crate::provider::Provider;
use crate::template::TemplateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// One rate-limited concurrent request per record.
    Sync,
    /// Provider-side asynchronous batch job.
    Batch,
    /// Convert a CSV into a fine-tune chat dataset (no API calls).
    Finetune,
}

#[derive(Debug, Parser)]
#[command(name = "report_extractor")]
#[command(about = "Extract structured clinical features from free-text medical reports via an LLM")]
pub struct Args {
    /// Execution mode.
    #[arg(long, value_enum, default_value_t = Mode::Sync)]
    pub mode: Mode,

    /// Input CSV path (the report table; for finetune mode, the source CSV).
    #[arg(long)]
    pub input: std::path::PathBuf,

    /// Report text column name (single-column mode). Mutually exclusive with --text-cols.
    #[arg(long)]
    pub text_col: Option<String>,

    /// Comma-separated report text columns; non-empty cells are labeled and merged.
    #[arg(long)]
    pub text_cols: Option<String>,

    /// Record id column name. Auto-detected when omitted.
    #[arg(long)]
    pub id_col: Option<String>,

    /// Extraction template.
    #[arg(long, value_enum, default_value_t = TemplateId::RenalCancer)]
    pub template: TemplateId,

    /// API provider preset.
    #[arg(long, value_enum, default_value_t = Provider::Siliconflow)]
    pub provider: Provider,

    /// Custom API base URL (overrides the provider preset).
    #[arg(long)]
    pub api_url: Option<String>,

    /// API key. Falls back to the provider's key environment variable, then API_KEY.
    #[arg(long)]
    pub api_key: Option<String>,

    /// Model name/id override.
    #[arg(long)]
    pub model: Option<String>,

    /// Response sampling temperature.
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Requests-per-minute budget shared by all concurrent workers.
    #[arg(long)]
    pub rpm: Option<u32>,

    /// Max concurrent in-flight chat requests.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-request timeout in seconds.
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Max retry attempts per record after the first try.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Exponential backoff base in seconds.
    #[arg(long)]
    pub retry_backoff: Option<f64>,

    /// Max characters of report text kept per record.
    #[arg(long)]
    pub max_chars: Option<usize>,

    /// Only process the first N records.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Output directory. Defaults to outputs/<input-stem>_<unix-seconds>.
    #[arg(long)]
    pub out: Option<std::path::PathBuf>,

    /// Directory for the generated batch request JSONL.
    #[arg(long)]
    pub request_dir: Option<std::path::PathBuf>,

    /// Batch status poll interval in seconds.
    #[arg(long, default_value_t = 15.0)]
    pub poll_interval: f64,

    /// Parse the input and preview records without calling the API.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// System prompt override for finetune mode. Defaults to the template prompt.
    #[arg(long)]
    pub system: Option<String>,

    /// Assistant content column for finetune mode (single column).
    #[arg(long)]
    pub assistant_col: Option<String>,

    /// Comma-separated assistant content columns for finetune mode.
    #[arg(long)]
    pub assistant_cols: Option<String>,
}
