use anyhow::{Result, bail};
use std::env;
use std::path::PathBuf;

use crate::args::Args;
use crate::constants::{API_BASE_URL_ENV, API_KEY_ENV, API_MODEL_ENV, DEFAULT_OUTPUT_DIR};
use crate::provider::Provider;
use crate::template::TemplateId;

/// Request pacing and resilience knobs.
#[derive(Debug, Clone)]
pub struct RateConfig {
    pub rpm: u32,
    pub concurrency: usize,
    pub timeout_secs: f64,
    pub max_retries: u32,
    pub retry_backoff: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            rpm: 30,
            concurrency: 5,
            timeout_secs: 60.0,
            max_retries: 3,
            retry_backoff: 2.0,
        }
    }
}

/// CSV record source knobs.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub text_column_candidates: Vec<String>,
    pub id_column_candidates: Vec<String>,
    pub max_chars: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            text_column_candidates: ["findings", "exam_findings", "report_text", "impression"]
                .map(str::to_string)
                .to_vec(),
            id_column_candidates: ["patient_id", "record_id", "case_id", "exam_no"]
                .map(str::to_string)
                .to_vec(),
            max_chars: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub output_dir: PathBuf,
    pub temperature: f64,
    pub template_id: TemplateId,
    pub rate: RateConfig,
    pub source: SourceConfig,
}

impl AppConfig {
    /// Builds the run configuration: provider preset, then environment
    /// overrides, then CLI flag overrides.
    pub fn resolve(args: &Args) -> Self {
        let provider = args.provider;
        let mut config = Self {
            base_url: provider
                .base_url()
                .map(str::to_string)
                .or_else(|| env::var(API_BASE_URL_ENV).ok())
                .unwrap_or_else(|| Provider::Siliconflow.base_url().unwrap_or_default().to_string()),
            model: provider
                .default_model()
                .map(str::to_string)
                .or_else(|| env::var(API_MODEL_ENV).ok())
                .unwrap_or_default(),
            api_key: provider
                .api_key_env()
                .and_then(|name| env::var(name).ok())
                .or_else(|| env::var(API_KEY_ENV).ok()),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            temperature: 0.0,
            template_id: args.template,
            rate: RateConfig::default(),
            source: SourceConfig::default(),
        };

        if let Some(url) = &args.api_url {
            config.base_url = url.clone();
        }
        if let Some(key) = &args.api_key {
            config.api_key = Some(key.clone());
        }
        if let Some(model) = &args.model {
            config.model = model.clone();
        }
        if let Some(temperature) = args.temperature {
            config.temperature = temperature;
        }
        if let Some(rpm) = args.rpm {
            config.rate.rpm = rpm;
        }
        if let Some(concurrency) = args.concurrency {
            config.rate.concurrency = concurrency;
        }
        if let Some(timeout) = args.timeout {
            config.rate.timeout_secs = timeout;
        }
        if let Some(max_retries) = args.max_retries {
            config.rate.max_retries = max_retries;
        }
        if let Some(backoff) = args.retry_backoff {
            config.rate.retry_backoff = backoff;
        }
        if let Some(max_chars) = args.max_chars {
            config.source.max_chars = max_chars;
        }
        if let Some(out) = &args.out {
            config.output_dir = out.clone();
        }
        config
    }

    /// The provider the resolved base URL actually points at. A custom
    /// --api-url matching a preset URL is treated as that preset.
    pub fn provider(&self) -> Provider {
        Provider::from_base_url(&self.base_url)
    }

    /// Fatal pre-run configuration check: every run mode that talks to the
    /// API needs a credential before any work starts.
    pub fn require_api_key(&self) -> Result<String> {
        match &self.api_key {
            Some(key) if !key.is_empty() => Ok(key.clone()),
            _ => bail!(
                "No API key configured. Pass --api-key or set {} (or the provider key variable, e.g. SILICONFLOW_API_KEY)",
                API_KEY_ENV
            ),
        }
    }
}
