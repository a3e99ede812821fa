use clap::ValueEnum;
use serde_json::{Value, json};
use std::fmt;

use crate::constants::{
    ALIYUN_BASE_URL, DEEPSEEK_BASE_URL, OPENAI_BASE_URL, QIANDUODUO_BASE_URL, SILICONFLOW_BASE_URL,
};

/// API provider preset. Selected once at configuration time; every
/// provider-specific request shape hangs off this descriptor instead of
/// being branched at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Provider {
    Siliconflow,
    Aliyun,
    Openai,
    Deepseek,
    Qianduoduo,
    Custom,
}

impl Provider {
    pub fn base_url(self) -> Option<&'static str> {
        match self {
            Provider::Siliconflow => Some(SILICONFLOW_BASE_URL),
            Provider::Aliyun => Some(ALIYUN_BASE_URL),
            Provider::Openai => Some(OPENAI_BASE_URL),
            Provider::Deepseek => Some(DEEPSEEK_BASE_URL),
            Provider::Qianduoduo => Some(QIANDUODUO_BASE_URL),
            Provider::Custom => None,
        }
    }

    pub fn default_model(self) -> Option<&'static str> {
        match self {
            Provider::Siliconflow => Some("Qwen/Qwen3-Omni-30B-A3B-Instruct"),
            Provider::Aliyun => Some("qwen-plus"),
            Provider::Openai => Some("gpt-4"),
            Provider::Deepseek => Some("deepseek-chat"),
            Provider::Qianduoduo => Some("gpt-4.1-mini"),
            Provider::Custom => None,
        }
    }

    pub fn api_key_env(self) -> Option<&'static str> {
        match self {
            Provider::Siliconflow => Some("SILICONFLOW_API_KEY"),
            Provider::Aliyun => Some("ALIYUN_API_KEY"),
            Provider::Openai => Some("OPENAI_API_KEY"),
            Provider::Deepseek => Some("DEEPSEEK_API_KEY"),
            Provider::Qianduoduo => Some("QIANDUODUO_API_KEY"),
            Provider::Custom => None,
        }
    }

    pub fn supports_batch(self) -> bool {
        matches!(
            self,
            Provider::Siliconflow | Provider::Aliyun | Provider::Openai
        )
    }

    /// Extra parameters for batch job creation. Aliyun embeds the model in
    /// each request line and rejects overrides; the other batch providers
    /// take a replace directive on the job itself.
    pub fn batch_extra_body(self, model: &str) -> Option<Value> {
        match self {
            Provider::Aliyun => None,
            _ => Some(json!({ "replace": { "model": model } })),
        }
    }

    /// Recovers the preset matching a base URL, if any. Used when the URL
    /// came from a flag or the environment rather than a preset.
    pub fn from_base_url(base_url: &str) -> Provider {
        let trimmed = base_url.trim_end_matches('/');
        for provider in [
            Provider::Siliconflow,
            Provider::Aliyun,
            Provider::Openai,
            Provider::Deepseek,
            Provider::Qianduoduo,
        ] {
            if provider
                .base_url()
                .is_some_and(|url| url.trim_end_matches('/') == trimmed)
            {
                return provider;
            }
        }
        Provider::Custom
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Siliconflow => "siliconflow",
            Provider::Aliyun => "aliyun",
            Provider::Openai => "openai",
            Provider::Deepseek => "deepseek",
            Provider::Qianduoduo => "qianduoduo",
            Provider::Custom => "custom",
        };
        f.write_str(name)
    }
}
