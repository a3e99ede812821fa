use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::common::truncate_for_log;
use crate::config::AppConfig;
use crate::constants::{BATCH_COMPLETION_WINDOW, BATCH_ENDPOINT, BATCH_REQUEST_FILE_NAME};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// Provider-side batch job status. Transitions are monotone toward one of
/// the three terminal states; anything unrecognized keeps the poll loop
/// going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Other,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Other => "unknown",
        };
        f.write_str(name)
    }
}

/// Snapshot of one provider-side batch job. `output_file_id` can stay
/// absent for a while even after the status reads completed.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub output_file_id: Option<String>,
}

/// The transport boundary: everything the pipeline needs from the LLM
/// provider. Kept behind a trait so the dispatcher and the batch
/// controller can run against a scripted transport in tests.
#[async_trait]
pub trait LlmApi: Send + Sync {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        response_format: Option<Value>,
    ) -> Result<Value>;

    async fn upload_jsonl(&self, path: &Path) -> Result<Value>;

    async fn create_batch(&self, input_file_id: &str, extra_body: Option<Value>)
    -> Result<BatchJob>;

    async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchJob>;

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>>;
}

/// OpenAI-compatible REST implementation of the transport boundary.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let api_key = config.require_api_key()?;
        let http = reqwest::Client::builder()
            .user_agent("report-extractor/0.1")
            .build()
            .context("Failed creating HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs_f64(config.rate.timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl LlmApi for HttpLlmClient {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        response_format: Option<Value>,
    ) -> Result<Value> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        if let Some(format) = response_format {
            body["response_format"] = format;
        }

        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("Chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Chat completion failed with status {status}: {}",
                truncate_for_log(&body)
            );
        }
        response
            .json()
            .await
            .context("Invalid chat completion response JSON")
    }

    async fn upload_jsonl(&self, path: &Path) -> Result<Value> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed reading batch request file {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(BATCH_REQUEST_FILE_NAME)
            .to_string();
        let form = Form::new()
            .text("purpose", "batch")
            .part("file", Part::bytes(bytes).file_name(file_name));

        let response = self
            .http
            .post(self.url("files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("File upload request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "File upload failed with status {status}: {}",
                truncate_for_log(&body)
            );
        }
        response.json().await.context("Invalid upload response JSON")
    }

    async fn create_batch(
        &self,
        input_file_id: &str,
        extra_body: Option<Value>,
    ) -> Result<BatchJob> {
        let mut body = json!({
            "input_file_id": input_file_id,
            "endpoint": BATCH_ENDPOINT,
            "completion_window": BATCH_COMPLETION_WINDOW,
        });
        if let (Some(base), Some(extra)) = (body.as_object_mut(), extra_body.as_ref().and_then(Value::as_object)) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }

        let response = self
            .http
            .post(self.url("batches"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Batch creation request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Batch creation failed with status {status}: {}",
                truncate_for_log(&body)
            );
        }
        response.json().await.context("Invalid batch job JSON")
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchJob> {
        let response = self
            .http
            .get(self.url(&format!("batches/{batch_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("Status request failed for batch {batch_id}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Batch status request failed with status {status}: {}",
                truncate_for_log(&body)
            );
        }
        response.json().await.context("Invalid batch job JSON")
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.url(&format!("files/{file_id}/content")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("Download request failed for file {file_id}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "File download failed with status {status}: {}",
                truncate_for_log(&body)
            );
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed reading download stream for file {file_id}"))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_deserializes_and_classifies() {
        let job: BatchJob = serde_json::from_str(
            r#"{"id": "batch_1", "status": "in_progress"}"#,
        )
        .unwrap();
        assert_eq!(job.status, BatchStatus::InProgress);
        assert!(!job.status.is_terminal());
        assert!(job.output_file_id.is_none());

        let done: BatchJob = serde_json::from_str(
            r#"{"id": "batch_1", "status": "completed", "output_file_id": "file_9"}"#,
        )
        .unwrap();
        assert!(done.status.is_terminal());
        assert_eq!(done.output_file_id.as_deref(), Some("file_9"));

        let odd: BatchJob =
            serde_json::from_str(r#"{"id": "batch_1", "status": "expired"}"#).unwrap();
        assert_eq!(odd.status, BatchStatus::Other);
        assert!(!odd.status.is_terminal());
    }

    #[test]
    fn chat_messages_serialize_with_roles() {
        let messages = [
            ChatMessage::system("You are an assistant."),
            ChatMessage::user("report text"),
        ];
        let value = serde_json::to_value(&messages).unwrap();
        assert_eq!(value[0]["role"], "system");
        assert_eq!(value[1]["content"], "report text");
    }
}
