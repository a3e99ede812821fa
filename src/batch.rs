use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;

use crate::aggregate::{Outcome, RecordOutcome, order_outcomes};
use crate::client::{BatchJob, BatchStatus, LlmApi};
use crate::config::AppConfig;
use crate::constants::BATCH_REQUEST_FILE_NAME;
use crate::reader::Record;
use crate::schema::extraction_from_chat_payload;
use crate::template::ExtractionTemplate;

/// How often the poll loop reports progress (every Nth poll).
const POLL_REPORT_EVERY: u32 = 3;
/// Bounded retries for an output_file_id that lags the completed status.
const OUTPUT_FILE_ID_RETRIES: u32 = 6;
/// Bounded retries for downloading a result artifact that briefly 404s.
const DOWNLOAD_RETRIES: u32 = 8;

/// What a batch run produced. `outcomes` is `None` when the job ended
/// failed/cancelled and no per-record results exist.
#[derive(Debug)]
pub struct BatchRunReport {
    pub batch_id: String,
    pub status: BatchStatus,
    pub outcomes: Option<Vec<RecordOutcome>>,
}

/// Globally-unique submission keys: the first occurrence of a natural id
/// keeps it unmodified, the k-th duplicate becomes `<id>__<k>`.
pub fn assign_custom_ids(records: &[Record]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    records
        .iter()
        .map(|record| {
            let base = if record.id.is_empty() {
                "row"
            } else {
                record.id.as_str()
            };
            let count = seen.entry(base).and_modify(|c| *c += 1).or_insert(1);
            if *count == 1 {
                base.to_string()
            } else {
                format!("{base}__{count}")
            }
        })
        .collect()
}

fn build_batch_payload(
    record: &Record,
    custom_id: &str,
    config: &AppConfig,
    system_prompt: &str,
) -> Value {
    json!({
        "custom_id": custom_id,
        "method": "POST",
        "url": "/v1/chat/completions",
        "body": {
            "model": config.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": record.text },
            ],
            "temperature": config.temperature,
            "response_format": { "type": "json_object" },
        },
    })
}

/// Assembles the request JSONL and the submission-key → input-index map
/// the result parser needs to route echoed keys back to rows.
pub fn write_request_jsonl(
    records: &[Record],
    request_dir: &Path,
    config: &AppConfig,
    template: &ExtractionTemplate,
) -> Result<(PathBuf, HashMap<String, usize>)> {
    fs::create_dir_all(request_dir)
        .with_context(|| format!("Failed creating request dir {}", request_dir.display()))?;
    let path = request_dir.join(BATCH_REQUEST_FILE_NAME);
    let file = File::create(&path)
        .with_context(|| format!("Failed creating batch request file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let system_prompt = template.system_prompt();
    let custom_ids = assign_custom_ids(records);
    let mut id_map = HashMap::with_capacity(records.len());

    for (index, (record, custom_id)) in records.iter().zip(&custom_ids).enumerate() {
        let payload = build_batch_payload(record, custom_id, config, &system_prompt);
        let line = serde_json::to_string(&payload).context("Failed encoding batch request line")?;
        writeln!(writer, "{line}")
            .with_context(|| format!("Failed writing batch request file {}", path.display()))?;
        id_map.insert(custom_id.clone(), index);
    }
    writer
        .flush()
        .with_context(|| format!("Failed flushing batch request file {}", path.display()))?;
    Ok((path, id_map))
}

/// Pulls the uploaded file id out of the (heterogeneously shaped) upload
/// response: `{id}` or `{data: {id}}`.
pub fn extract_file_id(upload: &Value) -> Option<String> {
    upload
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| upload.pointer("/data/id").and_then(Value::as_str))
        .map(str::to_string)
}

/// Polls job status at a fixed interval until a terminal state, reporting
/// progress at a decimated cadence instead of every iteration.
pub async fn poll_batch<T: LlmApi>(
    client: &T,
    batch_id: &str,
    interval: Duration,
) -> Result<BatchJob> {
    let mut polls = 0u32;
    loop {
        let job = client.retrieve_batch(batch_id).await?;
        polls += 1;
        if job.status.is_terminal() {
            println!("Batch job {batch_id} reached status {}", job.status);
            return Ok(job);
        }
        if polls % POLL_REPORT_EVERY == 1 {
            println!(
                "Batch job {batch_id} still {} after {polls} polls",
                job.status
            );
        }
        sleep(interval).await;
    }
}

/// A provider may report completed before the result artifact is
/// queryable. Re-fetch the job with growing waits until the file id shows
/// up; exhaustion is fatal for the run.
async fn resolve_output_file_id<T: LlmApi>(client: &T, job: BatchJob) -> Result<(BatchJob, String)> {
    if let Some(file_id) = job.output_file_id.clone() {
        return Ok((job, file_id));
    }
    for attempt in 1..=OUTPUT_FILE_ID_RETRIES {
        sleep(Duration::from_secs(2 * u64::from(attempt))).await;
        let refreshed = client.retrieve_batch(&job.id).await?;
        if let Some(file_id) = refreshed.output_file_id.clone() {
            return Ok((refreshed, file_id));
        }
    }
    bail!(
        "Batch job {} completed but no result file became available after {} retries",
        job.id,
        OUTPUT_FILE_ID_RETRIES
    )
}

/// The artifact can briefly 404 even after being referenced by the job.
async fn download_results<T: LlmApi>(client: &T, file_id: &str) -> Result<Vec<u8>> {
    let mut last_error = None;
    for attempt in 1..=DOWNLOAD_RETRIES {
        match client.download_file(file_id).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) => {
                last_error = Some(err);
                if attempt < DOWNLOAD_RETRIES {
                    sleep(Duration::from_secs(2 * u64::from(attempt))).await;
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| anyhow!("Result file download failed"))
        .context(format!(
            "Result file {file_id} never became available after {DOWNLOAD_RETRIES} attempts"
        )))
}

/// Indexes result lines by submission key and routes each back to the row
/// that submitted it. Unparseable lines and unknown keys are dropped; the
/// aggregator marks the rows they would have covered as missing.
pub fn parse_batch_results(
    records: &[Record],
    id_map: &HashMap<String, usize>,
    result_bytes: &[u8],
    template: &ExtractionTemplate,
) -> Vec<(usize, Outcome)> {
    let text = String::from_utf8_lossy(result_bytes);
    let mut outcomes = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(custom_id) = entry.get("custom_id").and_then(Value::as_str) else {
            continue;
        };
        let Some(&index) = id_map.get(custom_id) else {
            continue;
        };
        let record = &records[index];

        let error = entry.get("error").filter(|value| !value.is_null());
        let response = entry.get("response").filter(|value| !value.is_null());
        let outcome = match (response, error) {
            (Some(response), None) => {
                let payload = response.get("body").unwrap_or(response);
                match extraction_from_chat_payload(payload, &record.id, template) {
                    Ok(extraction) => Outcome::Success(extraction),
                    Err(err) => Outcome::Failure(format!("{err:#}")),
                }
            }
            (_, Some(error)) => Outcome::Failure(error.to_string()),
            (None, None) => Outcome::Failure("result line had neither response nor error".to_string()),
        };
        outcomes.push((index, outcome));
    }
    outcomes
}

/// Drives the whole batch lifecycle: build → upload → submit → poll →
/// fetch → parse. Per-record problems become per-record outcomes;
/// lifecycle problems abort the run.
pub async fn run_batch<T: LlmApi>(
    client: &T,
    config: &AppConfig,
    template: &ExtractionTemplate,
    records: Vec<Record>,
    request_dir: &Path,
    poll_interval: Duration,
) -> Result<BatchRunReport> {
    let provider = config.provider();
    if !provider.supports_batch() {
        bail!(
            "Batch mode is not supported for provider {provider}; use --mode sync"
        );
    }

    println!(
        "Preparing batch of {} records for provider {provider}",
        records.len()
    );
    let (request_path, id_map) = write_request_jsonl(&records, request_dir, config, template)?;
    println!("Wrote batch request file {}", request_path.display());

    let upload = client.upload_jsonl(&request_path).await?;
    let file_id = extract_file_id(&upload)
        .with_context(|| format!("Upload succeeded but returned no file id: {upload}"))?;
    println!("Uploaded request file, id {file_id}");

    let job = client
        .create_batch(&file_id, provider.batch_extra_body(&config.model))
        .await?;
    println!("Created batch job {}", job.id);
    println!(
        "Polling job status every {:.0}s",
        poll_interval.as_secs_f64()
    );

    let job = poll_batch(client, &job.id, poll_interval).await?;
    if job.status != BatchStatus::Completed {
        return Ok(BatchRunReport {
            batch_id: job.id,
            status: job.status,
            outcomes: None,
        });
    }

    let (job, output_file_id) = resolve_output_file_id(client, job).await?;
    let result_bytes = download_results(client, &output_file_id).await?;
    println!(
        "Downloaded result file {output_file_id} ({} bytes)",
        result_bytes.len()
    );

    let unordered = parse_batch_results(&records, &id_map, &result_bytes, template);
    let outcomes = order_outcomes(records, unordered);
    Ok(BatchRunReport {
        batch_id: job.id,
        status: job.status,
        outcomes: Some(outcomes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::MISSING_RESULT_ERROR;
    use crate::args::Args;
    use crate::client::ChatMessage;
    use crate::template::{TemplateId, get_template};
    use async_trait::async_trait;
    use clap::Parser;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn record(id: &str, text: &str) -> Record {
        Record {
            id: id.to_string(),
            text: text.to_string(),
            row_data: BTreeMap::new(),
        }
    }

    fn test_config() -> AppConfig {
        let args = Args::parse_from(["report_extractor", "--input", "unused.csv"]);
        AppConfig::resolve(&args)
    }

    fn chat_line(custom_id: &str, content: Value) -> String {
        json!({
            "custom_id": custom_id,
            "response": {
                "body": {
                    "choices": [{ "message": { "content": content.to_string() } }]
                }
            }
        })
        .to_string()
    }

    /// Scripted batch transport: replays queued status snapshots and
    /// download results in order.
    struct ScriptedBatch {
        upload: Value,
        created: BatchJob,
        statuses: Mutex<Vec<BatchJob>>,
        downloads: Mutex<Vec<Result<Vec<u8>>>>,
    }

    fn job(status: BatchStatus, output_file_id: Option<&str>) -> BatchJob {
        BatchJob {
            id: "batch_1".to_string(),
            status,
            output_file_id: output_file_id.map(str::to_string),
        }
    }

    #[async_trait]
    impl LlmApi for ScriptedBatch {
        async fn chat_completion(
            &self,
            _messages: &[ChatMessage],
            _response_format: Option<Value>,
        ) -> Result<Value> {
            bail!("batch runs never call the sync endpoint")
        }

        async fn upload_jsonl(&self, path: &Path) -> Result<Value> {
            assert!(path.exists(), "request file must exist before upload");
            Ok(self.upload.clone())
        }

        async fn create_batch(
            &self,
            input_file_id: &str,
            _extra_body: Option<Value>,
        ) -> Result<BatchJob> {
            assert_eq!(input_file_id, "file_7");
            Ok(self.created.clone())
        }

        async fn retrieve_batch(&self, _batch_id: &str) -> Result<BatchJob> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0].clone())
            }
        }

        async fn download_file(&self, _file_id: &str) -> Result<Vec<u8>> {
            let mut downloads = self.downloads.lock().unwrap();
            if downloads.is_empty() {
                bail!("no download scripted")
            }
            downloads.remove(0)
        }
    }

    #[test]
    fn duplicate_natural_ids_get_unique_submission_keys() {
        let records = vec![record("A", "1"), record("A", "2"), record("B", "3")];
        assert_eq!(assign_custom_ids(&records), vec!["A", "A__2", "B"]);

        let records = vec![record("", "1"), record("", "2")];
        assert_eq!(assign_custom_ids(&records), vec!["row", "row__2"]);
    }

    #[test]
    fn request_file_lines_carry_the_wire_shape() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let template = get_template(TemplateId::Generic);
        let records = vec![record("A", "first report"), record("A", "second report")];

        let (path, id_map) =
            write_request_jsonl(&records, dir.path(), &config, &template).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["custom_id"], "A");
        assert_eq!(lines[1]["custom_id"], "A__2");
        assert_eq!(lines[0]["method"], "POST");
        assert_eq!(lines[0]["url"], "/v1/chat/completions");
        assert_eq!(lines[0]["body"]["model"], config.model);
        assert_eq!(lines[0]["body"]["response_format"]["type"], "json_object");
        assert_eq!(lines[0]["body"]["messages"][1]["content"], "first report");

        assert_eq!(id_map["A"], 0);
        assert_eq!(id_map["A__2"], 1);
    }

    #[test]
    fn file_id_is_found_in_both_upload_shapes() {
        assert_eq!(
            extract_file_id(&json!({ "id": "file_1" })).as_deref(),
            Some("file_1")
        );
        assert_eq!(
            extract_file_id(&json!({ "data": { "id": "file_2" } })).as_deref(),
            Some("file_2")
        );
        assert_eq!(extract_file_id(&json!({ "object": "file" })), None);
    }

    #[test]
    fn unreturned_rows_become_missing_outcomes() {
        let template = get_template(TemplateId::Generic);
        let records = vec![record("1", "a"), record("2", "b"), record("3", "c")];
        let id_map: HashMap<String, usize> = assign_custom_ids(&records)
            .into_iter()
            .enumerate()
            .map(|(index, key)| (key, index))
            .collect();

        let artifact = [
            chat_line("1", json!({ "exam_type": "CT" })),
            chat_line("3", json!({ "exam_type": "MRI" })),
        ]
        .join("\n");

        let ordered = order_outcomes(
            records.clone(),
            parse_batch_results(&records, &id_map, artifact.as_bytes(), &template),
        );
        assert!(ordered[0].outcome.is_success());
        assert_eq!(ordered[1].outcome.error_text(), Some(MISSING_RESULT_ERROR));
        assert!(ordered[2].outcome.is_success());
    }

    #[test]
    fn duplicate_rows_each_get_their_own_result() {
        let template = get_template(TemplateId::Generic);
        let records = vec![record("A", "a"), record("A", "b")];
        let id_map: HashMap<String, usize> = assign_custom_ids(&records)
            .into_iter()
            .enumerate()
            .map(|(index, key)| (key, index))
            .collect();

        let artifact = [
            chat_line("A", json!({ "exam_type": "CT" })),
            chat_line("A__2", json!({ "exam_type": "MRI" })),
        ]
        .join("\n");

        let ordered = order_outcomes(
            records.clone(),
            parse_batch_results(&records, &id_map, artifact.as_bytes(), &template),
        );
        let first = ordered[0].outcome.extraction().unwrap();
        let second = ordered[1].outcome.extraction().unwrap();
        assert_eq!(first.get("exam_type"), Some(&json!("CT")));
        assert_eq!(second.get("exam_type"), Some(&json!("MRI")));
    }

    #[test]
    fn error_lines_and_junk_are_handled_per_record() {
        let template = get_template(TemplateId::Generic);
        let records = vec![record("1", "a"), record("2", "b"), record("3", "c")];
        let id_map: HashMap<String, usize> = assign_custom_ids(&records)
            .into_iter()
            .enumerate()
            .map(|(index, key)| (key, index))
            .collect();

        let artifact = [
            json!({ "custom_id": "1", "error": { "message": "refused" } }).to_string(),
            "{ this is not json".to_string(),
            json!({ "custom_id": "ghost", "response": null }).to_string(),
            chat_line("3", json!({ "exam_type": "CT" })),
        ]
        .join("\n");

        let unordered = parse_batch_results(&records, &id_map, artifact.as_bytes(), &template);
        assert_eq!(unordered.len(), 2);
        let ordered = order_outcomes(records, unordered);
        assert!(
            ordered[0]
                .outcome
                .error_text()
                .unwrap()
                .contains("refused")
        );
        assert_eq!(ordered[1].outcome.error_text(), Some(MISSING_RESULT_ERROR));
        assert!(ordered[2].outcome.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_survives_lagging_output_file_id_and_flaky_download() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let template = get_template(TemplateId::Generic);
        let records = vec![record("1", "x"), record("2", "y"), record("3", "z")];

        let artifact = [
            chat_line("1", json!({ "exam_type": "CT" })),
            chat_line("2", json!({ "exam_type": "MRI" })),
            chat_line("3", json!({ "exam_type": "US" })),
        ]
        .join("\n");

        let client = ScriptedBatch {
            upload: json!({ "data": { "id": "file_7" } }),
            created: job(BatchStatus::Queued, None),
            statuses: Mutex::new(vec![
                job(BatchStatus::Queued, None),
                job(BatchStatus::InProgress, None),
                // Completed, but the result file id lags behind.
                job(BatchStatus::Completed, None),
                job(BatchStatus::Completed, None),
                job(BatchStatus::Completed, Some("file_out")),
            ]),
            downloads: Mutex::new(vec![
                Err(anyhow!("File download failed with status 404")),
                Ok(artifact.into_bytes()),
            ]),
        };

        let report = run_batch(
            &client,
            &config,
            &template,
            records,
            dir.path(),
            Duration::from_secs(15),
        )
        .await
        .unwrap();

        assert_eq!(report.batch_id, "batch_1");
        assert_eq!(report.status, BatchStatus::Completed);
        let outcomes = report.outcomes.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|entry| entry.outcome.is_success()));
        assert_eq!(
            outcomes[1].outcome.extraction().unwrap().get("exam_type"),
            Some(&json!("MRI"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_surface_status_without_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let template = get_template(TemplateId::Generic);

        let client = ScriptedBatch {
            upload: json!({ "id": "file_7" }),
            created: job(BatchStatus::Queued, None),
            statuses: Mutex::new(vec![
                job(BatchStatus::InProgress, None),
                job(BatchStatus::Failed, None),
            ]),
            downloads: Mutex::new(vec![]),
        };

        let report = run_batch(
            &client,
            &config,
            &template,
            vec![record("1", "x")],
            dir.path(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(report.status, BatchStatus::Failed);
        assert!(report.outcomes.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_mode_requires_a_batch_capable_provider() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::parse_from([
            "report_extractor",
            "--input",
            "unused.csv",
            "--provider",
            "deepseek",
        ]);
        let config = AppConfig::resolve(&args);
        let template = get_template(TemplateId::Generic);

        let client = ScriptedBatch {
            upload: json!({}),
            created: job(BatchStatus::Queued, None),
            statuses: Mutex::new(vec![job(BatchStatus::Queued, None)]),
            downloads: Mutex::new(vec![]),
        };

        let err = run_batch(
            &client,
            &config,
            &template,
            vec![record("1", "x")],
            dir.path(),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
