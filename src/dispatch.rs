use anyhow::Result;
use futures::{StreamExt, stream::FuturesUnordered};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

use crate::aggregate::Outcome;
use crate::client::{ChatMessage, LlmApi};
use crate::config::AppConfig;
use crate::limiter::RateLimiter;
use crate::reader::Record;
use crate::retry::RetryPolicy;
use crate::schema::extraction_from_chat_payload;
use crate::template::ExtractionTemplate;

/// Runs one rate-limited, retried chat call per record with at most
/// `concurrency` in flight, and returns one `(input_index, Outcome)` pair
/// per record. Completion order is arbitrary; the aggregator restores
/// input order.
pub async fn process_records<T: LlmApi>(
    client: &T,
    config: &AppConfig,
    template: &ExtractionTemplate,
    records: &[Record],
) -> Vec<(usize, Outcome)> {
    let limiter = RateLimiter::new(config.rate.rpm);
    let policy = RetryPolicy::new(config.rate.max_retries, config.rate.retry_backoff);
    let system_prompt = template.system_prompt();
    let concurrency = config.rate.concurrency.max(1);

    let progress = ProgressBar::new(records.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [extract {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
    progress.set_message("starting extraction");

    let mut queue = records.iter().enumerate();
    let mut in_flight = FuturesUnordered::new();

    for _ in 0..concurrency {
        if let Some((index, record)) = queue.next() {
            in_flight.push(extract_record(
                index,
                record,
                client,
                &limiter,
                &policy,
                &system_prompt,
                template,
            ));
        }
    }

    let mut outcomes = Vec::with_capacity(records.len());
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    while let Some((index, outcome)) = in_flight.next().await {
        if outcome.is_success() {
            succeeded += 1;
        } else {
            failed += 1;
        }
        outcomes.push((index, outcome));
        progress.inc(1);
        progress.set_message(format!("ok={succeeded} failed={failed}"));

        if let Some((next_index, record)) = queue.next() {
            in_flight.push(extract_record(
                next_index,
                record,
                client,
                &limiter,
                &policy,
                &system_prompt,
                template,
            ));
        }
    }

    progress.finish_with_message(format!("done: ok={succeeded} failed={failed}"));
    outcomes
}

async fn extract_record<T: LlmApi>(
    index: usize,
    record: &Record,
    client: &T,
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    system_prompt: &str,
    template: &ExtractionTemplate,
) -> (usize, Outcome) {
    match try_extract(record, client, limiter, policy, system_prompt, template).await {
        Ok(extraction) => (index, Outcome::Success(extraction)),
        Err(err) => (index, Outcome::Failure(format!("{err:#}"))),
    }
}

async fn try_extract<T: LlmApi>(
    record: &Record,
    client: &T,
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    system_prompt: &str,
    template: &ExtractionTemplate,
) -> Result<crate::schema::Extraction> {
    let messages = [
        ChatMessage::system(system_prompt),
        ChatMessage::user(&record.text),
    ];
    let response = policy
        .run(limiter, || {
            client.chat_completion(&messages, Some(json!({ "type": "json_object" })))
        })
        .await?;
    extraction_from_chat_payload(&response, &record.id, template)
}
