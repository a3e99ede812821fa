use anyhow::{Context, Result};
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::aggregate::{RecordOutcome, count_successes};
use crate::common::{now_unix_seconds, truncate_for_log};
use crate::constants::{CSV_OUTPUT_FILE_NAME, DEFAULT_OUTPUT_DIR, JSONL_OUTPUT_FILE_NAME};
use crate::schema::Extraction;
use crate::template::ExtractionTemplate;

const ERROR_SAMPLE_CAP: usize = 20;

/// Where a run writes its artifacts. An explicit directory is used as-is
/// unless it already exists (never clobber a previous run); otherwise a
/// fresh `outputs/<input-stem>_<unix-seconds>` directory is derived.
pub fn resolve_output_dir(requested: Option<PathBuf>, input_path: &Path) -> PathBuf {
    let stamp = now_unix_seconds();
    match requested {
        Some(dir) if dir.exists() => {
            let name = dir
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(DEFAULT_OUTPUT_DIR);
            let stamped = format!("{name}_{stamp}");
            match dir.parent() {
                Some(parent) => parent.join(stamped),
                None => PathBuf::from(stamped),
            }
        }
        Some(dir) => dir,
        None => {
            let stem = input_path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("extractions");
            PathBuf::from(DEFAULT_OUTPUT_DIR).join(format!("{stem}_{stamp}"))
        }
    }
}

/// Writes both run artifacts in input order: the JSONL with full record
/// context and the tabular CSV with one column per template field.
pub fn write_outputs(
    outcomes: &[RecordOutcome],
    output_dir: &Path,
    template: &ExtractionTemplate,
) -> Result<()> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed creating output dir {}", output_dir.display()))?;
    let jsonl_path = output_dir.join(JSONL_OUTPUT_FILE_NAME);
    let csv_path = output_dir.join(CSV_OUTPUT_FILE_NAME);

    let jsonl_file = File::create(&jsonl_path)
        .with_context(|| format!("Failed creating {}", jsonl_path.display()))?;
    let mut jsonl = BufWriter::new(jsonl_file);

    let mut writer = csv::Writer::from_path(&csv_path)
        .with_context(|| format!("Failed creating {}", csv_path.display()))?;
    let mut header = vec!["id".to_string()];
    header.extend(template.field_names().iter().map(|name| name.to_string()));
    header.push("error".to_string());
    writer
        .write_record(&header)
        .context("Failed writing extraction CSV header")?;

    for entry in outcomes {
        let extraction = entry.outcome.extraction();
        let error = entry.outcome.error_text();

        let line = json!({
            "id": entry.record.id,
            "raw_text": entry.record.text,
            "extraction": extraction.map(Extraction::to_json),
            "error": error,
        });
        writeln!(jsonl, "{line}")
            .with_context(|| format!("Failed writing {}", jsonl_path.display()))?;

        let mut row = vec![entry.record.id.clone()];
        match extraction {
            Some(extraction) => row.extend(extraction.flatten_for_csv(template)),
            None => row.extend((0..template.fields.len()).map(|_| String::new())),
        }
        row.push(error.unwrap_or_default().to_string());
        writer
            .write_record(&row)
            .context("Failed writing extraction CSV row")?;
    }

    jsonl
        .flush()
        .with_context(|| format!("Failed flushing {}", jsonl_path.display()))?;
    writer.flush().context("Failed flushing extraction CSV")?;
    Ok(())
}

/// Operator summary: totals plus a capped sample of per-record errors.
pub fn print_summary(outcomes: &[RecordOutcome], output_dir: &Path) {
    let total = outcomes.len();
    let succeeded = count_successes(outcomes);
    println!(
        "Processed {total} records: {succeeded} succeeded, {} failed. Results in {}",
        total - succeeded,
        output_dir.display()
    );

    let errors: Vec<(&str, &str)> = outcomes
        .iter()
        .filter_map(|entry| {
            entry
                .outcome
                .error_text()
                .map(|error| (entry.record.id.as_str(), error))
        })
        .collect();
    for (id, error) in errors.iter().take(ERROR_SAMPLE_CAP) {
        println!("  {id}: {}", truncate_for_log(error));
    }
    if errors.len() > ERROR_SAMPLE_CAP {
        println!("  ... and {} more errors", errors.len() - ERROR_SAMPLE_CAP);
    }
}
