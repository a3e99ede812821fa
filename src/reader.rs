use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::path::Path;

use crate::common::truncate_chars;
use crate::config::AppConfig;

/// One unit of work: a report text plus its identity and the source row it
/// came from. Immutable after read time.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    pub text: String,
    pub row_data: BTreeMap<String, String>,
}

/// Column selection for the record source. Explicit flags win over
/// auto-detection.
#[derive(Debug, Default, Clone)]
pub struct ColumnSpec<'a> {
    pub text_col: Option<&'a str>,
    pub text_cols: Option<&'a str>,
    pub id_col: Option<&'a str>,
}

fn auto_detect_column<'a>(
    columns: &'a [String],
    candidates: &[String],
    keywords: &[&str],
) -> Option<&'a str> {
    for candidate in candidates {
        if let Some(found) = columns.iter().find(|col| *col == candidate) {
            return Some(found);
        }
    }
    columns
        .iter()
        .find(|col| {
            let lower = col.to_lowercase();
            keywords.iter().all(|keyword| lower.contains(keyword))
        })
        .map(String::as_str)
}

pub fn split_column_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|col| !col.is_empty())
        .map(str::to_string)
        .collect()
}

/// Merges one or more cell values into the prompt payload. With multiple
/// source columns each non-empty cell is labeled with its column name so
/// the model can tell the sections apart.
pub fn merge_text_columns(
    row: &BTreeMap<String, String>,
    columns: &[String],
    add_label: bool,
) -> String {
    let mut parts = Vec::new();
    for column in columns {
        let value = row.get(column).map(String::as_str).unwrap_or("").trim();
        if value.is_empty() {
            continue;
        }
        if columns.len() > 1 && add_label {
            parts.push(format!("[{column}]\n{value}"));
        } else {
            parts.push(value.to_string());
        }
    }
    parts.join("\n\n")
}

pub fn read_csv_records(
    path: &Path,
    config: &AppConfig,
    spec: &ColumnSpec<'_>,
    limit: Option<usize>,
) -> Result<Vec<Record>> {
    if !path.exists() {
        bail!("Input file not found at {}", path.display());
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed opening input CSV {}", path.display()))?;
    let columns: Vec<String> = reader
        .headers()
        .context("Failed reading CSV header")?
        .iter()
        .map(str::to_string)
        .collect();
    if columns.is_empty() {
        bail!("Input CSV {} has no header row", path.display());
    }

    let text_columns: Vec<String> = if let Some(cols) = spec.text_cols {
        let requested = split_column_list(cols);
        let missing: Vec<_> = requested
            .iter()
            .filter(|col| !columns.contains(col))
            .cloned()
            .collect();
        if !missing.is_empty() {
            bail!(
                "Text columns {:?} not found. Available columns: {:?}",
                missing,
                columns
            );
        }
        requested
    } else if let Some(col) = spec.text_col {
        if !columns.iter().any(|c| c == col) {
            bail!("Column '{col}' not found. Available columns: {:?}", columns);
        }
        vec![col.to_string()]
    } else {
        let detected = auto_detect_column(
            &columns,
            &config.source.text_column_candidates,
            &["finding"],
        )
        .with_context(|| {
            format!(
                "Could not auto-detect a report text column in {:?}; pass --text-col or --text-cols",
                columns
            )
        })?;
        vec![detected.to_string()]
    };

    let id_column: String = match spec.id_col {
        Some(col) => col.to_string(),
        None => auto_detect_column(&columns, &config.source.id_column_candidates, &["id"])
            .unwrap_or(&columns[0])
            .to_string(),
    };

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.context("Failed reading CSV row")?;
        let row_data: BTreeMap<String, String> = columns
            .iter()
            .cloned()
            .zip(row.iter().map(str::to_string))
            .collect();

        let text = merge_text_columns(&row_data, &text_columns, true);
        if text.is_empty() {
            continue;
        }
        let text = truncate_chars(&text, config.source.max_chars);

        let id_value = row_data
            .get(&id_column)
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        let id = if id_value.is_empty() {
            format!("row_{}", records.len() + 1)
        } else {
            id_value
        };

        records.push(Record { id, text, row_data });
        if limit.is_some_and(|limit| records.len() >= limit) {
            break;
        }
    }
    Ok(records)
}
