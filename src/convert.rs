use anyhow::{Context, Result, bail};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::reader::merge_text_columns;

/// Column selection for the fine-tune converter: user turns come from one
/// or more source columns, assistant turns are optional (present for
/// supervised sets, absent for prompt-only sets).
#[derive(Debug, Clone)]
pub struct FinetuneSpec {
    pub system_prompt: String,
    pub user_columns: Vec<String>,
    pub assistant_columns: Vec<String>,
}

/// Converts a CSV into a chat-format fine-tune dataset, one
/// `{"messages": [...]}` line per row. Rows with empty user content are
/// skipped. Returns (written, skipped).
pub fn csv_to_finetune_jsonl(
    input_csv: &Path,
    output_jsonl: &Path,
    spec: &FinetuneSpec,
) -> Result<(usize, usize)> {
    if !input_csv.exists() {
        bail!("Input file not found at {}", input_csv.display());
    }
    let mut reader = csv::Reader::from_path(input_csv)
        .with_context(|| format!("Failed opening input CSV {}", input_csv.display()))?;
    let columns: Vec<String> = reader
        .headers()
        .context("Failed reading CSV header")?
        .iter()
        .map(str::to_string)
        .collect();

    for (label, requested) in [
        ("user", &spec.user_columns),
        ("assistant", &spec.assistant_columns),
    ] {
        let missing: Vec<_> = requested
            .iter()
            .filter(|col| !columns.contains(col))
            .cloned()
            .collect();
        if !missing.is_empty() {
            bail!(
                "{label} columns {:?} not found. Available columns: {:?}",
                missing,
                columns
            );
        }
    }

    let file = File::create(output_jsonl)
        .with_context(|| format!("Failed creating {}", output_jsonl.display()))?;
    let mut writer = BufWriter::new(file);

    let mut written = 0usize;
    let mut skipped = 0usize;
    for row in reader.records() {
        let row = row.context("Failed reading CSV row")?;
        let row_data: BTreeMap<String, String> = columns
            .iter()
            .cloned()
            .zip(row.iter().map(str::to_string))
            .collect();

        let user_content = merge_text_columns(&row_data, &spec.user_columns, true);
        if user_content.is_empty() {
            skipped += 1;
            continue;
        }

        let mut messages = vec![
            json!({ "role": "system", "content": spec.system_prompt }),
            json!({ "role": "user", "content": user_content }),
        ];
        if !spec.assistant_columns.is_empty() {
            let assistant_content = merge_text_columns(&row_data, &spec.assistant_columns, false);
            if !assistant_content.is_empty() {
                messages.push(json!({ "role": "assistant", "content": assistant_content }));
            }
        }

        let line = serde_json::to_string(&json!({ "messages": messages }))
            .context("Failed encoding fine-tune line")?;
        writeln!(writer, "{line}")
            .with_context(|| format!("Failed writing {}", output_jsonl.display()))?;
        written += 1;
    }
    writer
        .flush()
        .with_context(|| format!("Failed flushing {}", output_jsonl.display()))?;
    Ok((written, skipped))
}

/// Default output path: the input with a .jsonl extension.
pub fn default_finetune_output(input_csv: &Path) -> PathBuf {
    input_csv.with_extension("jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::fs;

    fn spec(user: &[&str], assistant: &[&str]) -> FinetuneSpec {
        FinetuneSpec {
            system_prompt: "You are a medical report analysis assistant.".to_string(),
            user_columns: user.iter().map(|col| col.to_string()).collect(),
            assistant_columns: assistant.iter().map(|col| col.to_string()).collect(),
        }
    }

    #[test]
    fn builds_supervised_chat_lines_and_skips_empty_rows() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("train.csv");
        fs::write(
            &input,
            "findings,conclusion,labels\nkidney mass,suspicious,M1\n,,\nnormal,clear,M0\n",
        )
        .unwrap();
        let output = dir.path().join("train.jsonl");

        let (written, skipped) = csv_to_finetune_jsonl(
            &input,
            &output,
            &spec(&["findings", "conclusion"], &["labels"]),
        )
        .unwrap();
        assert_eq!((written, skipped), (2, 1));

        let lines: Vec<Value> = fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let messages = &lines[0]["messages"];
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(
            messages[1]["content"],
            "[findings]\nkidney mass\n\n[conclusion]\nsuspicious"
        );
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], "M1");
    }

    #[test]
    fn missing_columns_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("train.csv");
        fs::write(&input, "findings\ntext\n").unwrap();
        let output = dir.path().join("train.jsonl");

        let err = csv_to_finetune_jsonl(&input, &output, &spec(&["nope"], &[])).unwrap_err();
        assert!(err.to_string().contains("user columns"));
    }

    #[test]
    fn default_output_swaps_extension() {
        assert_eq!(
            default_finetune_output(Path::new("data/train.csv")),
            PathBuf::from("data/train.jsonl")
        );
    }
}
