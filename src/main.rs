mod aggregate;
mod args;
mod batch;
mod client;
mod common;
mod config;
mod constants;
mod convert;
mod dispatch;
mod limiter;
mod output;
mod provider;
mod reader;
mod retry;
mod schema;
mod template;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use aggregate::order_outcomes;
use args::{Args, Mode};
use batch::run_batch;
use client::HttpLlmClient;
use common::truncate_for_log;
use config::AppConfig;
use constants::DEFAULT_REQUEST_DIR;
use convert::{FinetuneSpec, csv_to_finetune_jsonl, default_finetune_output};
use dispatch::process_records;
use output::{print_summary, resolve_output_dir, write_outputs};
use reader::{ColumnSpec, Record, read_csv_records, split_column_list};
use template::{ExtractionTemplate, get_template};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.text_col.is_some() && args.text_cols.is_some() {
        bail!("--text-col and --text-cols are mutually exclusive");
    }

    match args.mode {
        Mode::Sync => run_sync_mode(&args).await,
        Mode::Batch => run_batch_mode(&args).await,
        Mode::Finetune => run_finetune_mode(&args),
    }
}

struct RunSetup {
    config: AppConfig,
    template: ExtractionTemplate,
    records: Vec<Record>,
    output_dir: PathBuf,
}

fn prepare_run(args: &Args) -> Result<RunSetup> {
    let config = AppConfig::resolve(args);
    let template = get_template(config.template_id);
    let spec = ColumnSpec {
        text_col: args.text_col.as_deref(),
        text_cols: args.text_cols.as_deref(),
        id_col: args.id_col.as_deref(),
    };
    let records = read_csv_records(&args.input, &config, &spec, args.limit)?;
    if records.is_empty() {
        bail!(
            "No records read from {}; check the CSV and the column flags",
            args.input.display()
        );
    }
    let output_dir = resolve_output_dir(args.out.clone(), &args.input);
    Ok(RunSetup {
        config,
        template,
        records,
        output_dir,
    })
}

fn print_dry_run(setup: &RunSetup) {
    println!(
        "Template {}: {}",
        setup.template.id, setup.template.description
    );
    for field in &setup.template.fields {
        println!("  {} ({})", field.name, field.display_name);
    }
    println!(
        "Read {} records; output would go to {}",
        setup.records.len(),
        setup.output_dir.display()
    );
    for record in setup.records.iter().take(5) {
        println!("  {}: {}", record.id, truncate_for_log(&record.text));
    }
}

async fn run_sync_mode(args: &Args) -> Result<()> {
    let setup = prepare_run(args)?;
    if args.dry_run {
        print_dry_run(&setup);
        return Ok(());
    }
    let client = HttpLlmClient::new(&setup.config)?;
    println!(
        "Processing {} records in sync mode (concurrency={}, rpm={}, model={})",
        setup.records.len(),
        setup.config.rate.concurrency,
        setup.config.rate.rpm,
        setup.config.model
    );

    let unordered = process_records(&client, &setup.config, &setup.template, &setup.records).await;
    let outcomes = order_outcomes(setup.records, unordered);
    write_outputs(&outcomes, &setup.output_dir, &setup.template)?;
    print_summary(&outcomes, &setup.output_dir);
    Ok(())
}

async fn run_batch_mode(args: &Args) -> Result<()> {
    let setup = prepare_run(args)?;
    if args.dry_run {
        print_dry_run(&setup);
        return Ok(());
    }
    let client = HttpLlmClient::new(&setup.config)?;
    let request_dir = args
        .request_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REQUEST_DIR));

    let report = run_batch(
        &client,
        &setup.config,
        &setup.template,
        setup.records,
        &request_dir,
        Duration::from_secs_f64(args.poll_interval),
    )
    .await?;

    match report.outcomes {
        Some(outcomes) => {
            write_outputs(&outcomes, &setup.output_dir, &setup.template)?;
            print_summary(&outcomes, &setup.output_dir);
            Ok(())
        }
        None => bail!(
            "Batch job {} ended with status {} and produced no results",
            report.batch_id,
            report.status
        ),
    }
}

fn run_finetune_mode(args: &Args) -> Result<()> {
    if args.assistant_col.is_some() && args.assistant_cols.is_some() {
        bail!("--assistant-col and --assistant-cols are mutually exclusive");
    }
    let config = AppConfig::resolve(args);
    let template = get_template(config.template_id);

    let user_columns = if let Some(cols) = &args.text_cols {
        split_column_list(cols)
    } else if let Some(col) = &args.text_col {
        vec![col.clone()]
    } else {
        bail!("finetune mode requires --text-col or --text-cols");
    };
    let assistant_columns = if let Some(cols) = &args.assistant_cols {
        split_column_list(cols)
    } else if let Some(col) = &args.assistant_col {
        vec![col.clone()]
    } else {
        Vec::new()
    };

    let output_path = match &args.out {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed creating output dir {}", dir.display()))?;
            let stem = args
                .input
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("finetune");
            dir.join(format!("{stem}.jsonl"))
        }
        None => default_finetune_output(&args.input),
    };

    let spec = FinetuneSpec {
        system_prompt: args
            .system
            .clone()
            .unwrap_or_else(|| template.system_prompt()),
        user_columns,
        assistant_columns,
    };
    let (written, skipped) = csv_to_finetune_jsonl(&args.input, &output_path, &spec)?;
    println!(
        "Wrote {written} fine-tune lines to {} ({skipped} empty rows skipped)",
        output_path.display()
    );
    Ok(())
}
