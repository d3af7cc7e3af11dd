//! Sheetflow - workbook migration tool

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use sheetflow_common::logging::{init_logging, LogConfig, LogLevel};
use sheetflow_core::reader::WorkbookContainer;
use sheetflow_core::{FieldValue, ProcessingConfig, RecordSetWriter, StreamingRowProcessor};
use sheetflow_migrate::memory::{InMemoryMasterStore, InMemoryStagingStore};
use sheetflow_migrate::{
    AsyncJobRunner, JobState, MasterStore, MigrationPipeline, MigrationPlan, PipelineConfig,
    StagingStore,
};

#[derive(Parser, Debug)]
#[command(name = "sheetflow")]
#[command(author, version, about = "Streaming workbook migration tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate a workbook per a migration plan
    Run {
        /// Workbook to migrate
        workbook: PathBuf,

        /// Migration plan (JSON)
        #[arg(short, long)]
        plan: PathBuf,

        /// Records per batch
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,

        /// Sheets processed concurrently
        #[arg(long, default_value_t = 2)]
        parallelism: usize,

        /// Abort a sheet after this many row errors
        #[arg(long)]
        max_errors: Option<u64>,

        /// Stop remaining sheets when one fails
        #[arg(long)]
        stop_on_sheet_failure: bool,

        /// Postgres connection string for durable staging and master stores.
        /// Requires a build with the `database` feature; in-memory stores
        /// are used when omitted.
        #[arg(long, env = "SHEETFLOW_DATABASE_URL")]
        database_url: Option<String>,
    },

    /// List the sheets of a workbook
    Sheets {
        workbook: PathBuf,
    },

    /// Re-export one sheet, typed per the plan, to xlsx or delimited text
    Convert {
        /// Workbook to read
        workbook: PathBuf,

        /// Migration plan naming the sheet's columns
        #[arg(short, long)]
        plan: PathBuf,

        /// Sheet to convert (defaults to the plan's first sheet)
        #[arg(long)]
        sheet: Option<String>,

        /// Output path
        #[arg(short, long)]
        output: PathBuf,

        /// Prefer delimited text over a workbook for large data
        #[arg(long)]
        prefer_csv: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("sheetflow".to_string())
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    match cli.command {
        Command::Run {
            workbook,
            plan,
            batch_size,
            parallelism,
            max_errors,
            stop_on_sheet_failure,
            database_url,
        } => {
            run_migration(
                workbook,
                plan,
                batch_size,
                parallelism,
                max_errors,
                stop_on_sheet_failure,
                database_url,
            )
            .await?;
        },
        Command::Sheets { workbook } => {
            list_sheets(&workbook)?;
        },
        Command::Convert {
            workbook,
            plan,
            sheet,
            output,
            prefer_csv,
        } => {
            convert_sheet(&workbook, &plan, sheet.as_deref(), &output, prefer_csv)?;
        },
    }

    Ok(())
}

async fn run_migration(
    workbook: PathBuf,
    plan_path: PathBuf,
    batch_size: usize,
    parallelism: usize,
    max_errors: Option<u64>,
    stop_on_sheet_failure: bool,
    database_url: Option<String>,
) -> Result<()> {
    let plan = MigrationPlan::from_path(&plan_path)?;

    let mut processing = ProcessingConfig::builder()
        .batch_size(batch_size)
        .sheet_parallelism(parallelism);
    if let Some(max) = max_errors {
        processing = processing.max_errors_before_abort(max);
    }
    let config = PipelineConfig {
        processing: processing.build(),
        continue_on_sheet_failure: !stop_on_sheet_failure,
        ..PipelineConfig::default()
    };

    let (staging, master) = build_stores(database_url).await?;
    let runner = AsyncJobRunner::new(MigrationPipeline::new(staging, master, config));

    info!(workbook = %workbook.display(), "starting migration");
    let job_id = runner.submit(workbook, plan);

    let ctrl_c_runner = Arc::clone(&runner);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(%job_id, "interrupt received, cancelling job");
            ctrl_c_runner.cancel(job_id);
        }
    });

    let progress_runner = Arc::clone(&runner);
    let progress = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            ticker.tick().await;
            match progress_runner.status(job_id) {
                Some(record) if record.state.is_terminal() => break,
                Some(record) => {
                    for sheet in &record.sheets {
                        info!(
                            sheet = %sheet.sheet,
                            state = sheet.state.as_str(),
                            processed = sheet.processed,
                            errors = sheet.errors,
                            "progress"
                        );
                    }
                }
                None => {}
            }
        }
    });

    let result = runner.wait(job_id).await?;
    progress.abort();

    println!("{}", result.summary());
    match result.state {
        JobState::Failed => bail!("migration failed"),
        JobState::Cancelled => bail!("migration cancelled"),
        _ => Ok(()),
    }
}

fn in_memory_stores() -> (Arc<dyn StagingStore>, Arc<dyn MasterStore>) {
    (
        Arc::new(InMemoryStagingStore::new()),
        Arc::new(InMemoryMasterStore::new()),
    )
}

#[cfg(feature = "database")]
async fn build_stores(
    database_url: Option<String>,
) -> Result<(Arc<dyn StagingStore>, Arc<dyn MasterStore>)> {
    use sheetflow_migrate::postgres::{PgMasterStore, PgStagingStore};

    let Some(url) = database_url else {
        return Ok(in_memory_stores());
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .context("connecting to the database")?;
    let staging = PgStagingStore::new(pool.clone());
    staging.ensure_schema().await?;
    Ok((Arc::new(staging), Arc::new(PgMasterStore::new(pool))))
}

#[cfg(not(feature = "database"))]
async fn build_stores(
    database_url: Option<String>,
) -> Result<(Arc<dyn StagingStore>, Arc<dyn MasterStore>)> {
    if database_url.is_some() {
        bail!("this build has no database support; rebuild with `--features database`");
    }
    Ok(in_memory_stores())
}

fn list_sheets(workbook: &PathBuf) -> Result<()> {
    let file = std::fs::File::open(workbook)
        .with_context(|| format!("opening {}", workbook.display()))?;
    let container = WorkbookContainer::open(std::io::BufReader::new(file))?;
    for name in container.sheet_names() {
        println!("{name}");
    }
    Ok(())
}

fn convert_sheet(
    workbook: &PathBuf,
    plan_path: &PathBuf,
    sheet: Option<&str>,
    output: &PathBuf,
    prefer_csv: bool,
) -> Result<()> {
    let plan = MigrationPlan::from_path(plan_path)?;
    let sheet_plan = match sheet {
        Some(name) => plan
            .sheets
            .iter()
            .find(|s| s.sheet == name)
            .with_context(|| format!("sheet '{name}' is not in the plan"))?,
        None => &plan.sheets[0],
    };
    let descriptor = sheet_plan.descriptor()?;

    let fields: Vec<String> = descriptor
        .bindings()
        .iter()
        .map(|b| b.field.clone())
        .collect();

    let config = ProcessingConfig::builder()
        .prefer_csv_for_large_data(prefer_csv)
        .build();
    let processor = StreamingRowProcessor::new(&config);
    let file = std::fs::File::open(workbook)
        .with_context(|| format!("opening {}", workbook.display()))?;

    // Batches go straight into the writer, so conversion never holds more
    // than one batch of rows no matter how large the sheet is
    let mut writer = RecordSetWriter::create(output, &sheet_plan.sheet, fields.clone(), &config);
    let mut exported = 0u64;
    processor.process_dynamic_with(
        std::io::BufReader::new(file),
        Some(sheet_plan.sheet.as_str()),
        descriptor,
        None,
        |batch| {
            let rows: Vec<Vec<FieldValue>> = batch
                .records()
                .iter()
                .map(|record| {
                    fields
                        .iter()
                        .map(|f| record.get(f).cloned().unwrap_or(FieldValue::Empty))
                        .collect()
                })
                .collect();
            exported += rows.len() as u64;
            writer.push_batch(&rows)?;
            Ok(())
        },
        |failure| {
            warn!(row = failure.row, rule = %failure.rule, "skipping unconvertible row");
        },
    )?;

    let used = writer.finish()?;
    info!(
        output = %output.display(),
        strategy = used,
        rows = exported,
        "sheet converted"
    );
    Ok(())
}
