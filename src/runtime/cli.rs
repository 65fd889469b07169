use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::adapters::config::Settings;
use crate::adapters::ingest::ingest_directory;
use crate::core::error::TriageError;
use crate::core::export::{export, write_jsonl, ExportCursor};
use crate::core::feedback::apply_feedback;
use crate::core::intake::submit_alert;
use crate::core::model::{AlertSubmission, FeedbackUpdate, RunStatus};
use crate::core::ports::ledger::LedgerPort;

use super::Services;

#[derive(Debug, Parser)]
#[command(name = "triage")]
#[command(about = "Incident triage: alert intake, investigations, review and training export")]
pub struct Cli {
    /// Settings file; defaults to ~/.triage/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Queue an alert read from a JSON file or stdin.
    Intake(IntakeArgs),
    /// Run the worker pool.
    Work(WorkArgs),
    /// Record a reviewer's verdict on a completed run.
    Feedback(FeedbackArgs),
    /// Write validated runs as JSON Lines training records.
    Export(ExportArgs),
    /// Index a directory of markdown runbooks.
    Ingest(IngestArgs),
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Debug, Args)]
pub struct IntakeArgs {
    /// JSON file with the alert; `-` or absent reads stdin.
    file: Option<PathBuf>,
    /// Treat the input as an Alertmanager webhook body.
    #[arg(long)]
    alertmanager: bool,
}

#[derive(Debug, Args)]
pub struct WorkArgs {
    /// Stop once the queue is empty instead of waiting for Ctrl-C.
    #[arg(long)]
    drain: bool,
    #[arg(long)]
    pool_size: Option<usize>,
}

#[derive(Debug, Args)]
pub struct FeedbackArgs {
    run_id: String,
    /// approved, corrected or rejected.
    status: RunStatus,
    /// Replacement conclusion; required with `corrected`.
    #[arg(long)]
    correction: Option<String>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Cursor printed by a previous export; 0 exports everything.
    #[arg(long, default_value_t = 0)]
    since: i64,
    /// Output file; stdout when absent.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Runbook directory; defaults to `ingest.runbooks_dir`.
    dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    List {
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Show {
        run_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(execute(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("error: {err}");
            if err.is_client_error() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn execute(cli: Cli) -> Result<(), TriageError> {
    let config_path = cli.config.unwrap_or_else(Settings::default_path);
    let settings = Settings::load(&config_path)?;
    let services = Services::from_settings(settings)?;

    match cli.command {
        Command::Intake(args) => intake(&services, args),
        Command::Work(args) => work(services, args).await,
        Command::Feedback(args) => {
            let run = apply_feedback(
                services.ledger.as_ref(),
                &FeedbackUpdate {
                    run_id: args.run_id,
                    new_status: args.status,
                    corrected_conclusion: args.correction,
                },
            )?;
            print_json(&run.summary())
        }
        Command::Export(args) => export_dataset(&services, args),
        Command::Ingest(args) => {
            let dir = args
                .dir
                .unwrap_or_else(|| PathBuf::from(&services.settings.ingest.runbooks_dir));
            let embedder = services.embedder()?;
            let report = ingest_directory(
                &services.settings.knowledge_db_path(),
                &dir,
                embedder.as_ref(),
                services.settings.ingest_options(),
            )
            .await?;
            print_json(&report)
        }
        Command::Runs { command } => match command {
            RunsCommand::List { status, limit } => {
                print_json(&services.ledger.list_runs(status, limit.max(1))?)
            }
            RunsCommand::Show { run_id } => match services.ledger.get_run(&run_id)? {
                Some(run) => print_json(&run),
                None => Err(TriageError::NotFound(run_id)),
            },
        },
    }
}

fn read_input(file: Option<&Path>) -> Result<String, TriageError> {
    match file {
        Some(path) if path != Path::new("-") => Ok(std::fs::read_to_string(path)?),
        _ => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            Ok(raw)
        }
    }
}

pub(crate) fn parse_submission(raw: &str, alertmanager: bool) -> Result<AlertSubmission, TriageError> {
    let body: Value = serde_json::from_str(raw)
        .map_err(|e| TriageError::Validation(format!("alert is not valid JSON: {e}")))?;
    if alertmanager {
        return AlertSubmission::from_alertmanager(&body);
    }
    serde_json::from_value(body)
        .map_err(|e| TriageError::Validation(format!("malformed alert: {e}")))
}

fn intake(services: &Services, args: IntakeArgs) -> Result<(), TriageError> {
    let raw = read_input(args.file.as_deref())?;
    let submission = parse_submission(&raw, args.alertmanager)?;
    let job = submit_alert(services.queue.as_ref(), submission)?;
    print_json(&job)
}

async fn work(mut services: Services, args: WorkArgs) -> Result<(), TriageError> {
    if let Some(size) = args.pool_size {
        services.settings.workers.pool_size = size;
    }
    let pool = services.worker_pool()?;

    let report = if args.drain {
        pool.drain().await
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received; finishing in-flight jobs");
                let _ = shutdown_tx.send(true);
            }
        });
        pool.run(shutdown_rx).await
    };
    log::info!(
        "worker pool done: processed={} completed={} failed={}",
        report.processed,
        report.completed,
        report.failed
    );
    Ok(())
}

fn export_dataset(services: &Services, args: ExportArgs) -> Result<(), TriageError> {
    let batch = export(services.ledger.as_ref(), ExportCursor(args.since.max(0)))?;
    let written = match args.out.as_deref() {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            write_jsonl(&mut writer, &batch.examples)?
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = stdout.lock();
            write_jsonl(&mut writer, &batch.examples)?
        }
    };
    // stdout may carry the dataset itself, so the cursor goes to stderr.
    eprintln!(
        "exported {written} example(s); next cursor: {}",
        batch.next_cursor.0
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), TriageError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn feedback_arguments_parse_status_loosely() {
        let cli = Cli::try_parse_from([
            "triage",
            "--config",
            "/tmp/triage.toml",
            "feedback",
            "job-1",
            "Corrected",
            "--correction",
            "OOM due to leak",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/triage.toml")));
        match cli.command {
            Command::Feedback(args) => {
                assert_eq!(args.run_id, "job-1");
                assert_eq!(args.status, RunStatus::Corrected);
                assert_eq!(args.correction.as_deref(), Some("OOM due to leak"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["triage", "feedback", "job-1", "done"]).is_err());
    }

    #[test]
    fn runs_and_export_subcommands_parse() {
        let cli = Cli::try_parse_from(["triage", "runs", "list", "--status", "completed"])
            .expect("parse list");
        assert!(matches!(
            cli.command,
            Command::Runs {
                command: RunsCommand::List {
                    status: Some(RunStatus::Completed),
                    limit: 50
                }
            }
        ));
        let cli = Cli::try_parse_from(["triage", "export", "--since", "7"]).expect("parse export");
        assert!(matches!(cli.command, Command::Export(ExportArgs { since: 7, out: None })));
    }

    #[test]
    fn submissions_parse_from_plain_and_alertmanager_bodies() {
        let plain = parse_submission(
            r#"{"source":"prometheus","severity":"critical","fingerprint":"cpu-high-podA","payload":{"pod":"podA"}}"#,
            false,
        )
        .expect("plain");
        assert_eq!(plain.fingerprint, "cpu-high-podA");

        let grouped = parse_submission(
            r#"{"alerts":[{"labels":{"alertname":"HighCPU","severity":"warning"},"fingerprint":"f1"}]}"#,
            true,
        )
        .expect("alertmanager");
        assert_eq!(grouped.severity, "warning");

        let err = parse_submission("{not json", false).expect_err("invalid");
        assert!(err.is_client_error());
        let err = parse_submission(r#"{"source":"x"}"#, false).expect_err("missing fields");
        assert!(err.is_client_error());
    }
}
