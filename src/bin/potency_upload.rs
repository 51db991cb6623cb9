use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::error;
use tracing_subscriber::EnvFilter;

use potency_upload::app::{App, PublishOptions};
use potency_upload::audit::JsonDirAuditSink;
use potency_upload::config::Settings;
use potency_upload::error::UploadError;
use potency_upload::output::{JsonOutput, OutputMode, print_outcome, render_preview};
use potency_upload::qbench::QBenchHttpClient;
use potency_upload::workbook::parse_workbook;
use potency_upload::worker::{WorkerMessage, failure_message, spawn_publish};

#[derive(Parser)]
#[command(name = "potency-upload")]
#[command(about = "Upload potency workbook results to QBench worksheets")]
#[command(version)]
struct Cli {
    #[arg(long, global = true, help = "Print machine-readable JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Parse a workbook and show what would be uploaded")]
    Preview(PreviewArgs),
    #[command(about = "Reconcile a workbook against QBench and upload results")]
    Upload(UploadArgs),
}

#[derive(Args)]
struct PreviewArgs {
    workbook: PathBuf,
}

#[derive(Args)]
struct UploadArgs {
    workbook: PathBuf,

    #[arg(long, help = "Run every check but send nothing to QBench")]
    dry_run: bool,

    #[arg(long, help = "Overwrite worksheet fields that already hold data")]
    force: bool,

    #[arg(long, help = "Do not write the audit record")]
    no_audit: bool,

    #[arg(long)]
    created_by: Option<String>,

    #[arg(long)]
    instrument: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<UploadError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &UploadError) -> u8 {
    match error {
        UploadError::MalformedWorkbook { .. }
        | UploadError::Workbook(..)
        | UploadError::MissingSetting(_)
        | UploadError::InvalidSetting { .. } => 2,
        UploadError::QBenchHttp(_)
        | UploadError::QBenchStatus { .. }
        | UploadError::QBenchAuth(_)
        | UploadError::QBenchPayload(_) => 3,
        UploadError::Audit(_) => 4,
        UploadError::Filesystem(_) => 1,
    }
}

fn run() -> miette::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Preview(args) => run_preview(args, output_mode),
        Commands::Upload(args) => run_upload(args, output_mode),
    }
}

fn run_preview(args: PreviewArgs, output_mode: OutputMode) -> miette::Result<()> {
    let extraction = parse_workbook(&args.workbook)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_extraction(&extraction).into_diagnostic()?,
        OutputMode::Human => print!("{}", render_preview(&extraction)),
    }
    Ok(())
}

fn run_upload(args: UploadArgs, output_mode: OutputMode) -> miette::Result<()> {
    let mut settings = Settings::from_env()?;
    if args.dry_run {
        settings.dry_run = true;
    }
    if args.force {
        settings.skip_processed_tests = false;
    }

    // Malformed input must fail before any remote call or token request.
    parse_workbook(&args.workbook)?;

    let qbench = QBenchHttpClient::new(&settings)?;
    let audit = JsonDirAuditSink::new(settings.resolve_audit_dir()?);

    let mut options = PublishOptions::from_settings(&settings);
    options.record_audit = !args.no_audit;
    options.created_by = args.created_by;
    options.instrument = args.instrument;

    let app = App::new(qbench, audit, settings);
    let worker = spawn_publish(app, args.workbook, options);

    let mut result = None;
    for message in worker.messages.iter() {
        match message {
            WorkerMessage::Progress(text) => {
                if matches!(output_mode, OutputMode::Human) {
                    eprintln!("  {text}");
                }
            }
            WorkerMessage::Success(report) => {
                result = Some(Ok(report));
                break;
            }
            WorkerMessage::Failure(err) => {
                result = Some(Err(err));
                break;
            }
        }
    }
    worker.join();

    match result {
        Some(Ok(report)) => {
            match output_mode {
                OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
                OutputMode::Human => {
                    print_outcome(&report.outcome);
                    if let Some(location) = &report.audit_location {
                        println!();
                        println!("Audit record: {location}");
                    }
                }
            }
            Ok(())
        }
        Some(Err(err)) => {
            error!("{}", failure_message(&err));
            Err(err.into())
        }
        None => Err(miette::Report::msg("upload worker stopped without a result")),
    }
}
