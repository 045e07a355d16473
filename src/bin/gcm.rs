use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use grid_campaign_manager::app::{
    App, DownloadOptions, Operation, ProgressSink, StatusOptions, TaskRequest,
};
use grid_campaign_manager::catalog::{CatalogClient, CatalogEntry, RucioCliClient};
use grid_campaign_manager::config::{ConfigLoader, ResolvedConfig};
use grid_campaign_manager::domain::TaskStatus;
use grid_campaign_manager::error::CampaignError;
use grid_campaign_manager::merge::{HaddMerger, MergeOptions};
use grid_campaign_manager::model::Campaign;
use grid_campaign_manager::output::{self, JsonOutput, OutputMode};
use grid_campaign_manager::reconcile::TaskCommand;
use grid_campaign_manager::store::TaskCache;
use grid_campaign_manager::tracking::{PandaHttpClient, TaskQuery, TrackingClient};
use grid_campaign_manager::tui::{LogRouter, Tui};

#[derive(Parser)]
#[command(name = "gcm")]
#[command(about = "Bookkeeping for grid production campaigns")]
#[command(version, author)]
struct Cli {
    /// Campaign config file (defaults to gcm.json in the working directory)
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Reconcile catalog and task status of every dataset")]
    Status(StatusArgs),
    #[command(about = "List the expected dataset identifiers")]
    Expected,
    #[command(about = "Download finished datasets")]
    Download(DownloadArgs),
    #[command(about = "Merge downloaded outputs with hadd")]
    Merge(MergeArgs),
    #[command(about = "Retry or kill tasks of a submitter")]
    Tasks(TasksArgs),
    #[command(about = "Summarize the campaign from the task cache, offline")]
    Summary,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    skip_tracking: bool,

    /// Task cache file (overrides the configured one)
    #[arg(long)]
    task_cache: Option<Utf8PathBuf>,

    /// Query the tracking service also for submitters without datasets
    #[arg(long)]
    all_submitters: bool,
}

#[derive(Args)]
struct DownloadArgs {
    /// Download even when the task is not reported done
    #[arg(long)]
    no_require_done: bool,

    /// Append identifiers to this file instead of downloading
    #[arg(long)]
    list_to: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct MergeArgs {
    #[arg(long)]
    no_require_downloaded: bool,

    #[arg(long)]
    overwrite: bool,
}

#[derive(Args)]
struct TasksArgs {
    #[command(subcommand)]
    action: TaskAction,
}

#[derive(Subcommand)]
enum TaskAction {
    Retry(TaskSelection),
    Kill(TaskSelection),
}

#[derive(Args)]
struct TaskSelection {
    #[arg(long)]
    submitter: String,

    #[arg(long)]
    status: String,

    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CampaignError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CampaignError) -> u8 {
    match error {
        CampaignError::MissingConfig
        | CampaignError::ConfigRead(_)
        | CampaignError::ConfigParse(_)
        | CampaignError::InvalidSampleName(_)
        | CampaignError::InvalidSubmissionDate(_)
        | CampaignError::InvalidSuffix(_)
        | CampaignError::UnknownSubmitter(_) => 2,
        error if error.is_transport() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let logs = LogRouter::default();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_ansi(output_mode == OutputMode::NonInteractive)
        .with_writer(logs.clone())
        .init();

    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    let default_cache = task_cache_for(&resolved)?;
    let tracking = PandaHttpClient::new(resolved.tracking.clone())?;
    let mut campaign = Campaign::from_config(resolved)?;
    let name = campaign.name().to_string();

    match cli.command {
        Commands::Status(args) => {
            let app = App::new(RucioCliClient::new(), tracking, HaddMerger::new());
            let options = StatusOptions {
                skip_tracking: args.skip_tracking,
                include_empty: args.all_submitters,
                task_cache: Some(args.task_cache.map(TaskCache::new).unwrap_or(default_cache)),
            };
            let result = run_operation(output_mode, &logs, Operation::Status, &name, move |sink| {
                app.status(&mut campaign, options, sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_status(&result).into_diagnostic(),
                OutputMode::Interactive => output::print_status(&result).into_diagnostic(),
            }
        }
        Commands::Expected => {
            let app = App::new(OfflineCatalog, OfflineTracking, HaddMerger::new());
            let result = run_operation(output_mode, &logs, Operation::Expected, &name, move |sink| {
                Ok(app.expected(&mut campaign, sink))
            })?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_expected(&result).into_diagnostic()
                }
                OutputMode::Interactive => {
                    for id in &result.records {
                        println!("{id}");
                    }
                    if !result.undistributed.is_empty() {
                        println!("\nExpected but not distributed to any submitter:");
                        for partial in &result.undistributed {
                            println!("  {partial}");
                        }
                    }
                    Ok(())
                }
            }
        }
        Commands::Download(args) => {
            let app = App::new(RucioCliClient::new(), OfflineTracking, HaddMerger::new());
            let options = DownloadOptions {
                require_upstream_done: !args.no_require_done,
                list_to: args.list_to,
                task_cache: Some(default_cache),
            };
            let result = run_operation(output_mode, &logs, Operation::Download, &name, move |sink| {
                app.download(&mut campaign, options, sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_download(&result).into_diagnostic()
                }
                OutputMode::Interactive => {
                    for failure in &result.failures {
                        println!("{}: {}", failure.submitter, failure.error);
                    }
                    output::print_summary(&name, &result.stats).into_diagnostic()
                }
            }
        }
        Commands::Merge(args) => {
            let app = App::new(RucioCliClient::new(), OfflineTracking, HaddMerger::new());
            let options = MergeOptions {
                require_downloaded: !args.no_require_downloaded,
                overwrite: args.overwrite,
            };
            let result = run_operation(output_mode, &logs, Operation::Merge, &name, move |sink| {
                app.merge(&mut campaign, options, Some(&default_cache), sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_merge(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    for (submitter, report) in &result.submitters {
                        println!("{submitter}: {} target files written", report.added);
                    }
                    output::print_summary(&name, &result.stats).into_diagnostic()
                }
            }
        }
        Commands::Tasks(args) => {
            let (command, selection) = match args.action {
                TaskAction::Retry(selection) => (TaskCommand::Retry, selection),
                TaskAction::Kill(selection) => (TaskCommand::Kill, selection),
            };
            let app = App::new(OfflineCatalog, tracking, HaddMerger::new());
            let request = TaskRequest {
                submitter: selection.submitter,
                status: TaskStatus::from(selection.status.as_str()),
                command,
                dry_run: selection.dry_run,
            };
            let result = run_operation(output_mode, &logs, Operation::Tasks, &name, move |sink| {
                app.tasks(&mut campaign, request, Some(&default_cache), sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_tasks(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    let report = &result.report;
                    println!(
                        "{} tasks of {} in status {}: {} selected, {} sent{}",
                        match result.command {
                            TaskCommand::Retry => "retry",
                            TaskCommand::Kill => "kill",
                        },
                        result.submitter,
                        result.status,
                        report.selected.len(),
                        report.sent.len(),
                        if report.dry_run { " (dry run)" } else { "" }
                    );
                    for (task_id, error) in &report.failures {
                        println!("  task {task_id}: {error}");
                    }
                    Ok(())
                }
            }
        }
        Commands::Summary => {
            let app = App::new(OfflineCatalog, OfflineTracking, HaddMerger::new());
            let result = run_operation(output_mode, &logs, Operation::Summary, &name, move |sink| {
                app.summary(&mut campaign, Some(&default_cache), sink)
            })?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_status(&result).into_diagnostic(),
                OutputMode::Interactive => output::print_status(&result).into_diagnostic(),
            }
        }
    }
}

fn run_operation<F, R>(
    mode: OutputMode,
    logs: &LogRouter,
    operation: Operation,
    campaign: &str,
    f: F,
) -> miette::Result<R>
where
    F: FnOnce(&dyn ProgressSink) -> Result<R, CampaignError> + Send + 'static,
    R: Send + 'static,
{
    match mode {
        OutputMode::Interactive => Tui::new(operation, campaign)
            .with_log_router(logs.clone())
            .run(f),
        OutputMode::NonInteractive => Ok(f(&JsonOutput)?),
    }
}

fn task_cache_for(config: &ResolvedConfig) -> miette::Result<TaskCache> {
    match &config.task_cache {
        Some(path) => Ok(TaskCache::new(path.clone())),
        None => Ok(TaskCache::default_for(&config.template.campaign)?),
    }
}

struct OfflineCatalog;
struct OfflineTracking;

impl CatalogClient for OfflineCatalog {
    fn list_entries(
        &self,
        _scope: &str,
        _name_filter: &str,
    ) -> Result<Vec<CatalogEntry>, CampaignError> {
        Err(CampaignError::CatalogCommand(
            "catalog not available offline".to_string(),
        ))
    }

    fn list_files(&self, _scope: &str, _name: &str) -> Result<Vec<CatalogEntry>, CampaignError> {
        Err(CampaignError::CatalogCommand(
            "catalog not available offline".to_string(),
        ))
    }

    fn download(
        &self,
        _scope: &str,
        _name: &str,
        _target_dir: &camino::Utf8Path,
    ) -> Result<(), CampaignError> {
        Err(CampaignError::CatalogCommand(
            "catalog not available offline".to_string(),
        ))
    }
}

impl TrackingClient for OfflineTracking {
    fn query_tasks(
        &self,
        _identity: &str,
        _since: DateTime<Utc>,
    ) -> Result<TaskQuery, CampaignError> {
        Err(CampaignError::TrackingHttp(
            "tracking service not available offline".to_string(),
        ))
    }

    fn retry(&self, _task_id: u64) -> Result<(), CampaignError> {
        Err(CampaignError::TrackingHttp(
            "tracking service not available offline".to_string(),
        ))
    }

    fn kill(&self, _task_id: u64) -> Result<(), CampaignError> {
        Err(CampaignError::TrackingHttp(
            "tracking service not available offline".to_string(),
        ))
    }
}
