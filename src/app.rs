use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::catalog::CatalogClient;
use crate::domain::TaskStatus;
use crate::error::CampaignError;
use crate::download::{self, DownloadReport, Downloader, RecordFailure};
use crate::merge::{MergeGate, MergeOptions, MergeReport, Merger};
use crate::model::{BuildMode, BuildReport, Campaign};
use crate::reconcile::{
    self, CatalogReport, Reconciler, SubmitterFailure, TaskCommand, TaskCommandReport,
    TaskMatchCounts, TrackingReport,
};
use crate::stats::CampaignStats;
use crate::store::TaskCache;
use crate::tracking::TrackingClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Status,
    Expected,
    Download,
    Merge,
    Tasks,
    Summary,
}

impl Operation {
    pub fn label(self) -> &'static str {
        match self {
            Operation::Status => "Status",
            Operation::Expected => "Expected",
            Operation::Download => "Download",
            Operation::Merge => "Merge",
            Operation::Tasks => "Tasks",
            Operation::Summary => "Summary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn emit(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    pub skip_tracking: bool,
    pub include_empty: bool,
    pub task_cache: Option<TaskCache>,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub require_upstream_done: bool,
    pub list_to: Option<Utf8PathBuf>,
    pub task_cache: Option<TaskCache>,
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub submitter: String,
    pub status: TaskStatus,
    pub command: TaskCommand,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpectedResult {
    pub campaign: String,
    pub build: BuildReport,
    pub expected: Vec<String>,
    pub records: Vec<String>,
    pub undistributed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub campaign: String,
    pub build: BuildReport,
    pub catalog: Option<CatalogReport>,
    pub tracking: Option<TrackingReport>,
    pub task_matches: TaskMatchCounts,
    pub restored_tasks: usize,
    /// Records whose catalog status came from the cache instead of a fresh
    /// catalog pass.
    pub restored_catalog: usize,
    pub undistributed: Vec<String>,
    pub stats: CampaignStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub campaign: String,
    pub submitters: BTreeMap<String, DownloadReport>,
    pub listed: usize,
    pub failures: Vec<SubmitterFailure>,
    pub stats: CampaignStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub campaign: String,
    pub submitters: BTreeMap<String, MergeReport>,
    pub status_failures: Vec<RecordFailure>,
    pub failures: Vec<SubmitterFailure>,
    pub stats: CampaignStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskCommandResult {
    pub submitter: String,
    pub status: TaskStatus,
    pub command: TaskCommand,
    pub report: TaskCommandReport,
}

/// Drives one campaign through its passes against concrete collaborators.
#[derive(Clone)]
pub struct App<C: CatalogClient, T: TrackingClient, M: Merger> {
    catalog: C,
    tracking: T,
    merger: M,
}

impl<C: CatalogClient, T: TrackingClient, M: Merger> App<C, T, M> {
    pub fn new(catalog: C, tracking: T, merger: M) -> Self {
        Self {
            catalog,
            tracking,
            merger,
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn tracking(&self) -> &T {
        &self.tracking
    }

    pub fn merger(&self) -> &M {
        &self.merger
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.catalog, &self.tracking)
    }

    pub fn expected(&self, campaign: &mut Campaign, sink: &dyn ProgressSink) -> ExpectedResult {
        emit(sink, "phase=Build; enumerating expected datasets".to_string());
        let build = campaign.build_expected_datasets(BuildMode::Reuse);
        ExpectedResult {
            campaign: campaign.name().to_string(),
            build,
            expected: campaign.expected_partial().to_vec(),
            records: campaign.records().keys().cloned().collect(),
            undistributed: campaign.undistributed(),
        }
    }

    /// Refresh catalog and task status of every record and recompute the
    /// statistics.
    pub fn status(
        &self,
        campaign: &mut Campaign,
        options: StatusOptions,
        sink: &dyn ProgressSink,
    ) -> Result<StatusResult, CampaignError> {
        let started = Instant::now();
        emit(sink, "phase=Build; enumerating expected datasets".to_string());
        let build = campaign.build_expected_datasets(BuildMode::Reuse);
        let restored_tasks = restore_cache(campaign, options.task_cache.as_ref(), sink)?;

        let reconciler = self.reconciler();
        let catalog = reconciler.reconcile_catalog(campaign, |name| {
            emit(sink, format!("phase=Catalog; checking {name}"));
        });
        if let Some(cache) = options.task_cache.as_ref() {
            cache.dump_catalog_from(campaign)?;
        }

        let tracking = if options.skip_tracking {
            None
        } else {
            let report = reconciler.refresh_tasks(campaign, options.include_empty, |name| {
                emit(sink, format!("phase=Tracking; querying tasks of {name}"));
            });
            if let Some(cache) = options.task_cache.as_ref() {
                emit(sink, "phase=Store; saving task cache".to_string());
                cache.dump_from(campaign)?;
            }
            Some(report)
        };

        emit(sink, "phase=Tracking; matching tasks to datasets".to_string());
        let task_matches = reconcile::match_tasks(campaign);
        let mut tracking = tracking;
        if let Some(report) = tracking.as_mut() {
            report.matches = task_matches.clone();
        }

        emit(sink, "phase=Report; updating statistics".to_string());
        let stats = campaign.update_statistics().clone();
        sink.event(ProgressEvent {
            message: "phase=Report; status complete".to_string(),
            elapsed: Some(started.elapsed()),
        });
        Ok(StatusResult {
            campaign: campaign.name().to_string(),
            build,
            catalog: Some(catalog),
            tracking,
            task_matches,
            restored_tasks,
            restored_catalog: 0,
            undistributed: campaign.undistributed(),
            stats,
        })
    }

    /// Statistics from the task cache and the last saved catalog status; no
    /// catalog or tracking calls.
    pub fn summary(
        &self,
        campaign: &mut Campaign,
        task_cache: Option<&TaskCache>,
        sink: &dyn ProgressSink,
    ) -> Result<StatusResult, CampaignError> {
        emit(sink, "phase=Build; enumerating expected datasets".to_string());
        let build = campaign.build_expected_datasets(BuildMode::Reuse);
        let restored_tasks = restore_cache(campaign, task_cache, sink)?;
        let restored_catalog = match task_cache {
            Some(cache) => cache.restore_catalog_into(campaign)?,
            None => 0,
        };
        emit(sink, "phase=Tracking; matching cached tasks".to_string());
        let task_matches = reconcile::match_tasks(campaign);
        emit(sink, "phase=Report; updating statistics".to_string());
        let stats = campaign.update_statistics().clone();
        Ok(StatusResult {
            campaign: campaign.name().to_string(),
            build,
            catalog: None,
            tracking: None,
            task_matches,
            restored_tasks,
            restored_catalog,
            undistributed: campaign.undistributed(),
            stats,
        })
    }

    pub fn download(
        &self,
        campaign: &mut Campaign,
        options: DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, CampaignError> {
        emit(sink, "phase=Build; enumerating expected datasets".to_string());
        campaign.build_expected_datasets(BuildMode::Reuse);
        restore_cache(campaign, options.task_cache.as_ref(), sink)?;
        reconcile::match_tasks(campaign);

        let mut result = DownloadResult {
            campaign: campaign.name().to_string(),
            submitters: BTreeMap::new(),
            listed: 0,
            failures: Vec::new(),
            stats: campaign.update_statistics().clone(),
        };
        let downloader = Downloader::new(&self.catalog, options.require_upstream_done);
        for name in submitter_names(campaign) {
            if let Some(list_file) = options.list_to.as_deref() {
                emit(sink, format!("phase=Download; listing datasets of {name}"));
                match download::append_download_list(campaign, &name, list_file) {
                    Ok(count) => result.listed += count,
                    Err(err) => result.failures.push(SubmitterFailure::new(&name, &err)),
                }
                continue;
            }
            emit(sink, format!("phase=Download; downloading datasets of {name}"));
            match downloader.download_submitter(campaign, &name) {
                Ok(report) => {
                    result.submitters.insert(name, report);
                }
                Err(err) => result.failures.push(SubmitterFailure::new(&name, &err)),
            }
        }

        emit(sink, "phase=Report; updating statistics".to_string());
        result.stats = campaign.update_statistics().clone();
        Ok(result)
    }

    pub fn merge(
        &self,
        campaign: &mut Campaign,
        options: MergeOptions,
        task_cache: Option<&TaskCache>,
        sink: &dyn ProgressSink,
    ) -> Result<MergeResult, CampaignError> {
        emit(sink, "phase=Build; enumerating expected datasets".to_string());
        campaign.build_expected_datasets(BuildMode::Reuse);
        restore_cache(campaign, task_cache, sink)?;
        reconcile::match_tasks(campaign);

        let mut status_failures = Vec::new();
        let mut failures = Vec::new();
        let names = submitter_names(campaign);
        if options.require_downloaded {
            let downloader = Downloader::new(&self.catalog, true);
            for name in &names {
                emit(sink, format!("phase=Download; checking downloads of {name}"));
                match downloader.refresh_submitter(campaign, name) {
                    Ok(failed) => status_failures.extend(failed),
                    Err(err) => failures.push(SubmitterFailure::new(name, &err)),
                }
            }
        }

        let gate = MergeGate::new(&self.merger, options);
        let mut submitters = BTreeMap::new();
        for name in names {
            emit(sink, format!("phase=Merge; merging outputs of {name}"));
            match gate.merge_submitter(campaign, &name) {
                Ok(report) => {
                    submitters.insert(name, report);
                }
                Err(err) => failures.push(SubmitterFailure::new(&name, &err)),
            }
        }

        emit(sink, "phase=Report; updating statistics".to_string());
        let stats = campaign.update_statistics().clone();
        Ok(MergeResult {
            campaign: campaign.name().to_string(),
            submitters,
            status_failures,
            failures,
            stats,
        })
    }

    /// Refresh one submitter's tasks, then retry or kill those in the
    /// requested status.
    pub fn tasks(
        &self,
        campaign: &mut Campaign,
        request: TaskRequest,
        task_cache: Option<&TaskCache>,
        sink: &dyn ProgressSink,
    ) -> Result<TaskCommandResult, CampaignError> {
        if campaign.submitter(&request.submitter).is_none() {
            return Err(CampaignError::UnknownSubmitter(request.submitter));
        }
        restore_cache(campaign, task_cache, sink)?;
        let reconciler = self.reconciler();
        emit(
            sink,
            format!("phase=Tracking; querying tasks of {}", request.submitter),
        );
        reconciler.refresh_submitter_tasks(campaign, &request.submitter, true)?;
        if let Some(cache) = task_cache {
            cache.dump_from(campaign)?;
        }
        emit(
            sink,
            format!(
                "phase=Tracking; {} {} tasks",
                match request.command {
                    TaskCommand::Retry => "retrying",
                    TaskCommand::Kill => "killing",
                },
                request.status
            ),
        );
        let report = reconciler.apply_task_command(
            campaign,
            &request.submitter,
            &request.status,
            request.command,
            request.dry_run,
        )?;
        Ok(TaskCommandResult {
            submitter: request.submitter,
            status: request.status,
            command: request.command,
            report,
        })
    }
}

fn submitter_names(campaign: &Campaign) -> Vec<String> {
    campaign.submitters().keys().cloned().collect()
}

fn restore_cache(
    campaign: &mut Campaign,
    cache: Option<&TaskCache>,
    sink: &dyn ProgressSink,
) -> Result<usize, CampaignError> {
    let Some(cache) = cache else {
        return Ok(0);
    };
    emit(sink, format!("phase=Store; reading task cache {}", cache.path()));
    cache.restore_into(campaign)
}
