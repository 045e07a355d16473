use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::domain::{CatalogStatus, TaskStatus};
use crate::error::CampaignError;
use crate::model::Campaign;
use crate::tracking::TrackingClient;

/// A submitter whose pass failed; the remaining submitters were processed.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitterFailure {
    pub submitter: String,
    pub error: String,
}

impl SubmitterFailure {
    pub fn new(submitter: &str, error: &CampaignError) -> Self {
        Self {
            submitter: submitter.to_string(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogCounts {
    pub checked: usize,
    pub done: usize,
    pub missing: usize,
    pub duplicate: usize,
}

impl CatalogCounts {
    pub fn add(&mut self, other: &CatalogCounts) {
        self.checked += other.checked;
        self.done += other.done;
        self.missing += other.missing;
        self.duplicate += other.duplicate;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogReport {
    pub counts: CatalogCounts,
    pub failures: Vec<SubmitterFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskRefresh {
    Updated { fetched: usize, kept: usize },
    NoIdentity,
    NoRecords,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskMatchCounts {
    /// Records that received a task status.
    pub updated: usize,
    /// Tasks whose outputs match no expected identifier.
    pub unexpected: usize,
    /// Matches dropped because the task is broken.
    pub broken: usize,
}

impl TaskMatchCounts {
    fn add(&mut self, other: &TaskMatchCounts) {
        self.updated += other.updated;
        self.unexpected += other.unexpected;
        self.broken += other.broken;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackingReport {
    pub refreshed: Vec<(String, TaskRefresh)>,
    pub matches: TaskMatchCounts,
    pub failures: Vec<SubmitterFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCommand {
    Retry,
    Kill,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCommandReport {
    pub selected: Vec<u64>,
    pub sent: Vec<u64>,
    pub failures: Vec<(u64, String)>,
    pub dry_run: bool,
}

/// Writes status reported by the catalog and the tracking service onto the
/// records of a campaign. Never adds or removes records.
pub struct Reconciler<'a> {
    catalog: &'a dyn CatalogClient,
    tracking: &'a dyn TrackingClient,
}

impl<'a> Reconciler<'a> {
    pub fn new(catalog: &'a dyn CatalogClient, tracking: &'a dyn TrackingClient) -> Self {
        Self { catalog, tracking }
    }

    /// Catalog pass over every submitter. `progress` is told each submitter
    /// name before it is checked.
    pub fn reconcile_catalog(
        &self,
        campaign: &mut Campaign,
        mut progress: impl FnMut(&str),
    ) -> CatalogReport {
        let mut report = CatalogReport::default();
        let names = campaign.submitters().keys().cloned().collect::<Vec<_>>();
        for name in names {
            progress(&name);
            match self.reconcile_submitter_catalog(campaign, &name) {
                Ok(counts) => report.counts.add(&counts),
                Err(err) => {
                    warn!(submitter = %name, error = %err, "catalog reconciliation failed");
                    report.failures.push(SubmitterFailure::new(&name, &err));
                }
            }
        }
        report
    }

    /// Set the catalog status of every record of one submitter from the
    /// number of catalog entries carrying its identifier.
    pub fn reconcile_submitter_catalog(
        &self,
        campaign: &mut Campaign,
        name: &str,
    ) -> Result<CatalogCounts, CampaignError> {
        let submitter = campaign
            .submitter(name)
            .ok_or_else(|| CampaignError::UnknownSubmitter(name.to_string()))?;
        let scope = submitter.scope();
        let ids = submitter.dids().iter().cloned().collect::<Vec<_>>();
        info!(submitter = name, records = ids.len(), "checking catalog");

        let mut counts = CatalogCounts::default();
        for id in ids {
            let entries = self.catalog.list_entries(&scope, &id)?;
            let status = CatalogStatus::from_entry_count(entries.len());
            match status {
                CatalogStatus::Done => counts.done += 1,
                CatalogStatus::Missing => counts.missing += 1,
                CatalogStatus::Duplicate => {
                    warn!(did = %id, entries = entries.len(), "duplicate catalog entries");
                    counts.duplicate += 1;
                }
                CatalogStatus::Unknown => {}
            }
            counts.checked += 1;
            if let Some(record) = campaign.record_mut(&id) {
                record.catalog_status = status;
            }
        }
        debug!(
            submitter = name,
            done = counts.done,
            missing = counts.missing,
            duplicate = counts.duplicate,
            "catalog check finished"
        );
        Ok(counts)
    }

    /// Query fresh task lists for every submitter. A failing submitter is
    /// reported and the others continue. Matching is left to the caller.
    pub fn refresh_tasks(
        &self,
        campaign: &mut Campaign,
        include_empty: bool,
        mut progress: impl FnMut(&str),
    ) -> TrackingReport {
        let mut report = TrackingReport::default();
        let names = campaign.submitters().keys().cloned().collect::<Vec<_>>();
        for name in names {
            progress(&name);
            match self.refresh_submitter_tasks(campaign, &name, include_empty) {
                Ok(refresh) => report.refreshed.push((name, refresh)),
                Err(err) => {
                    warn!(submitter = %name, error = %err, "task query failed");
                    report.failures.push(SubmitterFailure::new(&name, &err));
                }
            }
        }
        report
    }

    /// Refresh every submitter's tasks, then match all known tasks against
    /// the records.
    pub fn reconcile_tracking(
        &self,
        campaign: &mut Campaign,
        include_empty: bool,
        progress: impl FnMut(&str),
    ) -> TrackingReport {
        let mut report = self.refresh_tasks(campaign, include_empty, progress);
        report.matches = match_tasks(campaign);
        report
    }

    /// Fetch the tasks of one submitter and merge those of this campaign
    /// version into its task map.
    pub fn refresh_submitter_tasks(
        &self,
        campaign: &mut Campaign,
        name: &str,
        include_empty: bool,
    ) -> Result<TaskRefresh, CampaignError> {
        let since = campaign.since();
        let filter = campaign.template().version_filter();
        let submitter = campaign
            .submitter_mut(name)
            .ok_or_else(|| CampaignError::UnknownSubmitter(name.to_string()))?;
        if !include_empty && submitter.dids().is_empty() {
            info!(submitter = name, "skipping task query for submitter without records");
            return Ok(TaskRefresh::NoRecords);
        }
        let Some(identity) = submitter.full_name().map(str::to_string) else {
            info!(submitter = name, "no full name known, cannot query tasks");
            return Ok(TaskRefresh::NoIdentity);
        };

        let query = self.tracking.query_tasks(&identity, since)?;
        if query.status_code != 0 {
            return Err(CampaignError::TrackingQuery {
                identity,
                code: query.status_code,
            });
        }
        let fetched = query.tasks.len();
        let kept = query
            .tasks
            .into_iter()
            .filter(|(_, task)| filter.is_match(&task.task_name))
            .collect::<std::collections::BTreeMap<_, _>>();
        let refresh = TaskRefresh::Updated {
            fetched,
            kept: kept.len(),
        };
        info!(submitter = name, fetched, kept = kept.len(), "fetched tasks");
        submitter.merge_tasks(kept);
        Ok(refresh)
    }

    /// Send a retry or kill for every task of a submitter in `status`.
    pub fn apply_task_command(
        &self,
        campaign: &Campaign,
        name: &str,
        status: &TaskStatus,
        command: TaskCommand,
        dry_run: bool,
    ) -> Result<TaskCommandReport, CampaignError> {
        let submitter = campaign
            .submitter(name)
            .ok_or_else(|| CampaignError::UnknownSubmitter(name.to_string()))?;
        let mut report = TaskCommandReport {
            dry_run,
            ..TaskCommandReport::default()
        };
        report.selected = submitter
            .tasks()
            .values()
            .filter(|task| &task.status == status)
            .map(|task| task.task_id)
            .collect();
        info!(
            submitter = name,
            status = %status,
            command = ?command,
            tasks = report.selected.len(),
            "selected tasks"
        );
        if dry_run {
            return Ok(report);
        }
        for task_id in report.selected.clone() {
            let result = match command {
                TaskCommand::Retry => self.tracking.retry(task_id),
                TaskCommand::Kill => self.tracking.kill(task_id),
            };
            match result {
                Ok(()) => report.sent.push(task_id),
                Err(err) => {
                    warn!(task_id, error = %err, "task command failed");
                    report.failures.push((task_id, err.to_string()));
                }
            }
        }
        Ok(report)
    }
}

/// Attach task statuses of every submitter's known tasks to its records.
pub fn match_tasks(campaign: &mut Campaign) -> TaskMatchCounts {
    let mut total = TaskMatchCounts::default();
    let names = campaign.submitters().keys().cloned().collect::<Vec<_>>();
    for name in names {
        if let Some(counts) = match_submitter_tasks(campaign, &name) {
            total.add(&counts);
        }
    }
    total
}

/// Match the tasks of one submitter against its records. Within one pass a
/// record keeps the status of the task that takes precedence; broken tasks
/// never count as producers.
pub fn match_submitter_tasks(campaign: &mut Campaign, name: &str) -> Option<TaskMatchCounts> {
    let (submitter, records) = campaign.submitter_with_records(name)?;
    let mut counts = TaskMatchCounts::default();
    let mut assigned = HashSet::new();

    for (task_id, task) in submitter.tasks() {
        let mut found = false;
        let mut broken = false;
        for output in &task.output_datasets {
            if !submitter.dids().contains(output) {
                continue;
            }
            if task.status.is_broken() {
                debug!(task_id, task = %task.task_name, "broken task");
                counts.broken += 1;
                broken = true;
                continue;
            }
            found = true;
            let Some(record) = records.get_mut(output) else {
                continue;
            };
            if assigned.contains(output) && !task.status.supersedes(&record.task_status) {
                continue;
            }
            record.task_status = task.status.clone();
            record.task_id = Some(*task_id);
            assigned.insert(output.clone());
            counts.updated += 1;
        }
        if !found && !broken {
            debug!(task_id, task = %task.task_name, "task not expected");
            counts.unexpected += 1;
        }
    }

    info!(
        submitter = name,
        updated = counts.updated,
        "updated records with a task status"
    );
    if counts.unexpected > 0 {
        warn!(submitter = name, count = counts.unexpected, "found unexpected tasks");
    }
    if counts.broken > 0 {
        warn!(submitter = name, count = counts.broken, "found broken tasks");
    }
    Some(counts)
}
