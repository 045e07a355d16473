use std::fs::OpenOptions;
use std::io::Write;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::domain::DownloadStatus;
use crate::error::CampaignError;
use crate::fs_util;
use crate::model::Campaign;

/// Result of one gated download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    AlreadyDone,
    UpstreamNotReady,
    PathNotSet,
    Downloaded(DownloadStatus),
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub did: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub completed: usize,
    pub already_done: usize,
    pub upstream_not_ready: usize,
    pub path_not_set: usize,
    pub failures: Vec<RecordFailure>,
}

impl DownloadReport {
    fn record(&mut self, outcome: DownloadOutcome) {
        match outcome {
            DownloadOutcome::AlreadyDone => self.already_done += 1,
            DownloadOutcome::UpstreamNotReady => self.upstream_not_ready += 1,
            DownloadOutcome::PathNotSet => self.path_not_set += 1,
            DownloadOutcome::Downloaded(status) => {
                self.downloaded += 1;
                if status == DownloadStatus::Done {
                    self.completed += 1;
                }
            }
        }
    }
}

/// Download gate: decides per record whether fetching is needed and allowed.
pub struct Downloader<'a> {
    catalog: &'a dyn CatalogClient,
    require_upstream_done: bool,
}

impl<'a> Downloader<'a> {
    pub fn new(catalog: &'a dyn CatalogClient, require_upstream_done: bool) -> Self {
        Self {
            catalog,
            require_upstream_done,
        }
    }

    /// Re-derive the download status of one record from disk and catalog.
    pub fn refresh_status(
        &self,
        campaign: &mut Campaign,
        id: &str,
    ) -> Result<DownloadStatus, CampaignError> {
        let status = self.compute_status(campaign, id)?;
        if let Some(record) = campaign.record_mut(id) {
            record.download_status = status;
        }
        Ok(status)
    }

    fn compute_status(&self, campaign: &Campaign, id: &str) -> Result<DownloadStatus, CampaignError> {
        let record = campaign
            .record(id)
            .ok_or_else(|| CampaignError::Filesystem(format!("no record for {id}")))?;
        let Some(path) = campaign.download_path(record) else {
            return Ok(DownloadStatus::PathNotSet);
        };
        if !path.as_std_path().exists() {
            return Ok(DownloadStatus::NotYetDownloaded);
        }
        if self.require_upstream_done && !record.task_status.is_done() {
            return Ok(DownloadStatus::UpstreamNotReady);
        }

        let files = self.catalog.list_files(&record.scope(), id)?;
        if files.is_empty() {
            warn!(did = id, path = %path, "catalog returned no files; remove the directory manually");
        }
        let expected = files.iter().map(|file| file.size_bytes).sum::<u64>();
        let on_disk = files
            .iter()
            .map(|file| fs_util::file_size(&path.join(&file.name)))
            .sum::<u64>();
        if expected != on_disk {
            debug!(
                did = id,
                on_disk_mb = on_disk / 1024 / 1024,
                expected_mb = expected / 1024 / 1024,
                "incomplete download"
            );
            return Ok(DownloadStatus::Incomplete);
        }
        Ok(DownloadStatus::Done)
    }

    /// Download one record unless it is already complete or its task is not
    /// done while that is required.
    pub fn download(
        &self,
        campaign: &mut Campaign,
        id: &str,
    ) -> Result<DownloadOutcome, CampaignError> {
        let status = match campaign.record(id).map(|record| record.download_status) {
            Some(DownloadStatus::Unknown) | None => self.refresh_status(campaign, id)?,
            Some(status) => status,
        };
        if status == DownloadStatus::Done {
            debug!(did = id, "already downloaded, skip");
            return Ok(DownloadOutcome::AlreadyDone);
        }
        let record = campaign
            .record(id)
            .ok_or_else(|| CampaignError::Filesystem(format!("no record for {id}")))?;
        if self.require_upstream_done && !record.task_status.is_done() {
            debug!(did = id, task_status = %record.task_status, "task not done, skip");
            return Ok(DownloadOutcome::UpstreamNotReady);
        }
        let Some(dir) = campaign.download_dir_for(record.submitter()) else {
            return Ok(DownloadOutcome::PathNotSet);
        };
        let dir = dir.to_path_buf();
        let scope = record.scope();

        fs_util::ensure_dir(&dir)?;
        info!(did = id, status = %status, dir = %dir, "downloading");
        self.catalog.download(&scope, id, &dir)?;
        let status = self.refresh_status(campaign, id)?;
        Ok(DownloadOutcome::Downloaded(status))
    }

    pub fn refresh_submitter(
        &self,
        campaign: &mut Campaign,
        name: &str,
    ) -> Result<Vec<RecordFailure>, CampaignError> {
        let ids = record_ids(campaign, name)?;
        info!(submitter = name, records = ids.len(), "checking download progress");
        let mut failures = Vec::new();
        for id in ids {
            if let Err(err) = self.refresh_status(campaign, &id) {
                warn!(did = %id, error = %err, "download status check failed");
                failures.push(RecordFailure {
                    did: id,
                    error: err.to_string(),
                });
            }
        }
        Ok(failures)
    }

    pub fn download_submitter(
        &self,
        campaign: &mut Campaign,
        name: &str,
    ) -> Result<DownloadReport, CampaignError> {
        let ids = record_ids(campaign, name)?;
        let mut report = DownloadReport::default();
        if campaign.download_dir_for(name).is_none() {
            warn!(submitter = name, "download directory not set, cannot download");
            for id in &ids {
                if let Some(record) = campaign.record_mut(id) {
                    record.download_status = DownloadStatus::PathNotSet;
                }
            }
            report.path_not_set = ids.len();
            return Ok(report);
        }
        for id in ids {
            match self.download(campaign, &id) {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    warn!(did = %id, error = %err, "download failed");
                    report.failures.push(RecordFailure {
                        did: id,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}

fn record_ids(campaign: &Campaign, name: &str) -> Result<Vec<String>, CampaignError> {
    campaign
        .submitter(name)
        .map(|submitter| submitter.dids().iter().cloned().collect())
        .ok_or_else(|| CampaignError::UnknownSubmitter(name.to_string()))
}

/// Append the sorted identifiers of one submitter to a list file instead of
/// downloading them.
pub fn append_download_list(
    campaign: &Campaign,
    name: &str,
    list_file: &Utf8Path,
) -> Result<usize, CampaignError> {
    let ids = record_ids(campaign, name)?;
    if let Some(parent) = list_file.parent().filter(|p| !p.as_str().is_empty()) {
        fs_util::ensure_dir(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(list_file.as_std_path())
        .map_err(|err| CampaignError::Filesystem(format!("open {list_file}: {err}")))?;
    for id in &ids {
        writeln!(file, "{id}").map_err(|err| CampaignError::Filesystem(err.to_string()))?;
    }
    info!(submitter = name, count = ids.len(), file = %list_file, "listed datasets to download");
    Ok(ids.len())
}
