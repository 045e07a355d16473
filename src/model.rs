use std::collections::{BTreeMap, BTreeSet, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ResolvedConfig, SampleSettings, SystematicSpec};
use crate::domain::{CatalogStatus, DownloadStatus, MergeStatus, SystematicKind, TaskStatus};
use crate::error::CampaignError;
use crate::naming::{self, DidTemplate, TargetNaming};
use crate::stats::{self, CampaignStats};
use crate::tracking::TaskDescriptor;

/// One expected dataset and its status along each tracking axis.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetRecord {
    id: String,
    partial: String,
    submitter: String,
    systematic: String,
    sample: String,
    pub catalog_status: CatalogStatus,
    pub task_status: TaskStatus,
    pub task_id: Option<u64>,
    pub download_status: DownloadStatus,
    pub merge_status: MergeStatus,
}

impl DatasetRecord {
    fn new(id: String, partial: String, submitter: &str, systematic: &str, sample: &str) -> Self {
        Self {
            id,
            partial,
            submitter: submitter.to_string(),
            systematic: systematic.to_string(),
            sample: sample.to_string(),
            catalog_status: CatalogStatus::Unknown,
            task_status: TaskStatus::Unknown,
            task_id: None,
            download_status: DownloadStatus::Unknown,
            merge_status: MergeStatus::Uninitialized,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier without the submitter scope.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    pub fn submitter(&self) -> &str {
        &self.submitter
    }

    pub fn systematic(&self) -> &str {
        &self.systematic
    }

    pub fn sample(&self) -> &str {
        &self.sample
    }

    pub fn scope(&self) -> String {
        naming::scope_for(&self.submitter)
    }
}

#[derive(Debug, Clone)]
pub struct SampleGroup {
    name: String,
    super_sample: String,
    is_part_of_split: bool,
    nominal_only: bool,
    dids: BTreeSet<String>,
}

impl SampleGroup {
    pub fn new(name: &str) -> Result<Self, CampaignError> {
        let nominal_only = naming::is_nominal_only_sample(name);
        let split = naming::split_sample_name(name, nominal_only)?;
        Ok(Self {
            name: name.to_string(),
            super_sample: split.super_sample,
            is_part_of_split: split.is_part_of_split,
            nominal_only,
            dids: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn super_sample(&self) -> &str {
        &self.super_sample
    }

    pub fn is_part_of_split(&self) -> bool {
        self.is_part_of_split
    }

    pub fn is_nominal_only(&self) -> bool {
        self.nominal_only
    }

    pub fn dids(&self) -> &BTreeSet<String> {
        &self.dids
    }
}

#[derive(Debug, Clone)]
pub struct SystematicGroup {
    name: String,
    short_name: String,
    kind: SystematicKind,
    samples: BTreeMap<String, SampleGroup>,
    dids: BTreeSet<String>,
}

impl SystematicGroup {
    pub fn new(name: &str, short_name: &str, kind: SystematicKind) -> Self {
        Self {
            name: name.to_string(),
            short_name: short_name.to_string(),
            kind,
            samples: BTreeMap::new(),
            dids: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn kind(&self) -> SystematicKind {
        self.kind
    }

    /// Whether this systematic may be applied to the given sample.
    pub fn admits(&self, sample: &SampleGroup) -> bool {
        self.kind.is_nominal() || !sample.is_nominal_only()
    }

    pub fn samples(&self) -> &BTreeMap<String, SampleGroup> {
        &self.samples
    }

    pub fn dids(&self) -> &BTreeSet<String> {
        &self.dids
    }
}

/// An account under which grid jobs were submitted.
#[derive(Debug, Clone)]
pub struct Submitter {
    name: String,
    full_name: Option<String>,
    systematics: BTreeMap<String, SystematicGroup>,
    dids: BTreeSet<String>,
    pub(crate) tasks: BTreeMap<u64, TaskDescriptor>,
    pub download_dir: Option<Utf8PathBuf>,
    pub merge_target_dir: Option<Utf8PathBuf>,
}

impl Submitter {
    pub fn new(name: &str, full_name: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            full_name,
            systematics: BTreeMap::new(),
            dids: BTreeSet::new(),
            tasks: BTreeMap::new(),
            download_dir: None,
            merge_target_dir: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> String {
        naming::scope_for(&self.name)
    }

    /// Registered display name, required for tracking-service queries.
    pub fn full_name(&self) -> Option<&str> {
        self.full_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }

    pub fn systematics(&self) -> &BTreeMap<String, SystematicGroup> {
        &self.systematics
    }

    pub fn dids(&self) -> &BTreeSet<String> {
        &self.dids
    }

    pub fn tasks(&self) -> &BTreeMap<u64, TaskDescriptor> {
        &self.tasks
    }

    /// Merge task descriptors into the local task map; entries already known
    /// under the same id are replaced.
    pub fn merge_tasks(&mut self, tasks: BTreeMap<u64, TaskDescriptor>) {
        self.tasks.extend(tasks);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Keep the status of records that are still expected.
    Reuse,
    /// Start every record from scratch.
    Rebuild,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssignReport {
    pub systematics: usize,
    pub samples: usize,
    pub unknown_systematics: Vec<String>,
    pub unknown_samples: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub expected: usize,
    pub records: usize,
    pub reused: usize,
    pub duplicates: Vec<String>,
}

/// Top-level bookkeeping object. Owns every [`DatasetRecord`]; submitters and
/// their groups refer to records by identifier only.
#[derive(Debug, Clone)]
pub struct Campaign {
    template: DidTemplate,
    since: DateTime<Utc>,
    systematics: Vec<SystematicSpec>,
    long_to_short: BTreeMap<String, String>,
    short_to_long: BTreeMap<String, String>,
    samples: Vec<String>,
    sample_config: BTreeMap<String, SampleSettings>,
    pub download_dir: Option<Utf8PathBuf>,
    pub merge_target_dir: Option<Utf8PathBuf>,
    pub id_reference_file: Option<Utf8PathBuf>,
    naming: TargetNaming,
    submitters: BTreeMap<String, Submitter>,
    records: BTreeMap<String, DatasetRecord>,
    expected_partial: Vec<String>,
    stats: Option<CampaignStats>,
}

impl Campaign {
    /// Create the campaign from configuration and assign each configured
    /// submitter its systematics and samples.
    pub fn from_config(config: ResolvedConfig) -> Result<Self, CampaignError> {
        let mut long_to_short = BTreeMap::new();
        let mut short_to_long = BTreeMap::new();
        for spec in &config.systematics {
            long_to_short.insert(spec.long_name.clone(), spec.short_name.clone());
            short_to_long.insert(spec.short_name.clone(), spec.long_name.clone());
        }

        let mut campaign = Self {
            template: config.template,
            since: config.since,
            systematics: config.systematics,
            long_to_short,
            short_to_long,
            samples: config.samples,
            sample_config: config.sample_config,
            download_dir: config.download_dir,
            merge_target_dir: config.merge_target_dir,
            id_reference_file: config.id_reference_file,
            naming: config.naming,
            submitters: BTreeMap::new(),
            records: BTreeMap::new(),
            expected_partial: Vec::new(),
            stats: None,
        };
        info!(
            campaign = %campaign.template.campaign,
            systematics = campaign.systematics.len(),
            samples = campaign.samples.len(),
            "created campaign"
        );

        for request in config.submitters {
            let submitter = campaign.add_submitter(&request.name, request.full_name.clone());
            submitter.download_dir = request.download_dir.clone();
            submitter.merge_target_dir = request.merge_target_dir.clone();
            campaign.assign(&request.name, &request.systematics, &request.samples)?;
        }
        Ok(campaign)
    }

    pub fn name(&self) -> &str {
        &self.template.campaign
    }

    pub fn template(&self) -> &DidTemplate {
        &self.template
    }

    /// Earliest task creation date considered when querying the tracking service.
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn systematics(&self) -> &[SystematicSpec] {
        &self.systematics
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn sample_config(&self) -> &BTreeMap<String, SampleSettings> {
        &self.sample_config
    }

    pub fn naming(&self) -> &TargetNaming {
        &self.naming
    }

    pub fn short_name(&self, long_name: &str) -> Option<&str> {
        self.long_to_short.get(long_name).map(String::as_str)
    }

    pub fn long_name(&self, short_name: &str) -> Option<&str> {
        self.short_to_long.get(short_name).map(String::as_str)
    }

    fn systematic_spec(&self, long_name: &str) -> Option<&SystematicSpec> {
        self.systematics
            .iter()
            .find(|spec| spec.long_name == long_name)
    }

    pub fn submitters(&self) -> &BTreeMap<String, Submitter> {
        &self.submitters
    }

    pub fn submitter(&self, name: &str) -> Option<&Submitter> {
        self.submitters.get(name)
    }

    pub fn submitter_mut(&mut self, name: &str) -> Option<&mut Submitter> {
        self.submitters.get_mut(name)
    }

    pub fn records(&self) -> &BTreeMap<String, DatasetRecord> {
        &self.records
    }

    pub fn record(&self, id: &str) -> Option<&DatasetRecord> {
        self.records.get(id)
    }

    pub fn record_mut(&mut self, id: &str) -> Option<&mut DatasetRecord> {
        self.records.get_mut(id)
    }

    /// A submitter together with mutable access to the record arena.
    pub(crate) fn submitter_with_records(
        &mut self,
        name: &str,
    ) -> Option<(&Submitter, &mut BTreeMap<String, DatasetRecord>)> {
        let submitter = self.submitters.get(name)?;
        Some((submitter, &mut self.records))
    }

    pub fn expected_partial(&self) -> &[String] {
        &self.expected_partial
    }

    pub fn stats(&self) -> Option<&CampaignStats> {
        self.stats.as_ref()
    }

    /// Add a submitter unless one with this name exists. A full name given
    /// later fills in a missing one but never replaces it.
    pub fn add_submitter(&mut self, name: &str, full_name: Option<String>) -> &mut Submitter {
        let submitter = self
            .submitters
            .entry(name.to_string())
            .or_insert_with(|| Submitter::new(name, None));
        if submitter.full_name().is_none() {
            if let Some(full_name) = full_name.filter(|value| !value.trim().is_empty()) {
                submitter.full_name = Some(full_name);
            }
        }
        submitter
    }

    /// Attach systematics and, below each of them, samples to a submitter.
    /// Systematics unknown to the campaign are skipped; unknown samples are
    /// attached but reported.
    pub fn assign(
        &mut self,
        submitter_name: &str,
        systematics: &[String],
        samples: &[String],
    ) -> Result<AssignReport, CampaignError> {
        let mut report = AssignReport::default();
        let mut sample_groups = Vec::with_capacity(samples.len());
        for sample in samples {
            sample_groups.push(SampleGroup::new(sample)?);
            if !self.samples.contains(sample) {
                warn!(
                    submitter = submitter_name,
                    sample = %sample,
                    "sample unknown in this campaign; track manually"
                );
                report.unknown_samples.push(sample.clone());
            }
        }
        report.samples = sample_groups.len();

        let mut resolved = Vec::new();
        for systematic in systematics {
            match self.systematic_spec(systematic) {
                Some(spec) => resolved.push(spec.clone()),
                None => {
                    warn!(
                        submitter = submitter_name,
                        systematic = %systematic,
                        "systematic unknown in this campaign; skip"
                    );
                    report.unknown_systematics.push(systematic.clone());
                }
            }
        }
        report.systematics = resolved.len();

        let submitter = self.add_submitter(submitter_name, None);
        for spec in resolved {
            let group = submitter
                .systematics
                .entry(spec.long_name.clone())
                .or_insert_with(|| {
                    SystematicGroup::new(&spec.long_name, &spec.short_name, spec.kind)
                });
            for sample in &sample_groups {
                group
                    .samples
                    .entry(sample.name.clone())
                    .or_insert_with(|| sample.clone());
            }
        }
        info!(
            submitter = submitter_name,
            systematics = report.systematics,
            samples = report.samples,
            "assigned systematics and samples"
        );
        Ok(report)
    }

    /// Enumerate every dataset that should exist, both campaign-wide
    /// (scope-less) and per submitter, and index the per-submitter records.
    pub fn build_expected_datasets(&mut self, mode: BuildMode) -> BuildReport {
        let mut expected_partial = Vec::new();
        for spec in &self.systematics {
            for sample in &self.samples {
                if !spec.kind.is_nominal() && naming::is_nominal_only_sample(sample) {
                    continue;
                }
                expected_partial.push(self.template.partial(sample, &spec.short_name));
            }
        }
        self.expected_partial = expected_partial;

        let mut previous = match mode {
            BuildMode::Reuse => std::mem::take(&mut self.records),
            BuildMode::Rebuild => {
                self.records.clear();
                BTreeMap::new()
            }
        };
        let mut report = BuildReport {
            expected: self.expected_partial.len(),
            ..BuildReport::default()
        };

        for submitter in self.submitters.values_mut() {
            submitter.dids.clear();
            let mut count = 0usize;
            for systematic in submitter.systematics.values_mut() {
                systematic.dids.clear();
                let short_name = systematic.short_name.clone();
                let kind = systematic.kind;
                for sample in systematic.samples.values_mut() {
                    sample.dids.clear();
                    if !(kind.is_nominal() || !sample.nominal_only) {
                        continue;
                    }
                    let partial = self.template.partial(&sample.name, &short_name);
                    let id = format!("{}.{partial}", naming::scope_for(&submitter.name));
                    if submitter.dids.contains(&id) {
                        warn!(
                            submitter = %submitter.name,
                            did = %id,
                            "dataset identifier already exists for submitter; skip"
                        );
                        report.duplicates.push(id);
                        continue;
                    }
                    let record = match previous.remove(&id) {
                        Some(record) => {
                            report.reused += 1;
                            record
                        }
                        None => DatasetRecord::new(
                            id.clone(),
                            partial,
                            &submitter.name,
                            &systematic.name,
                            &sample.name,
                        ),
                    };
                    self.records.insert(id.clone(), record);
                    sample.dids.insert(id.clone());
                    systematic.dids.insert(id.clone());
                    submitter.dids.insert(id);
                    count += 1;
                }
            }
            debug!(submitter = %submitter.name, count, "expected datasets for submitter");
        }
        if !previous.is_empty() {
            debug!(dropped = previous.len(), "records no longer expected");
        }
        report.records = self.records.len();
        info!(
            expected = report.expected,
            records = report.records,
            "built expected datasets"
        );
        report
    }

    /// Expected scope-less identifiers not covered by any submitter.
    pub fn undistributed(&self) -> Vec<String> {
        let distributed = self
            .records
            .values()
            .map(|record| record.partial.as_str())
            .collect::<HashSet<_>>();
        let mut missing = self
            .expected_partial
            .iter()
            .filter(|partial| !distributed.contains(partial.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        missing.sort();
        missing
    }

    pub fn download_dir_for(&self, submitter: &str) -> Option<&Utf8Path> {
        self.submitters
            .get(submitter)
            .and_then(|s| s.download_dir.as_deref())
            .or(self.download_dir.as_deref())
    }

    pub fn merge_target_dir_for(&self, submitter: &str) -> Option<&Utf8Path> {
        self.submitters
            .get(submitter)
            .and_then(|s| s.merge_target_dir.as_deref())
            .or(self.merge_target_dir.as_deref())
    }

    /// Local directory a dataset is downloaded into.
    pub fn download_path(&self, record: &DatasetRecord) -> Option<Utf8PathBuf> {
        self.download_dir_for(&record.submitter)
            .map(|dir| dir.join(&record.id))
    }

    /// Merge restored task descriptors into each known submitter.
    pub fn restore_tasks(&mut self, snapshot: BTreeMap<String, BTreeMap<u64, TaskDescriptor>>) {
        for (name, tasks) in snapshot {
            match self.submitters.get_mut(&name) {
                Some(submitter) => {
                    debug!(submitter = %name, tasks = tasks.len(), "restored tasks");
                    submitter.merge_tasks(tasks);
                }
                None => debug!(submitter = %name, "ignoring tasks of unknown submitter"),
            }
        }
    }

    pub fn task_snapshot(&self) -> BTreeMap<String, BTreeMap<u64, TaskDescriptor>> {
        self.submitters
            .iter()
            .map(|(name, submitter)| (name.clone(), submitter.tasks.clone()))
            .collect()
    }

    /// Catalog status of every record the catalog has been checked for.
    pub fn catalog_snapshot(&self) -> BTreeMap<String, CatalogStatus> {
        self.records
            .iter()
            .filter(|(_, record)| record.catalog_status != CatalogStatus::Unknown)
            .map(|(id, record)| (id.clone(), record.catalog_status))
            .collect()
    }

    /// Set saved catalog statuses on existing records; unknown ids are
    /// ignored.
    pub fn restore_catalog(&mut self, snapshot: &BTreeMap<String, CatalogStatus>) -> usize {
        let mut restored = 0;
        for (id, status) in snapshot {
            if let Some(record) = self.records.get_mut(id) {
                record.catalog_status = *status;
                restored += 1;
            }
        }
        restored
    }

    /// Recompute every histogram and verdict from scratch.
    pub fn update_statistics(&mut self) -> &CampaignStats {
        let stats = stats::rollup(self);
        self.stats.insert(stats)
    }
}
