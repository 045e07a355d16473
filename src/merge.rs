use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SampleSettings;
use crate::domain::{DownloadStatus, MergeStatus};
use crate::error::CampaignError;
use crate::fs_util;
use crate::model::Campaign;
use crate::naming::{self, GridOutputDir, GridOutputFile, TargetNaming};

/// Multi-file merge primitive.
pub trait Merger: Send + Sync {
    fn merge(&self, sources: &[Utf8PathBuf], target: &Utf8Path) -> Result<(), CampaignError>;
}

/// Merger running `hadd -f9 <target> <sources...>`.
#[derive(Clone)]
pub struct HaddMerger {
    hadd: Option<PathBuf>,
}

impl HaddMerger {
    pub fn new() -> Self {
        Self {
            hadd: fs_util::find_in_path("hadd"),
        }
    }

    pub fn is_available(&self) -> bool {
        self.hadd.is_some()
    }
}

impl Default for HaddMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl Merger for HaddMerger {
    fn merge(&self, sources: &[Utf8PathBuf], target: &Utf8Path) -> Result<(), CampaignError> {
        let hadd = self
            .hadd
            .as_ref()
            .ok_or_else(|| CampaignError::MissingTool("hadd".to_string()))?;
        let mut cmd = Command::new(hadd);
        cmd.arg("-f9").arg(target.as_std_path());
        for source in sources {
            cmd.arg(source.as_std_path());
        }
        debug!(target = %target, sources = sources.len(), "running hadd");
        let output = cmd
            .output()
            .map_err(|err| CampaignError::MergeCommand(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("hadd failed for {target}")
        } else {
            stderr
        };
        Err(CampaignError::MergeCommand(message))
    }
}

/// Lines of the ID cross-reference file mapping constituent identifiers to
/// canonical sample names.
#[derive(Debug, Clone)]
pub struct IdCrossReference {
    lines: Vec<String>,
}

impl IdCrossReference {
    pub fn load(path: &Utf8Path) -> Result<Self, CampaignError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| CampaignError::Filesystem(format!("read {path}: {err}")))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self { lines }
    }

    /// First field of the first line containing `constituent`. Further
    /// matching lines are reported and ignored.
    pub fn lookup(&self, constituent: &str) -> Option<String> {
        let mut matches = self.lines.iter().filter(|line| line.contains(constituent));
        let first = matches.next()?;
        let others = matches.count();
        if others > 0 {
            warn!(constituent, others, "identifier matches several reference lines; using the first");
        }
        first.split(',').next().map(|field| field.trim().to_string())
    }
}

/// Campaign data the merge gate needs; owned so records can be updated
/// while it is in use.
#[derive(Debug, Clone)]
pub struct MergeContext {
    long_names: BTreeMap<String, String>,
    sample_config: BTreeMap<String, SampleSettings>,
    id_reference_file: Option<Utf8PathBuf>,
    naming: TargetNaming,
}

impl MergeContext {
    pub fn from_campaign(campaign: &Campaign) -> Self {
        Self {
            long_names: campaign
                .systematics()
                .iter()
                .map(|spec| (spec.short_name.clone(), spec.long_name.clone()))
                .collect(),
            sample_config: campaign.sample_config().clone(),
            id_reference_file: campaign.id_reference_file.clone(),
            naming: campaign.naming().clone(),
        }
    }
}

/// Per-record inputs of one merge attempt.
#[derive(Debug, Clone)]
pub struct MergeSource {
    pub did: String,
    pub source_dir: Option<Utf8PathBuf>,
    pub download_status: DownloadStatus,
    pub target_dir: Option<Utf8PathBuf>,
}

impl MergeSource {
    pub fn from_record(campaign: &Campaign, id: &str) -> Option<Self> {
        let record = campaign.record(id)?;
        Some(Self {
            did: id.to_string(),
            source_dir: campaign.download_path(record),
            download_status: record.download_status,
            target_dir: campaign
                .merge_target_dir_for(record.submitter())
                .map(Utf8Path::to_path_buf),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub require_downloaded: bool,
    pub overwrite: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            require_downloaded: true,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub statuses: BTreeMap<String, usize>,
    pub added: usize,
}

pub struct MergeGate<'a> {
    merger: &'a dyn Merger,
    options: MergeOptions,
}

impl<'a> MergeGate<'a> {
    pub fn new(merger: &'a dyn Merger, options: MergeOptions) -> Self {
        Self { merger, options }
    }

    pub fn merge_submitter(
        &self,
        campaign: &mut Campaign,
        name: &str,
    ) -> Result<MergeReport, CampaignError> {
        let ids = campaign
            .submitter(name)
            .map(|submitter| submitter.dids().iter().cloned().collect::<Vec<_>>())
            .ok_or_else(|| CampaignError::UnknownSubmitter(name.to_string()))?;
        let context = MergeContext::from_campaign(campaign);
        info!(submitter = name, records = ids.len(), "merging grid outputs");

        let mut report = MergeReport::default();
        for id in ids {
            let Some(source) = MergeSource::from_record(campaign, &id) else {
                continue;
            };
            let status = self.merge_dataset(Some(&context), &source);
            if let MergeStatus::Added(count) = status {
                report.added += count;
            }
            *report.statuses.entry(status.to_string()).or_default() += 1;
            if let Some(record) = campaign.record_mut(&id) {
                record.merge_status = status;
            }
        }
        Ok(report)
    }

    /// Merge every constituent group of one grid output bundle into its
    /// canonically named target. Each failed precondition yields its own
    /// status.
    pub fn merge_dataset(&self, context: Option<&MergeContext>, source: &MergeSource) -> MergeStatus {
        let Some(context) = context else {
            warn!(did = %source.did, "no campaign context, cannot merge");
            return MergeStatus::NoCampaignContext;
        };
        let Some(source_dir) = source
            .source_dir
            .as_deref()
            .filter(|dir| dir.as_std_path().is_dir())
        else {
            debug!(did = %source.did, "download directory does not exist, skip");
            return MergeStatus::NotDownloaded;
        };
        if self.options.require_downloaded && source.download_status != DownloadStatus::Done {
            debug!(did = %source.did, status = %source.download_status, "download not done, skip");
            return MergeStatus::NotDownloaded;
        }
        let Some(target_root) = source.target_dir.as_deref() else {
            warn!(did = %source.did, "no merge target directory configured");
            return MergeStatus::NoTargetDir;
        };
        let Some(grid_dir) = GridOutputDir::parse(&source.did) else {
            warn!(did = %source.did, "directory name does not match the grid output pattern");
            return MergeStatus::NoRegexMatch;
        };
        let Some(kind) = grid_dir.output_kind() else {
            warn!(did = %source.did, suffix = %grid_dir.suffix, "cannot tell app from mem output");
            return MergeStatus::CannotClassify;
        };
        let Some(systematic) = context.long_names.get(&grid_dir.systematic_short) else {
            warn!(
                did = %source.did,
                short = %grid_dir.systematic_short,
                "short systematic name unknown in this campaign"
            );
            return MergeStatus::NoRegexMatch;
        };
        let Some(settings) = context.sample_config.get(&grid_dir.sample) else {
            warn!(did = %source.did, sample = %grid_dir.sample, "sample not in sample configuration");
            return MergeStatus::NotInSampleConfig;
        };
        let Some(reference_file) = context.id_reference_file.as_deref() else {
            warn!(did = %source.did, "no id reference file configured");
            return MergeStatus::NoIdReferenceFile;
        };
        let reference = match IdCrossReference::load(reference_file) {
            Ok(reference) => reference,
            Err(err) => {
                warn!(error = %err, "cannot read id reference file");
                return MergeStatus::Failed;
            }
        };

        let groups = match group_output_files(source_dir, &grid_dir, settings) {
            Ok(groups) => groups,
            Err(err) => {
                warn!(did = %source.did, error = %err, "cannot list source directory");
                return MergeStatus::Failed;
            }
        };

        let target_dir = target_root
            .join(grid_dir.grid_id())
            .join(kind.as_str())
            .join(systematic);
        if let Err(err) = fs_util::ensure_dir(&target_dir) {
            warn!(error = %err, "cannot create merge target directory");
            return MergeStatus::Failed;
        }

        let mut added = 0usize;
        for (constituent, sources) in groups {
            let Some(mut canonical) = reference.lookup(&constituent) else {
                warn!(constituent = %constituent, "identifier not found in id reference file, skip");
                continue;
            };
            if let Some((nsubjobs, subjob_id)) = settings.split() {
                canonical = naming::with_subjob_index(&canonical, subjob_id);
                if !grid_dir.sample.ends_with(&format!("{nsubjobs}{subjob_id}")) {
                    warn!(
                        sample = %grid_dir.sample,
                        nsubjobs,
                        subjob_id,
                        "sample name does not carry its subjob suffix, skip"
                    );
                    continue;
                }
            }
            let target = target_dir.join(context.naming.file_name(kind, systematic, &canonical));
            if target.as_std_path().exists() && !self.options.overwrite {
                debug!(target = %target, "target exists, skip");
                continue;
            }
            info!(target = %target, sources = sources.len(), "merging");
            if let Err(err) = self.merger.merge(&sources, &target) {
                warn!(target = %target, error = %err, "merge failed");
                return MergeStatus::Failed;
            }
            added += 1;
        }

        if added == 0 {
            MergeStatus::Done
        } else {
            MergeStatus::Added(added)
        }
    }
}

/// Group the output files of one bundle by constituent identifier. Files
/// that do not belong to this bundle are skipped with a warning.
fn group_output_files(
    source_dir: &Utf8Path,
    grid_dir: &GridOutputDir,
    settings: &SampleSettings,
) -> Result<BTreeMap<String, Vec<Utf8PathBuf>>, CampaignError> {
    let mut groups: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();
    for path in fs_util::list_regular_files(source_dir)? {
        let Some(file_name) = path.file_name() else {
            continue;
        };
        let Some(file) = GridOutputFile::parse(file_name) else {
            warn!(file = file_name, "file does not match any output file pattern, skip");
            continue;
        };
        if file.scope != grid_dir.scope {
            warn!(
                file = file_name,
                file_scope = %file.scope,
                dir_scope = %grid_dir.scope,
                "scope of file and dataset differ, skip"
            );
            continue;
        }
        if !settings.dids.contains(&file.constituent) {
            warn!(
                constituent = %file.constituent,
                sample = %grid_dir.sample,
                "identifier not listed for sample"
            );
        }
        if file.extension != grid_dir.file_extension() {
            warn!(
                file = file_name,
                expected = grid_dir.file_extension(),
                "file extension differs from dataset suffix"
            );
        }
        groups.entry(file.constituent).or_default().push(path);
    }
    for sources in groups.values_mut() {
        sources.sort();
    }
    Ok(groups)
}
