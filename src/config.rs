use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{DatasetSuffix, SystematicKind};
use crate::error::CampaignError;
use crate::naming::{DidTemplate, TargetNaming};
use crate::tracking::TrackingEndpoints;

pub const DEFAULT_CONFIG_FILE: &str = "gcm.json";
pub const DEFAULT_SUBMISSION_DATE: &str = "2019-01-15";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub campaign: String,
    pub ntup_version: String,
    pub grid_version: String,
    #[serde(default)]
    pub submission_date: Option<String>,
    #[serde(default)]
    pub output_suffix: Option<String>,
    #[serde(default)]
    pub download_dir: Option<String>,
    #[serde(default)]
    pub merge_target_dir: Option<String>,
    #[serde(default)]
    pub id_reference_file: Option<String>,
    #[serde(default)]
    pub systematics_file: Option<String>,
    #[serde(default)]
    pub samples_file: Option<String>,
    #[serde(default)]
    pub sample_config_file: Option<String>,
    #[serde(default)]
    pub submitters: Vec<SubmitterEntry>,
    #[serde(default)]
    pub naming: Option<NamingEntry>,
    #[serde(default)]
    pub tracking: Option<TrackingEntry>,
    #[serde(default)]
    pub task_cache: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SubmitterEntry {
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub systematics_file: Option<String>,
    #[serde(default)]
    pub samples_file: Option<String>,
    #[serde(default)]
    pub systematics: Vec<String>,
    #[serde(default)]
    pub samples: Vec<String>,
    #[serde(default)]
    pub download_dir: Option<String>,
    #[serde(default)]
    pub merge_target_dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NamingEntry {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub njets: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TrackingEntry {
    #[serde(default)]
    pub monitor_url: Option<String>,
    #[serde(default)]
    pub server_url: Option<String>,
}

/// Per-sample entry of the sample configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SampleSettings {
    #[serde(default)]
    pub dids: Vec<String>,
    #[serde(default)]
    pub nsubjobs: Option<u32>,
    #[serde(default)]
    pub subjobid: Option<u32>,
    #[serde(default)]
    pub nfilesperjob: Option<u32>,
}

impl SampleSettings {
    /// `(nsubjobs, subjobid)` when the sample is one part of a split submission.
    pub fn split(&self) -> Option<(u32, u32)> {
        match (self.nsubjobs, self.subjobid) {
            (Some(n), Some(id)) if n > 1 => Some((n, id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystematicSpec {
    pub long_name: String,
    pub short_name: String,
    pub kind: SystematicKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitterRequest {
    pub name: String,
    pub full_name: Option<String>,
    pub systematics: Vec<String>,
    pub samples: Vec<String>,
    pub download_dir: Option<Utf8PathBuf>,
    pub merge_target_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub template: DidTemplate,
    pub since: DateTime<Utc>,
    pub download_dir: Option<Utf8PathBuf>,
    pub merge_target_dir: Option<Utf8PathBuf>,
    pub id_reference_file: Option<Utf8PathBuf>,
    pub systematics: Vec<SystematicSpec>,
    pub samples: Vec<String>,
    pub sample_config: BTreeMap<String, SampleSettings>,
    pub submitters: Vec<SubmitterRequest>,
    pub naming: TargetNaming,
    pub tracking: TrackingEndpoints,
    pub task_cache: Option<Utf8PathBuf>,
}

impl ResolvedConfig {
    /// Configuration with no lists, submitters or directories.
    pub fn new(template: DidTemplate) -> Self {
        Self {
            template,
            since: DateTime::<Utc>::UNIX_EPOCH,
            download_dir: None,
            merge_target_dir: None,
            id_reference_file: None,
            systematics: Vec::new(),
            samples: Vec::new(),
            sample_config: BTreeMap::new(),
            submitters: Vec::new(),
            naming: TargetNaming::default(),
            tracking: TrackingEndpoints::default(),
            task_cache: None,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CampaignError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(CampaignError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CampaignError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CampaignError::ConfigParse(err.to_string()))?;

        let base_dir = config_path
            .parent()
            .map(|parent| parent.to_path_buf())
            .unwrap_or_default();
        let base_dir = Utf8PathBuf::from_path_buf(base_dir)
            .map_err(|_| CampaignError::Filesystem("non-utf8 config directory".to_string()))?;

        Self::resolve_config(config, &base_dir)
    }

    pub fn resolve_config(
        config: Config,
        base_dir: &Utf8Path,
    ) -> Result<ResolvedConfig, CampaignError> {
        let suffix = match config.output_suffix.as_deref() {
            Some(value) => value.parse::<DatasetSuffix>()?,
            None => DatasetSuffix::MemOutput,
        };
        let since = parse_submission_date(
            config
                .submission_date
                .as_deref()
                .unwrap_or(DEFAULT_SUBMISSION_DATE),
        )?;

        let systematics = match config.systematics_file.as_deref() {
            Some(file) => {
                let path = resolve_path(base_dir, file);
                let specs = parse_systematics(&read_list_file(&path)?)?;
                info!(count = specs.len(), file = %path, "loaded systematics");
                specs
            }
            None => Vec::new(),
        };

        let (samples, sample_config) = match (
            config.sample_config_file.as_deref(),
            config.samples_file.as_deref(),
        ) {
            (Some(file), _) => {
                let path = resolve_path(base_dir, file);
                let sample_config = read_sample_config(&path)?;
                let samples = sample_config.keys().cloned().collect::<Vec<_>>();
                info!(count = samples.len(), file = %path, "loaded sample configuration");
                (samples, sample_config)
            }
            (None, Some(file)) => {
                let path = resolve_path(base_dir, file);
                let samples = dedup_preserving_order(read_list_file(&path)?);
                info!(count = samples.len(), file = %path, "loaded sample list");
                (samples, BTreeMap::new())
            }
            (None, None) => (Vec::new(), BTreeMap::new()),
        };

        let submitters = config
            .submitters
            .into_iter()
            .map(|entry| resolve_submitter(entry, base_dir))
            .collect::<Result<Vec<_>, CampaignError>>()?;

        let naming = match config.naming {
            Some(entry) => {
                let defaults = TargetNaming::default();
                TargetNaming {
                    prefix: entry.prefix.unwrap_or(defaults.prefix),
                    njets: entry.njets.unwrap_or(defaults.njets),
                    channel: entry.channel.unwrap_or(defaults.channel),
                }
            }
            None => TargetNaming::default(),
        };

        let defaults = TrackingEndpoints::default();
        let tracking = match config.tracking {
            Some(entry) => TrackingEndpoints {
                monitor_url: entry.monitor_url.unwrap_or(defaults.monitor_url),
                server_url: entry.server_url.unwrap_or(defaults.server_url),
            },
            None => defaults,
        };

        Ok(ResolvedConfig {
            template: DidTemplate {
                campaign: config.campaign,
                ntup_version: config.ntup_version,
                grid_version: config.grid_version,
                suffix,
            },
            since,
            download_dir: config.download_dir.map(|dir| resolve_path(base_dir, &dir)),
            merge_target_dir: config
                .merge_target_dir
                .map(|dir| resolve_path(base_dir, &dir)),
            id_reference_file: config
                .id_reference_file
                .map(|file| resolve_path(base_dir, &file)),
            systematics,
            samples,
            sample_config,
            submitters,
            naming,
            tracking,
            task_cache: config.task_cache.map(|file| resolve_path(base_dir, &file)),
        })
    }
}

fn resolve_submitter(
    entry: SubmitterEntry,
    base_dir: &Utf8Path,
) -> Result<SubmitterRequest, CampaignError> {
    let mut systematics = entry.systematics;
    if let Some(file) = entry.systematics_file.as_deref() {
        systematics.extend(read_list_file(&resolve_path(base_dir, file))?);
    }
    let mut samples = entry.samples;
    if let Some(file) = entry.samples_file.as_deref() {
        samples.extend(read_list_file(&resolve_path(base_dir, file))?);
    }
    Ok(SubmitterRequest {
        name: entry.name,
        full_name: entry.full_name.filter(|name| !name.trim().is_empty()),
        systematics: dedup_preserving_order(systematics),
        samples: dedup_preserving_order(samples),
        download_dir: entry.download_dir.map(|dir| resolve_path(base_dir, &dir)),
        merge_target_dir: entry
            .merge_target_dir
            .map(|dir| resolve_path(base_dir, &dir)),
    })
}

pub fn parse_submission_date(value: &str) -> Result<DateTime<Utc>, CampaignError> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| CampaignError::InvalidSubmissionDate(value.to_string()))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| CampaignError::InvalidSubmissionDate(value.to_string()))?;
    Ok(midnight.and_utc())
}

fn resolve_path(base_dir: &Utf8Path, value: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from(value);
    if path.is_absolute() || base_dir.as_str().is_empty() {
        path
    } else {
        base_dir.join(path)
    }
}

/// Non-empty lines of a text list file, ignoring `#` comments.
pub fn read_list_file(path: &Utf8Path) -> Result<Vec<String>, CampaignError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|_| CampaignError::ConfigRead(path.as_std_path().to_path_buf()))?;
    Ok(parse_list(&content))
}

pub fn parse_list(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .collect()
}

/// Parse `long short [kind]` lines. The long and short names must map one to
/// one; a repeated name keeps its first mapping and is reported.
pub fn parse_systematics(lines: &[String]) -> Result<Vec<SystematicSpec>, CampaignError> {
    let mut specs: Vec<SystematicSpec> = Vec::new();
    for line in lines {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let (long_name, short_name) = match fields.as_slice() {
            [long, short, ..] => (long.to_string(), short.to_string()),
            _ => {
                return Err(CampaignError::ConfigParse(format!(
                    "systematics line needs a long and a short name: {line}"
                )));
            }
        };
        let kind = match fields.get(2) {
            Some(kind) => kind.parse()?,
            None => SystematicKind::infer(&long_name),
        };
        if let Some(existing) = specs.iter().find(|spec| spec.long_name == long_name) {
            if existing.short_name != short_name {
                warn!(
                    systematic = %long_name,
                    kept = %existing.short_name,
                    ignored = %short_name,
                    "systematic listed twice with different short names"
                );
            }
            continue;
        }
        if let Some(existing) = specs.iter().find(|spec| spec.short_name == short_name) {
            warn!(
                short = %short_name,
                kept = %existing.long_name,
                ignored = %long_name,
                "short systematic name is not unique"
            );
            continue;
        }
        specs.push(SystematicSpec {
            long_name,
            short_name,
            kind,
        });
    }
    Ok(specs)
}

pub fn read_sample_config(
    path: &Utf8Path,
) -> Result<BTreeMap<String, SampleSettings>, CampaignError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|_| CampaignError::ConfigRead(path.as_std_path().to_path_buf()))?;
    serde_json::from_str(&content).map_err(|err| CampaignError::ConfigParse(err.to_string()))
}

fn dedup_preserving_order(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_skips_comments_and_blanks() {
        let lines = parse_list("# header\nttbar\n\n   \n  wjets  \n");
        assert_eq!(lines, vec!["ttbar".to_string(), "wjets".to_string()]);
    }

    #[test]
    fn systematics_keep_first_short_name() {
        let lines = vec![
            "nominal nom".to_string(),
            "JET_UP jup".to_string(),
            "JET_DOWN jup".to_string(),
            "ttbar_rad rad sample_syst".to_string(),
        ];
        let specs = parse_systematics(&lines).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].kind, SystematicKind::Nominal);
        assert_eq!(specs[1].kind, SystematicKind::Regular);
        assert_eq!(specs[2].kind, SystematicKind::SampleSyst);
    }

    #[test]
    fn split_requires_more_than_one_subjob() {
        let single = SampleSettings {
            nsubjobs: Some(1),
            subjobid: Some(1),
            ..SampleSettings::default()
        };
        assert_eq!(single.split(), None);
        let split = SampleSettings {
            nsubjobs: Some(4),
            subjobid: Some(2),
            ..SampleSettings::default()
        };
        assert_eq!(split.split(), Some((4, 2)));
    }
}
