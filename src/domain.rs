use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CampaignError;

/// Classification of a systematic variation. Nominal and sample-systematic
/// variations are the only ones produced for data and fake-estimate samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystematicKind {
    Regular,
    Nominal,
    SampleSyst,
}

impl SystematicKind {
    pub fn is_nominal(self) -> bool {
        matches!(self, SystematicKind::Nominal | SystematicKind::SampleSyst)
    }

    /// Kind used when the systematics list does not name one.
    pub fn infer(long_name: &str) -> Self {
        if long_name.to_lowercase().contains("nominal") {
            SystematicKind::Nominal
        } else {
            SystematicKind::Regular
        }
    }
}

impl fmt::Display for SystematicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystematicKind::Regular => write!(f, "regular"),
            SystematicKind::Nominal => write!(f, "nominal"),
            SystematicKind::SampleSyst => write!(f, "sample_syst"),
        }
    }
}

impl FromStr for SystematicKind {
    type Err = CampaignError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "regular" => Ok(SystematicKind::Regular),
            "nominal" => Ok(SystematicKind::Nominal),
            "sample_syst" | "sample-syst" => Ok(SystematicKind::SampleSyst),
            other => Err(CampaignError::ConfigParse(format!(
                "unknown systematic kind: {other}"
            ))),
        }
    }
}

/// Trailing part of a dataset identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetSuffix {
    #[serde(rename = "_app_output.root")]
    AppOutput,
    #[serde(rename = "_mem_output.root")]
    MemOutput,
    #[serde(rename = ".log")]
    Log,
}

impl DatasetSuffix {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetSuffix::AppOutput => "_app_output.root",
            DatasetSuffix::MemOutput => "_mem_output.root",
            DatasetSuffix::Log => ".log",
        }
    }

    pub fn output_kind(self) -> Option<OutputKind> {
        match self {
            DatasetSuffix::AppOutput => Some(OutputKind::App),
            DatasetSuffix::MemOutput => Some(OutputKind::Mem),
            DatasetSuffix::Log => None,
        }
    }
}

impl fmt::Display for DatasetSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetSuffix {
    type Err = CampaignError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "_app_output.root" => Ok(DatasetSuffix::AppOutput),
            "_mem_output.root" => Ok(DatasetSuffix::MemOutput),
            ".log" => Ok(DatasetSuffix::Log),
            other => Err(CampaignError::InvalidSuffix(other.to_string())),
        }
    }
}

/// Which grid job produced an output bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    App,
    Mem,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::App => "app",
            OutputKind::Mem => "mem",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CatalogStatus {
    #[default]
    Unknown,
    Done,
    Missing,
    Duplicate,
}

impl CatalogStatus {
    /// Status derived from the number of catalog entries matching one identifier.
    pub fn from_entry_count(count: usize) -> Self {
        match count {
            0 => CatalogStatus::Missing,
            1 => CatalogStatus::Done,
            _ => CatalogStatus::Duplicate,
        }
    }
}

impl fmt::Display for CatalogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogStatus::Unknown => write!(f, "unknown"),
            CatalogStatus::Done => write!(f, "done"),
            CatalogStatus::Missing => write!(f, "missing"),
            CatalogStatus::Duplicate => write!(f, "duplicate"),
        }
    }
}

impl From<CatalogStatus> for String {
    fn from(value: CatalogStatus) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for CatalogStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "unknown" => Ok(CatalogStatus::Unknown),
            "done" => Ok(CatalogStatus::Done),
            "missing" => Ok(CatalogStatus::Missing),
            "duplicate" => Ok(CatalogStatus::Duplicate),
            other => Err(format!("unknown catalog status: {other}")),
        }
    }
}

/// Task state as reported by the tracking service. Unrecognised strings are
/// kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    #[default]
    Unknown,
    Pending,
    Running,
    Finished,
    Done,
    Failed,
    Broken,
    Exhausted,
    Throttled,
    Aborted,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Unknown => "unknown",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Broken => "broken",
            TaskStatus::Exhausted => "exhausted",
            TaskStatus::Throttled => "throttled",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Other(value) => value,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    /// A broken task never counts as the producer of a dataset.
    pub fn is_broken(&self) -> bool {
        matches!(self, TaskStatus::Broken)
    }

    fn precedence(&self) -> u8 {
        match self {
            TaskStatus::Done => 2,
            TaskStatus::Running | TaskStatus::Finished => 1,
            _ => 0,
        }
    }

    /// Whether this status replaces `current` when several tasks report on
    /// the same dataset: `done` beats `running`/`finished`, which beat
    /// anything else. Ties go to the newer report.
    pub fn supersedes(&self, current: &TaskStatus) -> bool {
        self.precedence() >= current.precedence()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TaskStatus {
    fn from(value: &str) -> Self {
        match value.trim() {
            "" | "unknown" => TaskStatus::Unknown,
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "finished" => TaskStatus::Finished,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            "broken" => TaskStatus::Broken,
            "exhausted" => TaskStatus::Exhausted,
            "throttled" => TaskStatus::Throttled,
            "aborted" => TaskStatus::Aborted,
            other => TaskStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        TaskStatus::from(value.as_str())
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for TaskStatus {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(TaskStatus::from(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(into = "String")]
pub enum DownloadStatus {
    #[default]
    Unknown,
    PathNotSet,
    NotYetDownloaded,
    UpstreamNotReady,
    Incomplete,
    Done,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Unknown => write!(f, "unknown"),
            DownloadStatus::PathNotSet => write!(f, "path-not-set"),
            DownloadStatus::NotYetDownloaded => write!(f, "not-yet-downloaded"),
            DownloadStatus::UpstreamNotReady => write!(f, "upstream-not-ready"),
            DownloadStatus::Incomplete => write!(f, "incomplete"),
            DownloadStatus::Done => write!(f, "done"),
        }
    }
}

impl From<DownloadStatus> for String {
    fn from(value: DownloadStatus) -> Self {
        value.to_string()
    }
}

/// Outcome of the last merge attempt on one dataset. Every early return of
/// the merge gate maps to its own variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(into = "String")]
pub enum MergeStatus {
    #[default]
    Uninitialized,
    Failed,
    NoCampaignContext,
    NotDownloaded,
    NoTargetDir,
    NoRegexMatch,
    CannotClassify,
    NotInSampleConfig,
    NoIdReferenceFile,
    Done,
    Added(usize),
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStatus::Uninitialized => write!(f, "uninitialized"),
            MergeStatus::Failed => write!(f, "failed"),
            MergeStatus::NoCampaignContext => write!(f, "no-campaign-context"),
            MergeStatus::NotDownloaded => write!(f, "not-downloaded"),
            MergeStatus::NoTargetDir => write!(f, "no-target-dir"),
            MergeStatus::NoRegexMatch => write!(f, "no-regex-match"),
            MergeStatus::CannotClassify => write!(f, "cannot-classify-app-or-mem"),
            MergeStatus::NotInSampleConfig => write!(f, "not-in-sample-config"),
            MergeStatus::NoIdReferenceFile => write!(f, "no-id-reference-file"),
            MergeStatus::Done => write!(f, "done"),
            MergeStatus::Added(count) => write!(f, "{count}-added"),
        }
    }
}

impl From<MergeStatus> for String {
    fn from(value: MergeStatus) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Done,
    Incomplete,
}

impl Verdict {
    /// Done iff every owned record is visible in the catalog. Zero records
    /// count as done.
    pub fn from_counts(done: usize, total: usize) -> Self {
        if done == total {
            Verdict::Done
        } else {
            Verdict::Incomplete
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Done => write!(f, "done"),
            Verdict::Incomplete => write!(f, "incomplete"),
        }
    }
}
