use std::sync::LazyLock;

use regex::Regex;

use crate::domain::{DatasetSuffix, OutputKind};
use crate::error::CampaignError;

/// Production tag marking the fake-estimate variant of a data output file.
pub const FAKE_ESTIMATE_TAG: &str = "p43";

static SCOPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(user\.\w+)\.").expect("valid scope regex"));

static SPLIT_SAMPLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9]*[A-Za-z]+)([0-9]+)?([a-z]*)$").expect("valid split regex")
});

static GRID_OUTPUT_DIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(user\.\w+)\.(\w+)\.([0-9A-Za-z]+)_(\w+)\.(v\w+)\.(v\w+)(_(?:app|mem)_output\.root|\.log)(?:\.[0-9]+)?$",
    )
    .expect("valid grid output dir regex")
});

static GRID_OUTPUT_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(user\.\w+)\.([0-9]+)\.(\w+)\.([0-9]+)\._([0-9]+)\.((?:app|mem)_output\.root)$")
        .expect("valid grid output file regex")
});

static GRID_OUTPUT_FILE_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(user\.\w+)\.AllYear\.grp(1[5-8])_(\w+)\.([0-9]+)\._([0-9]+)\.((?:app|mem)_output\.root)$",
    )
    .expect("valid grid output data file regex")
});

/// Grid scope of a submitter account.
pub fn scope_for(account: &str) -> String {
    format!("user.{account}")
}

/// Scope prefix of a full identifier, e.g. `user.alice` for `user.alice.camp...`.
pub fn scope_of(identifier: &str) -> Option<&str> {
    SCOPE_RE
        .captures(identifier)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Samples that are only ever produced under a nominal systematic: detector
/// data and background estimates.
pub fn is_nominal_only_sample(sample: &str) -> bool {
    let lower = sample.to_lowercase();
    lower.contains("data") || lower.contains("qcd")
}

/// Naming parameters shared by every identifier of one campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidTemplate {
    pub campaign: String,
    pub ntup_version: String,
    pub grid_version: String,
    pub suffix: DatasetSuffix,
}

impl DidTemplate {
    /// Identifier without the submitter scope.
    pub fn partial(&self, sample: &str, systematic_short: &str) -> String {
        format!(
            "{}.{}_{}.{}.{}{}",
            self.campaign,
            sample,
            systematic_short,
            self.ntup_version,
            self.grid_version,
            self.suffix
        )
    }

    pub fn full(&self, account: &str, sample: &str, systematic_short: &str) -> String {
        format!(
            "{}.{}",
            scope_for(account),
            self.partial(sample, systematic_short)
        )
    }

    /// `ntup.grid`, the sub-directory merged outputs are grouped under.
    pub fn grid_id(&self) -> String {
        format!("{}.{}", self.ntup_version, self.grid_version)
    }

    /// Task-name filter keeping only tasks of this campaign version.
    pub fn version_filter(&self) -> Regex {
        let pattern = format!(
            r".*{}\.{}/?$",
            regex::escape(&self.ntup_version),
            regex::escape(&self.grid_version)
        );
        Regex::new(&pattern).expect("escaped version filter is a valid regex")
    }
}

/// Result of splitting a sample name into its super-sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSplit {
    pub super_sample: String,
    pub is_part_of_split: bool,
}

pub fn split_sample_name(name: &str, nominal_only: bool) -> Result<SampleSplit, CampaignError> {
    let caps = SPLIT_SAMPLE_RE
        .captures(name)
        .ok_or_else(|| CampaignError::InvalidSampleName(name.to_string()))?;
    let split_index = caps.get(2);
    if nominal_only || split_index.is_none() {
        return Ok(SampleSplit {
            super_sample: name.to_string(),
            is_part_of_split: false,
        });
    }
    Ok(SampleSplit {
        super_sample: caps[1].to_string(),
        is_part_of_split: true,
    })
}

/// Fields of a downloaded grid output directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridOutputDir {
    pub scope: String,
    pub stream: String,
    pub sample: String,
    pub systematic_short: String,
    pub ntup_version: String,
    pub grid_version: String,
    pub suffix: String,
}

impl GridOutputDir {
    pub fn parse(name: &str) -> Option<Self> {
        let caps = GRID_OUTPUT_DIR_RE.captures(name)?;
        Some(Self {
            scope: caps[1].to_string(),
            stream: caps[2].to_string(),
            sample: caps[3].to_string(),
            systematic_short: caps[4].to_string(),
            ntup_version: caps[5].to_string(),
            grid_version: caps[6].to_string(),
            suffix: caps[7].to_string(),
        })
    }

    pub fn grid_id(&self) -> String {
        format!("{}.{}", self.ntup_version, self.grid_version)
    }

    /// App or mem job, if the suffix says so.
    pub fn output_kind(&self) -> Option<OutputKind> {
        self.suffix
            .parse::<DatasetSuffix>()
            .ok()
            .and_then(DatasetSuffix::output_kind)
    }

    /// Extension expected on the contained files, e.g. `mem_output.root`.
    pub fn file_extension(&self) -> &str {
        self.suffix.trim_start_matches('_')
    }
}

/// Fields of one file inside a grid output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridOutputFile {
    pub scope: String,
    pub constituent: String,
    pub tags: String,
    pub task_id: String,
    pub number: String,
    pub extension: String,
}

impl GridOutputFile {
    /// Parse a standard output file name, falling back to the data layout
    /// where the constituent is rebuilt from the data-taking year.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(caps) = GRID_OUTPUT_FILE_RE.captures(name) {
            return Some(Self {
                scope: caps[1].to_string(),
                constituent: caps[2].to_string(),
                tags: caps[3].to_string(),
                task_id: caps[4].to_string(),
                number: caps[5].to_string(),
                extension: caps[6].to_string(),
            });
        }
        let caps = GRID_OUTPUT_FILE_DATA_RE.captures(name)?;
        let tags = caps[3].to_string();
        let prefix = if tags.contains(FAKE_ESTIMATE_TAG) {
            "QCDANTIMUON"
        } else {
            "data"
        };
        Some(Self {
            scope: caps[1].to_string(),
            constituent: format!("{prefix}{}", &caps[2]),
            tags,
            task_id: caps[4].to_string(),
            number: caps[5].to_string(),
            extension: caps[6].to_string(),
        })
    }
}

/// Fixed parts of merged output file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetNaming {
    pub prefix: String,
    pub njets: String,
    pub channel: String,
}

impl Default for TargetNaming {
    fn default() -> Self {
        Self {
            prefix: "ntup_schan".to_string(),
            njets: "2j".to_string(),
            channel: "lnu".to_string(),
        }
    }
}

impl TargetNaming {
    pub fn file_name(&self, kind: OutputKind, systematic: &str, canonical_sample: &str) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}.root",
            kind, self.prefix, self.njets, self.channel, systematic, canonical_sample
        )
    }
}

/// Canonical name with the zero-padded subjob index appended.
pub fn with_subjob_index(canonical: &str, subjob_id: u32) -> String {
    format!("{canonical}{subjob_id:03}")
}
