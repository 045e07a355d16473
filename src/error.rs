use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CampaignError {
    #[error("missing config file gcm.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("sample name \"{0}\" does not match the split-sample pattern")]
    InvalidSampleName(String),

    #[error("invalid submission date (expected YYYY-MM-DD): {0}")]
    InvalidSubmissionDate(String),

    #[error("invalid output suffix: {0}")]
    InvalidSuffix(String),

    #[error("unknown submitter: {0}")]
    UnknownSubmitter(String),

    #[error("catalog command failed: {0}")]
    CatalogCommand(String),

    #[error("unexpected catalog output: {0}")]
    CatalogParse(String),

    #[error("tracking request failed: {0}")]
    TrackingHttp(String),

    #[error("tracking service returned status {status}: {message}")]
    TrackingStatus { status: u16, message: String },

    #[error("tracking query for {identity} failed with code {code}")]
    TrackingQuery { identity: String, code: i64 },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("merge command failed: {0}")]
    MergeCommand(String),

    #[error("task cache error: {0}")]
    TaskCache(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl CampaignError {
    /// Transport-level failures coming from a remote service or an external tool.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CampaignError::CatalogCommand(_)
                | CampaignError::CatalogParse(_)
                | CampaignError::TrackingHttp(_)
                | CampaignError::TrackingStatus { .. }
                | CampaignError::TrackingQuery { .. }
                | CampaignError::MissingTool(_)
        )
    }
}
