use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;
use tracing::info;

use crate::domain::CatalogStatus;
use crate::error::CampaignError;
use crate::model::Campaign;
use crate::tracking::TaskDescriptor;

/// `{submitter: {task_id: descriptor}}` as persisted between runs.
pub type TaskSnapshot = BTreeMap<String, BTreeMap<u64, TaskDescriptor>>;

/// `{record id: catalog status}` from the last catalog pass.
pub type CatalogSnapshot = BTreeMap<String, CatalogStatus>;

/// On-disk cache of tracking-service task lists.
#[derive(Debug, Clone)]
pub struct TaskCache {
    path: Utf8PathBuf,
}

impl TaskCache {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    /// `~/.cache/grid-campaign-manager/tasks-<campaign>.json`
    pub fn default_for(campaign: &str) -> Result<Self, CampaignError> {
        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir().join(".cache").join("grid-campaign-manager"),
                )
                .ok()
            })
            .ok_or_else(|| {
                CampaignError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self::new(cache_root.join(format!("tasks-{campaign}.json"))))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Read the snapshot; a missing file is not an error.
    pub fn load(&self) -> Result<Option<TaskSnapshot>, CampaignError> {
        read_json(&self.path)
    }

    pub fn save(&self, snapshot: &TaskSnapshot) -> Result<(), CampaignError> {
        write_json_atomic(&self.path, snapshot)
    }

    /// Sibling file holding the catalog status of the last catalog pass.
    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.path.with_extension("catalog.json")
    }

    pub fn load_catalog(&self) -> Result<Option<CatalogSnapshot>, CampaignError> {
        read_json(&self.catalog_path())
    }

    /// Record the known catalog statuses, keeping saved entries for records
    /// the last pass could not check.
    pub fn dump_catalog_from(&self, campaign: &Campaign) -> Result<usize, CampaignError> {
        let mut snapshot = self.load_catalog()?.unwrap_or_default();
        snapshot.extend(campaign.catalog_snapshot());
        write_json_atomic(&self.catalog_path(), &snapshot)?;
        info!(file = %self.catalog_path(), records = snapshot.len(), "saved catalog status");
        Ok(snapshot.len())
    }

    /// Apply saved catalog statuses to the campaign's records. Returns the
    /// number of records updated.
    pub fn restore_catalog_into(&self, campaign: &mut Campaign) -> Result<usize, CampaignError> {
        let Some(snapshot) = self.load_catalog()? else {
            return Ok(0);
        };
        let count = campaign.restore_catalog(&snapshot);
        info!(file = %self.catalog_path(), records = count, "restored catalog status");
        Ok(count)
    }

    /// Merge cached tasks into the campaign's submitters. Returns the number
    /// of cached tasks read.
    pub fn restore_into(&self, campaign: &mut Campaign) -> Result<usize, CampaignError> {
        let Some(snapshot) = self.load()? else {
            return Ok(0);
        };
        let count = snapshot.values().map(BTreeMap::len).sum();
        campaign.restore_tasks(snapshot);
        info!(file = %self.path, tasks = count, "restored task cache");
        Ok(count)
    }

    pub fn dump_from(&self, campaign: &Campaign) -> Result<usize, CampaignError> {
        let snapshot = campaign.task_snapshot();
        let count = snapshot.values().map(BTreeMap::len).sum();
        self.save(&snapshot)?;
        info!(file = %self.path, tasks = count, "saved task cache");
        Ok(count)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, CampaignError> {
    if !path.as_std_path().exists() {
        info!(file = %path, "cache file does not exist, skip");
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| CampaignError::TaskCache(format!("read {path}: {err}")))?;
    let value = serde_json::from_str(&content)
        .map_err(|err| CampaignError::TaskCache(format!("parse {path}: {err}")))?;
    Ok(Some(value))
}

fn write_json_atomic<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<(), CampaignError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CampaignError::TaskCache(err.to_string()))?;
    let content = serde_json::to_vec_pretty(value)
        .map_err(|err| CampaignError::TaskCache(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix("gcm-cache")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CampaignError::TaskCache(err.to_string()))?;
    temp.write_all(&content)
        .map_err(|err| CampaignError::TaskCache(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CampaignError::TaskCache(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_location_is_named_after_campaign() {
        let cache = TaskCache::default_for("schan").unwrap();
        assert!(
            cache
                .path()
                .ends_with(".cache/grid-campaign-manager/tasks-schan.json")
        );
        assert!(
            cache
                .catalog_path()
                .ends_with(".cache/grid-campaign-manager/tasks-schan.catalog.json")
        );
    }
}
