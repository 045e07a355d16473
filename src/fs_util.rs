use std::fs;
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::CampaignError;

/// Create a directory and its parents; an existing directory is fine.
pub fn ensure_dir(path: &Utf8Path) -> Result<(), CampaignError> {
    fs::create_dir_all(path.as_std_path())
        .map_err(|err| CampaignError::Filesystem(format!("create {path}: {err}")))
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_regular_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CampaignError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| CampaignError::Filesystem(format!("read {dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| CampaignError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match Utf8PathBuf::from_path_buf(path) {
            Ok(path) => files.push(path),
            Err(path) => {
                tracing::warn!(path = %path.display(), "skipping non-utf8 file name");
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Size of a file on disk, zero when it does not exist.
pub fn file_size(path: &Utf8Path) -> u64 {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.len())
        .unwrap_or(0)
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
