use std::path::{Path, PathBuf};
use std::process::Command;

use camino::Utf8Path;
use serde::Serialize;
use tracing::debug;

use crate::error::CampaignError;
use crate::fs_util;

/// One dataset or file name reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub size_bytes: u64,
}

pub trait CatalogClient: Send + Sync {
    /// Datasets in `scope` whose name matches `name_filter`.
    fn list_entries(&self, scope: &str, name_filter: &str)
    -> Result<Vec<CatalogEntry>, CampaignError>;

    /// Files contained in one dataset.
    fn list_files(&self, scope: &str, name: &str) -> Result<Vec<CatalogEntry>, CampaignError>;

    /// Download one dataset into `<target_dir>/<name>`.
    fn download(&self, scope: &str, name: &str, target_dir: &Utf8Path)
    -> Result<(), CampaignError>;
}

/// Catalog client driving the `rucio` command line tool.
#[derive(Clone)]
pub struct RucioCliClient {
    rucio: Option<PathBuf>,
    ndownloader: u32,
}

impl RucioCliClient {
    pub fn new() -> Self {
        Self {
            rucio: fs_util::find_in_path("rucio"),
            ndownloader: 8,
        }
    }

    pub fn with_ndownloader(mut self, ndownloader: u32) -> Self {
        self.ndownloader = ndownloader.max(1);
        self
    }

    pub fn is_available(&self) -> bool {
        self.rucio.is_some()
    }

    fn require_rucio(&self) -> Result<&PathBuf, CampaignError> {
        self.rucio
            .as_ref()
            .ok_or_else(|| CampaignError::MissingTool("rucio".to_string()))
    }

    fn run_cmd(&self, program: &Path, args: &[String]) -> Result<String, CampaignError> {
        debug!(program = %program.display(), args = ?args, "running catalog command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CampaignError::CatalogCommand(err.to_string()))?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {} {}", program.display(), args.join(" "))
        } else {
            stderr
        };
        Err(CampaignError::CatalogCommand(message))
    }
}

impl Default for RucioCliClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogClient for RucioCliClient {
    fn list_entries(
        &self,
        scope: &str,
        name_filter: &str,
    ) -> Result<Vec<CatalogEntry>, CampaignError> {
        let rucio = self.require_rucio()?;
        let args = vec![
            "list-dids".to_string(),
            "--short".to_string(),
            format!("{scope}:{name_filter}"),
        ];
        let stdout = self.run_cmd(rucio, &args)?;
        Ok(parse_short_listing(&stdout))
    }

    fn list_files(&self, scope: &str, name: &str) -> Result<Vec<CatalogEntry>, CampaignError> {
        let rucio = self.require_rucio()?;
        let args = vec![
            "list-files".to_string(),
            "--csv".to_string(),
            format!("{scope}:{name}"),
        ];
        let stdout = self.run_cmd(rucio, &args)?;
        parse_file_listing(&stdout)
    }

    fn download(
        &self,
        scope: &str,
        name: &str,
        target_dir: &Utf8Path,
    ) -> Result<(), CampaignError> {
        let rucio = self.require_rucio()?;
        let args = vec![
            "download".to_string(),
            "--ndownloader".to_string(),
            self.ndownloader.to_string(),
            "--dir".to_string(),
            target_dir.to_string(),
            format!("{scope}:{name}"),
        ];
        self.run_cmd(rucio, &args).map(|_| ())
    }
}

/// Parse `list-dids --short` output: one `scope:name` per line.
pub fn parse_short_listing(stdout: &str) -> Vec<CatalogEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let name = line.split_once(':').map(|(_, name)| name).unwrap_or(line);
            CatalogEntry {
                name: name.to_string(),
                size_bytes: 0,
            }
        })
        .collect()
}

/// Parse `list-files --csv` output: `scope:name,guid,adler32,size,events`.
pub fn parse_file_listing(stdout: &str) -> Result<Vec<CatalogEntry>, CampaignError> {
    let mut entries = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let fields = line.split(',').map(str::trim).collect::<Vec<_>>();
        let (did, size) = match fields.as_slice() {
            [did, _guid, _checksum, size, ..] => (*did, *size),
            _ => return Err(CampaignError::CatalogParse(line.to_string())),
        };
        let size_bytes = size
            .parse::<u64>()
            .map_err(|_| CampaignError::CatalogParse(line.to_string()))?;
        let name = did.split_once(':').map(|(_, name)| name).unwrap_or(did);
        entries.push(CatalogEntry {
            name: name.to_string(),
            size_bytes,
        });
    }
    Ok(entries)
}
