use std::fmt::Write as _;
use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    DownloadResult, ExpectedResult, MergeResult, ProgressEvent, ProgressSink, StatusResult,
    TaskCommandResult,
};
use crate::domain::Verdict;
use crate::stats::{CampaignStats, NodeStats, StatusHistogram};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_expected(result: &ExpectedResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_merge(result: &MergeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_tasks(result: &TaskCommandResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Plain-text campaign summary, one block per submitter.
pub fn render_summary(campaign: &str, stats: &CampaignStats) -> String {
    let mut out = String::new();
    let root = &stats.root;
    let _ = writeln!(out, "Summary for campaign {campaign}");
    let _ = writeln!(
        out,
        "  {:4}/{:4}/{:4} datasets done/distributed/expected",
        stats.done, stats.distributed, stats.expected
    );
    let _ = writeln!(
        out,
        "  {:4} missing in catalog, {:4} expected but not distributed",
        stats.missing, stats.undistributed
    );
    let _ = writeln!(
        out,
        "  {:4}/{:4} submitters complete",
        NodeStats::count(&root.child_verdicts, "done"),
        root.children.len()
    );
    for (name, submitter) in &root.children {
        let _ = writeln!(out, "\n  Submitter {name}: {}", submitter.verdict);
        let _ = writeln!(
            out,
            "    {:4}/{:4} datasets visible in catalog",
            submitter.done, submitter.total
        );
        let _ = writeln!(
            out,
            "    {:4}/{:4} systematics complete",
            NodeStats::count(&submitter.child_verdicts, "done"),
            submitter.children.len()
        );
        let _ = writeln!(out, "    catalog:  {}", render_histogram(&submitter.catalog));
        let _ = writeln!(out, "    tasks:    {}", render_histogram(&submitter.task));
        let _ = writeln!(out, "    download: {}", render_histogram(&submitter.download));
        let _ = writeln!(out, "    merge:    {}", render_histogram(&submitter.merge));
        for (systematic, node) in &submitter.children {
            if node.verdict == Verdict::Done {
                continue;
            }
            let _ = writeln!(
                out,
                "      {systematic}: {}/{} done",
                node.done, node.total
            );
        }
    }
    out
}

fn render_histogram(histogram: &StatusHistogram) -> String {
    if histogram.is_empty() {
        return "-".to_string();
    }
    histogram
        .iter()
        .map(|(label, count)| format!("{label}={count}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pass counts and per-submitter failures of a status or summary run,
/// printed ahead of the campaign summary.
pub fn render_status_report(result: &StatusResult) -> String {
    let mut out = String::new();
    match &result.catalog {
        Some(catalog) => {
            let counts = &catalog.counts;
            let _ = writeln!(
                out,
                "Catalog: {} checked, {} done, {} missing, {} duplicate",
                counts.checked, counts.done, counts.missing, counts.duplicate
            );
            for failure in &catalog.failures {
                let _ = writeln!(out, "  {}: {}", failure.submitter, failure.error);
            }
        }
        None if result.restored_catalog > 0 => {
            let _ = writeln!(
                out,
                "Catalog: not refreshed, {} statuses from the last status run",
                result.restored_catalog
            );
        }
        None => {
            let _ = writeln!(
                out,
                "Catalog: not refreshed and nothing cached, run `gcm status` first"
            );
        }
    }
    let matches = &result.task_matches;
    let _ = writeln!(
        out,
        "Tasks: {} records updated, {} unexpected, {} broken",
        matches.updated, matches.unexpected, matches.broken
    );
    if let Some(tracking) = &result.tracking {
        for failure in &tracking.failures {
            let _ = writeln!(out, "  {}: {}", failure.submitter, failure.error);
        }
    }
    out
}

pub fn print_status(result: &StatusResult) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(render_status_report(result).as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.write_all(render_summary(&result.campaign, &result.stats).as_bytes())
}

pub fn print_summary(campaign: &str, stats: &CampaignStats) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(render_summary(campaign, stats).as_bytes())
}
