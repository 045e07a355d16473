use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::{CatalogStatus, Verdict};
use crate::model::{Campaign, DatasetRecord};

/// Frequency count of status labels.
pub type StatusHistogram = BTreeMap<String, usize>;

/// Histograms and verdict of one node of the campaign hierarchy. Children are
/// keyed by name, so traversal is always in lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub total: usize,
    pub done: usize,
    pub verdict: Verdict,
    pub catalog: StatusHistogram,
    pub task: StatusHistogram,
    pub download: StatusHistogram,
    pub merge: StatusHistogram,
    pub child_verdicts: StatusHistogram,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, NodeStats>,
}

impl NodeStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DatasetRecord>) -> Self {
        let mut catalog = StatusHistogram::new();
        let mut task = StatusHistogram::new();
        let mut download = StatusHistogram::new();
        let mut merge = StatusHistogram::new();
        let mut total = 0usize;
        let mut done = 0usize;
        for record in records {
            total += 1;
            if record.catalog_status == CatalogStatus::Done {
                done += 1;
            }
            *catalog.entry(record.catalog_status.to_string()).or_default() += 1;
            *task.entry(record.task_status.to_string()).or_default() += 1;
            *download.entry(record.download_status.to_string()).or_default() += 1;
            *merge.entry(record.merge_status.to_string()).or_default() += 1;
        }
        Self {
            total,
            done,
            verdict: Verdict::from_counts(done, total),
            catalog,
            task,
            download,
            merge,
            child_verdicts: StatusHistogram::new(),
            children: BTreeMap::new(),
        }
    }

    fn with_children(mut self, children: BTreeMap<String, NodeStats>) -> Self {
        let mut child_verdicts = StatusHistogram::new();
        for child in children.values() {
            *child_verdicts.entry(child.verdict.to_string()).or_default() += 1;
        }
        self.child_verdicts = child_verdicts;
        self.children = children;
        self
    }

    pub fn count(histogram: &StatusHistogram, label: &str) -> usize {
        histogram.get(label).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignStats {
    pub expected: usize,
    pub distributed: usize,
    pub done: usize,
    pub missing: usize,
    pub undistributed: usize,
    pub root: NodeStats,
}

/// Compute every node's histograms and verdict from the current record
/// statuses. Nothing is carried over from a previous rollup.
pub fn rollup(campaign: &Campaign) -> CampaignStats {
    let records = campaign.records();
    let lookup = |ids: &std::collections::BTreeSet<String>| {
        ids.iter()
            .filter_map(|id| records.get(id))
            .collect::<Vec<_>>()
    };

    let mut submitters = BTreeMap::new();
    for (name, submitter) in campaign.submitters() {
        let mut systematics = BTreeMap::new();
        for (syst_name, systematic) in submitter.systematics() {
            let samples = systematic
                .samples()
                .iter()
                .map(|(sample_name, sample)| {
                    (sample_name.clone(), NodeStats::from_records(lookup(sample.dids())))
                })
                .collect::<BTreeMap<_, _>>();
            let node = NodeStats::from_records(lookup(systematic.dids())).with_children(samples);
            systematics.insert(syst_name.clone(), node);
        }
        let node = NodeStats::from_records(lookup(submitter.dids())).with_children(systematics);
        submitters.insert(name.clone(), node);
    }

    let root = NodeStats::from_records(records.values()).with_children(submitters);
    CampaignStats {
        expected: campaign.expected_partial().len(),
        distributed: root.total,
        done: root.done,
        missing: NodeStats::count(&root.catalog, &CatalogStatus::Missing.to_string()),
        undistributed: campaign.undistributed().len(),
        root,
    }
}
