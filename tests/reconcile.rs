use std::collections::BTreeMap;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8Path;
use chrono::{DateTime, Utc};

use grid_campaign_manager::catalog::{CatalogClient, CatalogEntry};
use grid_campaign_manager::config::{ResolvedConfig, SubmitterRequest, SystematicSpec};
use grid_campaign_manager::domain::{CatalogStatus, DatasetSuffix, SystematicKind, TaskStatus};
use grid_campaign_manager::error::CampaignError;
use grid_campaign_manager::model::{BuildMode, Campaign};
use grid_campaign_manager::naming::DidTemplate;
use grid_campaign_manager::reconcile::{self, Reconciler, TaskCommand, TaskRefresh};
use grid_campaign_manager::tracking::{TaskDescriptor, TaskQuery, TrackingClient};

const TTBAR_NOM: &str = "user.alice.schan.ttbar_nom.v29lj.v11_mem_output.root";
const TTBAR_JUP: &str = "user.alice.schan.ttbar_jup.v29lj.v11_mem_output.root";
const WJETS_NOM: &str = "user.alice.schan.wjets_nom.v29lj.v11_mem_output.root";
const BOB_TTBAR_NOM: &str = "user.bob.schan.ttbar_nom.v29lj.v11_mem_output.root";

/// Catalog answering with a fixed number of entries per identifier.
#[derive(Default)]
struct CountingCatalog {
    entries: BTreeMap<String, usize>,
    failing_scope: Option<String>,
    calls: Mutex<usize>,
}

impl CatalogClient for CountingCatalog {
    fn list_entries(
        &self,
        scope: &str,
        name_filter: &str,
    ) -> Result<Vec<CatalogEntry>, CampaignError> {
        *self.calls.lock().unwrap() += 1;
        if self.failing_scope.as_deref() == Some(scope) {
            return Err(CampaignError::CatalogCommand("no proxy".to_string()));
        }
        let count = self.entries.get(name_filter).copied().unwrap_or(0);
        Ok((0..count)
            .map(|_| CatalogEntry {
                name: name_filter.to_string(),
                size_bytes: 0,
            })
            .collect())
    }

    fn list_files(&self, _scope: &str, _name: &str) -> Result<Vec<CatalogEntry>, CampaignError> {
        Ok(Vec::new())
    }

    fn download(&self, _scope: &str, _name: &str, _target_dir: &Utf8Path) -> Result<(), CampaignError> {
        Err(CampaignError::CatalogCommand("not expected".to_string()))
    }
}

#[derive(Default)]
struct StubTracking {
    tasks: BTreeMap<u64, TaskDescriptor>,
    status_code: i64,
    failing_identity: Option<String>,
    queries: Mutex<Vec<String>>,
    retried: Mutex<Vec<u64>>,
    killed: Mutex<Vec<u64>>,
}

impl TrackingClient for StubTracking {
    fn query_tasks(
        &self,
        identity: &str,
        _since: DateTime<Utc>,
    ) -> Result<TaskQuery, CampaignError> {
        self.queries.lock().unwrap().push(identity.to_string());
        if self.failing_identity.as_deref() == Some(identity) {
            return Err(CampaignError::TrackingHttp("connection reset".to_string()));
        }
        Ok(TaskQuery {
            status_code: self.status_code,
            tasks: self.tasks.clone(),
        })
    }

    fn retry(&self, task_id: u64) -> Result<(), CampaignError> {
        if task_id == 13 {
            return Err(CampaignError::TrackingStatus {
                status: 500,
                message: "server error".to_string(),
            });
        }
        self.retried.lock().unwrap().push(task_id);
        Ok(())
    }

    fn kill(&self, task_id: u64) -> Result<(), CampaignError> {
        self.killed.lock().unwrap().push(task_id);
        Ok(())
    }
}

fn task(id: u64, status: TaskStatus, outputs: &str) -> (u64, TaskDescriptor) {
    (
        id,
        TaskDescriptor::new(id, &format!("user.alice.task{id}.v29lj.v11/"), status, outputs),
    )
}

fn campaign() -> Campaign {
    let mut config = ResolvedConfig::new(DidTemplate {
        campaign: "schan".to_string(),
        ntup_version: "v29lj".to_string(),
        grid_version: "v11".to_string(),
        suffix: DatasetSuffix::MemOutput,
    });
    config.systematics = vec![
        SystematicSpec {
            long_name: "nominal".to_string(),
            short_name: "nom".to_string(),
            kind: SystematicKind::Nominal,
        },
        SystematicSpec {
            long_name: "JET_UP".to_string(),
            short_name: "jup".to_string(),
            kind: SystematicKind::Regular,
        },
    ];
    config.samples = vec!["ttbar".to_string(), "wjets".to_string()];
    config.submitters = vec![
        SubmitterRequest {
            name: "alice".to_string(),
            full_name: Some("Alice A".to_string()),
            systematics: vec!["nominal".to_string(), "JET_UP".to_string()],
            samples: vec!["ttbar".to_string(), "wjets".to_string()],
            download_dir: None,
            merge_target_dir: None,
        },
        SubmitterRequest {
            name: "bob".to_string(),
            full_name: None,
            systematics: vec!["nominal".to_string()],
            samples: vec!["ttbar".to_string()],
            download_dir: None,
            merge_target_dir: None,
        },
        SubmitterRequest {
            name: "carol".to_string(),
            full_name: Some("Carol C".to_string()),
            systematics: Vec::new(),
            samples: Vec::new(),
            download_dir: None,
            merge_target_dir: None,
        },
    ];
    let mut campaign = Campaign::from_config(config).unwrap();
    campaign.build_expected_datasets(BuildMode::Reuse);
    campaign
}

#[test]
fn catalog_status_follows_entry_count() {
    let mut campaign = campaign();
    let catalog = CountingCatalog {
        entries: BTreeMap::from([(TTBAR_NOM.to_string(), 1), (TTBAR_JUP.to_string(), 2)]),
        ..CountingCatalog::default()
    };
    let tracking = StubTracking::default();
    let reconciler = Reconciler::new(&catalog, &tracking);

    let mut visited = Vec::new();
    let report = reconciler.reconcile_catalog(&mut campaign, |name| visited.push(name.to_string()));
    assert_eq!(visited, vec!["alice", "bob", "carol"]);
    assert!(report.failures.is_empty());
    assert_eq!(report.counts.checked, 5);
    assert_eq!(report.counts.done, 1);
    assert_eq!(report.counts.duplicate, 1);
    assert_eq!(report.counts.missing, 3);

    assert_eq!(campaign.record(TTBAR_NOM).unwrap().catalog_status, CatalogStatus::Done);
    assert_eq!(campaign.record(TTBAR_JUP).unwrap().catalog_status, CatalogStatus::Duplicate);
    assert_eq!(campaign.record(WJETS_NOM).unwrap().catalog_status, CatalogStatus::Missing);
    assert_eq!(*catalog.calls.lock().unwrap(), 5);
}

#[test]
fn catalog_failure_is_isolated_per_submitter() {
    let mut campaign = campaign();
    let catalog = CountingCatalog {
        entries: BTreeMap::from([(BOB_TTBAR_NOM.to_string(), 1)]),
        failing_scope: Some("user.alice".to_string()),
        ..CountingCatalog::default()
    };
    let tracking = StubTracking::default();
    let report = Reconciler::new(&catalog, &tracking).reconcile_catalog(&mut campaign, |_| {});

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].submitter, "alice");
    assert_eq!(
        campaign.record(BOB_TTBAR_NOM).unwrap().catalog_status,
        CatalogStatus::Done
    );
    assert_eq!(
        campaign.record(TTBAR_NOM).unwrap().catalog_status,
        CatalogStatus::Unknown
    );
}

#[test]
fn broken_tasks_never_claim_a_dataset() {
    let mut campaign = campaign();
    let tracking = StubTracking {
        tasks: BTreeMap::from([
            task(10, TaskStatus::Broken, &format!("{TTBAR_NOM}/")),
            task(11, TaskStatus::Running, &format!("{TTBAR_JUP}/")),
            task(12, TaskStatus::Done, "user.alice.schan.other_nom.v29lj.v11_mem_output.root"),
        ]),
        ..StubTracking::default()
    };
    let catalog = CountingCatalog::default();
    let report = Reconciler::new(&catalog, &tracking).reconcile_tracking(&mut campaign, false, |_| {});

    assert_eq!(report.matches.broken, 1);
    assert_eq!(report.matches.updated, 1);
    assert_eq!(report.matches.unexpected, 1);
    let record = campaign.record(TTBAR_NOM).unwrap();
    assert_eq!(record.task_status, TaskStatus::Unknown);
    assert_eq!(record.task_id, None);
    assert_eq!(
        campaign.record(TTBAR_JUP).unwrap().task_status,
        TaskStatus::Running
    );
}

#[test]
fn done_task_wins_regardless_of_order() {
    for (done_id, running_id) in [(20, 21), (21, 20)] {
        let mut campaign = campaign();
        campaign
            .submitter_mut("alice")
            .unwrap()
            .merge_tasks(BTreeMap::from([
                task(done_id, TaskStatus::Done, TTBAR_NOM),
                task(running_id, TaskStatus::Running, TTBAR_NOM),
            ]));
        let counts = reconcile::match_tasks(&mut campaign);
        let record = campaign.record(TTBAR_NOM).unwrap();
        assert_eq!(record.task_status, TaskStatus::Done);
        assert_eq!(record.task_id, Some(done_id));
        assert_eq!(counts.unexpected, 0);
    }
}

#[test]
fn fresh_pass_replaces_status_of_previous_pass() {
    let mut campaign = campaign();
    campaign.record_mut(TTBAR_NOM).unwrap().task_status = TaskStatus::Done;
    campaign
        .submitter_mut("alice")
        .unwrap()
        .merge_tasks(BTreeMap::from([task(30, TaskStatus::Running, TTBAR_NOM)]));
    reconcile::match_tasks(&mut campaign);
    assert_eq!(
        campaign.record(TTBAR_NOM).unwrap().task_status,
        TaskStatus::Running
    );
}

#[test]
fn refresh_keeps_only_tasks_of_this_version() {
    let mut campaign = campaign();
    let other = TaskDescriptor::new(41, "user.alice.task41.v28.v3/", TaskStatus::Done, TTBAR_NOM);
    let tracking = StubTracking {
        tasks: BTreeMap::from([task(40, TaskStatus::Done, TTBAR_NOM), (41, other)]),
        ..StubTracking::default()
    };
    let catalog = CountingCatalog::default();
    let reconciler = Reconciler::new(&catalog, &tracking);

    let refresh = reconciler
        .refresh_submitter_tasks(&mut campaign, "alice", false)
        .unwrap();
    assert_eq!(refresh, TaskRefresh::Updated { fetched: 2, kept: 1 });
    let tasks = campaign.submitter("alice").unwrap().tasks();
    assert!(tasks.contains_key(&40));
    assert!(!tasks.contains_key(&41));
    assert_eq!(*tracking.queries.lock().unwrap(), vec!["Alice A".to_string()]);
}

#[test]
fn refresh_skips_submitters_without_identity_or_records() {
    let mut campaign = campaign();
    let tracking = StubTracking::default();
    let catalog = CountingCatalog::default();
    let reconciler = Reconciler::new(&catalog, &tracking);

    let bob = reconciler
        .refresh_submitter_tasks(&mut campaign, "bob", false)
        .unwrap();
    assert_eq!(bob, TaskRefresh::NoIdentity);
    let carol = reconciler
        .refresh_submitter_tasks(&mut campaign, "carol", false)
        .unwrap();
    assert_eq!(carol, TaskRefresh::NoRecords);
    assert!(tracking.queries.lock().unwrap().is_empty());

    let carol = reconciler
        .refresh_submitter_tasks(&mut campaign, "carol", true)
        .unwrap();
    assert_eq!(carol, TaskRefresh::Updated { fetched: 0, kept: 0 });
}

#[test]
fn rejected_query_is_an_error() {
    let mut campaign = campaign();
    let tracking = StubTracking {
        status_code: 255,
        ..StubTracking::default()
    };
    let catalog = CountingCatalog::default();
    let err = Reconciler::new(&catalog, &tracking)
        .refresh_submitter_tasks(&mut campaign, "alice", false)
        .unwrap_err();
    assert_matches!(err, CampaignError::TrackingQuery { code: 255, .. });
}

#[test]
fn tracking_failure_stays_with_its_submitter() {
    let mut campaign = campaign();
    let tracking = StubTracking {
        tasks: BTreeMap::from([task(50, TaskStatus::Running, TTBAR_NOM)]),
        failing_identity: Some("Alice A".to_string()),
        ..StubTracking::default()
    };
    let catalog = CountingCatalog::default();
    let mut visited = Vec::new();
    let report = Reconciler::new(&catalog, &tracking).reconcile_tracking(
        &mut campaign,
        true,
        |name| visited.push(name.to_string()),
    );

    assert_eq!(visited, vec!["alice", "bob", "carol"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].submitter, "alice");
    assert!(report.failures[0].error.contains("connection reset"));
    assert_eq!(
        report.refreshed,
        vec![
            ("bob".to_string(), TaskRefresh::NoIdentity),
            ("carol".to_string(), TaskRefresh::Updated { fetched: 1, kept: 1 }),
        ]
    );
    assert_eq!(
        *tracking.queries.lock().unwrap(),
        vec!["Alice A".to_string(), "Carol C".to_string()]
    );
    assert!(campaign.submitter("alice").unwrap().tasks().is_empty());
    assert_eq!(
        campaign.record(TTBAR_NOM).unwrap().task_status,
        TaskStatus::Unknown
    );
}

#[test]
fn unknown_submitter_is_reported() {
    let mut campaign = campaign();
    let tracking = StubTracking::default();
    let catalog = CountingCatalog::default();
    let err = Reconciler::new(&catalog, &tracking)
        .reconcile_submitter_catalog(&mut campaign, "mallory")
        .unwrap_err();
    assert_matches!(err, CampaignError::UnknownSubmitter(name) if name == "mallory");
}

#[test]
fn task_commands_select_by_status() {
    let mut campaign = campaign();
    campaign
        .submitter_mut("alice")
        .unwrap()
        .merge_tasks(BTreeMap::from([
            task(12, TaskStatus::Failed, TTBAR_NOM),
            task(13, TaskStatus::Failed, TTBAR_JUP),
            task(14, TaskStatus::Done, WJETS_NOM),
        ]));
    let tracking = StubTracking::default();
    let catalog = CountingCatalog::default();
    let reconciler = Reconciler::new(&catalog, &tracking);

    let dry = reconciler
        .apply_task_command(&campaign, "alice", &TaskStatus::Failed, TaskCommand::Retry, true)
        .unwrap();
    assert_eq!(dry.selected, vec![12, 13]);
    assert!(dry.sent.is_empty());
    assert!(tracking.retried.lock().unwrap().is_empty());

    let report = reconciler
        .apply_task_command(&campaign, "alice", &TaskStatus::Failed, TaskCommand::Retry, false)
        .unwrap();
    assert_eq!(report.sent, vec![12]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, 13);

    let report = reconciler
        .apply_task_command(&campaign, "alice", &TaskStatus::Done, TaskCommand::Kill, false)
        .unwrap();
    assert_eq!(report.sent, vec![14]);
    assert_eq!(*tracking.killed.lock().unwrap(), vec![14]);
}
