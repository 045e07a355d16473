use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use grid_campaign_manager::config::{
    ResolvedConfig, SampleSettings, SubmitterRequest, SystematicSpec,
};
use grid_campaign_manager::domain::{DatasetSuffix, DownloadStatus, MergeStatus, SystematicKind};
use grid_campaign_manager::error::CampaignError;
use grid_campaign_manager::merge::{MergeContext, MergeGate, MergeOptions, MergeSource, Merger};
use grid_campaign_manager::model::{BuildMode, Campaign};
use grid_campaign_manager::naming::DidTemplate;

const TTBAR: &str = "user.alice.schan.ttbar_nom.v29lj.v11_mem_output.root";
const SCHAN: &str = "user.alice.schan.schan22_nom.v29lj.v11_mem_output.root";

/// Merger that records its calls and touches the target file.
#[derive(Default)]
struct TouchMerger {
    calls: Mutex<Vec<(usize, Utf8PathBuf)>>,
    fail: bool,
}

impl Merger for TouchMerger {
    fn merge(&self, sources: &[Utf8PathBuf], target: &Utf8Path) -> Result<(), CampaignError> {
        if self.fail {
            return Err(CampaignError::MergeCommand("hadd exited with 1".to_string()));
        }
        self.calls
            .lock()
            .unwrap()
            .push((sources.len(), target.to_path_buf()));
        fs::write(target, b"merged").unwrap();
        Ok(())
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
    campaign: Campaign,
}

fn fixture(sample_config: bool, reference: bool) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

    let mut config = ResolvedConfig::new(DidTemplate {
        campaign: "schan".to_string(),
        ntup_version: "v29lj".to_string(),
        grid_version: "v11".to_string(),
        suffix: DatasetSuffix::MemOutput,
    });
    config.systematics = vec![SystematicSpec {
        long_name: "nominal".to_string(),
        short_name: "nom".to_string(),
        kind: SystematicKind::Nominal,
    }];
    config.samples = vec!["ttbar".to_string(), "schan22".to_string()];
    if sample_config {
        config.sample_config = BTreeMap::from([
            (
                "ttbar".to_string(),
                SampleSettings {
                    dids: vec!["410470".to_string()],
                    ..SampleSettings::default()
                },
            ),
            (
                "schan22".to_string(),
                SampleSettings {
                    dids: vec!["410644".to_string()],
                    nsubjobs: Some(2),
                    subjobid: Some(2),
                    nfilesperjob: None,
                },
            ),
        ]);
    }
    if reference {
        let path = root.join("ids.csv");
        fs::write(&path, "# name,dsid\nttbar_pp8,410470\nschan_lt,410644\n").unwrap();
        config.id_reference_file = Some(path);
    }
    config.download_dir = Some(root.join("downloads"));
    config.merge_target_dir = Some(root.join("merged"));
    config.submitters = vec![SubmitterRequest {
        name: "alice".to_string(),
        full_name: None,
        systematics: vec!["nominal".to_string()],
        samples: vec!["ttbar".to_string(), "schan22".to_string()],
        download_dir: None,
        merge_target_dir: None,
    }];
    let mut campaign = Campaign::from_config(config).unwrap();
    campaign.build_expected_datasets(BuildMode::Reuse);

    Fixture {
        _temp: temp,
        root,
        campaign,
    }
}

fn place_bundle(root: &Utf8Path, did: &str, constituent: &str, count: usize) {
    let dir = root.join("downloads").join(did);
    fs::create_dir_all(&dir).unwrap();
    for index in 1..=count {
        let name = format!("user.alice.{constituent}.e1_s2.20001._{index:06}.mem_output.root");
        fs::write(dir.join(name), b"x").unwrap();
    }
}

fn lenient() -> MergeOptions {
    MergeOptions {
        require_downloaded: false,
        overwrite: false,
    }
}

#[test]
fn second_merge_adds_nothing() {
    let mut fixture = fixture(true, true);
    place_bundle(&fixture.root, TTBAR, "410470", 3);
    let merger = TouchMerger::default();
    let gate = MergeGate::new(&merger, lenient());

    let first = gate.merge_submitter(&mut fixture.campaign, "alice").unwrap();
    assert_eq!(first.added, 1);
    assert_eq!(
        fixture.campaign.record(TTBAR).unwrap().merge_status,
        MergeStatus::Added(1)
    );
    assert_eq!(
        fixture.campaign.record(SCHAN).unwrap().merge_status,
        MergeStatus::NotDownloaded
    );
    let target = fixture
        .root
        .join("merged/v29lj.v11/mem/nominal/mem_ntup_schan_2j_lnu_nominal_ttbar_pp8.root");
    assert_eq!(*merger.calls.lock().unwrap(), vec![(3, target.clone())]);
    assert!(target.is_file());

    let second = gate.merge_submitter(&mut fixture.campaign, "alice").unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(
        fixture.campaign.record(TTBAR).unwrap().merge_status,
        MergeStatus::Done
    );
    assert_eq!(merger.calls.lock().unwrap().len(), 1);

    let overwrite = MergeGate::new(
        &merger,
        MergeOptions {
            require_downloaded: false,
            overwrite: true,
        },
    );
    overwrite.merge_submitter(&mut fixture.campaign, "alice").unwrap();
    assert_eq!(merger.calls.lock().unwrap().len(), 2);
}

#[test]
fn split_sample_target_carries_subjob_index() {
    let mut fixture = fixture(true, true);
    place_bundle(&fixture.root, SCHAN, "410644", 2);
    let merger = TouchMerger::default();
    MergeGate::new(&merger, lenient())
        .merge_submitter(&mut fixture.campaign, "alice")
        .unwrap();

    let target = fixture
        .root
        .join("merged/v29lj.v11/mem/nominal/mem_ntup_schan_2j_lnu_nominal_schan_lt002.root");
    assert!(target.is_file());
    assert_eq!(
        fixture.campaign.record(SCHAN).unwrap().merge_status,
        MergeStatus::Added(1)
    );
}

#[test]
fn download_must_be_done_when_required() {
    let mut fixture = fixture(true, true);
    place_bundle(&fixture.root, TTBAR, "410470", 1);
    let merger = TouchMerger::default();
    let gate = MergeGate::new(&merger, MergeOptions::default());

    gate.merge_submitter(&mut fixture.campaign, "alice").unwrap();
    assert_eq!(
        fixture.campaign.record(TTBAR).unwrap().merge_status,
        MergeStatus::NotDownloaded
    );

    fixture.campaign.record_mut(TTBAR).unwrap().download_status = DownloadStatus::Done;
    gate.merge_submitter(&mut fixture.campaign, "alice").unwrap();
    assert_eq!(
        fixture.campaign.record(TTBAR).unwrap().merge_status,
        MergeStatus::Added(1)
    );
}

#[test]
fn preconditions_map_to_their_own_status() {
    let fixture = fixture(true, true);
    place_bundle(&fixture.root, TTBAR, "410470", 1);
    let merger = TouchMerger::default();
    let gate = MergeGate::new(&merger, lenient());
    let context = MergeContext::from_campaign(&fixture.campaign);
    let source = MergeSource::from_record(&fixture.campaign, TTBAR).unwrap();

    assert_eq!(gate.merge_dataset(None, &source), MergeStatus::NoCampaignContext);

    let no_target = MergeSource {
        target_dir: None,
        ..source.clone()
    };
    assert_eq!(
        gate.merge_dataset(Some(&context), &no_target),
        MergeStatus::NoTargetDir
    );

    let foreign = "user.alice.schan.ttbar_xyz.v29lj.v11_mem_output.root";
    place_bundle(&fixture.root, foreign, "410470", 1);
    let unknown_systematic = MergeSource {
        did: foreign.to_string(),
        source_dir: Some(fixture.root.join("downloads").join(foreign)),
        ..source.clone()
    };
    assert_eq!(
        gate.merge_dataset(Some(&context), &unknown_systematic),
        MergeStatus::NoRegexMatch
    );

    let log = "user.alice.schan.ttbar_nom.v29lj.v11.log";
    place_bundle(&fixture.root, log, "410470", 1);
    let log_bundle = MergeSource {
        did: log.to_string(),
        source_dir: Some(fixture.root.join("downloads").join(log)),
        ..source.clone()
    };
    assert_eq!(
        gate.merge_dataset(Some(&context), &log_bundle),
        MergeStatus::CannotClassify
    );

    let not_downloaded = MergeSource {
        source_dir: Some(fixture.root.join("nowhere")),
        ..source
    };
    assert_eq!(
        gate.merge_dataset(Some(&context), &not_downloaded),
        MergeStatus::NotDownloaded
    );
    assert!(merger.calls.lock().unwrap().is_empty());
}

#[test]
fn missing_sample_config_or_reference_file() {
    let mut without_config = fixture(false, true);
    place_bundle(&without_config.root, TTBAR, "410470", 1);
    let merger = TouchMerger::default();
    let gate = MergeGate::new(&merger, lenient());
    gate.merge_submitter(&mut without_config.campaign, "alice")
        .unwrap();
    assert_eq!(
        without_config.campaign.record(TTBAR).unwrap().merge_status,
        MergeStatus::NotInSampleConfig
    );

    let mut without_reference = fixture(true, false);
    place_bundle(&without_reference.root, TTBAR, "410470", 1);
    gate.merge_submitter(&mut without_reference.campaign, "alice")
        .unwrap();
    assert_eq!(
        without_reference.campaign.record(TTBAR).unwrap().merge_status,
        MergeStatus::NoIdReferenceFile
    );
    assert!(merger.calls.lock().unwrap().is_empty());
}

#[test]
fn merger_failure_marks_record_failed() {
    let mut fixture = fixture(true, true);
    place_bundle(&fixture.root, TTBAR, "410470", 2);
    let merger = TouchMerger {
        fail: true,
        ..TouchMerger::default()
    };
    let report = MergeGate::new(&merger, lenient())
        .merge_submitter(&mut fixture.campaign, "alice")
        .unwrap();
    assert_eq!(
        fixture.campaign.record(TTBAR).unwrap().merge_status,
        MergeStatus::Failed
    );
    assert_eq!(report.statuses.get("failed"), Some(&1));
    assert_eq!(report.added, 0);
}

#[test]
fn unlisted_constituent_is_skipped() {
    let mut fixture = fixture(true, true);
    place_bundle(&fixture.root, TTBAR, "999999", 2);
    let merger = TouchMerger::default();
    MergeGate::new(&merger, lenient())
        .merge_submitter(&mut fixture.campaign, "alice")
        .unwrap();
    assert_eq!(
        fixture.campaign.record(TTBAR).unwrap().merge_status,
        MergeStatus::Done
    );
    assert!(merger.calls.lock().unwrap().is_empty());
}
