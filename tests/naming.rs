use assert_matches::assert_matches;

use grid_campaign_manager::domain::{DatasetSuffix, OutputKind};
use grid_campaign_manager::error::CampaignError;
use grid_campaign_manager::naming::{
    DidTemplate, GridOutputDir, GridOutputFile, TargetNaming, is_nominal_only_sample,
    split_sample_name, with_subjob_index,
};

fn template() -> DidTemplate {
    DidTemplate {
        campaign: "schan".to_string(),
        ntup_version: "v29lj".to_string(),
        grid_version: "v11".to_string(),
        suffix: DatasetSuffix::AppOutput,
    }
}

#[test]
fn partial_identifier_has_no_scope() {
    assert_eq!(
        template().partial("wjets3", "jup"),
        "schan.wjets3_jup.v29lj.v11_app_output.root"
    );
    assert_eq!(template().grid_id(), "v29lj.v11");
}

#[test]
fn split_sample_with_trailing_index() {
    let split = split_sample_name("ttbar2", false).unwrap();
    assert_eq!(split.super_sample, "ttbar");
    assert!(split.is_part_of_split);

    let split = split_sample_name("Wjets12", false).unwrap();
    assert_eq!(split.super_sample, "Wjets");
    assert!(split.is_part_of_split);
}

#[test]
fn sample_without_index_is_its_own_super_sample() {
    let split = split_sample_name("ttbar", false).unwrap();
    assert_eq!(split.super_sample, "ttbar");
    assert!(!split.is_part_of_split);
}

#[test]
fn nominal_only_samples_are_never_split() {
    assert!(is_nominal_only_sample("data2018"));
    assert!(is_nominal_only_sample("QCDJetLepton"));
    let split = split_sample_name("data2018", true).unwrap();
    assert_eq!(split.super_sample, "data2018");
    assert!(!split.is_part_of_split);
}

#[test]
fn purely_numeric_sample_is_rejected() {
    let err = split_sample_name("410644", false).unwrap_err();
    assert_matches!(err, CampaignError::InvalidSampleName(name) if name == "410644");
}

#[test]
fn grid_output_dir_with_retry_counter() {
    let parsed =
        GridOutputDir::parse("user.carol.schan.ttbar_nom.v29lj.v11_app_output.root.2").unwrap();
    assert_eq!(parsed.sample, "ttbar");
    assert_eq!(parsed.output_kind(), Some(OutputKind::App));
    assert!(GridOutputDir::parse("group.phys.schan.ttbar_nom.v29lj.v11.log").is_none());
}

#[test]
fn standard_output_file_fields() {
    let file =
        GridOutputFile::parse("user.alice.410644.e5_s3_r9.12345._000001.mem_output.root").unwrap();
    assert_eq!(file.scope, "user.alice");
    assert_eq!(file.constituent, "410644");
    assert_eq!(file.task_id, "12345");
    assert_eq!(file.number, "000001");
    assert_eq!(file.extension, "mem_output.root");
    assert!(GridOutputFile::parse("user.alice.410644.log.tgz").is_none());
}

#[test]
fn target_file_name() {
    let naming = TargetNaming::default();
    assert_eq!(
        naming.file_name(OutputKind::Mem, "nominal", "schan_lt"),
        "mem_ntup_schan_2j_lnu_nominal_schan_lt.root"
    );
    assert_eq!(with_subjob_index("schan_lt", 2), "schan_lt002");
}
