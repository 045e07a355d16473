use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{Datelike, TimeZone, Utc};
use serde_json::json;

use grid_campaign_manager::config::{
    Config, ConfigLoader, DEFAULT_SUBMISSION_DATE, parse_submission_date,
};
use grid_campaign_manager::domain::{DatasetSuffix, SystematicKind};
use grid_campaign_manager::error::CampaignError;
use grid_campaign_manager::tracking::DEFAULT_MONITOR_URL;

fn config(value: serde_json::Value) -> Config {
    serde_json::from_value(value).unwrap()
}

#[test]
fn minimal_config_uses_defaults() {
    let resolved = ConfigLoader::resolve_config(
        config(json!({
            "campaign": "schan",
            "ntup_version": "v29lj",
            "grid_version": "v11"
        })),
        &Utf8PathBuf::new(),
    )
    .unwrap();
    assert_eq!(resolved.template.suffix, DatasetSuffix::MemOutput);
    assert_eq!(
        resolved.since,
        parse_submission_date(DEFAULT_SUBMISSION_DATE).unwrap()
    );
    assert_eq!(resolved.naming.prefix, "ntup_schan");
    assert_eq!(resolved.tracking.monitor_url, DEFAULT_MONITOR_URL);
    assert!(resolved.systematics.is_empty());
    assert!(resolved.submitters.is_empty());
    assert!(resolved.task_cache.is_none());
}

#[test]
fn lists_and_paths_resolve_against_config_dir() {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    fs::write(
        base.join("systematics.txt"),
        "# long short [kind]\nnominal nom\nJET_UP jup\nttbar_rad rad sample_syst\n",
    )
    .unwrap();
    fs::write(base.join("samples.txt"), "ttbar\n\ndata17\nttbar\n").unwrap();
    fs::write(base.join("bob_samples.txt"), "wjets\n").unwrap();

    let resolved = ConfigLoader::resolve_config(
        config(json!({
            "campaign": "schan",
            "ntup_version": "v29lj",
            "grid_version": "v11",
            "submission_date": "2020-03-01",
            "output_suffix": ".log",
            "download_dir": "downloads",
            "systematics_file": "systematics.txt",
            "samples_file": "samples.txt",
            "task_cache": "/var/cache/tasks.json",
            "tracking": {"monitor_url": "https://monitor.example"},
            "submitters": [
                {"name": "alice", "full_name": "Alice A", "systematics": ["nominal"], "samples": ["ttbar"]},
                {"name": "bob", "full_name": " ", "samples": ["ttbar"], "samples_file": "bob_samples.txt"}
            ]
        })),
        &base,
    )
    .unwrap();

    assert_eq!(resolved.template.suffix, DatasetSuffix::Log);
    assert_eq!(resolved.since.year(), 2020);
    assert_eq!(
        resolved.since,
        Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap()
    );
    assert_eq!(resolved.download_dir, Some(base.join("downloads")));
    assert_eq!(
        resolved.task_cache,
        Some(Utf8PathBuf::from("/var/cache/tasks.json"))
    );
    assert_eq!(resolved.tracking.monitor_url, "https://monitor.example");
    assert_eq!(resolved.samples, vec!["ttbar", "data17"]);

    let kinds = resolved
        .systematics
        .iter()
        .map(|spec| spec.kind)
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            SystematicKind::Nominal,
            SystematicKind::Regular,
            SystematicKind::SampleSyst
        ]
    );

    assert_eq!(resolved.submitters[0].full_name.as_deref(), Some("Alice A"));
    assert_eq!(resolved.submitters[1].full_name, None);
    assert_eq!(resolved.submitters[1].samples, vec!["ttbar", "wjets"]);
}

#[test]
fn sample_config_takes_precedence_over_sample_list() {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    fs::write(base.join("samples.txt"), "ignored\n").unwrap();
    fs::write(
        base.join("samples.json"),
        r#"{"schan22": {"dids": ["410644"], "nsubjobs": 2, "subjobid": 2}, "ttbar": {"dids": ["410470"]}}"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve_config(
        config(json!({
            "campaign": "schan",
            "ntup_version": "v29lj",
            "grid_version": "v11",
            "samples_file": "samples.txt",
            "sample_config_file": "samples.json"
        })),
        &base,
    )
    .unwrap();
    assert_eq!(resolved.samples, vec!["schan22", "ttbar"]);
    assert_eq!(resolved.sample_config["schan22"].split(), Some((2, 2)));
    assert_eq!(resolved.sample_config["ttbar"].split(), None);
}

#[test]
fn invalid_values_are_rejected() {
    let err = ConfigLoader::resolve_config(
        config(json!({
            "campaign": "schan",
            "ntup_version": "v29lj",
            "grid_version": "v11",
            "output_suffix": "_output.root"
        })),
        &Utf8PathBuf::new(),
    )
    .unwrap_err();
    assert_matches!(err, CampaignError::InvalidSuffix(_));

    let err = ConfigLoader::resolve_config(
        config(json!({
            "campaign": "schan",
            "ntup_version": "v29lj",
            "grid_version": "v11",
            "submission_date": "15.01.2019"
        })),
        &Utf8PathBuf::new(),
    )
    .unwrap_err();
    assert_matches!(err, CampaignError::InvalidSubmissionDate(_));
}

#[test]
fn missing_list_file_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let err = ConfigLoader::resolve_config(
        config(json!({
            "campaign": "schan",
            "ntup_version": "v29lj",
            "grid_version": "v11",
            "systematics_file": "nope.txt"
        })),
        &base,
    )
    .unwrap_err();
    assert_matches!(err, CampaignError::ConfigRead(_));
}

#[test]
fn resolve_reads_explicit_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("campaign.json");
    fs::write(
        &path,
        r#"{"campaign": "schan", "ntup_version": "v29lj", "grid_version": "v11", "download_dir": "dl"}"#,
    )
    .unwrap();
    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.template.campaign, "schan");
    let expected = Utf8PathBuf::from_path_buf(temp.path().join("dl")).unwrap();
    assert_eq!(resolved.download_dir, Some(expected));

    let err = ConfigLoader::resolve(temp.path().join("missing.json").to_str()).unwrap_err();
    assert_matches!(err, CampaignError::ConfigRead(_));

    fs::write(&path, "{ not json").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, CampaignError::ConfigParse(_));
}
