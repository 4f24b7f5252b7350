//! End-to-end tests for `Layout` construction, queries, and persistence,
//! built against a small fixture dataset tree rather than mocked index
//! state.

use rsbids_core::{ConstructOptions, Derivatives, Error, FilterValue, Layout};
use std::path::Path;

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn fixture_dataset() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write(&root.join("dataset_description.json"), r#"{"Name": "D", "BIDSVersion": "1.8.0"}"#);
    write(&root.join("sub-01/anat/sub-01_T1w.nii.gz"), "x");
    write(&root.join("sub-01/func/sub-01_task-rest_bold.nii.gz"), "x");
    write(
        &root.join("sub-01/func/sub-01_task-rest_bold.json"),
        r#"{"RepetitionTime": 2.0, "TaskName": "resting state"}"#,
    );
    write(&root.join("sub-02/anat/sub-02_T1w.nii.gz"), "x");
    write(&root.join("derivatives/fmriprep/sub-01/anat/sub-01_space-MNI_desc-preproc_T1w.nii.gz"), "x");
    write(
        &root.join("derivatives/fmriprep/dataset_description.json"),
        r#"{"Name": "fmriprep", "GeneratedBy": [{"Name": "fMRIPrep"}]}"#,
    );
    tmp
}

#[test]
fn entities_aggregate_lists_all_subjects() {
    let tmp = fixture_dataset();
    let layout = Layout::construct(
        &[tmp.path().to_path_buf()],
        ConstructOptions::new().with_derivatives(Derivatives::Auto),
    )
    .unwrap();
    assert_eq!(layout.entities()["subject"], vec!["01".to_string(), "02".to_string()]);
}

#[test]
fn get_then_filter_scope_raw_counts_two() {
    let tmp = fixture_dataset();
    let layout = Layout::construct(
        &[tmp.path().to_path_buf()],
        ConstructOptions::new().with_derivatives(Derivatives::Auto),
    )
    .unwrap();
    let view = layout.get(&[("suffix", FilterValue::Exact("T1w".to_string()))]).unwrap();
    let raw_view = view.filter(None, Some("raw")).unwrap();
    assert_eq!(raw_view.len(), 2);
}

#[test]
fn labeled_derivative_scope_resolves_single_entry() {
    let tmp = fixture_dataset();
    let mut labeled = std::collections::BTreeMap::new();
    labeled.insert("prep".to_string(), tmp.path().join("derivatives/fmriprep"));
    let layout = Layout::construct(
        &[tmp.path().to_path_buf()],
        ConstructOptions::new().with_derivatives(Derivatives::Labeled(labeled)),
    )
    .unwrap();
    let view = layout.filter(None, Some("prep")).unwrap();
    let entry = view.one().unwrap();
    assert!(entry.path.ends_with("sub-01_space-MNI_desc-preproc_T1w.nii.gz"));
}

#[test]
fn index_metadata_resolves_bold_sidecar() {
    let tmp = fixture_dataset();
    let layout = Layout::construct(&[tmp.path().to_path_buf()], ConstructOptions::new()).unwrap().index_metadata();
    let entry = layout
        .get(&[("subject", FilterValue::Exact("01".to_string())), ("suffix", FilterValue::Exact("bold".to_string()))])
        .unwrap()
        .one()
        .unwrap();
    assert_eq!(entry.metadata.unwrap()["TaskName"], serde_json::Value::String("resting state".to_string()));
}

#[test]
fn sub_alias_matches_subject_integer_coercion() {
    let tmp = fixture_dataset();
    let layout = Layout::construct(&[tmp.path().to_path_buf()], ConstructOptions::new()).unwrap();
    let by_alias = layout.get(&[("sub", FilterValue::IntCoerce(1))]).unwrap();
    let by_long = layout.get(&[("subject", FilterValue::Exact("01".to_string()))]).unwrap();
    assert_eq!(by_alias.one().unwrap().path, by_long.one().unwrap().path);
}

#[test]
fn ambiguous_derivative_roots_error() {
    let tmp = fixture_dataset();
    write(
        &tmp.path().join("derivatives/other/dataset_description.json"),
        r#"{"Name": "other", "GeneratedBy": [{"Name": "Other"}]}"#,
    );
    let layout = Layout::construct(
        &[tmp.path().to_path_buf()],
        ConstructOptions::new().with_derivatives(Derivatives::Auto),
    )
    .unwrap();
    let err = layout.derivatives().root().unwrap_err();
    assert!(matches!(err, Error::AmbiguousRoot(_)));
}

#[test]
fn save_then_load_round_trips_entities() {
    let tmp = fixture_dataset();
    let cache = tmp.path().join("cache.rsbl");
    let layout = Layout::construct(
        &[tmp.path().to_path_buf()],
        ConstructOptions::new().with_derivatives(Derivatives::Auto),
    )
    .unwrap();
    layout.save(&cache).unwrap();
    let reloaded = Layout::load(&cache, true).unwrap();
    assert_eq!(reloaded.entities(), layout.entities());
    assert_eq!(reloaded.len(), layout.len());
}

#[test]
fn parse_resolves_absolute_path_against_its_root() {
    let tmp = fixture_dataset();
    let layout = Layout::construct(&[tmp.path().to_path_buf()], ConstructOptions::new()).unwrap();
    let abs = tmp.path().join("sub-02/anat/sub-02_T1w.nii.gz");
    let parsed = layout.parse(abs.to_str().unwrap()).unwrap();
    assert_eq!(parsed.entity("subject"), Some("02"));
}

#[test]
fn parse_rejects_absolute_path_outside_any_root() {
    let tmp = fixture_dataset();
    let other = tempfile::tempdir().unwrap();
    let layout = Layout::construct(&[tmp.path().to_path_buf()], ConstructOptions::new()).unwrap();
    let outside = other.path().join("sub-09/anat/sub-09_T1w.nii.gz");
    let err = layout.parse(outside.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, Error::NotInRoot(_)));
}

#[test]
fn duplicate_raw_root_is_rejected() {
    let tmp = fixture_dataset();
    let root = tmp.path().to_path_buf();
    let err = Layout::construct(&[root.clone(), root], ConstructOptions::new()).unwrap_err();
    assert!(matches!(err, Error::DuplicateRoot(_)));
}
