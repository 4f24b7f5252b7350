//! Dataset model and `dataset_description.json` parsing.
//!
//! A `Dataset` is a directory self-described by `dataset_description.json`
//! (spec §3). This module also carries the construction-time configuration
//! (C11): the `Derivatives` shape and `ConstructOptions`.

use crate::error::BadDescription;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Identifies one dataset (raw or derivative) within a `Layout`. Assigned in
/// discovery order; not globally unique across processes (spec §3 never
/// requires that — only uniqueness within one `Layout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Raw,
    Derivative,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: DatasetId,
    pub root: PathBuf,
    pub kind: DatasetKind,
    pub label: Option<String>,
    pub pipelines: Vec<String>,
    pub description: Option<DatasetDescription>,
    /// Set when `dataset_description.json` existed but failed to parse
    /// (spec §7: non-fatal, surfaced via the description property).
    pub description_error: Option<BadDescription>,
    pub source_datasets: Vec<SourceDataset>,
}

/// Polymorphic `derivatives` construction argument, normalized at the
/// construction boundary (spec §9 "Polymorphic inputs").
#[derive(Debug, Clone, Default)]
pub enum Derivatives {
    #[default]
    None,
    Auto,
    List(Vec<PathBuf>),
    Labeled(BTreeMap<String, PathBuf>),
}

impl Derivatives {
    pub fn bool(enabled: bool) -> Self {
        if enabled { Derivatives::Auto } else { Derivatives::None }
    }
}

/// Normalized construction options (C11), covering the non-filesystem
/// knobs of `construct()`.
#[derive(Debug, Clone, Default)]
pub struct ConstructOptions {
    pub derivatives: Derivatives,
    /// Strict entity-dictionary gating vs. permissive parsing.
    pub validate: bool,
    pub cache: Option<PathBuf>,
    pub reset_cache: bool,
}

impl ConstructOptions {
    pub fn new() -> Self {
        Self { validate: true, ..Default::default() }
    }

    pub fn with_derivatives(mut self, derivatives: Derivatives) -> Self {
        self.derivatives = derivatives;
        self
    }

    pub fn with_cache(mut self, cache: impl Into<PathBuf>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    pub fn with_reset_cache(mut self, reset: bool) -> Self {
        self.reset_cache = reset;
        self
    }

    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }
}

// ---------------------------------------------------------------------------
// dataset_description.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HedVersion {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedBy {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Version", default)]
    pub version: Option<String>,
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
    #[serde(rename = "CodeURL", default)]
    pub code_url: Option<String>,
    #[serde(rename = "Container", default)]
    pub container: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceDataset {
    #[serde(rename = "URI", default)]
    pub uri: Option<String>,
    #[serde(rename = "DOI", default)]
    pub doi: Option<String>,
    #[serde(rename = "Version", default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetDescription {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "BIDSVersion", default)]
    pub bids_version: Option<String>,
    #[serde(rename = "HEDVersion", default)]
    pub hed_version: Option<HedVersion>,
    #[serde(rename = "DatasetLinks", default)]
    pub dataset_links: Option<BTreeMap<String, String>>,
    #[serde(rename = "DatasetType", default)]
    pub dataset_type: Option<String>,
    #[serde(rename = "License", default)]
    pub license: Option<String>,
    #[serde(rename = "Authors", default)]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "Acknowledgements", default)]
    pub acknowledgements: Option<String>,
    #[serde(rename = "HowToAcknowledge", default)]
    pub how_to_acknowledge: Option<String>,
    #[serde(rename = "Funding", default)]
    pub funding: Option<Vec<String>>,
    #[serde(rename = "EthicsApprovals", default)]
    pub ethics_approvals: Option<Vec<String>>,
    #[serde(rename = "ReferencesAndLinks", default)]
    pub references_and_links: Option<Vec<String>>,
    #[serde(rename = "DatasetDOI", default)]
    pub dataset_doi: Option<String>,
    #[serde(rename = "GeneratedBy", default)]
    pub generated_by: Option<Vec<GeneratedBy>>,
    #[serde(rename = "SourceDatasets", default)]
    pub source_datasets: Option<Vec<SourceDataset>>,
    #[serde(rename = "PipelineDescription", default)]
    pub pipeline_description: Option<GeneratedBy>,
}

impl DatasetDescription {
    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .generated_by
            .as_ref()
            .map(|v| v.iter().map(|g| g.name.clone()).filter(|n| !n.is_empty()).collect())
            .unwrap_or_default();
        if names.is_empty() {
            if let Some(ref legacy) = self.pipeline_description {
                if !legacy.name.is_empty() {
                    names.push(legacy.name.clone());
                }
            }
        }
        names
    }
}

/// Parse `<root>/dataset_description.json`. Absence is not an error —
/// returns `Ok(None)`. A malformed file returns `Ok(Some(Err(..)))`-shaped
/// as `(None, Some(BadDescription))` so the caller can index the dataset
/// regardless (spec §7: non-fatal).
pub fn read_dataset_description(
    root: &Path,
) -> (Option<DatasetDescription>, Option<BadDescription>) {
    let path = root.join("dataset_description.json");
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return (None, None),
    };
    match serde_json::from_str::<DatasetDescription>(&content) {
        Ok(desc) => (Some(desc), None),
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "dataset_description.json failed to parse");
            (None, Some(BadDescription { root: root.to_path_buf(), cause: e.to_string() }))
        }
    }
}
