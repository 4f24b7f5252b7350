//! Metadata resolver (C5) — the BIDS inheritance principle walk.
//!
//! Triggered once per root layout by `index_metadata()`. For each indexed
//! path, walks every directory between the dataset root and the path's own
//! directory, collects `*.json` sidecars whose entities are a subset of the
//! path's own entities (and whose suffix/datatype agree), and merges them
//! shallowly with deeper and more-specific sidecars overriding shallower,
//! less-specific ones.

use crate::dataset::Dataset;
use crate::index::{LayoutIndex, PathId, PathRecord};
use crate::parser::{parse_path, ParseContext};
use std::collections::HashMap;
use std::path::Path;

pub type MetadataMap = HashMap<Box<str>, serde_json::Value>;

/// Render a JSON value the way entity/metadata aggregates store it: strings
/// pass through unquoted, everything else uses its JSON rendering (spec §6).
pub fn canonical_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Candidate {
    depth: usize,
    specificity: usize,
    filename: String,
    value: serde_json::Value,
}

/// Resolve metadata for every path currently in the index. Synchronous and
/// blocking (spec §5: "file I/O is blocking"); the caller is responsible for
/// only invoking this once per root (the one-shot latch lives on `Layout`).
pub fn resolve_all(ctx: &ParseContext, index: &LayoutIndex) -> Vec<MetadataMap> {
    index
        .paths()
        .iter()
        .enumerate()
        .map(|(row, record)| {
            let Some(dataset) = index.dataset(record.dataset) else {
                return MetadataMap::new();
            };
            let entities = index.row_entities(row as PathId);
            resolve_one(ctx, dataset, record, &entities)
        })
        .collect()
}

fn resolve_one(
    ctx: &ParseContext,
    dataset: &Dataset,
    target: &PathRecord,
    target_entities: &HashMap<&str, &str>,
) -> MetadataMap {
    let dir_segments: Vec<&str> =
        target.rel_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("").split('/').filter(|s| !s.is_empty()).collect();

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut prefix = String::new();

    for (depth, segment) in std::iter::once("").chain(dir_segments.iter().copied()).enumerate() {
        if !segment.is_empty() {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
        }
        let dir = dataset.root.join(&prefix);
        collect_sidecars(ctx, &dataset.root, &dir, &prefix, depth, target, target_entities, &mut candidates);
    }

    candidates.sort_by(|a, b| {
        (a.depth, a.specificity, a.filename.as_str()).cmp(&(b.depth, b.specificity, b.filename.as_str()))
    });

    let mut merged = serde_json::Map::new();
    for candidate in candidates {
        if let serde_json::Value::Object(obj) = candidate.value {
            for (k, v) in obj {
                merged.insert(k, v);
            }
        }
    }

    merged.into_iter().map(|(k, v)| (k.into_boxed_str(), v)).collect()
}

#[allow(clippy::too_many_arguments)]
fn collect_sidecars(
    ctx: &ParseContext,
    root: &Path,
    dir: &Path,
    dir_rel: &str,
    depth: usize,
    target: &PathRecord,
    target_entities: &HashMap<&str, &str>,
    out: &mut Vec<Candidate>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if filename == "dataset_description.json" {
            continue;
        }
        let rel_path = if dir_rel.is_empty() {
            filename.to_string()
        } else {
            format!("{dir_rel}/{filename}")
        };
        let Ok(parsed) = parse_path(ctx, &rel_path) else { continue };

        if parsed.suffix != target.suffix.as_deref().map(str::to_string) {
            continue;
        }
        if let Some(dt) = &parsed.datatype {
            if Some(dt.as_str()) != target.datatype.as_deref() {
                continue;
            }
        }
        let subset = parsed.entities.iter().all(|(k, v)| target_entities.get(k.as_str()) == Some(&v.as_str()));
        if !subset {
            continue;
        }

        let Ok(content) = std::fs::read_to_string(&path) else { continue };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else { continue };

        out.push(Candidate {
            depth,
            specificity: parsed.entities.len(),
            filename: filename.to_string(),
            value,
        });
    }
    let _ = root;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetId, DatasetKind};
    use crate::index::build_index;
    use crate::parser::ParserMode;
    use crate::walker::RawEntry;
    use std::fs;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn deeper_sidecar_overrides_shallower_and_is_merged_shallowly() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        write(&root.join("task-rest_bold.json"), r#"{"RepetitionTime": 2.0, "TaskName": "rest-generic"}"#);
        write(
            &root.join("sub-01/func/sub-01_task-rest_bold.json"),
            r#"{"TaskName": "rest-specific"}"#,
        );
        write(&root.join("sub-01/func/sub-01_task-rest_bold.nii.gz"), "x");

        let ctx = ParseContext { mode: ParserMode::Strict };
        let dataset = Dataset {
            id: DatasetId(0),
            root: root.clone(),
            kind: DatasetKind::Raw,
            label: None,
            pipelines: Vec::new(),
            description: None,
            description_error: None,
            source_datasets: Vec::new(),
        };
        let entries = vec![RawEntry {
            dataset: dataset.id,
            abs_path: root.join("sub-01/func/sub-01_task-rest_bold.nii.gz"),
            rel_path: "sub-01/func/sub-01_task-rest_bold.nii.gz".to_string(),
        }];
        let index = build_index(&ctx, vec![dataset], entries).unwrap();
        let resolved = resolve_all(&ctx, &index);
        let meta = &resolved[0];
        assert_eq!(canonical_string(&meta["RepetitionTime"]), "2.0");
        assert_eq!(canonical_string(&meta["TaskName"]), "rest-specific");
    }
}
