//! Query engine (C6) — reduces `get()`/`filter()` expressions to bitset
//! operations over a `LayoutIndex`, per §4.6. Pure functions over
//! `&LayoutIndex` plus the caller's current selection; `Layout` (in
//! `lib.rs`) owns the selection state and calls into these.

use crate::dataset::{DatasetId, DatasetKind};
use crate::entities;
use crate::error::Error;
use crate::index::LayoutIndex;
use crate::metadata::canonical_string;
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, BTreeSet};

/// The value half of a `get()` filter (spec §4.6 "Values").
#[derive(Debug, Clone)]
pub enum FilterValue {
    /// `true`: entity/metadata key present, any value.
    Present,
    /// `false`/`null`: key absent.
    Absent,
    Exact(String),
    IntCoerce(i64),
    /// A sequence of values, OR-composed.
    Any(Vec<FilterValue>),
}

enum FilterTarget {
    Entity(String),
    Metadata(String),
}

/// Resolve a `get()` key to either an entity column or an already-resolved
/// metadata key (spec §4.6: "Unknown key first checked against entity
/// dictionary, then against already-indexed metadata keys").
fn resolve_filter_key(index: &LayoutIndex, key: &str) -> Result<FilterTarget, Error> {
    if let Some(canonical) = entities::resolve_key(key) {
        return Ok(FilterTarget::Entity(canonical.to_string()));
    }
    let stripped = key.strip_suffix('_').unwrap_or(key);
    if index.entity_names().iter().any(|n| n.as_ref() == stripped) {
        return Ok(FilterTarget::Entity(stripped.to_string()));
    }
    if let Some(all_meta) = index.metadata.all() {
        if all_meta.iter().any(|m| m.contains_key(stripped)) {
            return Ok(FilterTarget::Metadata(stripped.to_string()));
        }
    }
    Err(Error::UnknownEntity(key.to_string()))
}

/// Apply one `get(key=value, ...)` call: AND each key's resolved bitmap into
/// `selection`.
pub fn apply_get(
    index: &LayoutIndex,
    selection: &RoaringBitmap,
    filters: &[(String, FilterValue)],
) -> Result<RoaringBitmap, Error> {
    let mut result = selection.clone();
    for (key, value) in filters {
        let bitmap = match resolve_filter_key(index, key)? {
            FilterTarget::Entity(name) => resolve_entity_value(index, &result, &name, value)?,
            FilterTarget::Metadata(name) => resolve_metadata_value(index, &result, &name, value)?,
        };
        result &= bitmap;
    }
    Ok(result)
}

fn resolve_entity_value(
    index: &LayoutIndex,
    selection: &RoaringBitmap,
    name: &str,
    value: &FilterValue,
) -> Result<RoaringBitmap, Error> {
    match value {
        FilterValue::Present => Ok(index.entity_present_rows(name)),
        FilterValue::Absent => {
            let mut rows = index.all_rows();
            rows -= index.entity_present_rows(name);
            Ok(rows)
        }
        FilterValue::Exact(s) => Ok(index.rows_with(name, s)),
        FilterValue::IntCoerce(n) => int_coerce_rows(
            selection,
            *n,
            index.entity_values(name).into_iter(),
            |v| index.rows_with(name, v),
            name,
        ),
        FilterValue::Any(values) => {
            let mut acc = RoaringBitmap::new();
            for v in values {
                acc |= resolve_entity_value(index, selection, name, v)?;
            }
            Ok(acc)
        }
    }
}

fn resolve_metadata_value(
    index: &LayoutIndex,
    selection: &RoaringBitmap,
    name: &str,
    value: &FilterValue,
) -> Result<RoaringBitmap, Error> {
    let Some(all_meta) = index.metadata.all() else { return Ok(RoaringBitmap::new()) };
    match value {
        FilterValue::Present => Ok(rows_matching(all_meta, |m| m.contains_key(name))),
        FilterValue::Absent => Ok(rows_matching(all_meta, |m| !m.contains_key(name))),
        FilterValue::Exact(s) => {
            Ok(rows_matching(all_meta, |m| m.get(name).map(canonical_string).as_deref() == Some(s)))
        }
        FilterValue::IntCoerce(n) => {
            let distinct_values: BTreeSet<String> = all_meta
                .iter()
                .filter_map(|m| m.get(name).map(canonical_string))
                .filter(|s| s.parse::<i64>() == Ok(*n))
                .collect();
            int_coerce_rows(
                selection,
                *n,
                distinct_values.iter().map(|s| s.as_str()),
                |v| rows_matching(all_meta, |m| m.get(name).map(canonical_string).as_deref() == Some(v)),
                name,
            )
        }
        FilterValue::Any(values) => {
            let mut acc = RoaringBitmap::new();
            for v in values {
                acc |= resolve_metadata_value(index, selection, name, v)?;
            }
            Ok(acc)
        }
    }
}

fn rows_matching(all_meta: &[crate::metadata::MetadataMap], pred: impl Fn(&crate::metadata::MetadataMap) -> bool) -> RoaringBitmap {
    all_meta.iter().enumerate().filter(|(_, m)| pred(m)).map(|(row, _)| row as u32).collect()
}

/// Shared integer-coercion logic (spec §9 "Integer query coercion"): collect
/// every distinct stored value that decimal-parses to `n`, union their row
/// sets, but fail `NotUnique` if more than one of those distinct values is
/// actually present within the caller's current selection.
fn int_coerce_rows<'a>(
    selection: &RoaringBitmap,
    n: i64,
    candidates: impl Iterator<Item = &'a str>,
    rows_for: impl Fn(&str) -> RoaringBitmap,
    key: &str,
) -> Result<RoaringBitmap, Error> {
    let mut acc = RoaringBitmap::new();
    let mut distinct_in_selection = 0usize;
    for value in candidates {
        if value.parse::<i64>() != Ok(n) {
            continue;
        }
        let rows = rows_for(value);
        if !(&rows & selection).is_empty() {
            distinct_in_selection += 1;
        }
        acc |= rows;
    }
    if distinct_in_selection > 1 {
        return Err(Error::NotUnique(vec![key.to_string()]));
    }
    Ok(acc)
}

/// `filter(root=...)` — glob or exact match against each candidate dataset's
/// canonical root (spec §4.6).
pub fn apply_root_filter(
    index: &LayoutIndex,
    dataset_ids: &BTreeSet<DatasetId>,
    pattern: &str,
) -> Result<BTreeSet<DatasetId>, Error> {
    let glob = globset::Glob::new(pattern)
        .map_err(|e| Error::UnknownScope(format!("invalid root glob '{pattern}': {e}")))?
        .compile_matcher();
    Ok(dataset_ids
        .iter()
        .copied()
        .filter(|id| {
            index
                .dataset(*id)
                .map(|d| glob.is_match(d.root.to_string_lossy().as_ref()))
                .unwrap_or(false)
        })
        .collect())
}

/// `filter(scope=...)` — resolution order raw/self -> derivatives -> label ->
/// pipeline, first match wins (spec §4.6).
pub fn apply_scope_filter(
    index: &LayoutIndex,
    dataset_ids: &BTreeSet<DatasetId>,
    scope: &str,
) -> Result<BTreeSet<DatasetId>, Error> {
    if scope == "raw" || scope == "self" {
        return Ok(by_kind(index, dataset_ids, DatasetKind::Raw));
    }
    if scope == "derivatives" {
        return Ok(by_kind(index, dataset_ids, DatasetKind::Derivative));
    }
    let by_label: BTreeSet<DatasetId> = dataset_ids
        .iter()
        .copied()
        .filter(|id| index.dataset(*id).and_then(|d| d.label.as_deref()) == Some(scope))
        .collect();
    if !by_label.is_empty() {
        return Ok(by_label);
    }
    let by_pipeline: BTreeSet<DatasetId> = dataset_ids
        .iter()
        .copied()
        .filter(|id| index.dataset(*id).map(|d| d.pipelines.iter().any(|p| p == scope)).unwrap_or(false))
        .collect();
    if !by_pipeline.is_empty() {
        return Ok(by_pipeline);
    }
    Err(Error::UnknownScope(scope.to_string()))
}

fn by_kind(index: &LayoutIndex, dataset_ids: &BTreeSet<DatasetId>, kind: DatasetKind) -> BTreeSet<DatasetId> {
    dataset_ids.iter().copied().filter(|id| index.dataset(*id).map(|d| d.kind == kind).unwrap_or(false)).collect()
}

/// Re-project a path selection onto a (possibly narrowed) dataset id set
/// (spec §3 invariant: "the set of dataset ids referenced by a selection's
/// bitset is a subset of the view's declared dataset ids").
pub fn restrict_to_datasets(index: &LayoutIndex, selection: &RoaringBitmap, dataset_ids: &BTreeSet<DatasetId>) -> RoaringBitmap {
    let mut allowed = RoaringBitmap::new();
    for id in dataset_ids {
        allowed |= index.rows_in_dataset(*id);
    }
    selection & allowed
}

/// `.one` (spec §4.7): the sole row if the selection is a singleton; else
/// `NotUnique` naming the entity keys that still vary across it.
pub fn one(index: &LayoutIndex, selection: &RoaringBitmap) -> Result<u32, Error> {
    if selection.len() == 1 {
        return Ok(selection.iter().next().expect("len==1"));
    }
    Err(Error::NotUnique(varying_entities(index, selection)))
}

fn varying_entities(index: &LayoutIndex, selection: &RoaringBitmap) -> Vec<String> {
    let mut varying = Vec::new();
    for name in index.entity_names() {
        let mut seen: Option<Option<&str>> = None;
        let mut differs = false;
        for row in selection.iter() {
            let v = index.entity_value(row, name);
            match seen {
                None => seen = Some(v),
                Some(prev) if prev != v => {
                    differs = true;
                    break;
                }
                _ => {}
            }
        }
        if differs {
            varying.push(name.to_string());
        }
    }
    varying.sort();
    varying
}

/// `.entities` aggregate: long name -> sorted unique values present in the
/// selection (spec §4.7).
pub fn entities_aggregate(index: &LayoutIndex, selection: &RoaringBitmap) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for name in index.entity_names() {
        let mut values: BTreeSet<String> = BTreeSet::new();
        for row in selection.iter() {
            if let Some(v) = index.entity_value(row, name) {
                values.insert(v.to_string());
            }
        }
        if !values.is_empty() {
            out.insert(name.to_string(), values.into_iter().collect());
        }
    }
    out
}

/// `.metadata` aggregate, mirroring `.entities` (spec §4.5).
pub fn metadata_aggregate(index: &LayoutIndex, selection: &RoaringBitmap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    if let Some(all_meta) = index.metadata.all() {
        for row in selection.iter() {
            if let Some(map) = all_meta.get(row as usize) {
                for (k, v) in map {
                    out.entry(k.to_string()).or_default().insert(canonical_string(v));
                }
            }
        }
    }
    out.into_iter().map(|(k, v)| (k, v.into_iter().collect())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, DatasetKind};
    use crate::index::build_index;
    use crate::parser::ParserMode;
    use crate::walker::RawEntry;

    fn index_with(files: &[(u32, &str)]) -> LayoutIndex {
        let ctx = crate::parser::ParseContext { mode: ParserMode::Strict };
        let mut dataset_ids: BTreeSet<u32> = files.iter().map(|(d, _)| *d).collect();
        let datasets: Vec<Dataset> = dataset_ids
            .drain(..)
            .map(|id| Dataset {
                id: DatasetId(id),
                root: format!("/tmp/ds{id}").into(),
                kind: DatasetKind::Raw,
                label: None,
                pipelines: Vec::new(),
                description: None,
                description_error: None,
                source_datasets: Vec::new(),
            })
            .collect();
        let entries = files
            .iter()
            .map(|(d, p)| RawEntry { dataset: DatasetId(*d), abs_path: (*p).into(), rel_path: p.to_string() })
            .collect();
        build_index(&ctx, datasets, entries).unwrap()
    }

    #[test]
    fn exact_match_filters_to_matching_rows() {
        let index = index_with(&[
            (0, "sub-01/anat/sub-01_T1w.nii.gz"),
            (0, "sub-02/anat/sub-02_T1w.nii.gz"),
        ]);
        let selection = index.all_rows();
        let filtered = apply_get(
            &index,
            &selection,
            &[("subject".to_string(), FilterValue::Exact("02".to_string()))],
        )
        .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn int_coercion_matches_zero_padded_run() {
        let index = index_with(&[(0, "sub-01/func/sub-01_run-01_bold.nii.gz")]);
        let selection = index.all_rows();
        let filtered =
            apply_get(&index, &selection, &[("run".to_string(), FilterValue::IntCoerce(1))]).unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn int_coercion_fails_not_unique_when_ambiguous() {
        let index = index_with(&[
            (0, "sub-01/func/sub-01_run-1_bold.nii.gz"),
            (0, "sub-01/func/sub-01_run-01_bold.nii.gz"),
        ]);
        let selection = index.all_rows();
        let err =
            apply_get(&index, &selection, &[("run".to_string(), FilterValue::IntCoerce(1))]).unwrap_err();
        assert!(matches!(err, Error::NotUnique(_)));
    }

    #[test]
    fn scope_resolution_falls_back_to_pipeline_name() {
        let ctx = crate::parser::ParseContext { mode: ParserMode::Strict };
        let dataset = Dataset {
            id: DatasetId(0),
            root: "/tmp/fmriprep".into(),
            kind: DatasetKind::Derivative,
            label: None,
            pipelines: vec!["fMRIPrep".to_string()],
            description: None,
            description_error: None,
            source_datasets: Vec::new(),
        };
        let entries =
            vec![RawEntry { dataset: DatasetId(0), abs_path: "x".into(), rel_path: "sub-01/anat/sub-01_T1w.nii.gz".to_string() }];
        let index = build_index(&ctx, vec![dataset], entries).unwrap();
        let ids: BTreeSet<DatasetId> = [DatasetId(0)].into_iter().collect();
        let resolved = apply_scope_filter(&index, &ids, "fMRIPrep").unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn unknown_scope_errors() {
        let index = index_with(&[(0, "sub-01/anat/sub-01_T1w.nii.gz")]);
        let ids: BTreeSet<DatasetId> = [DatasetId(0)].into_iter().collect();
        let err = apply_scope_filter(&index, &ids, "nonexistent").unwrap_err();
        assert!(matches!(err, Error::UnknownScope(_)));
    }
}
