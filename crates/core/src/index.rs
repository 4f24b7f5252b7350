//! Layout index (C4) — the columnar store a `Layout` is built on.
//!
//! Rows are paths; entity values live in sparse columns
//! (`Vec<Option<Box<str>>>`), one column per entity key, widened lazily as
//! new keys are discovered during the walk. Each column additionally owns a
//! lazily-built inverted index (`OnceLock`-guarded `HashMap<value,
//! RoaringBitmap>`) so repeated `filter()` calls on the same entity don't
//! re-scan the column; `RoaringBitmap` gives cheap AND/OR across entities
//! without materializing intermediate `Vec<PathId>`.

use crate::dataset::{Dataset, DatasetId};
use crate::error::Error;
use crate::parser::{parse_path, ParseContext, ParsedPath};
use crate::walker::RawEntry;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::{Once, OnceLock, RwLock};

pub type PathId = u32;

#[derive(Debug, Clone)]
pub struct PathRecord {
    pub dataset: DatasetId,
    pub rel_path: Box<str>,
    pub datatype: Option<Box<str>>,
    pub suffix: Option<Box<str>>,
    pub extension: Option<Box<str>>,
    pub parts: Vec<Box<str>>,
}

#[derive(Debug, Default)]
struct EntityColumn {
    values: Vec<Option<Box<str>>>,
    inverted: OnceLock<HashMap<Box<str>, RoaringBitmap>>,
}

impl EntityColumn {
    fn grow_to(&mut self, len: usize) {
        if self.values.len() < len {
            self.values.resize(len, None);
        }
    }

    fn set(&mut self, row: usize, value: Box<str>) {
        self.grow_to(row + 1);
        self.values[row] = Some(value);
    }

    fn inverted_index(&self) -> &HashMap<Box<str>, RoaringBitmap> {
        self.inverted.get_or_init(|| {
            let mut map: HashMap<Box<str>, RoaringBitmap> = HashMap::new();
            for (row, value) in self.values.iter().enumerate() {
                if let Some(v) = value {
                    map.entry(v.clone()).or_default().insert(row as u32);
                }
            }
            map
        })
    }
}

/// One-shot latch guarding `index_metadata()` (spec §5: "re-entrancy-safe
/// via a one-shot latch per root"). `done` lets subsequent callers check
/// completion without contending on `once`.
#[derive(Debug, Default)]
pub struct MetadataState {
    once: Once,
    done: RwLock<bool>,
    data: OnceLock<Vec<crate::metadata::MetadataMap>>,
}

impl MetadataState {
    pub fn is_indexed(&self) -> bool {
        *self.done.read().unwrap()
    }

    /// Runs `build` at most once across all callers; subsequent calls
    /// return immediately once `done` is set.
    pub fn ensure(&self, build: impl FnOnce() -> Vec<crate::metadata::MetadataMap>) {
        if self.is_indexed() {
            return;
        }
        self.once.call_once(|| {
            let result = build();
            let _ = self.data.set(result);
            *self.done.write().unwrap() = true;
        });
    }

    pub fn get(&self, id: PathId) -> Option<&crate::metadata::MetadataMap> {
        self.data.get().and_then(|v| v.get(id as usize))
    }

    pub fn all(&self) -> Option<&[crate::metadata::MetadataMap]> {
        self.data.get().map(|v| v.as_slice())
    }
}

/// The full columnar index backing a `Layout`: one row per path, plus the
/// dataset table and entity columns.
#[derive(Debug)]
pub struct LayoutIndex {
    datasets: Vec<Dataset>,
    paths: Vec<PathRecord>,
    entity_order: Vec<Box<str>>,
    entity_columns: HashMap<Box<str>, EntityColumn>,
    pub metadata: MetadataState,
}

impl LayoutIndex {
    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn dataset(&self, id: DatasetId) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.id == id)
    }

    pub fn paths(&self) -> &[PathRecord] {
        &self.paths
    }

    pub fn path(&self, id: PathId) -> Option<&PathRecord> {
        self.paths.get(id as usize)
    }

    pub fn entity_names(&self) -> &[Box<str>] {
        &self.entity_order
    }

    pub fn entity_value(&self, id: PathId, entity: &str) -> Option<&str> {
        self.entity_columns
            .get(entity)
            .and_then(|c| c.values.get(id as usize))
            .and_then(|v| v.as_deref())
    }

    /// All entity key/value pairs present on one row, keyed by long name.
    pub fn row_entities(&self, id: PathId) -> HashMap<&str, &str> {
        self.entity_order
            .iter()
            .filter_map(|name| self.entity_value(id, name).map(|v| (name.as_ref(), v)))
            .collect()
    }

    /// All distinct values present for `entity`, sorted for determinism.
    pub fn entity_values(&self, entity: &str) -> Vec<&str> {
        let Some(col) = self.entity_columns.get(entity) else { return Vec::new() };
        let mut values: Vec<&str> = col.inverted_index().keys().map(|b| b.as_ref()).collect();
        values.sort_unstable();
        values
    }

    /// Bitmap of every path row where `entity == value`. Empty if the
    /// entity or value is unknown to the index (spec §4.4: empty, not an
    /// error, for an unfiltered-to-empty selection).
    pub fn rows_with(&self, entity: &str, value: &str) -> RoaringBitmap {
        self.entity_columns
            .get(entity)
            .and_then(|c| c.inverted_index().get(value))
            .cloned()
            .unwrap_or_default()
    }

    /// Every row where `entity` has any value at all.
    pub fn entity_present_rows(&self, entity: &str) -> RoaringBitmap {
        match self.entity_columns.get(entity) {
            Some(col) => col.inverted_index().values().fold(RoaringBitmap::new(), |mut acc, bm| {
                acc |= bm;
                acc
            }),
            None => RoaringBitmap::new(),
        }
    }

    pub fn rows_in_dataset(&self, dataset: DatasetId) -> RoaringBitmap {
        let mut bitmap = RoaringBitmap::new();
        for (row, record) in self.paths.iter().enumerate() {
            if record.dataset == dataset {
                bitmap.insert(row as u32);
            }
        }
        bitmap
    }

    pub fn all_rows(&self) -> RoaringBitmap {
        (0..self.paths.len() as u32).collect()
    }
}

/// Consumes the walker's output and builds the columnar index. Single
/// writer by design (spec §5): the walk runs in parallel, but the index
/// itself is assembled on one thread as entries stream through the bounded
/// channel, so no locking is needed on these structures during construction.
pub fn build_index(
    ctx: &ParseContext,
    datasets: Vec<Dataset>,
    mut entries: Vec<RawEntry>,
) -> Result<LayoutIndex, Error> {
    entries.sort_by(|a, b| (a.dataset, a.rel_path.as_str()).cmp(&(b.dataset, b.rel_path.as_str())));

    let mut paths = Vec::with_capacity(entries.len());
    let mut entity_order: Vec<Box<str>> = Vec::new();
    let mut entity_columns: HashMap<Box<str>, EntityColumn> = HashMap::new();

    for entry in entries {
        // A strict-mode parse error demotes this one file to a parts-only
        // record rather than aborting the whole walk (spec §4.3, §7, §9).
        let parsed: ParsedPath = match parse_path(ctx, &entry.rel_path) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(path = %entry.rel_path, cause = %e, "file demoted to parts-only");
                crate::parser::parts_only(&entry.rel_path)
            }
        };
        let row = paths.len();

        for (key, value) in &parsed.entities {
            let column = entity_columns.entry(key.as_str().into()).or_insert_with(|| {
                entity_order.push(key.as_str().into());
                EntityColumn::default()
            });
            column.set(row, value.as_str().into());
        }

        paths.push(PathRecord {
            dataset: entry.dataset,
            rel_path: entry.rel_path.into_boxed_str(),
            datatype: parsed.datatype.map(|s| s.into_boxed_str()),
            suffix: parsed.suffix.map(|s| s.into_boxed_str()),
            extension: parsed.extension.map(|s| s.into_boxed_str()),
            parts: parsed.parts.into_iter().map(|s| s.into_boxed_str()).collect(),
        });
    }

    let total_rows = paths.len();
    for column in entity_columns.values_mut() {
        column.grow_to(total_rows);
    }

    Ok(LayoutIndex {
        datasets,
        paths,
        entity_order,
        entity_columns,
        metadata: MetadataState::default(),
    })
}

/// Reassemble a `LayoutIndex` from its decoded parts (persistence codec,
/// C8). Entity columns and metadata rows are rebuilt pre-populated; their
/// inverted indices still build lazily on first query, same as after a
/// fresh `build_index`.
pub fn rebuild_from_parts(
    datasets: Vec<Dataset>,
    paths: Vec<PathRecord>,
    entity_values: Vec<(String, Vec<Option<Box<str>>>)>,
    metadata_rows: Option<Vec<crate::metadata::MetadataMap>>,
) -> Result<LayoutIndex, Error> {
    let mut entity_order: Vec<Box<str>> = Vec::with_capacity(entity_values.len());
    let mut entity_columns: HashMap<Box<str>, EntityColumn> = HashMap::with_capacity(entity_values.len());
    for (name, values) in entity_values {
        entity_order.push(name.as_str().into());
        entity_columns.insert(name.into_boxed_str(), EntityColumn { values, inverted: OnceLock::new() });
    }

    let metadata = MetadataState::default();
    if let Some(rows) = metadata_rows {
        let _ = metadata.data.set(rows);
        *metadata.done.write().unwrap() = true;
    }

    Ok(LayoutIndex { datasets, paths, entity_order, entity_columns, metadata })
}
