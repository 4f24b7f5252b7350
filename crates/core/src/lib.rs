//! `rsbids-core` — a BIDS dataset indexer and query engine.
//!
//! `Layout` is the single public entry point: construct one from a set of
//! roots, then `.get(...)` / `.filter(...)` it into narrower immutable
//! views that share the same underlying index (spec §3 "Lifecycles").

pub mod dataset;
pub mod entities;
pub mod error;
pub mod index;
pub mod metadata;
pub mod parser;
pub mod persistence;
pub mod query;
pub mod walker;

pub use dataset::{ConstructOptions, Dataset, DatasetDescription, DatasetId, DatasetKind, Derivatives};
pub use entities::{long_to_short, short_to_long};
pub use error::{BadDescription, Error};
pub use parser::ParsedPath;
pub use query::FilterValue;
pub use walker::CancelToken;

use index::{LayoutIndex, PathId};
use parser::{ParseContext, ParserMode};
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One path in a view, with its resolved entities and (if
/// `index_metadata()` has run) resolved metadata.
#[derive(Debug, Clone)]
pub struct Entry<'a> {
    pub dataset: DatasetId,
    pub path: &'a str,
    pub datatype: Option<&'a str>,
    pub suffix: Option<&'a str>,
    pub extension: Option<&'a str>,
    pub parts: &'a [Box<str>],
    pub entities: BTreeMap<&'a str, &'a str>,
    pub metadata: Option<&'a metadata::MetadataMap>,
}

/// An immutable projection over a `LayoutIndex`: a selection bitset plus a
/// restricted dataset-id set (spec §3 "View"). Cloning a `Layout` is cheap
/// (shared `Arc<LayoutIndex>`).
#[derive(Clone)]
pub struct Layout {
    index: Arc<LayoutIndex>,
    selection: RoaringBitmap,
    dataset_ids: BTreeSet<DatasetId>,
    ctx: ParseContext,
}

impl Layout {
    fn from_index(index: Arc<LayoutIndex>, ctx: ParseContext) -> Self {
        let selection = index.all_rows();
        let dataset_ids = index.datasets().iter().map(|d| d.id).collect();
        Layout { index, selection, dataset_ids, ctx }
    }

    fn with_selection(&self, selection: RoaringBitmap, dataset_ids: BTreeSet<DatasetId>) -> Layout {
        Layout { index: self.index.clone(), selection, dataset_ids, ctx: self.ctx }
    }

    /// Build a new root layout from scratch, or load it from `options.cache`
    /// if present and `reset_cache` is not set (spec §4.3, §6).
    pub fn construct(roots: &[PathBuf], options: ConstructOptions) -> Result<Layout, Error> {
        Self::construct_with_cancel(roots, options, &CancelToken::new())
    }

    pub fn construct_with_cancel(
        roots: &[PathBuf],
        options: ConstructOptions,
        cancel: &CancelToken,
    ) -> Result<Layout, Error> {
        tracing::info!(roots = roots.len(), validate = options.validate, "constructing layout");
        let ctx = ParseContext { mode: if options.validate { ParserMode::Strict } else { ParserMode::Permissive } };

        if !options.reset_cache {
            if let Some(cache) = &options.cache {
                if cache.is_file() {
                    match persistence::load(cache) {
                        Ok(index) => return Ok(Layout::from_index(Arc::new(index), ctx)),
                        Err(e) => tracing::warn!(error = %e, path = %cache.display(), "cache load failed, rebuilding"),
                    }
                }
            }
        }

        let datasets = walker::resolve_datasets(roots, &options.derivatives)?;
        let entries = walker::walk_datasets(&datasets, cancel)?;
        if cancel.is_cancelled() {
            return Err(Error::io(
                PathBuf::new(),
                std::io::Error::new(std::io::ErrorKind::Interrupted, "construction cancelled"),
            ));
        }
        let index = index::build_index(&ctx, datasets, entries)?;
        tracing::info!(paths = index.paths().len(), datasets = index.datasets().len(), "layout constructed");

        if let Some(cache) = &options.cache {
            if let Err(e) = persistence::save(&index, cache) {
                tracing::warn!(error = %e, path = %cache.display(), "failed to write cache");
            }
        }
        Ok(Layout::from_index(Arc::new(index), ctx))
    }

    pub fn load(path: &Path, validate: bool) -> Result<Layout, Error> {
        let index = persistence::load(path)?;
        let ctx = ParseContext { mode: if validate { ParserMode::Strict } else { ParserMode::Permissive } };
        Ok(Layout::from_index(Arc::new(index), ctx))
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        persistence::save(&self.index, path)
    }

    /// `get(**entities_and_metadata)` — AND-composed entity/metadata
    /// filters (spec §4.6).
    pub fn get(&self, filters: &[(&str, FilterValue)]) -> Result<Layout, Error> {
        let owned: Vec<(String, FilterValue)> = filters.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let selection = query::apply_get(&self.index, &self.selection, &owned)?;
        Ok(self.with_selection(selection, self.dataset_ids.clone()))
    }

    /// `filter(root=, scope=)` — dataset-level filters (spec §4.6).
    pub fn filter(&self, root: Option<&str>, scope: Option<&str>) -> Result<Layout, Error> {
        let mut dataset_ids = self.dataset_ids.clone();
        if let Some(pattern) = root {
            dataset_ids = query::apply_root_filter(&self.index, &dataset_ids, pattern)?;
        }
        if let Some(scope) = scope {
            dataset_ids = query::apply_scope_filter(&self.index, &dataset_ids, scope)?;
        }
        let selection = query::restrict_to_datasets(&self.index, &self.selection, &dataset_ids);
        Ok(self.with_selection(selection, dataset_ids))
    }

    /// View restricted to derivative datasets (spec §4.7).
    pub fn derivatives(&self) -> Layout {
        self.filter(None, Some("derivatives")).expect("scope=\"derivatives\" never fails")
    }

    /// Ad-hoc parse, not added to the index (spec §4.7 `parse(path)`). An
    /// absolute path is first made relative to whichever configured dataset
    /// root contains it; an absolute path under none of them is `NotInRoot`
    /// (spec §4.2). A relative path is passed through as-is.
    pub fn parse(&self, path: &str) -> Result<ParsedPath, Error> {
        let as_path = Path::new(path);
        if !as_path.is_absolute() {
            return parser::parse_path(&self.ctx, path);
        }
        let canon = std::fs::canonicalize(as_path).unwrap_or_else(|_| as_path.to_path_buf());
        let rel = self
            .index
            .datasets()
            .iter()
            .find_map(|d| canon.strip_prefix(&d.root).ok())
            .ok_or_else(|| Error::NotInRoot(as_path.to_path_buf()))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        parser::parse_path(&self.ctx, &rel_str)
    }

    /// Idempotent: runs the inheritance-principle resolution once per root
    /// layout, then returns a view identical to `self` (spec §4.5).
    pub fn index_metadata(&self) -> Layout {
        let ctx = self.ctx;
        let index = self.index.clone();
        index.metadata.ensure(|| metadata::resolve_all(&ctx, &index));
        self.with_selection(self.selection.clone(), self.dataset_ids.clone())
    }

    pub fn len(&self) -> u64 {
        self.selection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selection.is_empty()
    }

    /// Ordered, unique list of datasets actually referenced by the
    /// selection (spec §4.7 `roots`).
    pub fn roots(&self) -> Vec<&Dataset> {
        self.dataset_ids
            .iter()
            .filter_map(|id| {
                let rows = self.index.rows_in_dataset(*id);
                if (&rows & &self.selection).is_empty() {
                    None
                } else {
                    self.index.dataset(*id)
                }
            })
            .collect()
    }

    /// The sole raw root, or (if none) the sole derivative root; else
    /// `AmbiguousRoot` / `NoRoot` (spec §4.7 `root`).
    pub fn root(&self) -> Result<&Dataset, Error> {
        let roots = self.roots();
        let raw: Vec<&&Dataset> = roots.iter().filter(|d| d.kind == DatasetKind::Raw).collect();
        if raw.len() == 1 {
            return Ok(raw[0]);
        }
        if raw.is_empty() {
            let derivative: Vec<&&Dataset> = roots.iter().filter(|d| d.kind == DatasetKind::Derivative).collect();
            return match derivative.len() {
                0 => Err(Error::NoRoot),
                1 => Ok(derivative[0]),
                n => Err(Error::AmbiguousRoot(n)),
            };
        }
        Err(Error::AmbiguousRoot(raw.len()))
    }

    pub fn description(&self) -> Result<Option<&DatasetDescription>, Error> {
        self.root().map(|d| d.description.as_ref())
    }

    pub fn entities(&self) -> BTreeMap<String, Vec<String>> {
        query::entities_aggregate(&self.index, &self.selection)
    }

    pub fn metadata(&self) -> BTreeMap<String, Vec<String>> {
        query::metadata_aggregate(&self.index, &self.selection)
    }

    /// The sole entry if `len()==1`; else `NotUnique` naming the entities
    /// that still vary (spec §4.7 `one`).
    pub fn one(&self) -> Result<Entry<'_>, Error> {
        let row = query::one(&self.index, &self.selection)?;
        Ok(self.entry(row))
    }

    /// All entries, path-sort ascending (spec §4.7: deterministic iteration
    /// order regardless of walk or dataset order).
    pub fn iter(&self) -> Vec<Entry<'_>> {
        let mut rows: Vec<PathId> = self.selection.iter().collect();
        rows.sort_by(|&a, &b| {
            self.index.path(a).map(|p| p.rel_path.as_ref()).cmp(&self.index.path(b).map(|p| p.rel_path.as_ref()))
        });
        rows.into_iter().map(|row| self.entry(row)).collect()
    }

    fn entry(&self, row: PathId) -> Entry<'_> {
        let record = self.index.path(row).expect("row id from this layout's own selection");
        let entities = self.index.row_entities(row).into_iter().collect();
        Entry {
            dataset: record.dataset,
            path: &record.rel_path,
            datatype: record.datatype.as_deref(),
            suffix: record.suffix.as_deref(),
            extension: record.extension.as_deref(),
            parts: &record.parts,
            entities,
            metadata: self.index.metadata.get(row),
        }
    }
}
