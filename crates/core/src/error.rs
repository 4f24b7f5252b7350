//! Error types (C9). One tagged variant per kind named in the specification,
//! following the teacher pack's `thiserror`-derived enum convention
//! (see e.g. `automapper-core`'s `AutomapperError`).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown entity or metadata key: {0}")]
    UnknownEntity(String),

    #[error("unknown scope: {0}")]
    UnknownScope(String),

    #[error("result is not unique; entities still varying: {0:?}")]
    NotUnique(Vec<String>),

    #[error("ambiguous root: {0} candidate roots")]
    AmbiguousRoot(usize),

    #[error("no root in selection")]
    NoRoot,

    #[error("inconsistent entity '{entity}': directory says '{dir_value}', filename says '{file_value}'")]
    InconsistentEntity { entity: String, dir_value: String, file_value: String },

    #[error("invalid entity value in token '{0}'")]
    InvalidEntityValue(String),

    #[error("duplicate dataset root: {0}")]
    DuplicateRoot(PathBuf),

    #[error("path '{0}' does not lie under any configured dataset root")]
    NotInRoot(PathBuf),

    #[error("cache file is incompatible: {0}")]
    CacheIncompatible(String),

    #[error("I/O error at {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}

/// Non-fatal: `dataset_description.json` was present but unparseable. Carried
/// on `Dataset` rather than propagated (spec §7: "non-fatal; dataset still
/// indexed with null description").
#[derive(Debug, Clone, thiserror::Error)]
#[error("dataset_description.json at {root} is unparseable: {cause}")]
pub struct BadDescription {
    pub root: PathBuf,
    pub cause: String,
}
