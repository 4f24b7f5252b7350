//! Dataset walker (C3) — filesystem enumeration, parallelized with `ignore`
//! + `rayon` the way the teacher's `scan.rs` walks a project tree.
//!
//! Discovery happens in two passes: first the set of dataset roots is
//! resolved (raw roots plus whatever `Derivatives` config says), each root
//! is read for `dataset_description.json`; then every root's file tree is
//! walked in parallel and each entry is handed to the caller as a
//! `RawEntry` for parsing (C2) and indexing (C4).

use crate::dataset::{read_dataset_description, Dataset, DatasetId, DatasetKind, Derivatives};
use crate::error::Error;
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;

/// Cooperative cancellation: checked at directory boundaries during the
/// parallel walk (spec §5 "Cancellation").
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One discovered file, relative to its dataset's root, queued for parsing.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub dataset: DatasetId,
    pub abs_path: PathBuf,
    pub rel_path: String,
}

/// Files inside these directories are never yielded directly — they are
/// either metadata carried on the `Dataset` itself, or nested derivative
/// roots walked separately (spec §4.1 "Nested derivatives are excluded from
/// the parent dataset's own enumeration").
const ALWAYS_SKIP: &[&str] = &[".git", ".datalad", ".bidsignore"];

fn canonical(path: &Path) -> Result<PathBuf, Error> {
    std::fs::canonicalize(path).map_err(|e| Error::io(path, e))
}

/// Resolve the ordered list of raw roots plus whatever the `Derivatives`
/// configuration contributes, assigning each a `DatasetId` in discovery
/// order and rejecting duplicate canonical roots (spec §4.1).
pub fn resolve_datasets(
    raw_roots: &[PathBuf],
    derivatives: &Derivatives,
) -> Result<Vec<Dataset>, Error> {
    let mut datasets = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut next_id = 0u32;

    for root in raw_roots {
        push_dataset(&mut datasets, &mut seen, &mut next_id, root, DatasetKind::Raw, None)?;
    }

    match derivatives {
        Derivatives::None => {}
        Derivatives::Auto => {
            for root in raw_roots {
                let deriv_dir = root.join("derivatives");
                if !deriv_dir.is_dir() {
                    continue;
                }
                let mut entries: Vec<PathBuf> = std::fs::read_dir(&deriv_dir)
                    .map_err(|e| Error::io(&deriv_dir, e))?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir() && p.join("dataset_description.json").is_file())
                    .collect();
                entries.sort();
                for pipeline_dir in entries {
                    push_dataset(
                        &mut datasets,
                        &mut seen,
                        &mut next_id,
                        &pipeline_dir,
                        DatasetKind::Derivative,
                        None,
                    )?;
                }
            }
        }
        Derivatives::List(paths) => {
            for path in paths {
                push_dataset(&mut datasets, &mut seen, &mut next_id, path, DatasetKind::Derivative, None)?;
            }
        }
        Derivatives::Labeled(map) => {
            for (label, path) in map {
                push_dataset(
                    &mut datasets,
                    &mut seen,
                    &mut next_id,
                    path,
                    DatasetKind::Derivative,
                    Some(label.clone()),
                )?;
            }
        }
    }

    Ok(datasets)
}

fn push_dataset(
    datasets: &mut Vec<Dataset>,
    seen: &mut HashSet<PathBuf>,
    next_id: &mut u32,
    root: &Path,
    kind: DatasetKind,
    label: Option<String>,
) -> Result<(), Error> {
    let canon = canonical(root)?;
    if !seen.insert(canon.clone()) {
        return Err(Error::DuplicateRoot(canon));
    }

    let (description, description_error) = read_dataset_description(&canon);
    let pipelines = description.as_ref().map(|d| d.pipeline_names()).unwrap_or_default();
    let source_datasets = description.as_ref().and_then(|d| d.source_datasets.clone()).unwrap_or_default();
    let label = label.or_else(|| {
        canon.file_name().map(|n| n.to_string_lossy().into_owned())
    });

    let id = DatasetId(*next_id);
    *next_id += 1;
    datasets.push(Dataset {
        id,
        root: canon,
        kind,
        label,
        pipelines,
        description,
        description_error,
        source_datasets,
    });
    Ok(())
}

/// Walk every dataset's file tree in parallel, streaming results through a
/// bounded channel (capacity 256, per the concurrency model in spec §5) so
/// the single-writer index builder can consume entries as they arrive
/// instead of waiting for the whole walk to finish.
pub fn walk_datasets(
    datasets: &[Dataset],
    cancel: &CancelToken,
) -> Result<Vec<RawEntry>, Error> {
    let (tx, rx) = sync_channel::<RawEntry>(256);
    let nested_roots: HashSet<PathBuf> =
        datasets.iter().filter(|d| d.kind == DatasetKind::Derivative).map(|d| d.root.clone()).collect();

    let cancel = cancel.clone();
    rayon::scope(|scope| {
        for dataset in datasets {
            let tx = tx.clone();
            let cancel = cancel.clone();
            let nested_roots = &nested_roots;
            let dataset_id = dataset.id;
            let root = dataset.root.clone();
            scope.spawn(move |_| {
                walk_one(&root, dataset_id, &cancel, nested_roots, &tx);
            });
        }
        drop(tx);
    });

    let mut out: Vec<RawEntry> = rx.into_iter().collect();
    if cancel.is_cancelled() {
        out.clear();
    }
    out.sort_by(|a, b| (a.dataset, &a.rel_path).cmp(&(b.dataset, &b.rel_path)));
    Ok(out)
}

fn walk_one(
    root: &Path,
    dataset_id: DatasetId,
    cancel: &CancelToken,
    nested_roots: &HashSet<PathBuf>,
    tx: &std::sync::mpsc::SyncSender<RawEntry>,
) {
    let nested: HashSet<PathBuf> =
        nested_roots.iter().filter(|p| p.parent().map(|pp| pp == root).unwrap_or(false) || p.starts_with(root) && *p != root).cloned().collect();

    let cancel_for_filter = cancel.clone();
    WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .threads(rayon::current_num_threads().min(8))
        .filter_entry(move |entry| {
            if cancel_for_filter.is_cancelled() {
                return false;
            }
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                if ALWAYS_SKIP.contains(&name.as_ref()) {
                    return false;
                }
                if nested.contains(entry.path()) {
                    return false;
                }
            }
            true
        })
        .build_parallel()
        .run(|| {
            let tx = tx.clone();
            let root = root.to_path_buf();
            let cancel = cancel.clone();
            Box::new(move |entry| {
                if cancel.is_cancelled() {
                    return ignore::WalkState::Quit;
                }
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => return ignore::WalkState::Continue,
                };
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    return ignore::WalkState::Continue;
                }
                let abs_path = entry.path().to_path_buf();
                if abs_path.file_name().and_then(|n| n.to_str()) == Some("dataset_description.json") {
                    return ignore::WalkState::Continue;
                }
                let rel_path = abs_path
                    .strip_prefix(&root)
                    .unwrap_or(&abs_path)
                    .to_string_lossy()
                    .replace('\\', "/");
                let _ = tx.send(RawEntry { dataset: dataset_id, abs_path, rel_path });
                ignore::WalkState::Continue
            })
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn resolves_single_raw_root() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("dataset_description.json"), r#"{"Name": "x", "BIDSVersion": "1.8.0"}"#);
        let datasets = resolve_datasets(&[tmp.path().to_path_buf()], &Derivatives::None).unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].kind, DatasetKind::Raw);
    }

    #[test]
    fn duplicate_root_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let err = resolve_datasets(&[root.clone(), root], &Derivatives::None).unwrap_err();
        assert!(matches!(err, Error::DuplicateRoot(_)));
    }

    #[test]
    fn auto_derivatives_discovers_pipeline_subdirs() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("dataset_description.json"), r#"{"Name": "raw"}"#);
        write(
            &tmp.path().join("derivatives/fmriprep/dataset_description.json"),
            r#"{"Name": "fmriprep", "GeneratedBy": [{"Name": "fMRIPrep"}]}"#,
        );
        let datasets = resolve_datasets(&[tmp.path().to_path_buf()], &Derivatives::Auto).unwrap();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[1].kind, DatasetKind::Derivative);
        assert_eq!(datasets[1].pipelines, vec!["fMRIPrep".to_string()]);
    }

    #[test]
    fn walk_yields_files_and_skips_nested_derivatives() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("dataset_description.json"), r#"{"Name": "raw"}"#);
        write(&tmp.path().join("sub-01/anat/sub-01_T1w.nii.gz"), "x");
        write(
            &tmp.path().join("derivatives/fmriprep/dataset_description.json"),
            r#"{"Name": "fmriprep"}"#,
        );
        write(
            &tmp.path().join("derivatives/fmriprep/sub-01/anat/sub-01_desc-preproc_T1w.nii.gz"),
            "y",
        );
        let datasets = resolve_datasets(&[tmp.path().to_path_buf()], &Derivatives::Auto).unwrap();
        let entries = walk_datasets(&datasets, &CancelToken::new()).unwrap();
        let raw_entries: Vec<_> = entries.iter().filter(|e| e.dataset == datasets[0].id).collect();
        assert_eq!(raw_entries.len(), 1);
        assert!(raw_entries[0].rel_path.ends_with("sub-01_T1w.nii.gz"));
    }
}
