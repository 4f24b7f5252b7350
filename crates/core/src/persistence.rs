//! Persistence codec (C8) — a bespoke binary layout, not a generic
//! serialization format (spec §4.8). Sections, in order:
//!
//! 1. magic `RSBL` + u16 version
//! 2. deduplicated string heap (every string referenced below lives here)
//! 3. dataset table
//! 4. entity dictionary snapshot
//! 5. path table (rel path, dataset id, datatype/suffix/extension, parts)
//! 6. entity columnar blocks (RLE over the path table's row order)
//! 7. metadata block (present iff `index_metadata()` was run)
//! 8. CRC32 trailer over sections 1–7
//!
//! The string heap is placed early (rather than inlined section-by-section)
//! so every later offset is a plain `u32` index — an implementation choice
//! the distilled format description left open; recorded in `DESIGN.md`.

use crate::dataset::{Dataset, DatasetDescription, DatasetId, DatasetKind};
use crate::error::Error;
use crate::index::{LayoutIndex, PathRecord};
use crate::metadata::canonical_string;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"RSBL";
const VERSION: u16 = 1;
const SENTINEL: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// String heap
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HeapWriter {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl HeapWriter {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), id);
        id
    }

    fn intern_opt(&mut self, s: Option<&str>) -> u32 {
        s.map(|s| self.intern(s)).unwrap_or(SENTINEL)
    }

    fn write(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u32::<LE>(self.strings.len() as u32)?;
        for s in &self.strings {
            let bytes = s.as_bytes();
            out.write_u32::<LE>(bytes.len() as u32)?;
            out.write_all(bytes)?;
        }
        Ok(())
    }
}

struct HeapReader {
    strings: Vec<String>,
}

impl HeapReader {
    fn read(cur: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
        let mut strings = Vec::with_capacity(count);
        for _ in 0..count {
            let len = cur.read_u32::<LE>().map_err(cache_err)? as usize;
            let mut buf = vec![0u8; len];
            cur.read_exact(&mut buf).map_err(cache_err)?;
            strings.push(String::from_utf8(buf).map_err(|e| Error::CacheIncompatible(e.to_string()))?);
        }
        Ok(HeapReader { strings })
    }

    fn get(&self, offset: u32) -> Result<&str, Error> {
        self.strings
            .get(offset as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::CacheIncompatible(format!("heap offset {offset} out of range")))
    }

    fn get_opt(&self, offset: u32) -> Result<Option<&str>, Error> {
        if offset == SENTINEL {
            Ok(None)
        } else {
            self.get(offset).map(Some)
        }
    }
}

fn cache_err(e: io::Error) -> Error {
    Error::CacheIncompatible(e.to_string())
}

// ---------------------------------------------------------------------------
// RLE columns
// ---------------------------------------------------------------------------

fn encode_rle_column(out: &mut Vec<u8>, values: &[Option<u32>]) -> io::Result<()> {
    let mut runs: Vec<(u32, Option<u32>)> = Vec::new();
    for &v in values {
        match runs.last_mut() {
            Some((len, prev)) if *prev == v => *len += 1,
            _ => runs.push((1, v)),
        }
    }
    out.write_u32::<LE>(runs.len() as u32)?;
    for (len, value) in runs {
        out.write_u32::<LE>(len)?;
        match value {
            Some(offset) => {
                out.write_u8(1)?;
                out.write_u32::<LE>(offset)?;
            }
            None => {
                out.write_u8(0)?;
                out.write_u32::<LE>(0)?;
            }
        }
    }
    Ok(())
}

fn decode_rle_column(cur: &mut Cursor<&[u8]>, row_count: usize) -> Result<Vec<Option<u32>>, Error> {
    let run_count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
    let mut values = Vec::with_capacity(row_count);
    for _ in 0..run_count {
        let len = cur.read_u32::<LE>().map_err(cache_err)? as usize;
        let flag = cur.read_u8().map_err(cache_err)?;
        let offset = cur.read_u32::<LE>().map_err(cache_err)?;
        let value = if flag == 1 { Some(offset) } else { None };
        for _ in 0..len {
            values.push(value);
        }
    }
    if values.len() != row_count {
        return Err(Error::CacheIncompatible(format!(
            "column row count mismatch: expected {row_count}, got {}",
            values.len()
        )));
    }
    Ok(values)
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

pub fn encode(index: &LayoutIndex) -> Vec<u8> {
    let mut heap = HeapWriter::default();
    let datasets = index.datasets();
    let paths = index.paths();
    let entity_names = index.entity_names();

    // Pre-intern everything so the heap section precedes every consumer.
    let dataset_root_offsets: Vec<u32> = datasets.iter().map(|d| heap.intern(&d.root.to_string_lossy())).collect();
    let dataset_label_offsets: Vec<u32> = datasets.iter().map(|d| heap.intern_opt(d.label.as_deref())).collect();
    let dataset_description_offsets: Vec<u32> = datasets
        .iter()
        .map(|d| heap.intern_opt(d.description.as_ref().and_then(|desc| serde_json::to_string(desc).ok()).as_deref()))
        .collect();
    let dataset_pipeline_offsets: Vec<Vec<u32>> =
        datasets.iter().map(|d| d.pipelines.iter().map(|p| heap.intern(p)).collect()).collect();

    let entity_name_offsets: Vec<u32> = entity_names.iter().map(|n| heap.intern(n)).collect();

    let path_rel_offsets: Vec<u32> = paths.iter().map(|p| heap.intern(&p.rel_path)).collect();
    let path_datatype_offsets: Vec<u32> = paths.iter().map(|p| heap.intern_opt(p.datatype.as_deref())).collect();
    let path_suffix_offsets: Vec<u32> = paths.iter().map(|p| heap.intern_opt(p.suffix.as_deref())).collect();
    let path_extension_offsets: Vec<u32> = paths.iter().map(|p| heap.intern_opt(p.extension.as_deref())).collect();
    let path_parts_offsets: Vec<Vec<u32>> =
        paths.iter().map(|p| p.parts.iter().map(|s| heap.intern(s)).collect()).collect();

    let entity_columns: Vec<Vec<Option<u32>>> = entity_names
        .iter()
        .map(|name| {
            (0..paths.len() as u32)
                .map(|row| index.entity_value(row, name).map(|v| heap.intern(v)))
                .collect()
        })
        .collect();

    let metadata_indexed = index.metadata.is_indexed();
    let metadata_keys: Vec<String> = if metadata_indexed {
        let mut keys: Vec<String> = index
            .metadata
            .all()
            .map(|all| all.iter().flat_map(|m| m.keys().map(|k| k.to_string())).collect::<std::collections::BTreeSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .collect();
        keys.sort();
        keys
    } else {
        Vec::new()
    };
    let metadata_key_offsets: Vec<u32> = metadata_keys.iter().map(|k| heap.intern(k)).collect();
    let metadata_columns: Vec<Vec<Option<u32>>> = metadata_keys
        .iter()
        .map(|key| {
            (0..paths.len())
                .map(|row| {
                    index
                        .metadata
                        .all()
                        .and_then(|all| all.get(row))
                        .and_then(|m| m.get(key.as_str()))
                        .map(|v| heap.intern(&canonical_string(v)))
                })
                .collect()
        })
        .collect();

    let mut body = Vec::new();
    body.extend_from_slice(MAGIC);
    body.write_u16::<LE>(VERSION).unwrap();
    heap.write(&mut body).unwrap();

    // Dataset table.
    body.write_u32::<LE>(datasets.len() as u32).unwrap();
    for (i, dataset) in datasets.iter().enumerate() {
        body.write_u32::<LE>(dataset_root_offsets[i]).unwrap();
        body.write_u8(match dataset.kind {
            DatasetKind::Raw => 0,
            DatasetKind::Derivative => 1,
        })
        .unwrap();
        body.write_u32::<LE>(dataset_label_offsets[i]).unwrap();
        body.write_u32::<LE>(dataset_description_offsets[i]).unwrap();
        body.write_u32::<LE>(dataset_pipeline_offsets[i].len() as u32).unwrap();
        for &off in &dataset_pipeline_offsets[i] {
            body.write_u32::<LE>(off).unwrap();
        }
    }

    // Entity dictionary snapshot.
    body.write_u32::<LE>(entity_names.len() as u32).unwrap();
    for &off in &entity_name_offsets {
        body.write_u32::<LE>(off).unwrap();
    }

    // Path table.
    body.write_u32::<LE>(paths.len() as u32).unwrap();
    for (i, record) in paths.iter().enumerate() {
        body.write_u32::<LE>(record.dataset.0).unwrap();
        body.write_u32::<LE>(path_rel_offsets[i]).unwrap();
        body.write_u32::<LE>(path_datatype_offsets[i]).unwrap();
        body.write_u32::<LE>(path_suffix_offsets[i]).unwrap();
        body.write_u32::<LE>(path_extension_offsets[i]).unwrap();
        body.write_u32::<LE>(path_parts_offsets[i].len() as u32).unwrap();
        for &off in &path_parts_offsets[i] {
            body.write_u32::<LE>(off).unwrap();
        }
    }

    // Entity columnar blocks.
    body.write_u32::<LE>(entity_columns.len() as u32).unwrap();
    for column in &entity_columns {
        encode_rle_column(&mut body, column).unwrap();
    }

    // Metadata block.
    body.write_u8(if metadata_indexed { 1 } else { 0 }).unwrap();
    if metadata_indexed {
        body.write_u32::<LE>(metadata_keys.len() as u32).unwrap();
        for (i, column) in metadata_columns.iter().enumerate() {
            body.write_u32::<LE>(metadata_key_offsets[i]).unwrap();
            encode_rle_column(&mut body, column).unwrap();
        }
    }

    let crc = crc32fast::hash(&body);
    let mut out = body;
    out.write_u32::<LE>(crc).unwrap();
    out
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

pub fn decode(bytes: &[u8]) -> Result<LayoutIndex, Error> {
    if bytes.len() < 4 + 2 + 4 {
        return Err(Error::CacheIncompatible("file too short".to_string()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(trailer.try_into().unwrap());
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        tracing::warn!(stored = stored_crc, computed = computed_crc, "cache CRC mismatch");
        return Err(Error::CacheIncompatible("CRC mismatch".to_string()));
    }

    let mut cur = Cursor::new(body);
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic).map_err(cache_err)?;
    if &magic != MAGIC {
        return Err(Error::CacheIncompatible("bad magic".to_string()));
    }
    let version = cur.read_u16::<LE>().map_err(cache_err)?;
    if version != VERSION {
        return Err(Error::CacheIncompatible(format!("unsupported cache version {version}")));
    }

    let heap = HeapReader::read(&mut cur)?;

    let dataset_count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
    let mut datasets = Vec::with_capacity(dataset_count);
    for i in 0..dataset_count {
        let root_off = cur.read_u32::<LE>().map_err(cache_err)?;
        let kind_byte = cur.read_u8().map_err(cache_err)?;
        let label_off = cur.read_u32::<LE>().map_err(cache_err)?;
        let description_off = cur.read_u32::<LE>().map_err(cache_err)?;
        let pipeline_count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
        let mut pipelines = Vec::with_capacity(pipeline_count);
        for _ in 0..pipeline_count {
            let off = cur.read_u32::<LE>().map_err(cache_err)?;
            pipelines.push(heap.get(off)?.to_string());
        }
        let kind = match kind_byte {
            0 => DatasetKind::Raw,
            1 => DatasetKind::Derivative,
            other => return Err(Error::CacheIncompatible(format!("unknown dataset kind tag {other}"))),
        };
        let description: Option<DatasetDescription> = match heap.get_opt(description_off)? {
            Some(json) => Some(
                serde_json::from_str(json)
                    .map_err(|e| Error::CacheIncompatible(format!("dataset {i} description: {e}")))?,
            ),
            None => None,
        };
        let source_datasets = description.as_ref().and_then(|d| d.source_datasets.clone()).unwrap_or_default();
        datasets.push(Dataset {
            id: DatasetId(i as u32),
            root: PathBuf::from(heap.get(root_off)?),
            kind,
            label: heap.get_opt(label_off)?.map(str::to_string),
            pipelines,
            description,
            description_error: None,
            source_datasets,
        });
    }

    let entity_count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
    let mut entity_names = Vec::with_capacity(entity_count);
    for _ in 0..entity_count {
        let off = cur.read_u32::<LE>().map_err(cache_err)?;
        entity_names.push(heap.get(off)?.to_string());
    }

    let path_count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
    let mut paths: Vec<PathRecord> = Vec::with_capacity(path_count);
    for _ in 0..path_count {
        let dataset_id = cur.read_u32::<LE>().map_err(cache_err)?;
        let rel_off = cur.read_u32::<LE>().map_err(cache_err)?;
        let datatype_off = cur.read_u32::<LE>().map_err(cache_err)?;
        let suffix_off = cur.read_u32::<LE>().map_err(cache_err)?;
        let extension_off = cur.read_u32::<LE>().map_err(cache_err)?;
        let parts_count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
        let mut parts = Vec::with_capacity(parts_count);
        for _ in 0..parts_count {
            let off = cur.read_u32::<LE>().map_err(cache_err)?;
            parts.push(heap.get(off)?.to_string().into_boxed_str());
        }
        paths.push(PathRecord {
            dataset: DatasetId(dataset_id),
            rel_path: heap.get(rel_off)?.to_string().into_boxed_str(),
            datatype: heap.get_opt(datatype_off)?.map(|s| s.to_string().into_boxed_str()),
            suffix: heap.get_opt(suffix_off)?.map(|s| s.to_string().into_boxed_str()),
            extension: heap.get_opt(extension_off)?.map(|s| s.to_string().into_boxed_str()),
            parts,
        });
    }

    let column_count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
    if column_count != entity_names.len() {
        return Err(Error::CacheIncompatible("entity column count mismatch".to_string()));
    }
    let mut entity_values: Vec<(String, Vec<Option<Box<str>>>)> = Vec::with_capacity(column_count);
    for name in &entity_names {
        let column = decode_rle_column(&mut cur, path_count)?;
        let resolved: Result<Vec<Option<Box<str>>>, Error> = column
            .into_iter()
            .map(|off| match off {
                Some(o) => heap.get(o).map(|s| Some(s.to_string().into_boxed_str())),
                None => Ok(None),
            })
            .collect();
        entity_values.push((name.clone(), resolved?));
    }

    let has_metadata = cur.read_u8().map_err(cache_err)? == 1;
    let metadata = if has_metadata {
        let key_count = cur.read_u32::<LE>().map_err(cache_err)? as usize;
        let mut columns = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let key_off = cur.read_u32::<LE>().map_err(cache_err)?;
            let key = heap.get(key_off)?.to_string();
            let column = decode_rle_column(&mut cur, path_count)?;
            columns.push((key, column));
        }
        let mut rows: Vec<crate::metadata::MetadataMap> = vec![Default::default(); path_count];
        for (key, column) in columns {
            for (row, value_off) in column.into_iter().enumerate() {
                if let Some(off) = value_off {
                    let s = heap.get(off)?.to_string();
                    rows[row].insert(key.as_str().into(), serde_json::Value::String(s));
                }
            }
        }
        Some(rows)
    } else {
        None
    };

    crate::index::rebuild_from_parts(datasets, paths, entity_values, metadata)
}

pub fn save(index: &LayoutIndex, path: &Path) -> Result<(), Error> {
    let bytes = encode(index);
    std::fs::write(path, bytes).map_err(|e| Error::io(path, e))
}

pub fn load(path: &Path) -> Result<LayoutIndex, Error> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetId as Id;
    use crate::index::build_index;
    use crate::parser::ParserMode;
    use crate::walker::RawEntry;

    #[test]
    fn round_trips_entities_and_dataset_table() {
        let ctx = crate::parser::ParseContext { mode: ParserMode::Strict };
        let dataset = Dataset {
            id: Id(0),
            root: "/tmp/ds".into(),
            kind: DatasetKind::Raw,
            label: None,
            pipelines: Vec::new(),
            description: None,
            description_error: None,
            source_datasets: Vec::new(),
        };
        let entries = vec![
            RawEntry { dataset: Id(0), abs_path: "x".into(), rel_path: "sub-01/anat/sub-01_T1w.nii.gz".to_string() },
            RawEntry {
                dataset: Id(0),
                abs_path: "y".into(),
                rel_path: "sub-01/func/sub-01_task-rest_bold.nii.gz".to_string(),
            },
        ];
        let index = build_index(&ctx, vec![dataset], entries).unwrap();
        let bytes = encode(&index);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.paths().len(), index.paths().len());
        assert_eq!(decoded.entity_value(1, "task"), Some("rest"));
        assert_eq!(decoded.dataset(Id(0)).unwrap().kind, DatasetKind::Raw);
    }

    #[test]
    fn bad_crc_is_cache_incompatible() {
        let ctx = crate::parser::ParseContext { mode: ParserMode::Strict };
        let dataset = Dataset {
            id: Id(0),
            root: "/tmp/ds".into(),
            kind: DatasetKind::Raw,
            label: None,
            pipelines: Vec::new(),
            description: None,
            description_error: None,
            source_datasets: Vec::new(),
        };
        let entries =
            vec![RawEntry { dataset: Id(0), abs_path: "x".into(), rel_path: "sub-01/anat/sub-01_T1w.nii.gz".to_string() }];
        let index = build_index(&ctx, vec![dataset], entries).unwrap();
        let mut bytes = encode(&index);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::CacheIncompatible(_)));
    }
}
