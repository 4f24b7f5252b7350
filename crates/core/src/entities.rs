//! Static BIDS entity dictionary (C1).
//!
//! Ships the long/short name table, canonical ordering, and the two pure
//! lookup functions the spec requires (`long_to_short`, `short_to_long`).
//! Built once behind a `LazyLock` — this is a fixed table, not runtime
//! configuration, so it needs no config crate.

use crate::error::Error;
use std::collections::HashMap;
use std::sync::LazyLock;

/// One row of the entity dictionary.
#[derive(Debug, Clone, Copy)]
pub struct EntityDef {
    pub long: &'static str,
    pub short: &'static str,
    pub order_rank: u32,
    pub in_filename: bool,
    pub in_directory: bool,
}

/// Canonical entity table, in BIDS specification order. Only `subject` and
/// `session` are ever legal directory-level entities in raw BIDS trees.
const ENTITY_TABLE: &[EntityDef] = &[
    e("subject", "sub", true, true),
    e("session", "ses", true, true),
    e("sample", "sample", true, false),
    e("task", "task", true, false),
    e("tracer", "trc", true, false),
    e("acquisition", "acq", true, false),
    e("ceagent", "ce", true, false),
    e("stain", "stain", true, false),
    e("reconstruction", "rec", true, false),
    e("direction", "dir", true, false),
    e("run", "run", true, false),
    e("modality", "mod", true, false),
    e("echo", "echo", true, false),
    e("flip", "flip", true, false),
    e("inversion", "inv", true, false),
    e("mt", "mt", true, false),
    e("part", "part", true, false),
    e("processing", "proc", true, false),
    e("hemisphere", "hemi", true, false),
    e("space", "space", true, false),
    e("split", "split", true, false),
    e("recording", "recording", true, false),
    e("chunk", "chunk", true, false),
    e("resolution", "res", true, false),
    e("density", "den", true, false),
    e("label", "label", true, false),
    e("description", "desc", true, false),
    e("from", "from", true, false),
    e("to", "to", true, false),
    e("atlas", "atlas", true, false),
    e("segmentation", "seg", true, false),
];

const fn e(long: &'static str, short: &'static str, in_filename: bool, in_directory: bool) -> EntityDef {
    EntityDef { long, short, order_rank: 0, in_filename, in_directory }
}

struct Dictionary {
    by_long: HashMap<&'static str, &'static EntityDef>,
    by_short: HashMap<&'static str, &'static EntityDef>,
}

static DICTIONARY: LazyLock<Dictionary> = LazyLock::new(|| {
    let mut by_long = HashMap::new();
    let mut by_short = HashMap::new();
    for (rank, def) in ENTITY_TABLE.iter().enumerate() {
        let mut def = *def;
        def.order_rank = rank as u32;
        let leaked: &'static EntityDef = Box::leak(Box::new(def));
        if by_long.insert(leaked.long, leaked).is_some() {
            panic!("duplicate long entity name in static table: {}", leaked.long);
        }
        if by_short.insert(leaked.short, leaked).is_some() {
            panic!("duplicate short entity name in static table: {}", leaked.short);
        }
    }
    Dictionary { by_long, by_short }
});

/// Look up an entity definition by its canonical long name.
pub fn lookup_long(name: &str) -> Option<&'static EntityDef> {
    DICTIONARY.by_long.get(name).copied()
}

/// Look up an entity definition by its short (filename-token) name.
pub fn lookup_short(name: &str) -> Option<&'static EntityDef> {
    DICTIONARY.by_short.get(name).copied()
}

/// Resolve either a long or short name (or a trailing-underscore alias such
/// as `from_`) to the canonical long name.
pub fn resolve_key(name: &str) -> Option<&'static str> {
    let stripped = name.strip_suffix('_').unwrap_or(name);
    lookup_long(stripped).or_else(|| lookup_short(stripped)).map(|d| d.long)
}

/// Canonical order rank for a long entity name, used to sort `.entities`
/// aggregates and to reconstruct filenames in canonical order.
pub fn order_rank(long_name: &str) -> u32 {
    lookup_long(long_name).map(|d| d.order_rank).unwrap_or(u32::MAX)
}

/// `long_to_short` — fails with `UnknownEntity` if `name` is not registered.
pub fn long_to_short(name: &str) -> Result<&'static str, Error> {
    lookup_long(name).map(|d| d.short).ok_or_else(|| Error::UnknownEntity(name.to_string()))
}

/// `short_to_long` — fails with `UnknownEntity` if `name` is not registered.
pub fn short_to_long(name: &str) -> Result<&'static str, Error> {
    lookup_short(name).map(|d| d.long).ok_or_else(|| Error::UnknownEntity(name.to_string()))
}

/// BIDS datatype labels recognized by the path parser (§4.2).
pub const DATATYPES: &[&str] = &[
    "anat", "func", "dwi", "fmap", "perf", "meg", "eeg", "ieeg", "beh", "pet", "micr", "motion",
    "nirs",
];

pub fn is_datatype(segment: &str) -> bool {
    DATATYPES.contains(&segment)
}
