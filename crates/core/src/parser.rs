//! Path parser (C2) — a pure function of a path string plus parser mode.
//!
//! No filesystem access happens here; that's what makes parsing
//! "embarrassingly parallel" per the concurrency model (§5 of the spec).

use crate::entities;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    /// Only dictionary-registered entity names are recognized.
    Strict,
    /// Any `key-value` token is accepted as an entity.
    Permissive,
}

/// Everything the parser needs about the surrounding dataset; currently just
/// the mode, but kept as its own type so future per-dataset parse context
/// (e.g. a custom entity allow-list) has somewhere to live without changing
/// every call site.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext {
    pub mode: ParserMode,
}

/// A filesystem path parsed into BIDS entities, datatype, suffix, and
/// extension (spec §3 "Parsed Path").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedPath {
    pub rel_path: String,
    /// Ordered long-name -> value, insertion order = directory entities
    /// first, then filename entities in filename order (spec §3).
    pub entities: Vec<(String, String)>,
    pub datatype: Option<String>,
    pub suffix: Option<String>,
    pub extension: Option<String>,
    pub parts: Vec<String>,
}

impl ParsedPath {
    pub fn entity(&self, long_name: &str) -> Option<&str> {
        self.entities.iter().find(|(k, _)| k == long_name).map(|(_, v)| v.as_str())
    }
}

/// Split a `key-value` token at the first `-`. Returns `None` if there is no
/// `-`, or if the key is empty.
fn split_entity_token(token: &str) -> Option<(&str, &str)> {
    let idx = token.find('-')?;
    let (key, rest) = token.split_at(idx);
    let value = &rest[1..];
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Resolve a raw token key to a canonical long name under the given mode.
/// Strict mode requires dictionary membership; permissive mode accepts any
/// non-empty key verbatim as its own canonical name.
fn canonical_entity_name(mode: ParserMode, key: &str) -> Option<String> {
    match mode {
        ParserMode::Strict => entities::lookup_long(key)
            .or_else(|| entities::lookup_short(key))
            .map(|d| d.long.to_string()),
        ParserMode::Permissive => Some(key.to_string()),
    }
}

/// Insert `(key, value)` into `map`, preserving first-seen order. Returns an
/// error if `key` is already present with a different value and
/// `mode == Strict` (directory/filename consistency, spec §4.2).
fn merge_entity(
    ordered: &mut Vec<(String, String)>,
    mode: ParserMode,
    key: String,
    value: String,
    from_directory: bool,
) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::InvalidEntityValue(format!("{key}-")));
    }
    if let Some(existing) = ordered.iter_mut().find(|(k, _)| *k == key) {
        if existing.1 != value {
            if mode == ParserMode::Strict {
                return Err(Error::InconsistentEntity {
                    entity: key,
                    dir_value: if from_directory { value } else { existing.1.clone() },
                    file_value: if from_directory { existing.1.clone() } else { value },
                });
            }
            // Permissive: the more specific (filename) value wins.
            if !from_directory {
                existing.1 = value;
            }
        }
        return Ok(());
    }
    ordered.push((key, value));
    Ok(())
}

/// Parse a path (relative to its dataset root, using `/` separators) into
/// entities, datatype, suffix, extension, and leftover parts.
pub fn parse_path(ctx: &ParseContext, rel_path: &str) -> Result<ParsedPath, Error> {
    let mode = ctx.mode;
    let segments: Vec<&str> = rel_path.split('/').filter(|s| !s.is_empty()).collect();
    let (dir_segments, filename) = match segments.split_last() {
        Some((last, rest)) => (rest, *last),
        None => {
            return Ok(ParsedPath { rel_path: rel_path.to_string(), ..Default::default() });
        }
    };

    let mut entities_ordered: Vec<(String, String)> = Vec::new();
    let mut parts: Vec<String> = Vec::new();
    let mut datatype: Option<String> = None;

    // --- datatype: the penultimate directory segment ---
    let mut mined_dirs = dir_segments;
    if let Some((&last_dir, rest)) = dir_segments.split_last() {
        if entities::is_datatype(last_dir) {
            datatype = Some(last_dir.to_string());
            mined_dirs = rest;
        } else if mode == ParserMode::Permissive && split_entity_token(last_dir).is_none() {
            // Permissive: a bare directory name in datatype position that
            // isn't itself an entity token MAY be treated as a datatype.
            datatype = Some(last_dir.to_string());
            mined_dirs = rest;
        }
    }

    // --- mine remaining directory segments for entity-value tokens ---
    for &seg in mined_dirs {
        match split_entity_token(seg) {
            Some((key, value)) => {
                if let Some(long) = canonical_entity_name(mode, key) {
                    merge_entity(&mut entities_ordered, mode, long, value.to_string(), true)?;
                } else {
                    parts.push(seg.to_string());
                }
            }
            None => parts.push(seg.to_string()),
        }
    }

    // --- split filename on '_' ---
    let tokens: Vec<&str> = filename.split('_').filter(|s| !s.is_empty()).collect();
    let mut suffix: Option<String> = None;
    let mut extension: Option<String> = None;

    let (body_tokens, trailing) = match tokens.split_last() {
        Some((last, rest)) => (rest, Some(*last)),
        None => (&[][..], None),
    };

    let trailing_entity_token = trailing.and_then(split_entity_token);
    let trailing_canonical =
        trailing_entity_token.and_then(|(key, _)| canonical_entity_name(mode, key));
    let trailing_has_dash = trailing_entity_token.is_some();
    let trailing_is_entity = trailing_canonical.is_some();

    for &token in body_tokens {
        match split_entity_token(token) {
            Some((key, value)) => {
                if let Some(long) = canonical_entity_name(mode, key) {
                    merge_entity(&mut entities_ordered, mode, long, value.to_string(), false)?;
                } else {
                    parts.push(token.to_string());
                }
            }
            None => parts.push(token.to_string()),
        }
    }

    if let Some(trailing) = trailing {
        if trailing_is_entity {
            let (key, value) = trailing_entity_token.unwrap();
            let long = trailing_canonical.unwrap();
            merge_entity(&mut entities_ordered, mode, long, value.to_string(), false)?;
        } else if trailing_has_dash {
            // Looks like an entity token but the key isn't recognized
            // (strict mode only) — demote to parts rather than guessing a suffix.
            parts.push(trailing.to_string());
        } else {
            // suffix [+ extension]: split at the first '.' in the trailing token.
            match trailing.find('.') {
                Some(dot_idx) => {
                    let (s, ext) = trailing.split_at(dot_idx);
                    if !s.is_empty() {
                        suffix = Some(s.to_string());
                    }
                    extension = Some(ext.to_string());
                }
                None => suffix = Some(trailing.to_string()),
            }
        }
    }

    Ok(ParsedPath {
        rel_path: rel_path.to_string(),
        entities: entities_ordered,
        datatype,
        suffix,
        extension,
        parts,
    })
}

/// Fallback for when `parse_path` fails in strict mode (spec §4.3 "parse
/// failures in strict mode demote the file to a 'parts-only' record rather
/// than aborting the walk"; §9 resolves this as the chosen policy). No
/// entities are recognized — every directory and filename token is pushed to
/// `parts` — but datatype/suffix/extension are still recovered best-effort,
/// since none of that recovery depends on the entity merge that failed.
pub fn parts_only(rel_path: &str) -> ParsedPath {
    let segments: Vec<&str> = rel_path.split('/').filter(|s| !s.is_empty()).collect();
    let (dir_segments, filename) = match segments.split_last() {
        Some((last, rest)) => (rest, *last),
        None => return ParsedPath { rel_path: rel_path.to_string(), ..Default::default() },
    };

    let mut parts: Vec<String> = Vec::new();
    let mut datatype: Option<String> = None;

    let mut mined_dirs = dir_segments;
    if let Some((&last_dir, rest)) = dir_segments.split_last() {
        if entities::is_datatype(last_dir) {
            datatype = Some(last_dir.to_string());
            mined_dirs = rest;
        }
    }
    parts.extend(mined_dirs.iter().map(|s| (*s).to_string()));

    let tokens: Vec<&str> = filename.split('_').filter(|s| !s.is_empty()).collect();
    let (body_tokens, trailing) = match tokens.split_last() {
        Some((last, rest)) => (rest, Some(*last)),
        None => (&[][..], None),
    };
    parts.extend(body_tokens.iter().map(|s| (*s).to_string()));

    let mut suffix = None;
    let mut extension = None;
    if let Some(trailing) = trailing {
        if split_entity_token(trailing).is_some() {
            parts.push(trailing.to_string());
        } else {
            match trailing.find('.') {
                Some(dot_idx) => {
                    let (s, ext) = trailing.split_at(dot_idx);
                    if !s.is_empty() {
                        suffix = Some(s.to_string());
                    }
                    extension = Some(ext.to_string());
                }
                None => suffix = Some(trailing.to_string()),
            }
        }
    }

    ParsedPath { rel_path: rel_path.to_string(), entities: Vec::new(), datatype, suffix, extension, parts }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> ParseContext {
        ParseContext { mode: ParserMode::Strict }
    }

    fn permissive() -> ParseContext {
        ParseContext { mode: ParserMode::Permissive }
    }

    #[test]
    fn parses_simple_anat_file() {
        let p = parse_path(&strict(), "sub-01/anat/sub-01_T1w.nii.gz").unwrap();
        assert_eq!(p.entity("subject"), Some("01"));
        assert_eq!(p.datatype.as_deref(), Some("anat"));
        assert_eq!(p.suffix.as_deref(), Some("T1w"));
        assert_eq!(p.extension.as_deref(), Some(".nii.gz"));
    }

    #[test]
    fn parses_func_file_with_task_entity() {
        let p =
            parse_path(&strict(), "sub-01/func/sub-01_task-rest_bold.nii.gz").unwrap();
        assert_eq!(p.entity("subject"), Some("01"));
        assert_eq!(p.entity("task"), Some("rest"));
        assert_eq!(p.suffix.as_deref(), Some("bold"));
        assert_eq!(p.extension.as_deref(), Some(".nii.gz"));
    }

    #[test]
    fn multipart_extension_preserved_verbatim() {
        let p = parse_path(&strict(), "sub-01/anat/sub-01_T1w.json.gz").unwrap();
        assert_eq!(p.extension.as_deref(), Some(".json.gz"));
    }

    #[test]
    fn strict_mode_drops_unknown_token_to_parts() {
        let p = parse_path(&strict(), "sub-01/anat/sub-01_foobar-val_T1w.nii.gz").unwrap();
        assert!(p.entity("foobar").is_none());
        assert!(p.parts.iter().any(|s| s == "foobar-val"));
    }

    #[test]
    fn permissive_mode_accepts_unknown_entity() {
        let p = parse_path(&permissive(), "sub-01/anat/sub-01_foobar-val_T1w.nii.gz").unwrap();
        assert_eq!(p.entity("foobar"), Some("val"));
    }

    #[test]
    fn directory_filename_consistency_enforced_in_strict_mode() {
        let err =
            parse_path(&strict(), "sub-01/anat/sub-02_T1w.nii.gz").unwrap_err();
        assert!(matches!(err, Error::InconsistentEntity { .. }));
    }

    #[test]
    fn directory_filename_consistency_lenient_in_permissive_mode() {
        let p = parse_path(&permissive(), "sub-01/anat/sub-02_T1w.nii.gz").unwrap();
        // filename value wins
        assert_eq!(p.entity("subject"), Some("02"));
    }

    #[test]
    fn empty_value_is_invalid() {
        let err = parse_path(&strict(), "sub-01/anat/sub-01_run-_T1w.nii.gz").unwrap_err();
        assert!(matches!(err, Error::InvalidEntityValue(_)));
    }

    #[test]
    fn derivative_entities_space_desc() {
        let p = parse_path(
            &strict(),
            "sub-01/anat/sub-01_space-MNI_desc-preproc_T1w.nii.gz",
        )
        .unwrap();
        assert_eq!(p.entity("space"), Some("MNI"));
        assert_eq!(p.entity("description"), Some("preproc"));
    }

    #[test]
    fn dataset_description_has_no_entities() {
        // "dataset_description.json" splits on '_' into ["dataset",
        // "description.json"]; "dataset" carries no '-' so it is a leading
        // non-entity part, and the trailing token yields suffix +
        // extension, same as any other non-entity filename.
        let p = parse_path(&strict(), "dataset_description.json").unwrap();
        assert!(p.entities.is_empty());
        assert!(p.parts.iter().any(|s| s == "dataset"));
        assert_eq!(p.suffix.as_deref(), Some("description"));
        assert_eq!(p.extension.as_deref(), Some(".json"));
    }

    #[test]
    fn parts_only_recovers_suffix_and_extension_without_entities() {
        let p = parts_only("sub-01/anat/sub-01_foo-_T1w.nii.gz");
        assert!(p.entities.is_empty());
        assert!(p.parts.iter().any(|s| s == "sub-01"));
        assert!(p.parts.iter().any(|s| s == "foo-"));
        assert_eq!(p.datatype.as_deref(), Some("anat"));
        assert_eq!(p.suffix.as_deref(), Some("T1w"));
        assert_eq!(p.extension.as_deref(), Some(".nii.gz"));
    }
}
