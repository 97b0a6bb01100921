use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};

pub const ITEMS_DIR: &str = "items";
pub const ALBUMS_DIR: &str = "albums";

const MAX_STEM_BYTES: usize = 200;
const MAX_EXT_CHARS: usize = 16;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("stored path is empty")]
    Empty,
    #[error("stored path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("no free canonical path for {0}")]
    Exhausted(String),
}

/// Makes a remote-provided name safe to use as a single path component.
///
/// Anything outside letters, digits, `-`, `_`, `(`, `)` and space becomes `_`;
/// runs of `_` collapse and the result is trimmed. May return an empty string.
pub fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_underscore = false;
    for ch in value.chars() {
        let ch = if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '(' | ')' | ' ') {
            ch
        } else {
            '_'
        };
        if ch == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(ch);
    }
    truncate_bytes(out.trim_matches(|c| c == '_' || c == ' '), MAX_STEM_BYTES).to_string()
}

fn truncate_bytes(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].trim_end_matches(|c| c == '_' || c == ' ')
}

/// Directory name for an album title; never empty.
pub fn album_dir_name(title: &str) -> String {
    let name = sanitize(title);
    if name.is_empty() {
        "Untitled".to_string()
    } else {
        name
    }
}

/// Sanitized `stem.ext` for a remote filename; never empty.
pub fn file_name_for(filename: &str) -> String {
    let (stem, ext) = split_extension(filename);
    let mut stem = sanitize(stem);
    if stem.is_empty() {
        stem = "untitled".to_string();
    }
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

fn split_extension(filename: &str) -> (&str, Option<String>) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext: String = ext
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .take(MAX_EXT_CHARS)
                .collect();
            (stem, (!ext.is_empty()).then_some(ext))
        }
        _ => (filename, None),
    }
}

/// Hex digest of the remote id, used to disambiguate colliding names.
pub fn id_digest(remote_id: &str) -> String {
    format!("{:x}", Sha256::digest(remote_id.as_bytes()))
}

pub fn id_suffix(remote_id: &str) -> String {
    id_digest(remote_id)[..8].to_string()
}

/// Inserts `_<suffix>` between the stem and the extension of `name`.
pub fn with_suffix(name: &str, suffix: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{suffix}.{ext}"),
        _ => format!("{name}_{suffix}"),
    }
}

/// `items/<year>/<month>` in UTC.
pub fn canonical_dir(created_at: OffsetDateTime) -> String {
    let utc = created_at.to_offset(UtcOffset::UTC);
    format!(
        "{ITEMS_DIR}/{:04}/{:02}",
        utc.year(),
        u8::from(utc.month())
    )
}

/// Canonical path candidates in preference order: the plain name, a short id
/// suffix, then the full id digest.
pub fn canonical_candidates(
    filename: &str,
    created_at: OffsetDateTime,
    remote_id: &str,
) -> [String; 3] {
    let dir = canonical_dir(created_at);
    let name = file_name_for(filename);
    [
        format!("{dir}/{name}"),
        format!("{dir}/{}", with_suffix(&name, &id_suffix(remote_id))),
        format!("{dir}/{}", with_suffix(&name, &id_digest(remote_id))),
    ]
}

pub fn album_dir(dir_name: &str) -> String {
    format!("{ALBUMS_DIR}/{dir_name}")
}

/// Maps a stored data-relative path under `data_dir`.
pub fn resolve(data_dir: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = data_dir.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    Ok(out)
}

/// Where a download streams before it is renamed over `target`.
pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(sanitize("Trip: Rome/Paris!!"), "Trip_ Rome_Paris");
        assert_eq!(sanitize("__a***b__"), "a_b");
        assert_eq!(sanitize("Été (2023)"), "Été (2023)");
        assert_eq!(sanitize("..."), "");
    }

    #[test]
    fn empty_names_get_fallbacks() {
        assert_eq!(album_dir_name("///"), "Untitled");
        assert_eq!(file_name_for(""), "untitled");
        assert_eq!(file_name_for("??.JPG"), "untitled.JPG");
    }

    #[test]
    fn file_names_keep_extension() {
        assert_eq!(file_name_for("IMG 0001.jpeg"), "IMG 0001.jpeg");
        assert_eq!(file_name_for("a.b.c.png"), "a_b_c.png");
        assert_eq!(file_name_for("noext"), "noext");
    }

    #[test]
    fn long_names_are_truncated_on_char_boundary() {
        let long = "é".repeat(300);
        let out = sanitize(&long);
        assert!(out.len() <= MAX_STEM_BYTES);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn canonical_candidates_are_date_partitioned_and_stable() {
        let created = datetime!(2023-01-15 10:00 UTC);
        let first = canonical_candidates("A.jpg", created, "id-a");
        let again = canonical_candidates("A.jpg", created, "id-a");
        assert_eq!(first, again);
        assert_eq!(first[0], "items/2023/01/A.jpg");
        assert_eq!(first[1], format!("items/2023/01/A_{}.jpg", id_suffix("id-a")));
        assert_ne!(first[1], canonical_candidates("A.jpg", created, "id-b")[1]);
    }

    #[test]
    fn canonical_dir_uses_utc() {
        let created = datetime!(2023-02-01 01:00 +03:00);
        assert_eq!(canonical_dir(created), "items/2023/01");
    }

    #[test]
    fn resolve_rejects_escapes() {
        let root = PathBuf::from("/data");
        assert_eq!(
            resolve(&root, "items/2023/01/A.jpg").unwrap(),
            PathBuf::from("/data/items/2023/01/A.jpg")
        );
        assert!(matches!(
            resolve(&root, "../etc/passwd"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(matches!(resolve(&root, ""), Err(PathError::Empty)));
    }

    #[test]
    fn partial_path_keeps_extension() {
        assert_eq!(
            partial_path(Path::new("/d/a.jpg")),
            PathBuf::from("/d/a.jpg.partial")
        );
        assert_eq!(partial_path(Path::new("/d/a")), PathBuf::from("/d/a.partial"));
    }
}
