//! Path string helpers shared by locations, archives and the extraction cache.
//!
//! All paths handled by the storage layer are strings using `/` as the
//! separator once normalised. Comparisons are case-insensitive throughout.

use std::cmp::Ordering;

use crate::archive::ArchiveFormat;

pub const SEPARATOR: char = '/';

/// Convert `\` to `/` and collapse repeated separators.
///
/// A leading `//` (UNC share) is preserved.
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let unc = path.starts_with("\\\\") || path.starts_with("//");
    let mut last_was_separator = false;
    for c in path.chars() {
        let c = if c == '\\' { SEPARATOR } else { c };
        if c == SEPARATOR {
            if last_was_separator {
                continue;
            }
            last_was_separator = true;
        } else {
            last_was_separator = false;
        }
        out.push(c);
    }
    if unc {
        out.insert(0, SEPARATOR);
    }
    out
}

/// True for `/rooted`, `//server/share` and `C:/drive` forms.
pub fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    if path.starts_with(SEPARATOR) || path.starts_with('\\') {
        return true;
    }
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

pub fn ends_with_separator(path: &str) -> bool {
    path.ends_with(SEPARATOR) || path.ends_with('\\')
}

pub fn trim_trailing_separator(path: &str) -> &str {
    path.strip_suffix(SEPARATOR).unwrap_or(path)
}

pub fn fold_case(path: &str) -> String {
    path.to_lowercase()
}

pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || fold_case(a) == fold_case(b)
}

pub fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    fold_case(a).cmp(&fold_case(b))
}

/// Case-insensitive prefix test that only matches on a segment boundary, so
/// `/roms/games.zip2` does not start with `/roms/games.zip`.
pub fn starts_with_segment(path: &str, prefix: &str) -> bool {
    strip_segment_prefix(path, prefix).is_some()
}

/// The part of `path` after `prefix`, compared segment by segment without
/// regard to case. The remainder is a slice of `path` itself, so case
/// folding that changes byte lengths cannot shift it.
pub fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = trim_trailing_separator(prefix);
    if prefix.is_empty() {
        return Some(path);
    }
    let mut rest = Some(path);
    for wanted in prefix.split(SEPARATOR) {
        let (segment, tail) = match rest?.split_once(SEPARATOR) {
            Some((segment, tail)) => (segment, Some(tail)),
            None => (rest?, None),
        };
        if !eq_ignore_case(segment, wanted) {
            return None;
        }
        rest = tail;
    }
    Some(rest.unwrap_or(""))
}

/// Concatenate two path fragments with exactly one separator between them.
pub fn join(base: &str, child: &str) -> String {
    if base.is_empty() {
        return child.to_string();
    }
    let child = child.trim_start_matches(SEPARATOR);
    if ends_with_separator(base) {
        format!("{base}{child}")
    } else {
        format!("{base}{SEPARATOR}{child}")
    }
}

/// Final path segment, ignoring any trailing separator.
pub fn file_name(path: &str) -> &str {
    let trimmed = trim_trailing_separator(path);
    trimmed.rsplit(SEPARATOR).next().unwrap_or(trimmed)
}

/// Extension of the final segment without the dot, if any.
pub fn extension(path: &str) -> Option<&str> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx + 1..]),
    }
}

pub fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

/// Everything before the final segment, without a trailing separator.
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = trim_trailing_separator(path);
    trimmed.rfind(SEPARATOR).map(|idx| if idx == 0 { "/" } else { &trimmed[..idx] })
}

/// True when the final segment carries a recognised archive extension.
pub fn has_archive_extension(path: &str) -> bool {
    ArchiveFormat::from_path(path).is_some()
}

/// Every prefix of `path` that ends in an archive-extension segment,
/// outermost first. `/a/x.tar/y.zip/rom.bin` yields `/a/x.tar` and
/// `/a/x.tar/y.zip`.
pub fn archive_prefixes(path: &str) -> Vec<&str> {
    let mut prefixes = Vec::new();
    let mut end = 0;
    for segment in path.split(SEPARATOR) {
        let start = end;
        end = start + segment.len();
        if !segment.is_empty() && has_archive_extension(segment) {
            prefixes.push(&path[..end]);
        }
        end += 1;
    }
    prefixes
}

/// Split `path` at the most deeply nested container that has something
/// after it: `/a/games.zip/sub/rom.bin` -> (`/a/games.zip`, `sub/rom.bin`).
pub fn split_container(path: &str) -> Option<(&str, &str)> {
    archive_prefixes(path).into_iter().rev().find_map(|prefix| {
        let rest = path[prefix.len()..].trim_start_matches(SEPARATOR);
        (!rest.is_empty()).then_some((prefix, rest))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_converts_and_collapses() {
        assert_eq!(normalize("C:\\games\\\\intv\\rom.bin"), "C:/games/intv/rom.bin");
        assert_eq!(normalize("/a//b/"), "/a/b/");
        assert_eq!(normalize("\\\\server\\share\\x"), "//server/share/x");
    }

    #[test]
    fn absolute_forms() {
        assert!(is_absolute("/roms"));
        assert!(is_absolute("C:/roms"));
        assert!(is_absolute("d:\\roms"));
        assert!(!is_absolute("roms/a.bin"));
        assert!(!is_absolute("C:roms"));
    }

    #[test]
    fn segment_prefix() {
        assert!(starts_with_segment("/Roms/Games.ZIP/a.bin", "/roms/games.zip"));
        assert!(starts_with_segment("/roms/games.zip", "/roms/games.zip/"));
        assert!(!starts_with_segment("/roms/games.zip2/a.bin", "/roms/games.zip"));
        assert!(!starts_with_segment("/roms", "/roms/games.zip"));
    }

    #[test]
    fn prefix_remainder_survives_length_changing_case_folds() {
        // U+212A KELVIN SIGN folds to ASCII `k`, shrinking by two bytes.
        assert_eq!(strip_segment_prefix("/k.zip/rom.bin", "/\u{212A}.zip"), Some("rom.bin"));
        assert_eq!(strip_segment_prefix("/\u{212A}.zip/rom.bin", "/k.zip"), Some("rom.bin"));
        assert_eq!(strip_segment_prefix("/kk.zip/\u{e9}", "/\u{212A}\u{212A}.zip"), Some("\u{e9}"));
        assert_eq!(strip_segment_prefix("/roms/games.zip", "/roms/games.zip"), Some(""));
        assert_eq!(strip_segment_prefix("/roms/x.bin", "/"), Some("/roms/x.bin"));
        assert_eq!(strip_segment_prefix("/roms/x.bin", "/other"), None);
    }

    #[test]
    fn container_splitting() {
        let path = "/lib/collection.tar/games.zip/rom.bin";
        assert_eq!(
            archive_prefixes(path),
            vec!["/lib/collection.tar", "/lib/collection.tar/games.zip"]
        );
        assert_eq!(split_container(path), Some(("/lib/collection.tar/games.zip", "rom.bin")));
        assert_eq!(split_container("/lib/games.zip"), None);
        assert_eq!(split_container("/lib/rom.bin"), None);
    }

    #[test]
    fn name_parts() {
        assert_eq!(file_name("/a/b/rom.bin"), "rom.bin");
        assert_eq!(file_name("/a/b/"), "b");
        assert_eq!(extension("/a/b/rom.BIN"), Some("BIN"));
        assert_eq!(extension("/a/.hidden"), None);
        assert_eq!(file_stem("/a/games.zip"), "games");
        assert_eq!(parent("/a/b/rom.bin"), Some("/a/b"));
        assert_eq!(parent("/rom.bin"), Some("/"));
        assert_eq!(join("/a/", "/b"), "/a/b");
    }
}
