//! Prefix matching over flat blob names.
//!
//! Blob names are flat strings, but callers list them as if `/` delimited
//! directories. Matching is a plain string prefix; what gets reported for a
//! match depends on its *listing base*:
//!
//! - when the prefix names a directory exactly (`Lorem` for `Lorem/x`), the
//!   base is the prefix plus the separator;
//! - otherwise it is the prefix's own directory portion (`a/b/` for
//!   `a/b/Lo`, the empty string for `Lo`).

use std::path::PathBuf;

pub const SEPARATOR: char = '/';

/// Byte length of the listing base for `name`, or `None` if it does not match.
fn listing_base(name: &str, prefix: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?;
    if !prefix.is_empty() && !prefix.ends_with(SEPARATOR) && rest.starts_with(SEPARATOR) {
        return Some(prefix.len() + SEPARATOR.len_utf8());
    }
    Some(prefix.rfind(SEPARATOR).map_or(0, |idx| idx + SEPARATOR.len_utf8()))
}

/// First-level entry of `name` below the listing base of `prefix`.
pub fn next_segment<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let base = listing_base(name, prefix)?;
    let rest = &name[base..];
    Some(match rest.find(SEPARATOR) {
        Some(idx) => &rest[..idx],
        None => rest,
    })
}

/// `name` rebuilt as a platform path: the base's directory joined with the
/// remainder after it.
pub fn relative_path(name: &str, prefix: &str) -> Option<PathBuf> {
    let base = listing_base(name, prefix)?;
    let (dir, rest) = name.split_at(base);
    Some(
        dir.split(SEPARATOR)
            .chain(rest.split(SEPARATOR))
            .filter(|segment| !segment.is_empty())
            .collect(),
    )
}
