//! Body canonicalization and the hash contracts.
//!
//! `source_hash` is computed over the canonical body so that insignificant
//! whitespace edits (CRLF checkouts, trailing spaces, stray blank lines at
//! either end) do not register as content changes, while genuine edits and
//! reordering still do.
//!
//! The aggregate catalog hash is the explicit contract for whole-catalog
//! change detection: collect the `(id, source_hash)` pairs, sort them by id,
//! and feed `id`, `\n`, `source_hash`, `\n` per pair into a single SHA-256.
//! Sorting makes the digest independent of directory scan order.

use sha2::{Digest, Sha256};

/// Normalize line endings to LF, strip trailing whitespace per line, and trim
/// leading/trailing blank lines. The result carries no trailing newline.
pub fn canonicalize(body: &str) -> String {
    let unified = body.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = unified.split('\n').map(str::trim_end).collect();

    let first = lines.iter().position(|line| !line.is_empty());
    let Some(first) = first else {
        return String::new();
    };
    let last = lines
        .iter()
        .rposition(|line| !line.is_empty())
        .unwrap_or(first);

    lines[first..=last].join("\n")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of the canonicalized body; the value stored as `sourceHash`.
pub fn source_hash(body: &str) -> String {
    sha256_hex(canonicalize(body).as_bytes())
}

/// Hash of the raw body bytes. The manifest records this alongside the
/// source hash so byte-level drift that canonicalization masks is still
/// detectable.
pub fn body_hash(body: &str) -> String {
    sha256_hex(body.as_bytes())
}

/// Order-independent digest over a set of `(id, source_hash)` pairs.
pub fn aggregate_hash<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut sorted: Vec<(&str, &str)> = pairs.into_iter().collect();
    sorted.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (id, hash) in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_unifies_line_endings() {
        assert_eq!(canonicalize("a\r\nb\rc\nd"), "a\nb\nc\nd");
    }

    #[test]
    fn canonicalize_strips_trailing_whitespace_per_line() {
        assert_eq!(canonicalize("a  \nb\t\nc"), "a\nb\nc");
    }

    #[test]
    fn canonicalize_trims_boundary_blank_lines_only() {
        assert_eq!(canonicalize("\n\n  \na\n\nb\n\n\n"), "a\n\nb");
    }

    #[test]
    fn canonicalize_of_blank_input_is_empty() {
        assert_eq!(canonicalize("\n  \n\t\n"), "");
        assert_eq!(canonicalize(""), "");
    }

    #[test]
    fn source_hash_is_stable_under_whitespace_noise() {
        let clean = source_hash("first\nsecond");
        assert_eq!(source_hash("first  \r\nsecond\r\n\r\n"), clean);
        assert_eq!(source_hash("\n\nfirst\nsecond\n"), clean);
    }

    #[test]
    fn source_hash_tracks_content_and_ordering() {
        assert_ne!(source_hash("first\nsecond"), source_hash("second\nfirst"));
        assert_ne!(source_hash("first"), source_hash("first!"));
    }

    #[test]
    fn aggregate_hash_ignores_pair_order() {
        let forward = aggregate_hash(vec![("a", "h1"), ("b", "h2"), ("c", "h3")]);
        let shuffled = aggregate_hash(vec![("c", "h3"), ("a", "h1"), ("b", "h2")]);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn aggregate_hash_tracks_membership_and_content() {
        let base = aggregate_hash(vec![("a", "h1"), ("b", "h2")]);
        assert_ne!(aggregate_hash(vec![("a", "h1")]), base);
        assert_ne!(aggregate_hash(vec![("a", "h1"), ("b", "other")]), base);
    }
}
