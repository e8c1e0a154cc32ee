//! Path canonicalization and changed-file reconciliation.
//!
//! Model-emitted paths arrive in whatever shape the model produced:
//! backslashes, leading `./`, doubled separators, stray whitespace. Both the
//! emitted path and the changelist's file list are canonicalized before the
//! exact-match comparison.

use std::collections::BTreeSet;

/// Canonicalizes a repo-relative path: trims whitespace, normalizes
/// backslashes to forward slashes, strips a leading `./`, and collapses
/// duplicate separators.
#[must_use]
pub fn canonicalize_repo_path(path: &str) -> String {
    let trimmed = path.trim().replace('\\', "/");
    let stripped = trimmed.strip_prefix("./").unwrap_or(&trimmed);

    let mut out = String::with_capacity(stripped.len());
    let mut last_was_separator = false;
    for ch in stripped.chars() {
        if ch == '/' {
            if !last_was_separator {
                out.push(ch);
            }
            last_was_separator = true;
        } else {
            out.push(ch);
            last_was_separator = false;
        }
    }
    out
}

/// Canonicalizes a changed-file list into a set ready for reconciliation.
#[must_use]
pub fn canonicalize_changed_files(changed_files: &[String]) -> BTreeSet<String> {
    changed_files
        .iter()
        .map(|path| canonicalize_repo_path(path))
        .collect()
}

/// Whether a (canonicalized) finding path names one of the changed files.
#[must_use]
pub fn is_changed_file(canonical_path: &str, changed: &BTreeSet<String>) -> bool {
    changed.contains(canonical_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_normalizes_separators_and_prefix() {
        assert_eq!(canonicalize_repo_path("  ./src\\a.py "), "src/a.py");
        assert_eq!(canonicalize_repo_path("src//nested///b.py"), "src/nested/b.py");
        assert_eq!(canonicalize_repo_path("src/a.py"), "src/a.py");
    }

    #[test]
    fn test_leading_dot_slash_is_stripped_once() {
        // "././x" keeps the inner "./": only the leading marker is a display
        // artifact.
        assert_eq!(canonicalize_repo_path("././x.py"), "./x.py");
    }

    #[test]
    fn test_reconciliation_is_exact_after_canonicalization() {
        let changed = canonicalize_changed_files(&[
            "src/a.py".to_string(),
            ".\\src\\b.py".to_string(),
        ]);
        assert!(is_changed_file(&canonicalize_repo_path("./src/a.py"), &changed));
        assert!(is_changed_file(&canonicalize_repo_path("src/b.py"), &changed));
        assert!(!is_changed_file(&canonicalize_repo_path("src/c.py"), &changed));
        assert!(!is_changed_file(&canonicalize_repo_path("src/a"), &changed));
    }
}
