//! Test-file discovery: walk the working directory and keep paths that
//! match a project's `test_match` patterns.
//!
//! Patterns are path globs with the usual three forms: `*` (within a
//! segment), `?` (one character) and `**` (any number of segments).
//! Hidden directories, `target` and the cache root are never descended
//! into.

use crate::error::{TactError, TactResult};
use std::path::{Path, PathBuf};

const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "__snapshots__"];

/// Walk `cwd` and return the relative paths matching any pattern, sorted.
pub fn discover(cwd: &Path, patterns: &[String]) -> TactResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk(cwd, cwd, patterns, &mut found)?;
    found.sort();
    Ok(found)
}

fn walk(
    root: &Path,
    dir: &Path,
    patterns: &[String],
    found: &mut Vec<PathBuf>,
) -> TactResult<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|err| TactError::io(format!("failed to read {}", dir.display()), err))?;
    for entry in entries {
        let entry =
            entry.map_err(|err| TactError::io(format!("failed to read {}", dir.display()), err))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry
            .file_type()
            .map_err(|err| TactError::io(format!("failed to stat {}", path.display()), err))?;
        if file_type.is_dir() {
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            walk(root, &path, patterns, found)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            if patterns.iter().any(|pattern| matches(pattern, &relative)) {
                found.push(PathBuf::from(relative));
            }
        }
    }
    Ok(())
}

/// Match a slash-separated glob against a slash-separated relative path.
#[must_use]
pub fn matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();
    match_segments(&pattern, &path)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            match_segments(&pattern[1..], path)
                || (!path.is_empty() && match_segments(pattern, &path[1..]))
        }
        Some(segment) => {
            !path.is_empty()
                && match_segment(segment, path[0])
                && match_segments(&pattern[1..], &path[1..])
        }
    }
}

fn match_segment(pattern: &str, segment: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let segment: Vec<char> = segment.chars().collect();
    match_chars(&pattern, &segment)
}

fn match_chars(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            match_chars(&pattern[1..], text) || (!text.is_empty() && match_chars(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && match_chars(&pattern[1..], &text[1..]),
        Some(&ch) => !text.is_empty() && text[0] == ch && match_chars(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_star_globs() {
        assert!(matches("tests/login.tact", "tests/login.tact"));
        assert!(matches("tests/*.tact", "tests/login.tact"));
        assert!(!matches("tests/*.tact", "tests/sub/login.tact"));
        assert!(matches("tests/lo?in.tact", "tests/login.tact"));
    }

    #[test]
    fn double_star_spans_directories() {
        assert!(matches("**/*.tact", "login.tact"));
        assert!(matches("**/*.tact", "a/b/c/login.tact"));
        assert!(matches("tests/**/*.tact", "tests/deep/login.tact"));
        assert!(matches("tests/**/*.tact", "tests/login.tact"));
        assert!(!matches("tests/**/*.tact", "spec/login.tact"));
    }

    #[test]
    fn discovery_walks_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tests/sub")).unwrap();
        std::fs::create_dir_all(dir.path().join(".tact/cache/tests")).unwrap();
        std::fs::write(dir.path().join("tests/a.tact"), "").unwrap();
        std::fs::write(dir.path().join("tests/sub/b.tact"), "").unwrap();
        std::fs::write(dir.path().join("tests/notes.md"), "").unwrap();
        std::fs::write(dir.path().join(".tact/cache/tests/a.tact"), "").unwrap();

        let found = discover(dir.path(), &["tests/**/*.tact".to_string()]).unwrap();
        assert_eq!(
            found,
            vec![PathBuf::from("tests/a.tact"), PathBuf::from("tests/sub/b.tact")]
        );
    }
}
