//! Transform-cache resolution.
//!
//! The source transform (an external collaborator) writes its output under
//! `<cwd>/.tact/cache/`, mirroring the source tree, with a first line of
//! `//# hash=<hex>` recording the SHA-256 of the source it was produced
//! from. The core only resolves: a valid cache entry wins, anything else
//! falls back to the source path itself.

use crate::error::{TactError, TactResult};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Directory under the working directory that holds transformed files.
pub const CACHE_DIR: &str = ".tact/cache";

const HASH_PREFIX: &str = "//# hash=";

/// Hex SHA-256 of `data`.
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Resolve the loadable path for `source` (relative to `cwd`).
///
/// Returns the cache path iff the cached file's header hash matches the
/// current source contents; otherwise the source path.
pub fn resolve(cwd: &Path, source: &Path) -> TactResult<PathBuf> {
    let source_abs = cwd.join(source);
    let cached = cwd.join(CACHE_DIR).join(source);
    let Ok(cached_text) = std::fs::read_to_string(&cached) else {
        return Ok(source_abs);
    };
    let Some(stored) = cached_text
        .lines()
        .next()
        .and_then(|line| line.strip_prefix(HASH_PREFIX))
    else {
        return Ok(source_abs);
    };
    let source_data = std::fs::read(&source_abs)
        .map_err(|err| TactError::io(format!("failed to read {}", source.display()), err))?;
    if stored == content_hash(&source_data) {
        Ok(cached)
    } else {
        Ok(source_abs)
    }
}
