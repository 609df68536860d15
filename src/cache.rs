//! On-disk memoization of expensive per-scan computations
//!
//! Entries live under `<dir>/<function>/<key>.json` where the key is an xxh3 hash of
//! the function name and its argument strings.

use crate::structs::Result;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use xxhash_rust::xxh3::xxh3_64;

/// Function-result cache keyed by (function name, argument values)
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: Option<PathBuf>,
}

impl DiskCache {
    /// Cache rooted at `dir`
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    /// A cache that always recomputes
    #[must_use]
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Argument string identifying a file by path, size and modification time
    ///
    /// # Errors
    /// Returns error if the file metadata cannot be read
    pub fn file_key(path: &Path) -> Result<String> {
        let metadata = fs::metadata(path)?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        Ok(format!("{}:{}:{modified}", path.display(), metadata.len()))
    }

    fn entry_path(&self, func: &str, args: &[String]) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let mut material = String::from(func);
        for arg in args {
            material.push('\u{1f}');
            material.push_str(arg);
        }
        let key = xxh3_64(material.as_bytes());
        Some(dir.join(func).join(format!("{key:016x}.json")))
    }

    /// Return the cached result of `func(args)`, computing and storing it on a miss
    ///
    /// # Errors
    /// Returns error if `compute` fails or the entry cannot be written
    pub fn cached<T, F>(&self, func: &str, args: &[String], compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let Some(path) = self.entry_path(func, args) else {
            return compute();
        };

        if path.exists() {
            match read_entry::<T>(&path) {
                Ok(value) => {
                    debug!("cache hit: {func} ({})", path.display());
                    return Ok(value);
                }
                Err(e) => {
                    warn!("discarding unreadable cache entry {}: {e}", path.display());
                }
            }
        } else {
            debug!("cache miss: {func}");
        }

        let value = compute()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec(&value)?)?;
        Ok(value)
    }
}

fn read_entry<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    #[test]
    fn test_second_call_hits_cache() {
        let dir = TempDir::new().expect("create temp dir");
        let cache = DiskCache::new(dir.path());
        let calls = Cell::new(0);

        let compute = || {
            calls.set(calls.get() + 1);
            Ok(vec![1.0_f64, 2.0, 3.0])
        };
        let first: Vec<f64> = cache
            .cached("square", &["a".to_string()], compute)
            .expect("first call");
        let second: Vec<f64> = cache
            .cached("square", &["a".to_string()], || {
                calls.set(calls.get() + 1);
                Ok(vec![])
            })
            .expect("second call");

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_different_arguments_miss() {
        let dir = TempDir::new().expect("create temp dir");
        let cache = DiskCache::new(dir.path());

        let a: u32 = cache.cached("f", &["1".into()], || Ok(1)).expect("a");
        let b: u32 = cache.cached("f", &["2".into()], || Ok(2)).expect("b");

        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_corrupt_entry_recomputed() {
        let dir = TempDir::new().expect("create temp dir");
        let cache = DiskCache::new(dir.path());
        let _: u32 = cache.cached("f", &[], || Ok(7)).expect("store");

        let entry = cache.entry_path("f", &[]).expect("entry path");
        fs::write(&entry, b"not json").expect("corrupt entry");

        let value: u32 = cache.cached("f", &[], || Ok(9)).expect("recompute");
        assert_eq!(value, 9);
    }

    #[test]
    fn test_disabled_cache_always_computes() {
        let cache = DiskCache::disabled();
        let calls = Cell::new(0);
        for _ in 0..2 {
            let _: u8 = cache
                .cached("f", &[], || {
                    calls.set(calls.get() + 1);
                    Ok(0)
                })
                .expect("compute");
        }
        assert_eq!(calls.get(), 2);
    }
}
