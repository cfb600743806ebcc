// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Cached resolution of the runtime bundle (§4.6 Start: "resolve the
//! runtime bundle (cached; reloaded if mtime changed)"). The bundle itself
//! — the compiled standard library offered to job authors — is a black box
//! per §1; this cache only owns the disk-read-and-invalidate policy its
//! interface to the core requires.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

/// No path configured means no bundle is prepended to job sources; the
/// stdlib stays entirely external to this host.
pub struct RuntimeBundleCache {
    path: Option<PathBuf>,
    cached: Mutex<Option<(SystemTime, Arc<str>)>>,
}

impl RuntimeBundleCache {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, cached: Mutex::new(None) }
    }

    /// Read the bundle from disk, reusing the cached text iff the file's
    /// mtime hasn't advanced since the last resolution.
    pub fn resolve(&self) -> std::io::Result<Arc<str>> {
        let Some(path) = &self.path else { return Ok(Arc::from("")) };
        let mtime = fs::metadata(path)?.modified()?;
        {
            let cached = self.cached.lock();
            if let Some((cached_mtime, text)) = cached.as_ref() {
                if *cached_mtime == mtime {
                    return Ok(text.clone());
                }
            }
        }
        let text: Arc<str> = Arc::from(fs::read_to_string(path)?);
        *self.cached.lock() = Some((mtime, text.clone()));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_path_resolves_to_empty_bundle() {
        let cache = RuntimeBundleCache::new(None);
        assert_eq!(&*cache.resolve().unwrap(), "");
    }

    #[test]
    fn skips_reload_when_mtime_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.js");
        fs::write(&path, "v1").unwrap();
        let original_mtime = fs::metadata(&path).unwrap().modified().unwrap();

        let cache = RuntimeBundleCache::new(Some(path.clone()));
        assert_eq!(&*cache.resolve().unwrap(), "v1");

        // Rewrite the content but force the same mtime back: a cache keyed
        // on mtime must keep serving the stale-on-disk-but-cached text.
        fs::write(&path, "v2").unwrap();
        fs::File::open(&path).unwrap().set_modified(original_mtime).unwrap();
        assert_eq!(&*cache.resolve().unwrap(), "v1");
    }

    #[test]
    fn reloads_when_mtime_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.js");
        fs::write(&path, "v1").unwrap();
        let cache = RuntimeBundleCache::new(Some(path.clone()));
        assert_eq!(&*cache.resolve().unwrap(), "v1");

        let advanced = fs::metadata(&path).unwrap().modified().unwrap() + std::time::Duration::from_secs(1);
        fs::write(&path, "v2").unwrap();
        fs::File::open(&path).unwrap().set_modified(advanced).unwrap();
        assert_eq!(&*cache.resolve().unwrap(), "v2");
    }
}
