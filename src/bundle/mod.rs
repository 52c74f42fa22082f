//! Deterministic, content-addressed module bundle builder (§4.3).
//!
//! A bundle is a ZIP archive containing a module's source (renamed to a
//! fixed entry name), its resolved `module_utils` dependencies under
//! their original package path, synthesized `__init__.py` files for any
//! missing package directories, and a fixed entry-point script. Entries
//! are written in sorted order with a fixed timestamp so the same inputs
//! always produce byte-identical output, which is what makes the
//! content hash meaningful as a cache key.
//!
//! Grounded on
//! `examples/original_source/src/ftl2/module_loading/bundle.py`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{DateTime, ZipWriter};

use crate::depend::DependencyResult;
use crate::error::{Error, Result};

/// Entry-point script embedded in every bundle. Reads `ANSIBLE_MODULE_ARGS`
/// from stdin as JSON, calls `main()` in the bundled module, and prints the
/// JSON result (or a `{failed: true, ...}` envelope on exception).
pub const MAIN_TEMPLATE: &str = r#"#!/usr/bin/env python
import sys
import json

if sys.argv[0].endswith('.zip') or sys.argv[0].endswith('.pyz'):
    sys.path.insert(0, sys.argv[0])

from ftl2_module import main

if __name__ == "__main__":
    try:
        input_data = sys.stdin.read()
        if input_data:
            params = json.loads(input_data)
            module_args = params.get("ANSIBLE_MODULE_ARGS", {})
        else:
            module_args = {}

        result = main(module_args)

        if result is not None:
            print(json.dumps(result))

    except Exception as e:
        error_result = {
            "failed": True,
            "msg": str(e),
            "exception": type(e).__name__,
        }
        print(json.dumps(error_result))
        sys.exit(1)
"#;

/// A fixed timestamp used for every ZIP entry so bundle bytes depend only
/// on content, never on build-time clock state.
fn fixed_mtime() -> DateTime {
    DateTime::from_date_and_time(1980, 1, 1, 0, 0, 0).expect("static date is valid")
}

/// Metadata describing a built bundle.
#[derive(Debug, Clone)]
pub struct BundleInfo {
    /// The module's fully qualified collection name, or its file stem if
    /// none was supplied.
    pub fqcn: String,
    /// SHA-256 hash of the ZIP bytes, truncated to 12 hex characters.
    pub content_hash: String,
    /// Size of the ZIP archive in bytes.
    pub size: usize,
    /// Path to the original module file.
    pub module_path: PathBuf,
    /// Number of dependency files bundled in.
    pub dependency_count: usize,
}

impl std::fmt::Display for BundleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bundle({}, hash={}, {} bytes, {} deps)",
            self.fqcn, self.content_hash, self.size, self.dependency_count
        )
    }
}

/// A built module bundle: metadata plus the raw ZIP bytes.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Bundle metadata.
    pub info: BundleInfo,
    /// The ZIP archive bytes.
    pub data: Vec<u8>,
}

impl Bundle {
    /// Write the bundle to a file on disk.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.data)?;
        info!(path = %path.display(), "wrote bundle to disk");
        Ok(())
    }
}

/// Input to [`build_bundle`]: either a pre-resolved dependency list or a
/// full [`DependencyResult`] from `depend::find_all_dependencies`.
pub enum Dependencies {
    /// Explicit dependency file paths.
    Paths(Vec<PathBuf>),
    /// A resolved dependency closure.
    Resolved(DependencyResult),
}

impl Dependencies {
    fn into_paths(self) -> Vec<PathBuf> {
        match self {
            Dependencies::Paths(p) => p,
            Dependencies::Resolved(r) => r.dependencies,
        }
    }
}

/// Compute the in-archive path for a dependency file, preserving its
/// `ansible/module_utils/...` or `ansible_collections/...` directory
/// structure so the module's imports still resolve once unpacked.
#[must_use]
pub fn archive_path(file_path: &Path) -> String {
    let components: Vec<String> = file_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();

    if let Some(idx) = components.iter().position(|c| c == "ansible") {
        return components[idx..].join("/");
    }
    if let Some(idx) = components.iter().position(|c| c == "ansible_collections") {
        return components[idx..].join("/");
    }

    file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn package_init_dirs(added_paths: &BTreeSet<String>) -> BTreeSet<String> {
    let mut dirs = BTreeSet::new();
    for path in added_paths {
        let parts: Vec<&str> = path.split('/').collect();
        for i in 0..parts.len().saturating_sub(1) {
            dirs.insert(parts[..=i].join("/"));
        }
    }
    dirs
}

/// Build a deterministic ZIP bundle for `module_path`, auto-resolving
/// dependencies if none are given.
pub fn build_bundle(
    module_path: &Path,
    dependencies: Option<Dependencies>,
    fqcn: &str,
    resolve_opts: Option<&crate::depend::ResolveOptions>,
) -> Result<Bundle> {
    let dep_list = match dependencies {
        Some(deps) => deps.into_paths(),
        None => {
            let opts = resolve_opts.cloned().unwrap_or_default();
            crate::depend::find_all_dependencies(module_path, &opts).dependencies
        }
    };

    debug!(module = %module_path.display(), dep_count = dep_list.len(), "building bundle");

    let module_source = std::fs::read_to_string(module_path).map_err(|e| Error::BundleBuild {
        module: module_path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut buffer = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut buffer);
        let mut zip = ZipWriter::new(cursor);
        let options: FileOptions<()> = FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(fixed_mtime())
            .unix_permissions(0o644);

        zip.start_file("ftl2_module.py", options)
            .map_err(|e| Error::BundleBuild { module: module_path.to_path_buf(), message: e.to_string() })?;
        std::io::Write::write_all(&mut zip, module_source.as_bytes())
            .map_err(|e| Error::BundleBuild { module: module_path.to_path_buf(), message: e.to_string() })?;

        let mut added_paths: BTreeSet<String> = BTreeSet::new();
        let mut sorted_deps: Vec<(String, &PathBuf)> =
            dep_list.iter().map(|p| (archive_path(p), p)).collect();
        sorted_deps.sort_by(|a, b| a.0.cmp(&b.0));

        for (arc_path, dep_path) in &sorted_deps {
            if added_paths.contains(arc_path) {
                continue;
            }
            match std::fs::read_to_string(dep_path) {
                Ok(source) => {
                    zip.start_file(arc_path.as_str(), options).map_err(|e| Error::BundleBuild {
                        module: module_path.to_path_buf(),
                        message: e.to_string(),
                    })?;
                    std::io::Write::write_all(&mut zip, source.as_bytes()).map_err(|e| Error::BundleBuild {
                        module: module_path.to_path_buf(),
                        message: e.to_string(),
                    })?;
                    added_paths.insert(arc_path.clone());
                }
                Err(e) => {
                    warn!(path = %dep_path.display(), error = %e, "failed to add dependency to bundle");
                }
            }
        }

        for dir in package_init_dirs(&added_paths) {
            let init_path = format!("{dir}/__init__.py");
            if added_paths.contains(&init_path) {
                continue;
            }
            zip.start_file(init_path.as_str(), options).map_err(|e| Error::BundleBuild {
                module: module_path.to_path_buf(),
                message: e.to_string(),
            })?;
            std::io::Write::write_all(&mut zip, b"# Auto-generated package init\n")
                .map_err(|e| Error::BundleBuild { module: module_path.to_path_buf(), message: e.to_string() })?;
        }

        zip.start_file("__main__.py", options)
            .map_err(|e| Error::BundleBuild { module: module_path.to_path_buf(), message: e.to_string() })?;
        std::io::Write::write_all(&mut zip, MAIN_TEMPLATE.as_bytes())
            .map_err(|e| Error::BundleBuild { module: module_path.to_path_buf(), message: e.to_string() })?;

        zip.finish().map_err(|e| Error::BundleBuild { module: module_path.to_path_buf(), message: e.to_string() })?;
    }

    let mut hasher = Sha256::new();
    hasher.update(&buffer);
    let content_hash = format!("{:x}", hasher.finalize())[..12].to_string();

    let info = BundleInfo {
        fqcn: if fqcn.is_empty() {
            module_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        } else {
            fqcn.to_string()
        },
        content_hash,
        size: buffer.len(),
        module_path: module_path.to_path_buf(),
        dependency_count: dep_list.len(),
    };

    info!(bundle = %info, "built bundle");

    Ok(Bundle { info, data: buffer })
}

/// Verify a bundle's ZIP structure and that it contains the two mandatory
/// entries (`__main__.py`, `ftl2_module.py`).
pub fn verify_bundle(bundle: &Bundle) -> bool {
    let cursor = std::io::Cursor::new(&bundle.data);
    let mut zip = match zip::ZipArchive::new(cursor) {
        Ok(z) => z,
        Err(e) => {
            warn!(error = %e, "invalid ZIP file");
            return false;
        }
    };

    let names: Vec<String> = (0..zip.len())
        .filter_map(|i| zip.by_index(i).ok().map(|f| f.name().to_string()))
        .collect();

    if !names.iter().any(|n| n == "__main__.py") {
        warn!("bundle missing __main__.py");
        return false;
    }
    if !names.iter().any(|n| n == "ftl2_module.py") {
        warn!("bundle missing ftl2_module.py");
        return false;
    }
    true
}

/// List every entry name in a bundle's archive.
pub fn list_bundle_contents(bundle: &Bundle) -> Result<Vec<String>> {
    let cursor = std::io::Cursor::new(&bundle.data);
    let mut zip = zip::ZipArchive::new(cursor).map_err(|e| Error::BundleBuild {
        module: bundle.info.module_path.clone(),
        message: e.to_string(),
    })?;
    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i).map_err(|e| Error::BundleBuild {
            module: bundle.info.module_path.clone(),
            message: e.to_string(),
        })?;
        names.push(entry.name().to_string());
    }
    Ok(names)
}

/// A cache of built bundles, keyed by FQCN and by content hash, so a
/// module built once for one host is reused for every other host in the
/// same invocation.
#[derive(Debug, Default)]
pub struct BundleCache {
    by_fqcn: DashMap<String, Bundle>,
    by_hash: DashMap<String, Bundle>,
}

impl BundleCache {
    /// Construct an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached bundle by FQCN.
    #[must_use]
    pub fn get(&self, fqcn: &str) -> Option<Bundle> {
        self.by_fqcn.get(fqcn).map(|b| b.clone())
    }

    /// Look up a cached bundle by its content hash.
    #[must_use]
    pub fn get_by_hash(&self, content_hash: &str) -> Option<Bundle> {
        self.by_hash.get(content_hash).map(|b| b.clone())
    }

    /// Insert a bundle under its FQCN and content hash.
    pub fn add(&self, bundle: Bundle) {
        self.by_hash.insert(bundle.info.content_hash.clone(), bundle.clone());
        self.by_fqcn.insert(bundle.info.fqcn.clone(), bundle);
    }

    /// Return the cached bundle for `module_path`, building and caching
    /// one if absent.
    pub fn get_or_build_from_path(
        &self,
        module_path: &Path,
        fqcn: &str,
        resolve_opts: Option<&crate::depend::ResolveOptions>,
    ) -> Result<Bundle> {
        let key = if fqcn.is_empty() { module_path.to_string_lossy().to_string() } else { fqcn.to_string() };

        if let Some(cached) = self.by_fqcn.get(&key) {
            debug!(key, "bundle cache hit");
            return Ok(cached.clone());
        }

        debug!(key, "bundle cache miss, building");
        let bundle = build_bundle(module_path, None, fqcn, resolve_opts)?;
        self.by_fqcn.insert(key, bundle.clone());
        if !fqcn.is_empty() {
            self.by_fqcn.insert(fqcn.to_string(), bundle.clone());
        }
        self.by_hash.insert(bundle.info.content_hash.clone(), bundle.clone());
        Ok(bundle)
    }

    /// Remove every cached bundle.
    pub fn clear(&self) {
        self.by_fqcn.clear();
        self.by_hash.clear();
    }

    /// Number of distinct FQCN entries cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_fqcn.len()
    }

    /// True if the cache holds no bundles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_fqcn.is_empty()
    }

    /// True if a bundle is cached under this FQCN.
    #[must_use]
    pub fn contains(&self, fqcn: &str) -> bool {
        self.by_fqcn.contains_key(fqcn)
    }

    /// Sum of the sizes of every distinct cached bundle.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.by_hash.iter().map(|entry| entry.value().info.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_module(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn builds_a_bundle_with_no_dependencies() {
        let dir = tempdir().unwrap();
        let module = write_module(dir.path(), "ping.py", "def main(args):\n    return {}\n");

        let bundle = build_bundle(&module, Some(Dependencies::Paths(vec![])), "ansible.builtin.ping", None).unwrap();

        assert_eq!(bundle.info.fqcn, "ansible.builtin.ping");
        assert_eq!(bundle.info.dependency_count, 0);
        assert_eq!(bundle.info.content_hash.len(), 12);
        assert!(verify_bundle(&bundle));

        let names = list_bundle_contents(&bundle).unwrap();
        assert!(names.contains(&"ftl2_module.py".to_string()));
        assert!(names.contains(&"__main__.py".to_string()));
    }

    #[test]
    fn identical_inputs_produce_identical_bytes() {
        let dir = tempdir().unwrap();
        let module = write_module(dir.path(), "ping.py", "def main(args):\n    return {}\n");

        let b1 = build_bundle(&module, Some(Dependencies::Paths(vec![])), "m", None).unwrap();
        let b2 = build_bundle(&module, Some(Dependencies::Paths(vec![])), "m", None).unwrap();

        assert_eq!(b1.data, b2.data);
        assert_eq!(b1.info.content_hash, b2.info.content_hash);
    }

    #[test]
    fn preserves_module_utils_package_structure_in_archive() {
        let base = tempdir().unwrap();
        let dep_dir = base.path().join("ansible").join("module_utils");
        fs::create_dir_all(&dep_dir).unwrap();
        let dep = write_module(&dep_dir, "basic.py", "X = 1\n");

        assert_eq!(archive_path(&dep), "ansible/module_utils/basic.py");
    }

    #[test]
    fn bundle_cache_reuses_built_bundles() {
        let dir = tempdir().unwrap();
        let module = write_module(dir.path(), "ping.py", "def main(args):\n    return {}\n");

        let cache = BundleCache::new();
        assert!(cache.is_empty());

        let b1 = cache.get_or_build_from_path(&module, "ansible.builtin.ping", None).unwrap();
        let b2 = cache.get_or_build_from_path(&module, "ansible.builtin.ping", None).unwrap();

        assert_eq!(b1.info.content_hash, b2.info.content_hash);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("ansible.builtin.ping"));
    }
}
