//! Content-addressed gate archive assembly (§4.4).
//!
//! A gate bundles the resident dispatcher together with pre-baked
//! modules and their merged dependency closure into a single archive
//! deployed once per host and reused across invocations. Builds are
//! cached on disk keyed by a hash over every input that can change the
//! archive's bytes.
//!
//! Grounded on `examples/original_source/src/ftl2/gate.py`
//! (`GateBuildConfig.compute_hash`, `GateBuilder.build`,
//! `_install_modules`, `_install_module_deps`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::bundle::archive_path;
use crate::depend::{find_all_dependencies, fqcn, ResolveOptions};
use crate::error::{Error, Result};

/// A scanned, discovered module ready for use in a gate build: either a
/// simple file resolved by name, or an FQCN-resolved ansible-style module.
#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    /// Name as the caller requested it (bare name or FQCN).
    pub requested: String,
    /// Resolved file path.
    pub path: PathBuf,
    /// Resolved FQCN, if this went through collection/builtin resolution.
    pub fqcn: Option<String>,
}

/// Extract the bare module name from a FQCN, used as its filename inside
/// the gate (`community.general.slack` -> `slack`).
#[must_use]
pub fn module_path_name(fqcn: &str) -> &str {
    fqcn.rsplit('.').next().unwrap_or(fqcn)
}

/// Pinned third-party package requirement to install into the gate
/// environment (e.g. `requests>=2.0`).
pub type DependencyPin = String;

/// Seam standing in for the source system's `pip install --target`
/// step. This crate has no Python toolchain to invoke on the build host,
/// so installation is delegated to an implementation the caller supplies;
/// [`NullInstaller`] is the default and performs no installation while
/// still letting pins participate in the gate's content hash.
pub trait DependencyInstaller: Send + Sync {
    /// Install `pins` into `target_dir`. A no-op implementation is valid;
    /// callers that need real packages on the target plug in their own.
    fn install(&self, pins: &[DependencyPin], target_dir: &Path) -> Result<()>;
}

/// Default [`DependencyInstaller`]: records that installation was
/// requested but performs none.
#[derive(Debug, Default)]
pub struct NullInstaller;

impl DependencyInstaller for NullInstaller {
    fn install(&self, pins: &[DependencyPin], target_dir: &Path) -> Result<()> {
        if !pins.is_empty() {
            debug!(
                count = pins.len(),
                target = %target_dir.display(),
                "dependency installation requested but no installer configured; pins recorded in gate hash only"
            );
        }
        Ok(())
    }
}

/// Configuration for a single gate build.
#[derive(Debug, Clone)]
pub struct GateBuildConfig {
    /// Module names or FQCNs to bake into the gate.
    pub modules: Vec<String>,
    /// Directories searched for bare-named (non-FQCN) modules.
    pub module_dirs: Vec<PathBuf>,
    /// Third-party package pins to install alongside the gate.
    pub dependencies: Vec<DependencyPin>,
    /// Interpreter path baked into the gate's shebang for the remote host.
    pub interpreter: String,
    /// Dispatcher source bytes, included in the hash so a gate-code change
    /// invalidates every cached archive.
    pub dispatcher_source: Vec<u8>,
    /// Collection search roots for FQCN resolution.
    pub collection_paths: Vec<PathBuf>,
    /// Root of the core `ansible/modules` tree, if available.
    pub builtin_modules_root: Option<PathBuf>,
    /// Root of the core `ansible/module_utils` tree, if available.
    pub core_module_utils_root: Option<PathBuf>,
}

impl GateBuildConfig {
    /// Compute the SHA-256 hash identifying this exact build: modules,
    /// module directories, dependency pins, interpreter path, and
    /// dispatcher source bytes.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for m in &self.modules {
            hasher.update(m.as_bytes());
        }
        for d in &self.module_dirs {
            hasher.update(d.to_string_lossy().as_bytes());
        }
        for dep in &self.dependencies {
            hasher.update(dep.as_bytes());
        }
        hasher.update(self.interpreter.as_bytes());
        hasher.update(&self.dispatcher_source);
        format!("{:x}", hasher.finalize())
    }
}

/// Builds and caches gate archives on disk, keyed by [`GateBuildConfig::compute_hash`].
pub struct GateBuilder {
    cache_dir: PathBuf,
    installer: Box<dyn DependencyInstaller>,
}

impl GateBuilder {
    /// Construct a builder caching under `cache_dir` with the default
    /// no-op dependency installer.
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            installer: Box::new(NullInstaller),
        })
    }

    /// Construct a builder with a custom [`DependencyInstaller`].
    pub fn with_installer(cache_dir: PathBuf, installer: Box<dyn DependencyInstaller>) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir, installer })
    }

    /// Build (or reuse a cached) gate archive for `config`. Returns the
    /// archive path and its content hash.
    pub fn build(&self, config: &GateBuildConfig) -> Result<(PathBuf, String)> {
        debug!(modules = ?config.modules, "building gate");

        let gate_hash = config.compute_hash();
        let cached_gate = self.cache_dir.join(format!("ftl_gate_{gate_hash}.pyz"));

        if cached_gate.exists() {
            info!(path = %cached_gate.display(), "reusing cached gate");
            return Ok((cached_gate, gate_hash));
        }

        self.build_new_gate(config, &cached_gate)
            .map_err(|e| Error::GateBuild(e.to_string()))?;
        info!(path = %cached_gate.display(), "built new gate");
        Ok((cached_gate, gate_hash))
    }

    fn build_new_gate(&self, config: &GateBuildConfig, target_path: &Path) -> Result<()> {
        let scratch = tempfile::tempdir()?;

        let discovered = self.resolve_modules(config)?;
        let merged_deps = self.merge_module_deps(config, &discovered)?;

        if !config.dependencies.is_empty() {
            self.installer.install(&config.dependencies, scratch.path())?;
        }

        let tmp_archive = scratch.path().join("ftl_gate.pyz");
        self.write_archive(config, &discovered, &merged_deps, &tmp_archive)?;

        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&tmp_archive, target_path).or_else(|_| {
            std::fs::copy(&tmp_archive, target_path).map(|_| ())
        })?;

        Ok(())
    }

    /// Resolve every configured module name: a simple filename lookup
    /// under `module_dirs` first, then FQCN resolution (defaulting bare
    /// names to the `ansible.builtin` namespace).
    fn resolve_modules(&self, config: &GateBuildConfig) -> Result<Vec<DiscoveredModule>> {
        let mut discovered = Vec::with_capacity(config.modules.len());

        for module in &config.modules {
            if let Some(path) = find_module_in_dirs(&config.module_dirs, module) {
                discovered.push(DiscoveredModule {
                    requested: module.clone(),
                    path,
                    fqcn: None,
                });
                continue;
            }

            let resolved_fqcn = if module.contains('.') {
                module.clone()
            } else {
                format!("{}.{}", fqcn::DEFAULT_NAMESPACE, module)
            };

            let path = fqcn::resolve_fqcn(
                &resolved_fqcn,
                config.builtin_modules_root.as_deref(),
                None,
                &config.collection_paths,
            )
            .map_err(|e| Error::ModuleNotFound(format!("cannot find {module}: {e}")))?;

            discovered.push(DiscoveredModule {
                requested: module.clone(),
                path,
                fqcn: Some(resolved_fqcn),
            });
        }

        Ok(discovered)
    }

    /// Resolve and merge the module_utils dependency closure for every
    /// FQCN-resolved module, keyed by archive path so shared dependencies
    /// across modules are installed only once.
    fn merge_module_deps(
        &self,
        config: &GateBuildConfig,
        discovered: &[DiscoveredModule],
    ) -> Result<BTreeMap<String, PathBuf>> {
        let mut merged: BTreeMap<String, PathBuf> = BTreeMap::new();
        let opts = ResolveOptions {
            core_module_utils_root: config.core_module_utils_root.clone(),
            collection_paths: config.collection_paths.clone(),
            ..Default::default()
        };

        for module in discovered {
            if module.fqcn.is_none() {
                continue;
            }
            let dep_result = find_all_dependencies(&module.path, &opts);
            debug!(
                module = %module.requested,
                deps = dep_result.dependencies.len(),
                unresolved = dep_result.unresolved.len(),
                "resolved module dependencies"
            );
            for dep_path in &dep_result.dependencies {
                let arc_path = archive_path(dep_path);
                merged.entry(arc_path).or_insert_with(|| dep_path.clone());
            }
        }

        Ok(merged)
    }

    fn write_archive(
        &self,
        config: &GateBuildConfig,
        discovered: &[DiscoveredModule],
        merged_deps: &BTreeMap<String, PathBuf>,
        archive_path: &Path,
    ) -> Result<()> {
        let file = std::fs::File::create(archive_path)?;
        let mut zip = ZipWriter::new(file);
        let options: FileOptions<()> = FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        zip.start_file("__main__.py", options)?;
        std::io::Write::write_all(&mut zip, &config.dispatcher_source)?;

        zip.start_file("ftl_gate/__init__.py", options)?;
        zip.start_file("ftl2/__init__.py", options)?;

        for module in discovered {
            let file_name = match &module.fqcn {
                Some(fqcn) => format!("{}.py", module_path_name(fqcn)),
                None => module
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| format!("{}.py", module.requested)),
            };
            let source = std::fs::read(&module.path)?;
            zip.start_file(format!("ftl_gate/{file_name}"), options)?;
            std::io::Write::write_all(&mut zip, &source)?;
        }

        let mut init_dirs: BTreeSet<String> = BTreeSet::new();
        for (arc_path, source_path) in merged_deps {
            let parts: Vec<&str> = arc_path.split('/').collect();
            for i in 0..parts.len().saturating_sub(1) {
                init_dirs.insert(parts[..=i].join("/"));
            }
            let source = std::fs::read(source_path)?;
            zip.start_file(arc_path.as_str(), options)?;
            std::io::Write::write_all(&mut zip, &source)?;
        }
        for dir in &init_dirs {
            let init_path = format!("{dir}/__init__.py");
            if merged_deps.contains_key(&init_path) {
                continue;
            }
            zip.start_file(init_path.as_str(), options)?;
        }

        zip.finish()?;
        Ok(())
    }
}

fn find_module_in_dirs(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(format!("{name}.py"));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn module_path_name_strips_namespace_and_collection() {
        assert_eq!(module_path_name("community.general.slack"), "slack");
        assert_eq!(module_path_name("ansible.builtin.service"), "service");
        assert_eq!(module_path_name("ping"), "ping");
    }

    #[test]
    fn hash_is_stable_for_identical_config() {
        let config = GateBuildConfig {
            modules: vec!["ping".to_string()],
            module_dirs: vec![],
            dependencies: vec![],
            interpreter: "/usr/bin/python3".to_string(),
            dispatcher_source: b"dispatcher".to_vec(),
            collection_paths: vec![],
            builtin_modules_root: None,
            core_module_utils_root: None,
        };
        assert_eq!(config.compute_hash(), config.compute_hash());
    }

    #[test]
    fn hash_changes_with_dispatcher_source() {
        let base = GateBuildConfig {
            modules: vec!["ping".to_string()],
            module_dirs: vec![],
            dependencies: vec![],
            interpreter: "/usr/bin/python3".to_string(),
            dispatcher_source: b"v1".to_vec(),
            collection_paths: vec![],
            builtin_modules_root: None,
            core_module_utils_root: None,
        };
        let mut changed = base.clone();
        changed.dispatcher_source = b"v2".to_vec();
        assert_ne!(base.compute_hash(), changed.compute_hash());
    }

    #[test]
    fn builds_and_caches_a_simple_module_gate() {
        let module_dir = tempdir().unwrap();
        fs::write(module_dir.path().join("ping.py"), "def main(args):\n    return {}\n").unwrap();

        let cache_dir = tempdir().unwrap();
        let builder = GateBuilder::new(cache_dir.path().to_path_buf()).unwrap();

        let config = GateBuildConfig {
            modules: vec!["ping".to_string()],
            module_dirs: vec![module_dir.path().to_path_buf()],
            dependencies: vec![],
            interpreter: "/usr/bin/python3".to_string(),
            dispatcher_source: b"dispatcher".to_vec(),
            collection_paths: vec![],
            builtin_modules_root: None,
            core_module_utils_root: None,
        };

        let (path1, hash1) = builder.build(&config).unwrap();
        assert!(path1.exists());

        let (path2, hash2) = builder.build(&config).unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(path1, path2);
    }
}
