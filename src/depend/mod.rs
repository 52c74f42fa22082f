//! Transitive module_utils dependency resolution (§4.2).
//!
//! Grounded on
//! `examples/original_source/src/ftl2/module_loading/dependencies.py`'s
//! `find_all_dependencies`.

pub mod fqcn;
pub mod pyimport;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::depend::pyimport::ModuleUtilsImport;

/// Default recursion cap for transitive dependency resolution, matching
/// the source's `max_depth=50`.
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// Resolved and unresolved dependency closure for a single module file.
#[derive(Debug, Clone, Default)]
pub struct DependencyResult {
    /// The module file this result was computed for.
    pub module_path: PathBuf,
    /// Resolved dependency file paths, in discovery order.
    pub dependencies: Vec<PathBuf>,
    /// Imports that could not be resolved to a file (recorded, not fatal).
    pub unresolved: Vec<ModuleUtilsImport>,
    /// Every module_utils import observed, resolved or not.
    pub all_imports: Vec<ModuleUtilsImport>,
}

impl DependencyResult {
    /// Number of resolved dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// True if no dependencies were resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// Resolve a single `module_utils` import to a file path, dispatching on
/// whether it names a collection or the core namespace.
fn resolve_import(
    imp: &ModuleUtilsImport,
    core_module_utils_root: Option<&Path>,
    collection_paths: &[PathBuf],
) -> Option<PathBuf> {
    if imp.is_collection {
        resolve_collection_module_util(&imp.namespace, &imp.collection, &imp.module_path, collection_paths)
    } else {
        core_module_utils_root.and_then(|root| resolve_core_module_util(root, &imp.module_path))
    }
}

/// Resolve a core `ansible.module_utils.<path>` import against the core
/// module_utils root, handling the `six.moves` virtual-namespace special
/// case (`six.moves` is synthesized at runtime by the `six` package and
/// has no corresponding file).
fn resolve_core_module_util(module_utils_base: &Path, module_path: &str) -> Option<PathBuf> {
    if module_path.starts_with("six.moves") {
        let six_init = module_utils_base.join("six").join("__init__.py");
        return six_init.exists().then_some(six_init);
    }

    if module_path.is_empty() {
        return None;
    }
    let parts: Vec<&str> = module_path.split('.').collect();

    let package_path = module_utils_base.join(parts.join("/")).join("__init__.py");
    if package_path.exists() {
        return Some(package_path);
    }

    let module_file = if parts.len() > 1 {
        module_utils_base.join(parts[..parts.len() - 1].join("/")).join(format!("{}.py", parts[parts.len() - 1]))
    } else {
        module_utils_base.join(format!("{}.py", parts[0]))
    };
    if module_file.exists() {
        return Some(module_file);
    }

    let direct_path = module_utils_base.join(format!("{}.py", parts.join("/")));
    direct_path.exists().then_some(direct_path)
}

/// Resolve a collection module_utils import across each candidate
/// collection root, in priority order.
fn resolve_collection_module_util(
    namespace: &str,
    collection: &str,
    module_path: &str,
    collection_paths: &[PathBuf],
) -> Option<PathBuf> {
    let parts: Vec<&str> = module_path.split('.').collect();

    for base_path in collection_paths {
        let module_utils_base = base_path
            .join("ansible_collections")
            .join(namespace)
            .join(collection)
            .join("plugins")
            .join("module_utils");

        if !module_utils_base.exists() {
            continue;
        }

        let package_path = module_utils_base.join(parts.join("/")).join("__init__.py");
        if package_path.exists() {
            return Some(package_path);
        }

        let module_file = if parts.len() > 1 {
            module_utils_base.join(parts[..parts.len() - 1].join("/")).join(format!("{}.py", parts[parts.len() - 1]))
        } else {
            module_utils_base.join(format!("{}.py", parts[0]))
        };
        if module_file.exists() {
            return Some(module_file);
        }
    }

    None
}

/// Read a module_utils file and scan it for further imports.
fn imports_from_file(path: &Path) -> Vec<ModuleUtilsImport> {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read module_utils file");
            return Vec::new();
        }
    };
    let package = pyimport::package_from_path(path);
    pyimport::find_module_utils_imports(&source, &package)
}

/// Options controlling where dependency resolution looks for module_utils
/// files.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Root of the core `ansible/module_utils` tree, if available.
    pub core_module_utils_root: Option<PathBuf>,
    /// Collection roots to search for collection-scoped module_utils.
    pub collection_paths: Vec<PathBuf>,
    /// Recursion cap; defaults to [`DEFAULT_MAX_DEPTH`].
    pub max_depth: usize,
}

impl ResolveOptions {
    /// Build options with the default recursion depth.
    #[must_use]
    pub fn new(core_module_utils_root: Option<PathBuf>, collection_paths: Vec<PathBuf>) -> Self {
        Self {
            core_module_utils_root,
            collection_paths,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Walk the transitive module_utils dependency closure of `module_path`,
/// starting from its own imports. Cycle-safe (tracks visited file paths
/// and import strings) and depth-capped.
#[must_use]
pub fn find_all_dependencies(module_path: &Path, opts: &ResolveOptions) -> DependencyResult {
    let mut result = DependencyResult {
        module_path: module_path.to_path_buf(),
        ..Default::default()
    };

    let mut seen_paths: HashSet<PathBuf> = HashSet::new();
    let mut seen_imports: HashSet<String> = HashSet::new();
    let mut stack: Vec<(PathBuf, usize)> = vec![(module_path.to_path_buf(), 0)];

    while let Some((current_path, depth)) = stack.pop() {
        if depth > opts.max_depth {
            warn!(max_depth = opts.max_depth, "max dependency depth reached");
            continue;
        }
        if seen_paths.contains(&current_path) {
            continue;
        }
        seen_paths.insert(current_path.clone());

        for imp in imports_from_file(&current_path) {
            if seen_imports.contains(&imp.import_path) {
                continue;
            }
            seen_imports.insert(imp.import_path.clone());
            result.all_imports.push(imp.clone());

            match resolve_import(&imp, opts.core_module_utils_root.as_deref(), &opts.collection_paths) {
                None => {
                    debug!(import_path = %imp.import_path, "could not resolve module_utils import");
                    result.unresolved.push(imp);
                }
                Some(dep_path) => {
                    if !seen_paths.contains(&dep_path) {
                        result.dependencies.push(dep_path.clone());
                        stack.push((dep_path, depth + 1));
                    }
                }
            }
        }
    }

    result
}
