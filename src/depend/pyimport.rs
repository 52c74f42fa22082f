//! Python import scanning for module_utils dependency detection (§4.2).
//!
//! The source system walks a Python AST to find `import`/`from ... import`
//! statements. This crate has no Python-AST parser in its dependency
//! stack, so the same statement shapes are recognized with a line-oriented
//! regex scan instead: every bare `import X` and `from X import Y` at any
//! indentation is matched, which is sufficient because module_utils
//! imports are always top-level statements, never constructed dynamically.
//!
//! Grounded on
//! `examples/original_source/src/ftl2/module_loading/dependencies.py`'s
//! `ModuleUtilsFinder`.

use once_cell::sync::Lazy;
use regex::Regex;

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*import\s+([A-Za-z_][\w\.]*)").expect("static import regex is valid")
});

static FROM_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*from\s+(\.*)([A-Za-z_][\w\.]*)?\s+import\s+").expect("static from-import regex is valid")
});

/// A single `module_utils` import found in source, with its components
/// already split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleUtilsImport {
    /// The full dotted import path, fully resolved for relative imports.
    pub import_path: String,
    /// True if this is a collection-scoped import (`ansible_collections...`).
    pub is_collection: bool,
    /// Collection namespace, set only when `is_collection`.
    pub namespace: String,
    /// Collection name, set only when `is_collection`.
    pub collection: String,
    /// The module_utils path within the package, e.g. `common.text.converters`.
    pub module_path: String,
}

impl ModuleUtilsImport {
    fn from_path(import_path: String) -> Self {
        let mut result = Self {
            import_path: import_path.clone(),
            is_collection: false,
            namespace: String::new(),
            collection: String::new(),
            module_path: String::new(),
        };
        if let Some(rest) = import_path.strip_prefix("ansible_collections.") {
            let parts: Vec<&str> = rest.split('.').collect();
            // full path is ansible_collections.<ns>.<coll>.plugins.module_utils.<path>
            // `parts` here starts after "ansible_collections.", so index 3 is "module_utils".
            if parts.len() >= 5 && parts[2] == "module_utils" {
                result.is_collection = true;
                result.namespace = parts[0].to_string();
                result.collection = parts[1].to_string();
                result.module_path = parts[3..].join(".");
            }
        } else if let Some(rest) = import_path.strip_prefix("ansible.module_utils.") {
            result.module_path = rest.to_string();
        } else if import_path == "ansible.module_utils" {
            result.module_path = String::new();
        }
        result
    }
}

/// Resolve a relative import (`from . import x`, `from .._internal import y`)
/// against the package path of the file being scanned.
fn resolve_relative_import(current_package: &str, module: &str, level: usize) -> Option<String> {
    if current_package.is_empty() {
        return None;
    }
    let parts: Vec<&str> = current_package.split('.').collect();
    if level > parts.len() {
        return None;
    }
    let keep = parts.len() - level + 1;
    let base = parts[..keep].join(".");
    if module.is_empty() {
        Some(base)
    } else {
        Some(format!("{base}.{module}"))
    }
}

/// Scan Python source for `module_utils` imports, resolving relative
/// imports against `current_package` (the dotted package path of the file
/// being scanned, e.g. `ansible.module_utils` for `basic.py`).
#[must_use]
pub fn find_module_utils_imports(source: &str, current_package: &str) -> Vec<ModuleUtilsImport> {
    let mut found = Vec::new();

    for line in source.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            continue;
        }

        if let Some(caps) = IMPORT_RE.captures(line) {
            let name = &caps[1];
            if name.contains("module_utils") {
                found.push(ModuleUtilsImport::from_path(name.to_string()));
            }
            continue;
        }

        if let Some(caps) = FROM_IMPORT_RE.captures(line) {
            let dots = &caps[1];
            let module = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let level = dots.len();

            if level > 0 {
                if let Some(resolved) = resolve_relative_import(current_package, module, level) {
                    if resolved.contains("module_utils") {
                        found.push(ModuleUtilsImport::from_path(resolved));
                    }
                }
            } else if !module.is_empty() && module.contains("module_utils") {
                found.push(ModuleUtilsImport::from_path(module.to_string()));
            }
        }
    }

    found
}

/// Derive the dotted package path for a module_utils file from its
/// on-disk path, so relative imports inside it can be resolved. Returns
/// an empty string if the path doesn't contain a `module_utils` segment
/// under an `ansible` or `ansible_collections` root.
#[must_use]
pub fn package_from_path(file_path: &std::path::Path) -> String {
    let components: Vec<String> = file_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();

    if !components.iter().any(|c| c == "module_utils") {
        return String::new();
    }

    let start_idx = components
        .iter()
        .position(|c| c == "ansible" || c == "ansible_collections");

    let Some(start_idx) = start_idx else {
        return String::new();
    };

    if components.is_empty() {
        return String::new();
    }
    let package_parts = &components[start_idx..components.len() - 1];
    package_parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn finds_absolute_core_import() {
        let src = "from ansible.module_utils.basic import AnsibleModule\n";
        let imports = find_module_utils_imports(src, "");
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].import_path, "ansible.module_utils.basic");
        assert!(!imports[0].is_collection);
        assert_eq!(imports[0].module_path, "basic");
    }

    #[test]
    fn finds_nested_core_import() {
        let src = "from ansible.module_utils.common.text.converters import to_text\n";
        let imports = find_module_utils_imports(src, "");
        assert_eq!(imports[0].module_path, "common.text.converters");
    }

    #[test]
    fn finds_collection_import() {
        let src = "from ansible_collections.community.general.plugins.module_utils.foo import Bar\n";
        let imports = find_module_utils_imports(src, "");
        assert_eq!(imports.len(), 1);
        assert!(imports[0].is_collection);
        assert_eq!(imports[0].namespace, "community");
        assert_eq!(imports[0].collection, "general");
        assert_eq!(imports[0].module_path, "foo");
    }

    #[test]
    fn resolves_relative_import_within_module_utils() {
        let src = "from ._internal import _traceback\n";
        let imports = find_module_utils_imports(src, "ansible.module_utils");
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].import_path, "ansible.module_utils._internal");
    }

    #[test]
    fn ignores_unrelated_imports() {
        let src = "import os\nimport json\nfrom typing import Any\n";
        assert!(find_module_utils_imports(src, "").is_empty());
    }

    #[test]
    fn ignores_commented_import_lines() {
        let src = "# from ansible.module_utils.basic import AnsibleModule\n";
        assert!(find_module_utils_imports(src, "").is_empty());
    }

    #[test]
    fn plain_import_of_module_utils_package() {
        let src = "import ansible.module_utils.basic\n";
        let imports = find_module_utils_imports(src, "");
        assert_eq!(imports[0].module_path, "basic");
    }

    #[test]
    fn package_from_path_for_plain_module() {
        let path = Path::new("ansible/module_utils/basic.py");
        assert_eq!(package_from_path(path), "ansible.module_utils");
    }

    #[test]
    fn package_from_path_for_init_file() {
        let path = Path::new("ansible/module_utils/_internal/__init__.py");
        assert_eq!(package_from_path(path), "ansible.module_utils._internal");
    }

    #[test]
    fn package_from_path_without_module_utils_is_empty() {
        let path = Path::new("ansible/modules/copy.py");
        assert_eq!(package_from_path(path), "");
    }
}
