//! Fully-qualified collection name parsing and search-path resolution
//! (§4.2). Grounded on
//! `examples/original_source/src/ftl2/module_loading/fqcn.py`.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

static FQCN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z_][a-zA-Z0-9_]*)\.([a-zA-Z_][a-zA-Z0-9_]*)\.([a-zA-Z_][a-zA-Z0-9_]*)$")
        .expect("static FQCN regex is valid")
});

/// A parsed fully-qualified collection name: `namespace.collection.module`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFqcn {
    /// Collection namespace, e.g. `amazon`.
    pub namespace: String,
    /// Collection name, e.g. `aws`.
    pub collection: String,
    /// Module name within the collection.
    pub module_name: String,
}

impl std::fmt::Display for ParsedFqcn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.collection, self.module_name)
    }
}

/// Parse a dotted FQCN string into its three components.
pub fn parse_fqcn(fqcn: &str) -> Result<ParsedFqcn> {
    if fqcn.is_empty() {
        return Err(Error::ModuleNotFound("(empty FQCN)".to_string()));
    }
    let caps = FQCN_PATTERN.captures(fqcn).ok_or_else(|| {
        let parts: Vec<&str> = fqcn.split('.').collect();
        if parts.len() != 3 {
            Error::ModuleArgs {
                module: fqcn.to_string(),
                message: format!("expected 3 dotted parts (namespace.collection.module), got {}", parts.len()),
            }
        } else {
            Error::ModuleArgs {
                module: fqcn.to_string(),
                message: "invalid characters in one or more parts".to_string(),
            }
        }
    })?;
    Ok(ParsedFqcn {
        namespace: caps[1].to_string(),
        collection: caps[2].to_string(),
        module_name: caps[3].to_string(),
    })
}

/// True if `fqcn` parses as a well-formed FQCN.
#[must_use]
pub fn is_valid_fqcn(fqcn: &str) -> bool {
    parse_fqcn(fqcn).is_ok()
}

/// Default namespace applied when a bare module name is requested without
/// a collection qualifier.
pub const DEFAULT_NAMESPACE: &str = "ansible.builtin";

/// Collection search roots, in priority order: playbook-adjacent,
/// caller-supplied extras, `ANSIBLE_COLLECTIONS_PATH` (if set), else the
/// default well-known locations.
#[must_use]
pub fn collection_paths(playbook_dir: Option<&Path>, extra_paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(dir) = playbook_dir {
        let candidate = dir.join("collections");
        if candidate.exists() {
            paths.push(candidate);
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join("collections");
        if candidate.exists() && !paths.contains(&candidate) {
            paths.push(candidate);
        }
    }

    for p in extra_paths {
        if !paths.contains(p) {
            paths.push(p.clone());
        }
    }

    if let Ok(env_paths) = std::env::var("ANSIBLE_COLLECTIONS_PATH") {
        for part in env_paths.split(':') {
            let path = PathBuf::from(part);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    } else {
        for default in default_collection_paths() {
            if !paths.contains(&default) {
                paths.push(default);
            }
        }
    }

    paths
}

fn default_collection_paths() -> Vec<PathBuf> {
    let mut defaults = Vec::new();
    if let Some(home) = dirs::home_dir() {
        defaults.push(home.join(".ansible").join("collections"));
    }
    defaults.push(PathBuf::from("/usr/share/ansible/collections"));
    defaults
}

/// Resolve a collection module to its on-disk path, searching
/// `ansible_collections/<ns>/<coll>/plugins/modules/<name>.py` under each
/// root in `paths`.
pub fn resolve_collection_module(
    namespace: &str,
    collection: &str,
    module_name: &str,
    paths: &[PathBuf],
) -> Result<PathBuf> {
    let mut searched = Vec::new();
    for base in paths {
        let candidate = base
            .join("ansible_collections")
            .join(namespace)
            .join(collection)
            .join("plugins")
            .join("modules")
            .join(format!("{module_name}.py"));
        searched.push(candidate.clone());
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::ModuleNotFound(format!(
        "{namespace}.{collection}.{module_name} (searched {} path(s))",
        searched.len()
    )))
}

/// Resolve `ansible.builtin.<name>` against a builtin modules root,
/// trying a flat layout first then one level of category subdirectory.
pub fn resolve_builtin_module(builtin_root: &Path, module_name: &str) -> Result<PathBuf> {
    let direct = builtin_root.join(format!("{module_name}.py"));
    if direct.exists() {
        return Ok(direct);
    }
    if let Ok(entries) = std::fs::read_dir(builtin_root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let candidate = path.join(format!("{module_name}.py"));
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
    }
    Err(Error::ModuleNotFound(format!("ansible.builtin.{module_name}")))
}

/// Resolve an FQCN to a file path, dispatching on the `ansible.builtin`
/// special case versus a regular collection lookup.
pub fn resolve_fqcn(
    fqcn: &str,
    builtin_root: Option<&Path>,
    playbook_dir: Option<&Path>,
    extra_paths: &[PathBuf],
) -> Result<PathBuf> {
    let parsed = parse_fqcn(fqcn)?;
    if parsed.namespace == "ansible" && parsed.collection == "builtin" {
        let root = builtin_root
            .ok_or_else(|| Error::ModuleNotFound(format!("ansible.builtin.{}", parsed.module_name)))?;
        return resolve_builtin_module(root, &parsed.module_name);
    }
    let paths = collection_paths(playbook_dir, extra_paths);
    resolve_collection_module(&parsed.namespace, &parsed.collection, &parsed.module_name, &paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_fqcn() {
        let parsed = parse_fqcn("amazon.aws.ec2_instance").unwrap();
        assert_eq!(parsed.namespace, "amazon");
        assert_eq!(parsed.collection, "aws");
        assert_eq!(parsed.module_name, "ec2_instance");
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(parse_fqcn("ec2_instance").is_err());
        assert!(parse_fqcn("amazon.aws.ec2.instance").is_err());
    }

    #[test]
    fn rejects_empty_string() {
        assert!(parse_fqcn("").is_err());
    }

    #[test]
    fn is_valid_fqcn_matches_parse_fqcn() {
        assert!(is_valid_fqcn("ansible.builtin.copy"));
        assert!(!is_valid_fqcn("not-a-fqcn"));
    }
}
