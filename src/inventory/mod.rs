//! Inventory (spec.md §3/§6): a flat set of hosts plus named groups for
//! target resolution, loaded from a minimal YAML schema.
//!
//! ```yaml
//! hosts:
//!   web1:
//!     ansible_host: 10.0.0.5
//!   web2: {}
//! vars:
//!   env: prod
//! children:
//!   web:
//!     hosts: [web1, web2]
//! ```
//!
//! This intentionally has no INI parser, no dynamic inventory plugins, no
//! group-variable precedence, and no host pattern algebra (`web[1:3]`,
//! `web:&staging`, ...) — the teacher's `constructed.rs`/`plugin.rs`
//! machinery covers all of that and has no counterpart here.

pub mod group;
pub mod host;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::Path;

use crate::error::{Error, Result};
pub use group::Group;
pub use host::{ConnectionKind, HostSpec};

/// The recognized top-level inventory document shape.
#[derive(Debug, Deserialize)]
struct InventoryDoc {
    #[serde(default)]
    hosts: IndexMap<String, Value>,
    #[serde(default)]
    #[allow(dead_code)]
    vars: IndexMap<String, Value>,
    #[serde(default)]
    children: ChildrenDoc,
}

/// `children` may be a list of bare group names or a map of group name to
/// `{hosts: [...]}`. spec.md §6 allows both shapes.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum ChildrenDoc {
    #[default]
    Empty,
    List(Vec<String>),
    Map(IndexMap<String, GroupDoc>),
}

#[derive(Debug, Default, Deserialize)]
struct GroupDoc {
    #[serde(default)]
    hosts: Vec<String>,
}

/// What a target name resolves to.
pub enum Target<'a> {
    Host(&'a HostSpec),
    Group(Vec<&'a HostSpec>),
}

/// The loaded inventory: hosts and groups, queryable by name.
#[derive(Debug, Default, Clone)]
pub struct Inventory {
    hosts: IndexMap<String, HostSpec>,
    groups: IndexMap<String, Group>,
}

impl Inventory {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load_str(yaml: &str) -> Result<Self> {
        let doc: InventoryDoc = serde_yaml::from_str(yaml).map_err(|e| Error::InventoryLoad {
            path: "<string>".into(),
            message: e.to_string(),
        })?;
        Self::from_doc(doc, "<string>")
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::InventoryLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let doc: InventoryDoc = serde_yaml::from_str(&contents).map_err(|e| Error::InventoryLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_doc(doc, path.display().to_string())
    }

    fn from_doc(doc: InventoryDoc, source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let mut inventory = Self::empty();

        for (name, value) in doc.hosts {
            let attrs: IndexMap<String, Value> = match value {
                Value::Mapping(_) => serde_yaml::from_value(value).map_err(|e| Error::InventoryLoad {
                    path: source.clone().into(),
                    message: format!("host '{name}': {e}"),
                })?,
                Value::Null => IndexMap::new(),
                other => {
                    return Err(Error::InventoryLoad {
                        path: source.into(),
                        message: format!("host '{name}' must be a mapping or null, got {other:?}"),
                    })
                }
            };
            inventory.add_host(HostSpec::from_attrs(&name, &attrs));
        }

        match doc.children {
            ChildrenDoc::Empty => {}
            ChildrenDoc::List(names) => {
                for name in names {
                    inventory.groups.entry(name.clone()).or_insert_with(|| Group::new(name));
                }
            }
            ChildrenDoc::Map(map) => {
                for (name, group_doc) in map {
                    let mut group = Group::new(name.clone());
                    for host in group_doc.hosts {
                        group.add_host(host);
                    }
                    inventory.groups.insert(name, group);
                }
            }
        }

        Ok(inventory)
    }

    /// Insert or replace a host (used by the orchestrator's dynamic
    /// `add_host`, §4.8).
    pub fn add_host(&mut self, host: HostSpec) {
        self.hosts.insert(host.name.clone(), host);
    }

    #[must_use]
    pub fn host(&self, name: &str) -> Option<&HostSpec> {
        self.hosts.get(name)
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostSpec> {
        self.hosts.values()
    }

    /// Every group that directly lists `host` as a member (event routing,
    /// §4.9; does not follow nested child groups).
    pub fn groups_containing<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a Group> {
        self.groups.values().filter(move |g| g.has_host(host))
    }

    /// Resolve a target name: groups take priority over hosts of the same
    /// name, since a group expands to potentially many hosts and an
    /// ambiguous name should favor the broader match. An unknown name is
    /// an error.
    pub fn resolve(&self, target: &str) -> Result<Target<'_>> {
        if let Some(group) = self.groups.get(target) {
            return Ok(Target::Group(self.expand_group(group)));
        }
        if let Some(host) = self.hosts.get(target) {
            return Ok(Target::Host(host));
        }
        Err(Error::UnknownTarget(target.to_string()))
    }

    fn expand_group<'a>(&'a self, group: &'a Group) -> Vec<&'a HostSpec> {
        let mut seen = std::collections::BTreeSet::new();
        let mut result = Vec::new();
        self.collect_group_hosts(group, &mut seen, &mut result);
        result
    }

    fn collect_group_hosts<'a>(
        &'a self,
        group: &'a Group,
        seen: &mut std::collections::BTreeSet<String>,
        result: &mut Vec<&'a HostSpec>,
    ) {
        for name in group.direct_hosts() {
            if seen.insert(name.clone()) {
                if let Some(host) = self.hosts.get(name) {
                    result.push(host);
                }
            }
        }
        for child_name in group.children() {
            if let Some(child) = self.groups.get(child_name) {
                self.collect_group_hosts(child, seen, result);
            }
        }
    }
}
