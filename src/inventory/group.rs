//! Groups (spec.md §3): a named set of hosts, used only for target
//! resolution. No precedence rules, no variable inheritance, no nested
//! pattern algebra — a host can belong to more than one group and a
//! group can list child groups, and that's the entire feature set.

use std::collections::BTreeSet;

/// A named collection of host names, possibly including child groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    hosts: BTreeSet<String>,
    children: BTreeSet<String>,
}

impl Group {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }

    pub fn add_host(&mut self, host: impl Into<String>) {
        self.hosts.insert(host.into());
    }

    pub fn add_child(&mut self, child: impl Into<String>) {
        self.children.insert(child.into());
    }

    #[must_use]
    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    pub fn direct_hosts(&self) -> impl Iterator<Item = &String> {
        self.hosts.iter()
    }

    pub fn children(&self) -> impl Iterator<Item = &String> {
        self.children.iter()
    }
}
