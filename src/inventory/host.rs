//! Host definitions for the inventory (spec.md §3/§6).
//!
//! A host is a name plus the handful of connection attributes the
//! orchestrator needs to reach it, and an opaque variable bag for
//! everything else. This is deliberately not a general inventory schema:
//! no per-group variable precedence, no dynamic inventory plugins, no
//! pattern algebra.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// How the orchestrator reaches a host.
///
/// spec.md's data model calls this `local | shell`; the `ansible_connection`
/// inventory attribute spells the remote case `ssh`. Both names mean the
/// same thing here: everything that isn't `local` goes over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    #[serde(alias = "ssh")]
    Shell,
    Local,
}

impl ConnectionKind {
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, ConnectionKind::Local)
    }
}

fn default_port() -> u16 {
    22
}

fn default_interpreter() -> String {
    "python3".to_string()
}

/// A single managed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub connection: ConnectionKind,

    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Every inventory key that isn't one of the recognized attributes
    /// above, kept verbatim for modules and secret bindings to read.
    #[serde(default)]
    pub vars: IndexMap<String, Value>,
}

impl HostSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            port: default_port(),
            user: None,
            connection: ConnectionKind::default(),
            interpreter: default_interpreter(),
            vars: IndexMap::new(),
        }
    }

    /// The address to dial: `ansible_host` if set, otherwise the host's
    /// own name (spec.md §6: `ansible_host` is optional, name is the
    /// fallback).
    #[must_use]
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Build a host from a raw inventory entry's attribute map, splitting
    /// recognized `ansible_*` keys from the opaque var bag (spec.md §6).
    pub fn from_attrs(name: &str, attrs: &IndexMap<String, Value>) -> Self {
        let mut spec = Self::new(name);
        for (key, value) in attrs {
            match key.as_str() {
                "ansible_host" => spec.address = value.as_str().map(str::to_string),
                "ansible_port" => {
                    if let Some(port) = value.as_u64() {
                        spec.port = port as u16;
                    }
                }
                "ansible_user" => spec.user = value.as_str().map(str::to_string),
                "ansible_connection" => {
                    if let Some(kind) = value.as_str() {
                        spec.connection = match kind {
                            "local" => ConnectionKind::Local,
                            _ => ConnectionKind::Shell,
                        };
                    }
                }
                "ansible_python_interpreter" => {
                    if let Some(interpreter) = value.as_str() {
                        spec.interpreter = interpreter.to_string();
                    }
                }
                other => {
                    spec.vars.insert(other.to_string(), value.clone());
                }
            }
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ansible_host_falls_back_to_name() {
        let host = HostSpec::new("web1");
        assert_eq!(host.address(), "web1");
    }

    #[test]
    fn recognized_attrs_are_extracted_and_unknown_keys_go_to_vars() {
        let mut attrs = IndexMap::new();
        attrs.insert("ansible_host".to_string(), Value::from("10.0.0.5"));
        attrs.insert("ansible_port".to_string(), Value::from(2222));
        attrs.insert("ansible_user".to_string(), Value::from("deploy"));
        attrs.insert("ansible_connection".to_string(), Value::from("local"));
        attrs.insert("datacenter".to_string(), Value::from("us-east"));

        let host = HostSpec::from_attrs("web1", &attrs);
        assert_eq!(host.address(), "10.0.0.5");
        assert_eq!(host.port, 2222);
        assert_eq!(host.user.as_deref(), Some("deploy"));
        assert!(host.connection.is_local());
        assert_eq!(host.get_var("datacenter").unwrap().as_str(), Some("us-east"));
        assert!(host.get_var("ansible_host").is_none());
    }

    #[test]
    fn defaults_match_spec() {
        let host = HostSpec::new("x");
        assert_eq!(host.port, 22);
        assert_eq!(host.interpreter, "python3");
        assert_eq!(host.connection, ConnectionKind::Shell);
    }
}
