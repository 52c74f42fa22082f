//! Policy engine (§4.11): ordered rules gating module execution before
//! any network activity, evaluated module-name glob + parameter
//! predicates + host glob + environment match, first match wins,
//! default allow.

use std::collections::HashMap;

use globset::Glob;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// One rule as authored in a policy file.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRuleDoc {
    pub id: String,
    #[serde(default)]
    pub module: Option<String>,
    /// Parameter predicates: every listed key must be present in the
    /// effective parameter map and its stringified value must match the
    /// glob. A rule with no `params` matches regardless of parameters.
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    pub action: PolicyAction,
    #[serde(default)]
    pub reason: Option<String>,
}

struct CompiledRule {
    id: String,
    module: Option<Glob>,
    params: Vec<(String, Glob)>,
    host: Option<Glob>,
    environment: Option<String>,
    action: PolicyAction,
    reason: String,
}

/// Render a param value the way a rule's glob pattern expects to match
/// it: strings pass through bare, everything else uses its JSON text.
fn param_match_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl CompiledRule {
    fn matches(&self, module: &str, params: &Value, host: &str, environment: &str) -> bool {
        if let Some(glob) = &self.module {
            if !glob.compile_matcher().is_match(module) {
                return false;
            }
        }
        for (key, glob) in &self.params {
            let Some(value) = params.get(key) else {
                return false;
            };
            if !glob.compile_matcher().is_match(param_match_text(value)) {
                return false;
            }
        }
        if let Some(glob) = &self.host {
            if !glob.compile_matcher().is_match(host) {
                return false;
            }
        }
        if let Some(env) = &self.environment {
            if env != environment {
                return false;
            }
        }
        true
    }
}

/// Evaluates rules in declaration order against a module invocation.
pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
}

impl PolicyEngine {
    /// No rules: every invocation is allowed.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compile rules from their YAML document form.
    pub fn from_docs(docs: Vec<PolicyRuleDoc>) -> Result<Self> {
        let mut rules = Vec::with_capacity(docs.len());
        for doc in docs {
            let module = doc
                .module
                .as_deref()
                .map(Glob::new)
                .transpose()
                .map_err(|e| Error::Config(format!("invalid policy module pattern: {e}")))?;
            let host = doc
                .host
                .as_deref()
                .map(Glob::new)
                .transpose()
                .map_err(|e| Error::Config(format!("invalid policy host pattern: {e}")))?;
            let mut params = Vec::with_capacity(doc.params.len());
            for (key, pattern) in doc.params {
                let glob = Glob::new(&pattern)
                    .map_err(|e| Error::Config(format!("invalid policy param pattern for '{key}': {e}")))?;
                params.push((key, glob));
            }
            rules.push(CompiledRule {
                id: doc.id,
                module,
                params,
                host,
                environment: doc.environment,
                action: doc.action,
                reason: doc.reason.unwrap_or_else(|| "denied by policy".to_string()),
            });
        }
        Ok(Self { rules })
    }

    pub fn load_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        let docs: Vec<PolicyRuleDoc> =
            serde_yaml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_docs(docs)
    }

    /// First matching rule decides; no match means allow.
    pub fn evaluate(&self, module: &str, params: &Value, host: &str, environment: &str) -> Result<()> {
        for rule in &self.rules {
            if rule.matches(module, params, host, environment) {
                return match rule.action {
                    PolicyAction::Allow => Ok(()),
                    PolicyAction::Deny => Err(Error::PolicyDenied {
                        rule: rule.id.clone(),
                        module: module.to_string(),
                        host: host.to_string(),
                        reason: rule.reason.clone(),
                    }),
                };
            }
        }
        Ok(())
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_params() -> Value {
        Value::Object(serde_json::Map::new())
    }

    #[test]
    fn default_policy_allows_everything() {
        let engine = PolicyEngine::empty();
        assert!(engine.evaluate("command", &no_params(), "web1", "prod").is_ok());
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = PolicyEngine::from_docs(vec![
            PolicyRuleDoc {
                id: "allow-ping".to_string(),
                module: Some("ping".to_string()),
                params: HashMap::new(),
                host: None,
                environment: None,
                action: PolicyAction::Allow,
                reason: None,
            },
            PolicyRuleDoc {
                id: "deny-all".to_string(),
                module: Some("*".to_string()),
                params: HashMap::new(),
                host: None,
                environment: None,
                action: PolicyAction::Deny,
                reason: Some("locked down".to_string()),
            },
        ])
        .unwrap();

        assert!(engine.evaluate("ping", &no_params(), "web1", "prod").is_ok());
        let err = engine.evaluate("command", &no_params(), "web1", "prod").unwrap_err();
        assert!(matches!(err, Error::PolicyDenied { .. }));
    }

    #[test]
    fn environment_predicate_scopes_a_rule() {
        let engine = PolicyEngine::from_docs(vec![PolicyRuleDoc {
            id: "prod-lockdown".to_string(),
            module: Some("command".to_string()),
            params: HashMap::new(),
            host: None,
            environment: Some("prod".to_string()),
            action: PolicyAction::Deny,
            reason: Some("no shell commands in prod".to_string()),
        }])
        .unwrap();

        assert!(engine.evaluate("command", &no_params(), "web1", "staging").is_ok());
        assert!(engine.evaluate("command", &no_params(), "web1", "prod").is_err());
    }

    #[test]
    fn param_predicate_scopes_a_rule_to_matching_values() {
        let engine = PolicyEngine::from_docs(vec![PolicyRuleDoc {
            id: "deny-rm".to_string(),
            module: Some("command".to_string()),
            params: HashMap::from([("cmd".to_string(), "rm *".to_string())]),
            host: None,
            environment: None,
            action: PolicyAction::Deny,
            reason: Some("no rm via command module".to_string()),
        }])
        .unwrap();

        let rm_params = Value::Object(serde_json::Map::from_iter([(
            "cmd".to_string(),
            Value::String("rm -rf /tmp/x".to_string()),
        )]));
        let ls_params = Value::Object(serde_json::Map::from_iter([(
            "cmd".to_string(),
            Value::String("ls -la".to_string()),
        )]));

        assert!(engine.evaluate("command", &rm_params, "web1", "prod").is_err());
        assert!(engine.evaluate("command", &ls_params, "web1", "prod").is_ok());
        assert!(engine.evaluate("command", &no_params(), "web1", "prod").is_ok());
    }
}
