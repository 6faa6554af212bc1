//! Quarantine configuration and bridge policy.
//!
//! [`QuarantineConfig`] is what a payload passes to `quarantine()`: which
//! host globals to override and which sandbox to run in.  [`BridgePolicy`]
//! holds the fixed tables the realm initializer and the global wrapper use.
//! Both deserialize from JSON with `serde_json`; every field has a default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::QuarantineError;
use crate::object_model::JsValue;
use crate::realm::HOST_METRICS;

/// Sandbox name used when a caller does not supply one.
pub const DEFAULT_SANDBOX_NAME: &str = "default";

/// Message of the configuration error raised for non-function overrides.
pub const ONLY_FUNCTIONS_MESSAGE: &str = "Quarantiner :: Only functions supported for now";

fn default_sandbox_name() -> String {
    DEFAULT_SANDBOX_NAME.to_string()
}

/// Declared type of an overridden global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalKind {
    Function,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDeclaration {
    #[serde(rename = "type")]
    pub kind: GlobalKind,
}

impl GlobalDeclaration {
    pub fn function() -> Self {
        Self {
            kind: GlobalKind::Function,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineConfig {
    #[serde(default)]
    pub globals: BTreeMap<String, GlobalDeclaration>,
    #[serde(default = "default_sandbox_name")]
    pub sandbox: String,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            globals: BTreeMap::new(),
            sandbox: default_sandbox_name(),
        }
    }
}

impl QuarantineConfig {
    /// Config for `sandbox` overriding each of `functions`.
    pub fn with_functions(sandbox: &str, functions: &[&str]) -> Self {
        Self {
            globals: functions
                .iter()
                .map(|name| (name.to_string(), GlobalDeclaration::function()))
                .collect(),
            sandbox: sandbox.to_string(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, QuarantineError> {
        serde_json::from_str(json).map_err(|err| QuarantineError::configuration(err.to_string()))
    }

    /// Read a config object handed over by script code.  `null` and
    /// `undefined` mean "all defaults".
    pub fn from_script_value(agent: &mut Agent, value: &JsValue) -> Result<Self, QuarantineError> {
        if value.is_nullish() {
            return Ok(Self::default());
        }
        let json = agent.value_to_json(value)?;
        serde_json::from_value(json).map_err(|err| QuarantineError::configuration(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), QuarantineError> {
        if self.sandbox.trim().is_empty() {
            return Err(QuarantineError::configuration(
                "Quarantiner :: Sandbox name must not be empty",
            ));
        }
        if self
            .globals
            .values()
            .any(|declaration| declaration.kind != GlobalKind::Function)
        {
            return Err(QuarantineError::configuration(ONLY_FUNCTIONS_MESSAGE));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BridgePolicy
// ---------------------------------------------------------------------------

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Fixed tables consulted when a realm is initialised and when the isolated
/// global is read through its wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgePolicy {
    /// Platform classes whose instances are capability objects.
    pub capability_classes: Vec<String>,
    /// Isolated constructors replaced on the isolated global by their
    /// bridge wrapper, so instances they create are bridged too.
    pub bom_classes: Vec<String>,
    /// Isolated globals served isolated-native through the global wrapper.
    pub global_overrides: Vec<String>,
    /// Globals always read live from the host window.
    pub host_metrics: Vec<String>,
    /// Host constructors the isolated realm sees as its own.
    pub host_redirects: Vec<String>,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self {
            capability_classes: names(&[
                "EventTarget",
                "Event",
                "HTMLAllCollection",
                "HTMLCollection",
                "HTMLFormControlsCollection",
                "NodeList",
                "Node",
                "MutationObserver",
                "MutationRecord",
            ]),
            bom_classes: names(&["MutationObserver"]),
            global_overrides: names(&[
                "Object",
                "Array",
                "Boolean",
                "Number",
                "String",
                "Function",
                "Error",
                "parseInt",
                "setTimeout",
            ]),
            host_metrics: HOST_METRICS.iter().map(|(name, _)| name.to_string()).collect(),
            host_redirects: names(&["Array", "Boolean", "Number", "Object", "String"]),
        }
    }
}

impl BridgePolicy {
    pub fn from_json(json: &str) -> Result<Self, QuarantineError> {
        serde_json::from_str(json).map_err(|err| QuarantineError::configuration(err.to_string()))
    }

    pub fn is_host_metric(&self, name: &str) -> bool {
        self.host_metrics.iter().any(|m| m == name)
    }

    /// Capability classes plus BOM classes, deduplicated, in declaration
    /// order.
    pub fn all_capability_classes(&self) -> Vec<String> {
        let mut all = self.capability_classes.clone();
        for class in &self.bom_classes {
            if !all.contains(class) {
                all.push(class.clone());
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // QuarantineConfig
    // -----------------------------------------------------------------------

    #[test]
    fn empty_json_gives_defaults() {
        let config = QuarantineConfig::from_json("{}").unwrap();
        assert_eq!(config, QuarantineConfig::default());
        assert_eq!(config.sandbox, DEFAULT_SANDBOX_NAME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn function_globals_parse_and_validate() {
        let config = QuarantineConfig::from_json(
            r#"{"globals": {"foo": {"type": "function"}, "bar": {"type": "function"}}, "sandbox": "ads"}"#,
        )
        .unwrap();
        assert_eq!(config, QuarantineConfig::with_functions("ads", &["bar", "foo"]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn object_globals_are_rejected() {
        let config =
            QuarantineConfig::from_json(r#"{"globals": {"foo": {"type": "object"}}}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err, QuarantineError::configuration(ONLY_FUNCTIONS_MESSAGE));
        assert_eq!(err.error_code(), "QR-CONFIG-0001");
    }

    #[test]
    fn unknown_global_type_is_a_configuration_error() {
        let err = QuarantineConfig::from_json(r#"{"globals": {"foo": {"type": "number"}}}"#)
            .unwrap_err();
        assert!(matches!(err, QuarantineError::Configuration(_)));
    }

    #[test]
    fn empty_sandbox_name_is_rejected() {
        let config = QuarantineConfig::with_functions(" ", &[]);
        assert!(matches!(
            config.validate(),
            Err(QuarantineError::Configuration(_))
        ));
    }

    #[test]
    fn script_objects_convert_to_config() {
        let mut agent = Agent::new();
        let realm = agent.host_realm();
        let value = agent
            .value_from_json(
                realm,
                &serde_json::json!({"globals": {"track": {"type": "function"}}, "sandbox": "metrics"}),
            )
            .unwrap();
        let config = QuarantineConfig::from_script_value(&mut agent, &value).unwrap();
        assert_eq!(config, QuarantineConfig::with_functions("metrics", &["track"]));
        let defaults = QuarantineConfig::from_script_value(&mut agent, &JsValue::Undefined).unwrap();
        assert_eq!(defaults, QuarantineConfig::default());
    }

    // -----------------------------------------------------------------------
    // BridgePolicy
    // -----------------------------------------------------------------------

    #[test]
    fn policy_defaults_and_partial_json() {
        let policy = BridgePolicy::default();
        assert!(policy.is_host_metric("innerWidth"));
        assert!(!policy.is_host_metric("name"));
        assert_eq!(policy.host_redirects.len(), 5);

        let custom = BridgePolicy::from_json(r#"{"host_metrics": ["innerWidth"]}"#).unwrap();
        assert_eq!(custom.host_metrics, vec!["innerWidth".to_string()]);
        assert_eq!(custom.global_overrides, policy.global_overrides);
    }

    #[test]
    fn all_capability_classes_deduplicates_bom_classes() {
        let policy = BridgePolicy::default();
        let all = policy.all_capability_classes();
        assert_eq!(
            all.iter().filter(|c| c.as_str() == "MutationObserver").count(),
            1
        );
        assert_eq!(all.len(), policy.capability_classes.len());
    }
}
