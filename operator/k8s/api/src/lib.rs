#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The custom resources declaring desired security-policy entities.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::{Client, Resource, ResourceExt};

pub const API_GROUP: &str = "beta.appgate.com";
pub const API_VERSION: &str = "v1";

/// Annotation recording the newest declared generation the controller has
/// acknowledged.
pub const LATEST_GENERATION_ANNOTATION: &str = "beta.appgate.com/latest-generation";

/// Annotation recording when the declared spec last changed.
pub const MODIFICATION_ANNOTATION: &str = "beta.appgate.com/modification-timestamp";

/// A boolean expression evaluated when a client claims an entitlement.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "beta.appgate.com",
    version = "v1",
    kind = "Condition",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub expression: String,
    #[serde(default)]
    pub repeat_schedules: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementAction {
    pub subtype: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<String>,
    #[serde(default)]
    pub hosts: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppShortcut {
    pub name: String,
    pub url: String,
    pub color_mode: String,
}

/// Access to a site's resources, guarded by named conditions.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "beta.appgate.com",
    version = "v1",
    kind = "Entitlement",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSpec {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub site: String,
    #[serde(default)]
    pub conditions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_logic: Option<String>,
    #[serde(default)]
    pub actions: Vec<EntitlementAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_shortcut: Option<AppShortcut>,
    #[serde(default)]
    pub disabled: bool,
}

/// Grants named entitlements to the clients matched by its expression.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "beta.appgate.com", version = "v1", kind = "Policy", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub disabled: bool,
    pub expression: String,
    #[serde(default)]
    pub entitlements: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_manifest_deserializes() {
        let condition: Condition = serde_yaml::from_str(
            r#"
            apiVersion: beta.appgate.com/v1
            kind: Condition
            metadata:
              name: condition-1
            spec:
              name: condition-1
              expression: return true;
              tags: [api-created]
            "#,
        )
        .unwrap();
        assert_eq!(condition.spec.name, "condition-1");
        assert!(condition.spec.tags.contains("api-created"));
        assert!(condition.spec.repeat_schedules.is_empty());
    }

    #[test]
    fn entitlement_spec_defaults_are_lenient() {
        let spec: EntitlementSpec = serde_json::from_value(serde_json::json!({
            "name": "entitlement-1",
            "site": "site-1",
        }))
        .unwrap();
        assert!(spec.conditions.is_empty());
        assert_eq!(spec.condition_logic, None);
        assert!(!spec.disabled);
    }
}
