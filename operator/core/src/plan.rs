//! Diffing of the remote state against the desired state.
//!
//! Entities are matched by name: declared entities carry no remote
//! identifier, so the id of the matching remote entity is injected before
//! any comparison or submission. Plans are ordered by referential
//! dependency; a plan carrying dangling references must not be applied.

use crate::entity::{AppgateEntity, Condition, Entitlement, Policy};
use crate::projection::entity_eq;
use crate::state::{AppgateState, EntitiesSet, RefErrors};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info};

/// The decision sets for one entity kind, keyed by entity name.
///
/// `share` holds entities that already match the remote copy; it is never
/// submitted, but its names count toward referential integrity.
#[derive(Clone, Debug)]
pub struct Plan<T> {
    pub create: BTreeMap<String, T>,
    pub modify: BTreeMap<String, T>,
    pub delete: BTreeMap<String, T>,
    pub share: BTreeMap<String, T>,
}

impl<T> Default for Plan<T> {
    fn default() -> Self {
        Self {
            create: BTreeMap::new(),
            modify: BTreeMap::new(),
            delete: BTreeMap::new(),
            share: BTreeMap::new(),
        }
    }
}

impl<T: AppgateEntity> Plan<T> {
    /// Names present in the system once this plan is applied.
    pub fn expected_names(&self) -> BTreeSet<&str> {
        self.create
            .keys()
            .chain(self.modify.keys())
            .chain(self.share.keys())
            .map(String::as_str)
            .collect()
    }

    pub fn needs_apply(&self) -> bool {
        !(self.create.is_empty() && self.modify.is_empty() && self.delete.is_empty())
    }

    fn log_summary(&self) {
        for name in self.create.keys() {
            info!("+ {name}");
        }
        for name in self.modify.keys() {
            info!("* {name}");
        }
        for name in self.delete.keys() {
            info!("- {name}");
        }
        for name in self.share.keys() {
            info!("= {name}");
        }
    }
}

/// Diffs two same-kind sets by name.
pub fn compare_entities<T: AppgateEntity>(
    current: &EntitiesSet<T>,
    expected: &EntitiesSet<T>,
) -> Plan<T> {
    let mut plan = Plan::default();

    for entity in current.iter() {
        if expected.get(entity.name()).is_none() && !entity.is_builtin() {
            plan.delete.insert(entity.name().to_string(), entity.clone());
        }
    }

    for entity in expected.iter() {
        match current.get(entity.name()) {
            None => {
                plan.create.insert(entity.name().to_string(), entity.clone());
            }
            Some(remote) => {
                let candidate = entity.clone().with_id(remote.id().map(str::to_string));
                if entity_eq(&candidate, remote) {
                    plan.share.insert(candidate.name().to_string(), candidate);
                } else {
                    plan.modify.insert(candidate.name().to_string(), candidate);
                }
            }
        }
    }

    plan
}

/// Collects references from the surviving entities of `plan` that the
/// referenced plan does not account for.
pub fn check_references<T, U>(
    plan: &Plan<T>,
    referenced: &Plan<U>,
    references: impl Fn(&T) -> &BTreeSet<String>,
) -> RefErrors
where
    T: AppgateEntity,
    U: AppgateEntity,
{
    let expected = referenced.expected_names();
    let mut errors = RefErrors::new();
    for entity in plan
        .create
        .values()
        .chain(plan.modify.values())
        .chain(plan.share.values())
    {
        for name in references(entity) {
            if !expected.contains(name.as_str()) {
                errors
                    .entry(entity.name().to_string())
                    .or_default()
                    .insert(name.clone());
            }
        }
    }
    errors
}

/// One plan per kind plus the referential-integrity error maps.
#[derive(Clone, Debug, Default)]
pub struct AppgatePlan {
    pub conditions: Plan<Condition>,
    pub entitlements: Plan<Entitlement>,
    pub policies: Plan<Policy>,
    pub entitlement_errors: RefErrors,
    pub policy_errors: RefErrors,
}

impl AppgatePlan {
    pub fn needs_apply(&self) -> bool {
        self.conditions.needs_apply()
            || self.entitlements.needs_apply()
            || self.policies.needs_apply()
    }

    pub fn has_errors(&self) -> bool {
        !self.entitlement_errors.is_empty() || !self.policy_errors.is_empty()
    }

    pub fn log_summary(&self) {
        info!("Plan summary:");
        info!("Conditions:");
        self.conditions.log_summary();
        info!("Entitlements:");
        self.entitlements.log_summary();
        info!("Policies:");
        self.policies.log_summary();
    }

    pub fn log_errors(&self) {
        for (entitlement, conditions) in &self.entitlement_errors {
            error!(
                %entitlement,
                "References conditions not defined in the system: {}",
                join(conditions)
            );
        }
        for (policy, entitlements) in &self.policy_errors {
            error!(
                %policy,
                "References entitlements not defined in the system: {}",
                join(entitlements)
            );
        }
    }
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn merge(errors: &mut RefErrors, other: RefErrors) {
    for (name, missing) in other {
        errors.entry(name).or_default().extend(missing);
    }
}

/// Builds the full plan in dependency order: conditions first, then
/// entitlements checked against the condition plan, then policies checked
/// against the entitlement plan. Pre-collected resolution conflicts merge
/// into the error maps.
pub fn create_appgate_plan(
    current: &AppgateState,
    expected: &AppgateState,
    entitlement_conflicts: RefErrors,
    policy_conflicts: RefErrors,
) -> AppgatePlan {
    let conditions = compare_entities(&current.conditions, &expected.conditions);
    let entitlements = compare_entities(&current.entitlements, &expected.entitlements);
    let mut entitlement_errors = check_references(&entitlements, &conditions, |e| &e.conditions);
    merge(&mut entitlement_errors, entitlement_conflicts);

    let policies = compare_entities(&current.policies, &expected.policies);
    let mut policy_errors = check_references(&policies, &entitlements, |p| &p.entitlements);
    merge(&mut policy_errors, policy_conflicts);

    AppgatePlan {
        conditions,
        entitlements,
        policies,
        entitlement_errors,
        policy_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{AppgateMetadata, EventOp};
    use std::collections::BTreeSet;

    fn policy(name: &str, id: Option<&str>, expression: &str) -> Policy {
        Policy {
            id: id.map(str::to_string),
            name: name.to_string(),
            tags: BTreeSet::new(),
            disabled: false,
            expression: expression.to_string(),
            entitlements: BTreeSet::new(),
            created: None,
            updated: None,
            appgate_metadata: AppgateMetadata::default(),
        }
    }

    fn condition(name: &str, id: Option<&str>) -> Condition {
        Condition {
            id: id.map(str::to_string),
            name: name.to_string(),
            tags: BTreeSet::new(),
            expression: "expression-test".to_string(),
            repeat_schedules: BTreeSet::new(),
            created: None,
            updated: None,
            appgate_metadata: AppgateMetadata::default(),
        }
    }

    fn entitlement(name: &str, conditions: &[&str]) -> Entitlement {
        Entitlement {
            id: None,
            name: name.to_string(),
            tags: BTreeSet::new(),
            site: "site-example".to_string(),
            conditions: conditions.iter().map(|c| c.to_string()).collect(),
            condition_logic: "and".to_string(),
            actions: Vec::new(),
            app_shortcut: None,
            disabled: false,
            created: None,
            updated: None,
            appgate_metadata: AppgateMetadata::default(),
        }
    }

    fn policies(entities: Vec<Policy>) -> EntitiesSet<Policy> {
        EntitiesSet::from_entities(entities)
    }

    #[test]
    fn everything_current_and_nothing_expected_is_deleted() {
        let current = policies(vec![
            policy("policy1", Some("id1"), "expression-1"),
            policy("policy2", Some("id2"), "expression-2"),
            policy("policy3", Some("id3"), "expression-3"),
        ]);
        let plan = compare_entities(&current, &policies(vec![]));
        let mut deleted: Vec<&str> = plan
            .delete
            .values()
            .filter_map(|p| p.id.as_deref())
            .collect();
        deleted.sort_unstable();
        assert_eq!(deleted, vec!["id1", "id2", "id3"]);
        assert!(plan.create.is_empty());
        assert!(plan.modify.is_empty());
        assert!(plan.share.is_empty());
    }

    #[test]
    fn everything_expected_and_nothing_current_is_created() {
        let expected = policies(vec![
            policy("policy1", None, "expression-1"),
            policy("policy2", None, "expression-2"),
            policy("policy3", None, "expression-3"),
        ]);
        let plan = compare_entities(&policies(vec![]), &expected);
        assert_eq!(
            plan.create.keys().collect::<Vec<_>>(),
            vec!["policy1", "policy2", "policy3"]
        );
        assert!(plan.modify.is_empty());
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn identical_sets_are_shared_with_ids_injected() {
        let current = policies(vec![
            policy("policy1", Some("id1"), "expression-1"),
            policy("policy2", Some("id2"), "expression-2"),
        ]);
        let expected = policies(vec![
            policy("policy1", None, "expression-1"),
            policy("policy2", None, "expression-2"),
        ]);
        let plan = compare_entities(&current, &expected);
        assert!(plan.create.is_empty());
        assert!(plan.modify.is_empty());
        assert!(plan.delete.is_empty());
        let mut shared_ids: Vec<&str> = plan
            .share
            .values()
            .filter_map(|p| p.id.as_deref())
            .collect();
        shared_ids.sort_unstable();
        assert_eq!(shared_ids, vec!["id1", "id2"]);
    }

    #[test]
    fn mixed_sets_split_into_create_modify_and_delete() {
        let current = policies(vec![
            policy("policy3", Some("id1"), "expression-1"),
            policy("policy2", Some("id2"), "expression-2"),
            policy("policy4", Some("id3"), "expression-3"),
        ]);
        let expected = policies(vec![
            policy("policy1", None, "expression-1"),
            policy("policy2", None, "expression-2"),
            policy("policy3", None, "expression-3"),
        ]);
        let plan = compare_entities(&current, &expected);
        assert_eq!(plan.create.keys().collect::<Vec<_>>(), vec!["policy1"]);
        assert_eq!(plan.share.keys().collect::<Vec<_>>(), vec!["policy2"]);
        // policy3 exists on both sides with a different expression: modified,
        // carrying the current id.
        assert_eq!(plan.modify.keys().collect::<Vec<_>>(), vec!["policy3"]);
        assert_eq!(plan.modify["policy3"].id.as_deref(), Some("id1"));
        assert_eq!(plan.delete.keys().collect::<Vec<_>>(), vec!["policy4"]);
    }

    #[test]
    fn builtin_entities_are_never_deleted() {
        let mut builtin = policy("builtin-policy", Some("id1"), "expression-1");
        builtin.tags.insert(crate::BUILTIN_TAG.to_string());
        let current = policies(vec![builtin, policy("policy2", Some("id2"), "x")]);
        let plan = compare_entities(&current, &policies(vec![]));
        assert_eq!(plan.delete.keys().collect::<Vec<_>>(), vec!["policy2"]);
    }

    #[test]
    fn modified_entity_carries_the_current_id() {
        let current = policies(vec![policy("n", Some("1"), "field-a-1")]);
        let expected = policies(vec![policy("n", None, "field-a-2")]);
        let plan = compare_entities(&current, &expected);
        assert!(plan.create.is_empty());
        assert!(plan.delete.is_empty());
        assert!(plan.share.is_empty());
        let modified = &plan.modify["n"];
        assert_eq!(modified.id.as_deref(), Some("1"));
        assert_eq!(modified.expression, "field-a-2");
    }

    #[test]
    fn dangling_references_are_collected() {
        let entitlements = Plan::<Entitlement> {
            create: [(
                "e1".to_string(),
                entitlement("e1", &["cond-missing"]),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let conditions = Plan::<Condition> {
            share: [("cond-1".to_string(), condition("cond-1", Some("c1")))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let errors = check_references(&entitlements, &conditions, |e| &e.conditions);
        assert_eq!(
            errors.get("e1").unwrap(),
            &["cond-missing".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn full_plan_wires_reference_checks_in_dependency_order() {
        let mut current = AppgateState::default();
        current.with_entity(condition("cond-1", Some("c1")).into(), EventOp::Added);

        let mut expected = AppgateState::default();
        expected.with_entity(condition("cond-1", None).into(), EventOp::Added);
        expected.with_entity(
            entitlement("e1", &["cond-1", "cond-missing"]).into(),
            EventOp::Added,
        );

        let plan = create_appgate_plan(&current, &expected, RefErrors::new(), RefErrors::new());
        assert!(plan.has_errors());
        assert!(plan.needs_apply());
        assert_eq!(
            plan.entitlement_errors.get("e1").unwrap(),
            &["cond-missing".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn unchanged_states_need_no_apply() {
        let mut current = AppgateState::default();
        current.with_entity(condition("cond-1", Some("c1")).into(), EventOp::Added);
        let expected = current.clone();
        let plan = create_appgate_plan(&current, &expected, RefErrors::new(), RefErrors::new());
        assert!(!plan.needs_apply());
        assert!(!plan.has_errors());
        assert_eq!(plan.conditions.share.len(), 1);
    }
}
