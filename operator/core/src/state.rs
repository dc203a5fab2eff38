//! The entity collections tracked by the operator.
//!
//! Two live states exist at any time: the last known remote truth and the
//! desired state accumulated from watch events. Both are plain values; the
//! control loop is the single writer.

use crate::entity::{AnyEntity, AppgateEntity, Condition, Entitlement, EventOp, Kind, Policy};
use crate::projection::{self, entity_eq, View};
use ahash::AHashMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Dangling references, keyed by the referencing entity's name.
pub type RefErrors = BTreeMap<String, BTreeSet<String>>;

/// A set of entities of one kind.
///
/// The name is the durable business key and the primary index; the
/// remote-assigned id is kept as a secondary index so modification events
/// can find an entry across renames.
#[derive(Clone, Debug)]
pub struct EntitiesSet<T> {
    by_name: BTreeMap<String, T>,
    by_id: AHashMap<String, String>,
}

impl<T> Default for EntitiesSet<T> {
    fn default() -> Self {
        Self {
            by_name: BTreeMap::new(),
            by_id: AHashMap::new(),
        }
    }
}

impl<T: AppgateEntity> EntitiesSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: impl IntoIterator<Item = T>) -> Self {
        let mut set = Self::new();
        for entity in entities {
            set.insert(entity);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Iterates in name order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.by_name.values()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.by_name.get(name)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&T> {
        self.by_id.get(id).and_then(|name| self.by_name.get(name))
    }

    pub fn insert(&mut self, entity: T) {
        if let Some(prev) = self.by_name.get(entity.name()) {
            if let Some(id) = prev.id() {
                self.by_id.remove(id);
            }
        }
        if let Some(id) = entity.id() {
            self.by_id.insert(id.to_string(), entity.name().to_string());
        }
        self.by_name.insert(entity.name().to_string(), entity);
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        let entity = self.by_name.remove(name)?;
        if let Some(id) = entity.id() {
            self.by_id.remove(id);
        }
        Some(entity)
    }

    fn remove_by_id(&mut self, id: &str) -> Option<T> {
        let name = self.by_id.remove(id)?;
        self.by_name.remove(&name)
    }

    /// Applies one watch event to the set.
    pub fn apply(&mut self, entity: T, op: EventOp) {
        match op {
            EventOp::Added => self.insert(entity),
            EventOp::Deleted => {
                let matched = self
                    .by_name
                    .get(entity.name())
                    .map(|existing| entity_eq(existing, &entity));
                match matched {
                    Some(true) => {
                        self.remove(entity.name());
                    }
                    Some(false) => warn!(
                        name = %entity.name(),
                        "Ignoring delete: stored entity does not match the deleted one"
                    ),
                    None => {
                        debug!(name = %entity.name(), "Ignoring delete for an unknown entity")
                    }
                }
            }
            EventOp::Modified => {
                // Identity is the remote id when present; a declared entity
                // without one is keyed by name, which insert replaces.
                if let Some(id) = entity.id().map(str::to_string) {
                    self.remove_by_id(&id);
                }
                self.insert(entity);
            }
        }
    }

    /// The subset of entities exempt from deletion.
    pub fn builtin_only(&self) -> Self {
        Self::from_entities(self.iter().filter(|e| e.is_builtin()).cloned())
    }
}

/// The three entity collections.
#[derive(Clone, Debug, Default)]
pub struct AppgateState {
    pub conditions: EntitiesSet<Condition>,
    pub entitlements: EntitiesSet<Entitlement>,
    pub policies: EntitiesSet<Policy>,
}

impl AppgateState {
    pub fn with_entity(&mut self, entity: AnyEntity, op: EventOp) {
        match entity {
            AnyEntity::Condition(condition) => self.conditions.apply(condition, op),
            AnyEntity::Entitlement(entitlement) => self.entitlements.apply(entitlement, op),
            AnyEntity::Policy(policy) => self.policies.apply(policy, op),
        }
    }

    pub fn builtin_only(&self) -> Self {
        Self {
            conditions: self.conditions.builtin_only(),
            entitlements: self.entitlements.builtin_only(),
            policies: self.policies.builtin_only(),
        }
    }

    /// Validates the cross-entity reference sets against this state,
    /// returning dangling entitlement→condition and policy→entitlement
    /// references.
    pub fn resolve_references(&self) -> (RefErrors, RefErrors) {
        let mut entitlement_conflicts = RefErrors::new();
        for entitlement in self.entitlements.iter() {
            let missing: BTreeSet<String> = entitlement
                .conditions
                .iter()
                .filter(|name| self.conditions.get(name).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                entitlement_conflicts.insert(entitlement.name.clone(), missing);
            }
        }

        let mut policy_conflicts = RefErrors::new();
        for policy in self.policies.iter() {
            let missing: BTreeSet<String> = policy
                .entitlements
                .iter()
                .filter(|name| self.entitlements.get(name).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                policy_conflicts.insert(policy.name.clone(), missing);
            }
        }

        (entitlement_conflicts, policy_conflicts)
    }

    /// Serializes the declared view of every collection, one YAML document
    /// per kind.
    pub fn dump_documents(&self) -> Result<Vec<(Kind, String)>, serde_yaml::Error> {
        fn document<T: AppgateEntity>(set: &EntitiesSet<T>) -> Result<String, serde_yaml::Error> {
            let entities: Vec<Value> = set
                .iter()
                .map(|e| Value::Object(projection::dump(e, View::Desired)))
                .collect();
            serde_yaml::to_string(&entities)
        }

        Ok(vec![
            (Kind::Condition, document(&self.conditions)?),
            (Kind::Entitlement, document(&self.entitlements)?),
            (Kind::Policy, document(&self.policies)?),
        ])
    }
}
