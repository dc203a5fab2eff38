//! Dual-view projection of entities.
//!
//! The same logical entity is loaded and dumped differently depending on
//! which side the raw data came from: the declared (desired-state) side
//! populates write-only fields and recomputes derived read-only fields,
//! while the remote side is trusted for read-only fields but never carries
//! write-only ones. Field behavior is driven by a static per-kind table
//! rather than runtime inspection.

use crate::entity::{AppgateEntity, AppgateMetadata};
use crate::secrets::{SecretsError, SecretsResolver};
use base64::Engine;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Which side of the reconciliation raw data belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum View {
    /// Data declared in the cluster: what the entity should look like.
    Desired,
    /// Data returned by the appliance: what the entity currently looks like.
    Remote,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Visibility {
    Plain,
    ReadOnly,
    WriteOnly,
}

/// Projection policy for a single wire field.
#[derive(Clone, Debug)]
pub struct FieldPolicy {
    pub name: &'static str,
    pub visibility: Visibility,
    pub secret: bool,
    pub checksum_of: Option<&'static str>,
    pub comparable: bool,
}

impl FieldPolicy {
    const fn new(name: &'static str, visibility: Visibility, comparable: bool) -> Self {
        Self {
            name,
            visibility,
            secret: false,
            checksum_of: None,
            comparable,
        }
    }

    /// An ordinary field, part of entity equality.
    pub const fn plain(name: &'static str) -> Self {
        Self::new(name, Visibility::Plain, true)
    }

    /// A field carried on the wire but excluded from equality, such as the
    /// remote-assigned identifier.
    pub const fn attribute(name: &'static str) -> Self {
        Self::new(name, Visibility::Plain, false)
    }

    /// A field only the remote side produces.
    pub const fn read_only(name: &'static str) -> Self {
        Self::new(name, Visibility::ReadOnly, false)
    }

    /// A field only the declared side produces.
    pub const fn write_only(name: &'static str) -> Self {
        Self::new(name, Visibility::WriteOnly, false)
    }

    /// A write-only password field, resolved through the secrets resolver.
    pub const fn secret(name: &'static str) -> Self {
        Self {
            name,
            visibility: Visibility::WriteOnly,
            secret: true,
            checksum_of: None,
            comparable: false,
        }
    }

    /// A read-only digest of another field. The declared side recomputes it
    /// from the source payload, so it stands in for the (incomparable)
    /// payload during equality checks.
    pub const fn checksum(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            visibility: Visibility::ReadOnly,
            secret: false,
            checksum_of: Some(source),
            comparable: true,
        }
    }
}

/// The projection policies for every wire field of one entity kind.
pub struct FieldTable(pub &'static [FieldPolicy]);

impl FieldTable {
    pub fn iter(&self) -> std::slice::Iter<'_, FieldPolicy> {
        self.0.iter()
    }
}

pub static CONDITION_FIELDS: FieldTable = FieldTable(&[
    FieldPolicy::attribute("id"),
    FieldPolicy::plain("name"),
    FieldPolicy::plain("tags"),
    FieldPolicy::plain("expression"),
    FieldPolicy::plain("repeatSchedules"),
    FieldPolicy::read_only("created"),
    FieldPolicy::read_only("updated"),
]);

pub static ENTITLEMENT_FIELDS: FieldTable = FieldTable(&[
    FieldPolicy::attribute("id"),
    FieldPolicy::plain("name"),
    FieldPolicy::plain("tags"),
    FieldPolicy::plain("site"),
    FieldPolicy::plain("conditions"),
    FieldPolicy::plain("conditionLogic"),
    FieldPolicy::plain("actions"),
    FieldPolicy::plain("appShortcut"),
    FieldPolicy::plain("disabled"),
    FieldPolicy::read_only("created"),
    FieldPolicy::read_only("updated"),
]);

pub static POLICY_FIELDS: FieldTable = FieldTable(&[
    FieldPolicy::attribute("id"),
    FieldPolicy::plain("name"),
    FieldPolicy::plain("tags"),
    FieldPolicy::plain("disabled"),
    FieldPolicy::plain("expression"),
    FieldPolicy::plain("entitlements"),
    FieldPolicy::read_only("created"),
    FieldPolicy::read_only("updated"),
]);

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("raw entity is not an object")]
    NotAnObject,
    #[error("checksum source field is not valid base64: {0}")]
    ChecksumSource(#[from] base64::DecodeError),
    #[error(transparent)]
    Secret(#[from] SecretsError),
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

/// Loads raw field maps into typed entities under a view, resolving secret
/// fields on the declared side.
#[derive(Clone, Default)]
pub struct EntityLoader {
    resolver: SecretsResolver,
}

impl EntityLoader {
    pub fn new(resolver: SecretsResolver) -> Self {
        Self { resolver }
    }

    pub fn load<T: AppgateEntity>(
        &self,
        raw: Value,
        metadata: Option<AppgateMetadata>,
        view: View,
    ) -> Result<T, LoadError> {
        let mut fields = match raw {
            Value::Object(fields) => fields,
            _ => return Err(LoadError::NotAnObject),
        };
        let mut metadata = metadata.unwrap_or_default();

        for policy in T::field_table().iter() {
            match (view, policy.visibility) {
                (View::Remote, Visibility::WriteOnly) => {
                    fields.remove(policy.name);
                }
                (View::Remote, _) => {}
                (View::Desired, Visibility::ReadOnly) => {
                    // Never trust an incoming read-only value; recompute it
                    // when it derives from another field.
                    fields.remove(policy.name);
                    if let Some(source) = policy.checksum_of {
                        if let Some(payload) = fields.get(source).and_then(Value::as_str) {
                            let digest = checksum(payload)?;
                            fields.insert(policy.name.to_string(), Value::String(digest));
                        }
                    }
                }
                (View::Desired, _) => {
                    if policy.secret {
                        if let Some(value) = fields.get(policy.name) {
                            metadata
                                .passwords
                                .insert(policy.name.to_string(), value.clone());
                            let resolved = self.resolver.resolve(value)?;
                            fields.insert(policy.name.to_string(), Value::String(resolved));
                        }
                    }
                }
            }
        }

        if view == View::Desired && !fields.contains_key("id") {
            let id = metadata
                .uuid
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            fields.insert("id".to_string(), Value::String(id));
        }

        let entity: T = serde_json::from_value(Value::Object(fields))?;
        Ok(entity.with_metadata(metadata))
    }
}

fn checksum(payload: &str) -> Result<String, base64::DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn to_fields<T: AppgateEntity>(entity: &T) -> Map<String, Value> {
    // Entities are plain field structs; they always serialize to objects.
    match serde_json::to_value(entity) {
        Ok(Value::Object(fields)) => fields,
        _ => Map::new(),
    }
}

/// Emits the fields valid for the target view. Read-only fields (checksums
/// included) are never dumped: they exist for local comparison bookkeeping
/// only. Secret fields are withheld from the remote view; see
/// [`dump_with_secrets`].
pub fn dump<T: AppgateEntity>(entity: &T, view: View) -> Map<String, Value> {
    dump_inner(entity, view, false)
}

/// Remote-view dump that keeps resolved secret fields. Used when submitting
/// writes to the appliance.
pub fn dump_with_secrets<T: AppgateEntity>(entity: &T) -> Map<String, Value> {
    dump_inner(entity, View::Remote, true)
}

fn dump_inner<T: AppgateEntity>(entity: &T, view: View, with_secrets: bool) -> Map<String, Value> {
    let fields = to_fields(entity);
    let mut out = Map::new();
    for policy in T::field_table().iter() {
        if policy.visibility == Visibility::ReadOnly {
            continue;
        }
        if policy.secret && view == View::Remote && !with_secrets {
            continue;
        }
        if let Some(value) = fields.get(policy.name) {
            if !value.is_null() {
                out.insert(policy.name.to_string(), value.clone());
            }
        }
    }
    out
}

/// Emits exactly the comparable fields; the projection compared by
/// [`entity_eq`] and shown when inspecting changes.
pub fn diff_dump<T: AppgateEntity>(entity: &T) -> Map<String, Value> {
    let fields = to_fields(entity);
    let mut out = Map::new();
    for policy in T::field_table().iter() {
        if !policy.comparable {
            continue;
        }
        if let Some(value) = fields.get(policy.name) {
            if !value.is_null() {
                out.insert(policy.name.to_string(), value.clone());
            }
        }
    }
    out
}

/// Compares two entities of the same kind by their comparable fields.
///
/// Secret payloads cannot be compared directly, so when one side carries
/// recorded password metadata its sync markers override a field-level match:
/// a declared generation the remote side has not acknowledged, or a
/// declared modification later than the remote update, reports the entities
/// unequal and forces a modify.
pub fn entity_eq<T: AppgateEntity>(a: &T, b: &T) -> bool {
    if diff_dump(a) != diff_dump(b) {
        return false;
    }
    in_sync(a, b) && in_sync(b, a)
}

fn in_sync<T: AppgateEntity>(declared: &T, remote: &T) -> bool {
    let metadata = declared.metadata();
    if metadata.passwords.is_empty() {
        return true;
    }
    let updated = match remote.updated() {
        Some(updated) => updated,
        None => return true,
    };
    if metadata.generation > metadata.latest_generation {
        return false;
    }
    match metadata.modified {
        Some(modified) => modified < updated,
        None => true,
    }
}
