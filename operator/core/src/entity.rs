use crate::projection::{self, FieldTable};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The entity kinds managed by the operator, in referential dependency
/// order: entitlements reference conditions and policies reference
/// entitlements, so conditions always go first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Condition,
    Entitlement,
    Policy,
}

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Condition, Kind::Entitlement, Kind::Policy];
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Condition => "Condition".fmt(f),
            Kind::Entitlement => "Entitlement".fmt(f),
            Kind::Policy => "Policy".fmt(f),
        }
    }
}

/// Per-instance bookkeeping captured from the declared resource. It is never
/// dumped and never compared directly; recorded secret payloads feed the
/// staleness override in [`crate::projection::entity_eq`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppgateMetadata {
    pub uuid: Option<String>,
    pub generation: i64,
    #[serde(rename = "latestGeneration")]
    pub latest_generation: i64,
    #[serde(rename = "creationTimestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "modificationTimestamp")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub passwords: BTreeMap<String, Value>,
}

impl Default for AppgateMetadata {
    fn default() -> Self {
        Self {
            uuid: None,
            generation: 1,
            latest_generation: 1,
            created: None,
            modified: None,
            passwords: BTreeMap::new(),
        }
    }
}

/// A typed entity that can be projected between the declared and remote
/// views. Instances are immutable values: the `with_*` constructors return
/// updated copies.
pub trait AppgateEntity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn field_table() -> &'static FieldTable;

    /// The stable business key. Unique per kind; this is not the identifier.
    fn name(&self) -> &str;

    /// The remote-assigned identifier, absent on freshly declared entities.
    fn id(&self) -> Option<&str>;

    fn with_id(self, id: Option<String>) -> Self;

    fn tags(&self) -> &BTreeSet<String>;

    /// The remote modification timestamp, absent on declared entities.
    fn updated(&self) -> Option<DateTime<Utc>>;

    fn metadata(&self) -> &AppgateMetadata;

    fn with_metadata(self, metadata: AppgateMetadata) -> Self;

    fn is_builtin(&self) -> bool {
        self.tags().contains(crate::BUILTIN_TAG)
    }
}

/// An [`AppgateEntity`] of one of the three managed kinds, convertible to and
/// from [`AnyEntity`].
pub trait ManagedEntity: AppgateEntity + Into<AnyEntity> {
    fn kind() -> Kind;

    fn from_any(entity: AnyEntity) -> Option<Self>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub expression: String,
    #[serde(default)]
    pub repeat_schedules: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub appgate_metadata: AppgateMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementAction {
    pub subtype: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<String>,
    #[serde(default)]
    pub hosts: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppShortcut {
    pub name: String,
    pub url: String,
    pub color_mode: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub site: String,
    /// Names of the conditions guarding this entitlement.
    #[serde(default)]
    pub conditions: BTreeSet<String>,
    #[serde(default = "default_condition_logic")]
    pub condition_logic: String,
    #[serde(default)]
    pub actions: Vec<EntitlementAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_shortcut: Option<AppShortcut>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub appgate_metadata: AppgateMetadata,
}

fn default_condition_logic() -> String {
    "and".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub disabled: bool,
    pub expression: String,
    /// Names of the entitlements granted by this policy.
    #[serde(default)]
    pub entitlements: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub appgate_metadata: AppgateMetadata,
}

macro_rules! impl_entity {
    ($entity:ty, $kind:expr, $table:expr, $variant:ident) => {
        impl AppgateEntity for $entity {
            fn field_table() -> &'static FieldTable {
                $table
            }

            fn name(&self) -> &str {
                &self.name
            }

            fn id(&self) -> Option<&str> {
                self.id.as_deref()
            }

            fn with_id(self, id: Option<String>) -> Self {
                Self { id, ..self }
            }

            fn tags(&self) -> &BTreeSet<String> {
                &self.tags
            }

            fn updated(&self) -> Option<DateTime<Utc>> {
                self.updated
            }

            fn metadata(&self) -> &AppgateMetadata {
                &self.appgate_metadata
            }

            fn with_metadata(self, appgate_metadata: AppgateMetadata) -> Self {
                Self {
                    appgate_metadata,
                    ..self
                }
            }
        }

        impl ManagedEntity for $entity {
            fn kind() -> Kind {
                $kind
            }

            fn from_any(entity: AnyEntity) -> Option<Self> {
                match entity {
                    AnyEntity::$variant(entity) => Some(entity),
                    _ => None,
                }
            }
        }

        impl From<$entity> for AnyEntity {
            fn from(entity: $entity) -> Self {
                AnyEntity::$variant(entity)
            }
        }
    };
}

impl_entity!(
    Condition,
    Kind::Condition,
    &projection::CONDITION_FIELDS,
    Condition
);
impl_entity!(
    Entitlement,
    Kind::Entitlement,
    &projection::ENTITLEMENT_FIELDS,
    Entitlement
);
impl_entity!(Policy, Kind::Policy, &projection::POLICY_FIELDS, Policy);

/// An entity of any managed kind, as carried by events and the remote
/// gateway.
#[derive(Clone, Debug)]
pub enum AnyEntity {
    Condition(Condition),
    Entitlement(Entitlement),
    Policy(Policy),
}

impl AnyEntity {
    pub fn kind(&self) -> Kind {
        match self {
            AnyEntity::Condition(_) => Kind::Condition,
            AnyEntity::Entitlement(_) => Kind::Entitlement,
            AnyEntity::Policy(_) => Kind::Policy,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AnyEntity::Condition(c) => &c.name,
            AnyEntity::Entitlement(e) => &e.name,
            AnyEntity::Policy(p) => &p.name,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            AnyEntity::Condition(c) => c.id.as_deref(),
            AnyEntity::Entitlement(e) => e.id.as_deref(),
            AnyEntity::Policy(p) => p.id.as_deref(),
        }
    }
}

/// A watch notification for one declared entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventOp {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventOp::Added => "ADDED".fmt(f),
            EventOp::Modified => "MODIFIED".fmt(f),
            EventOp::Deleted => "DELETED".fmt(f),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppgateEvent {
    pub op: EventOp,
    pub entity: AnyEntity,
}
