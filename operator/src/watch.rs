//! Per-kind resource watchers feeding the event queue.
//!
//! Each watcher owns its own stream and pushes onto a single FIFO queue;
//! ordering is preserved within one kind only. Resources that fail to load
//! are logged and skipped so one bad manifest cannot stall the loop.

use appgate_operator_core::entity::{
    AppgateEntity, AppgateEvent, AppgateMetadata, EventOp, ManagedEntity,
};
use appgate_operator_core::projection::{EntityLoader, LoadError, View};
use appgate_operator_k8s_api as k8s;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use kube::runtime::watcher;
use kube::Resource;
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// A custom resource declaring one entity.
pub(crate) trait DeclaredEntity: Resource + Clone + std::fmt::Debug + Send + 'static {
    type Entity: ManagedEntity;

    fn spec_value(&self) -> Result<Value, serde_json::Error>;
}

impl DeclaredEntity for k8s::Condition {
    type Entity = appgate_operator_core::entity::Condition;

    fn spec_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.spec)
    }
}

impl DeclaredEntity for k8s::Entitlement {
    type Entity = appgate_operator_core::entity::Entitlement;

    fn spec_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.spec)
    }
}

impl DeclaredEntity for k8s::Policy {
    type Entity = appgate_operator_core::entity::Policy;

    fn spec_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.spec)
    }
}

/// Translates one kind's watch stream into queue events until the stream or
/// the queue closes.
pub(crate) async fn run<K: DeclaredEntity>(
    events: impl Stream<Item = watcher::Event<K>>,
    loader: EntityLoader,
    tx: UnboundedSender<AppgateEvent>,
) {
    tokio::pin!(events);
    let mut seen = HashSet::new();
    while let Some(event) = events.next().await {
        let sent = match event {
            watcher::Event::Applied(resource) => emit(&loader, &mut seen, &tx, &resource, false),
            watcher::Event::Deleted(resource) => emit(&loader, &mut seen, &tx, &resource, true),
            watcher::Event::Restarted(resources) => resources
                .iter()
                .all(|resource| emit(&loader, &mut seen, &tx, resource, false)),
        };
        if !sent {
            debug!("Event queue closed, stopping watch");
            return;
        }
    }
}

fn emit<K: DeclaredEntity>(
    loader: &EntityLoader,
    seen: &mut HashSet<String>,
    tx: &UnboundedSender<AppgateEvent>,
    resource: &K,
    deleted: bool,
) -> bool {
    let entity = match load_declared(loader, resource) {
        Ok(entity) => entity,
        Err(error) => {
            warn!(%error, "Failed to load declared entity, skipping event");
            return true;
        }
    };
    let name = entity.name().to_string();
    let op = if deleted {
        seen.remove(&name);
        EventOp::Deleted
    } else if seen.insert(name) {
        EventOp::Added
    } else {
        EventOp::Modified
    };
    tx.send(AppgateEvent {
        op,
        entity: entity.into(),
    })
    .is_ok()
}

fn load_declared<K: DeclaredEntity>(
    loader: &EntityLoader,
    resource: &K,
) -> Result<K::Entity, LoadError> {
    let raw = resource.spec_value()?;
    let metadata = desired_metadata(resource.meta());
    loader.load(raw, Some(metadata), View::Desired)
}

/// Captures the instance bookkeeping the projection layer needs from the
/// resource's Kubernetes metadata.
pub(crate) fn desired_metadata(meta: &k8s::ObjectMeta) -> AppgateMetadata {
    let generation = meta.generation.unwrap_or(1);
    let annotations = meta.annotations.clone().unwrap_or_default();
    let created = meta.creation_timestamp.as_ref().map(|t| t.0);
    let modified = annotations
        .get(k8s::MODIFICATION_ANNOTATION)
        .and_then(|v| v.parse::<DateTime<Utc>>().ok())
        .or(created);
    let latest_generation = annotations
        .get(k8s::LATEST_GENERATION_ANNOTATION)
        .and_then(|v| v.parse().ok())
        .unwrap_or(generation);
    AppgateMetadata {
        uuid: meta.uid.clone(),
        generation,
        latest_generation,
        created,
        modified,
        ..Default::default()
    }
}
