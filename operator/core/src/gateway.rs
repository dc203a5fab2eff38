use crate::entity::{AnyEntity, Kind};
use thiserror::Error;

/// Errors at the appliance network boundary.
///
/// All of these are fatal to the control loop: the process restarts and
/// replays from the watch streams rather than reconcile against partially
/// known state.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication with the controller failed: {0}")]
    Authentication(#[source] anyhow::Error),
    #[error("failed to fetch {kind} entities: {source}")]
    Fetch {
        kind: Kind,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to {verb} {kind} {name}: {source}")]
    Apply {
        verb: &'static str,
        kind: Kind,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// The remote access-control appliance.
///
/// Callers enforce the apply ordering: conditions, entitlements, policies,
/// reversed for deletion.
#[async_trait::async_trait]
pub trait RemoteStateGateway: Send + Sync {
    async fn login(&self) -> Result<(), GatewayError>;

    async fn fetch(&self, kind: Kind) -> Result<Vec<AnyEntity>, GatewayError>;

    /// Submits a new entity; returns the persisted copy.
    async fn create(&self, entity: &AnyEntity) -> Result<AnyEntity, GatewayError>;

    /// Replaces the remote entity sharing the submitted entity's id; returns
    /// the persisted copy.
    async fn update(&self, entity: &AnyEntity) -> Result<AnyEntity, GatewayError>;

    async fn delete(&self, entity: &AnyEntity) -> Result<(), GatewayError>;
}
