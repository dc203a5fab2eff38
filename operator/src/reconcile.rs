//! The reconciliation loop.
//!
//! One loop instance manages one namespace. It accumulates desired state
//! from the event queue and, whenever the queue stays quiet for the debounce
//! window, diffs it against the remote state and applies the resulting plan.
//! Errors at the network boundary abort the loop: the process restarts and
//! replays from the watch streams rather than retry in place.

use appgate_operator_core::entity::{AnyEntity, AppgateEvent, EventOp, Kind, ManagedEntity};
use appgate_operator_core::gateway::{GatewayError, RemoteStateGateway};
use appgate_operator_core::plan::{create_appgate_plan, AppgatePlan, Plan};
use appgate_operator_core::state::{AppgateState, EntitiesSet};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time;
use tracing::{error, info, warn};

/// Options governing one loop instance.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub namespace: String,
    /// Queue quiescence window; reconciliation runs when it elapses.
    pub debounce: Duration,
    /// Compute and log plans without submitting them.
    pub dry_run: bool,
    /// Start from a builtin-only expected state instead of a copy of the
    /// remote state.
    pub cleanup: bool,
    /// Refresh the remote state before every reconciliation to pick up
    /// drift made outside this operator.
    pub two_way_sync: bool,
}

pub(crate) struct ControlLoop<G> {
    settings: Settings,
    gateway: G,
    events: UnboundedReceiver<AppgateEvent>,
}

impl<G: RemoteStateGateway> ControlLoop<G> {
    pub(crate) fn new(
        settings: Settings,
        gateway: G,
        events: UnboundedReceiver<AppgateEvent>,
    ) -> Self {
        Self {
            settings,
            gateway,
            events,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), GatewayError> {
        let namespace = self.settings.namespace.clone();
        info!(%namespace, "Fetching current state from the controller");
        self.gateway.login().await?;
        let mut current = fetch_state(&self.gateway).await?;
        let mut expected = if self.settings.cleanup {
            current.builtin_only()
        } else {
            current.clone()
        };

        info!(%namespace, "Ready to process events");
        loop {
            match time::timeout(self.settings.debounce, self.events.recv()).await {
                Ok(Some(AppgateEvent { op, entity })) => {
                    info!(
                        %namespace,
                        %op,
                        kind = %entity.kind(),
                        name = %entity.name(),
                        "Event received"
                    );
                    expected.with_entity(entity, op);
                }
                Ok(None) => {
                    // Watchers are gone; settle outstanding work and stop.
                    self.reconcile(&mut current, &expected).await?;
                    return Ok(());
                }
                Err(_) => self.reconcile(&mut current, &expected).await?,
            }
        }
    }

    async fn reconcile(
        &self,
        current: &mut AppgateState,
        expected: &AppgateState,
    ) -> Result<(), GatewayError> {
        let namespace = self.settings.namespace.as_str();
        if self.settings.two_way_sync {
            *current = fetch_state(&self.gateway).await?;
        }

        let (entitlement_conflicts, policy_conflicts) = expected.resolve_references();
        let plan = create_appgate_plan(current, expected, entitlement_conflicts, policy_conflicts);
        if plan.has_errors() {
            error!(%namespace, "Expected state has dangling references, the plan will not be applied");
            plan.log_errors();
            return Ok(());
        }
        if !plan.needs_apply() {
            info!(%namespace, "Nothing changed, keeping watching");
            return Ok(());
        }

        plan.log_summary();
        if self.settings.dry_run {
            warn!(%namespace, "Running in dry-run mode, nothing will be applied");
            return Ok(());
        }

        self.gateway.login().await?;
        *current = self.apply(&plan, current).await?;
        Ok(())
    }

    /// Applies the actionable sets, returning the post-apply remote truth.
    /// Deletes run against the most dependent kind first; creates and
    /// modifies follow the referential dependency order.
    async fn apply(
        &self,
        plan: &AppgatePlan,
        current: &AppgateState,
    ) -> Result<AppgateState, GatewayError> {
        let mut next = current.clone();

        self.delete_kind(&plan.policies, &mut next.policies).await?;
        self.delete_kind(&plan.entitlements, &mut next.entitlements)
            .await?;
        self.delete_kind(&plan.conditions, &mut next.conditions)
            .await?;

        self.submit_kind(&plan.conditions, &mut next.conditions)
            .await?;
        self.submit_kind(&plan.entitlements, &mut next.entitlements)
            .await?;
        self.submit_kind(&plan.policies, &mut next.policies).await?;

        Ok(next)
    }

    async fn delete_kind<T: ManagedEntity>(
        &self,
        plan: &Plan<T>,
        set: &mut EntitiesSet<T>,
    ) -> Result<(), GatewayError> {
        for entity in plan.delete.values() {
            self.gateway.delete(&entity.clone().into()).await?;
            set.remove(entity.name());
        }
        Ok(())
    }

    async fn submit_kind<T: ManagedEntity>(
        &self,
        plan: &Plan<T>,
        set: &mut EntitiesSet<T>,
    ) -> Result<(), GatewayError> {
        for entity in plan.create.values() {
            let persisted = self.gateway.create(&entity.clone().into()).await?;
            set.insert(downcast(entity, persisted)?);
        }
        for entity in plan.modify.values() {
            let persisted = self.gateway.update(&entity.clone().into()).await?;
            set.insert(downcast(entity, persisted)?);
        }
        Ok(())
    }
}

fn downcast<T: ManagedEntity>(submitted: &T, persisted: AnyEntity) -> Result<T, GatewayError> {
    T::from_any(persisted).ok_or_else(|| GatewayError::Apply {
        verb: "persist",
        kind: T::kind(),
        name: submitted.name().to_string(),
        source: anyhow::anyhow!("controller returned an entity of a different kind"),
    })
}

pub(crate) async fn fetch_state<G: RemoteStateGateway>(
    gateway: &G,
) -> Result<AppgateState, GatewayError> {
    let mut state = AppgateState::default();
    for kind in Kind::ALL {
        for entity in gateway.fetch(kind).await? {
            state.with_entity(entity, EventOp::Added);
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use appgate_operator_core::entity::{AppgateMetadata, Condition, Entitlement, Policy};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct MockGateway {
        calls: Arc<Mutex<Vec<String>>>,
        remote: Arc<Mutex<AppgateState>>,
    }

    impl MockGateway {
        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait::async_trait]
    impl RemoteStateGateway for MockGateway {
        async fn login(&self) -> Result<(), GatewayError> {
            self.record("login".to_string());
            Ok(())
        }

        async fn fetch(&self, kind: Kind) -> Result<Vec<AnyEntity>, GatewayError> {
            self.record(format!("fetch {kind}"));
            let remote = self.remote.lock();
            Ok(match kind {
                Kind::Condition => remote.conditions.iter().cloned().map(Into::into).collect(),
                Kind::Entitlement => {
                    remote.entitlements.iter().cloned().map(Into::into).collect()
                }
                Kind::Policy => remote.policies.iter().cloned().map(Into::into).collect(),
            })
        }

        async fn create(&self, entity: &AnyEntity) -> Result<AnyEntity, GatewayError> {
            self.record(format!("create {} {}", entity.kind(), entity.name()));
            self.remote
                .lock()
                .with_entity(entity.clone(), EventOp::Added);
            Ok(entity.clone())
        }

        async fn update(&self, entity: &AnyEntity) -> Result<AnyEntity, GatewayError> {
            self.record(format!(
                "update {} {} {}",
                entity.kind(),
                entity.name(),
                entity.id().unwrap_or("-")
            ));
            self.remote
                .lock()
                .with_entity(entity.clone(), EventOp::Modified);
            Ok(entity.clone())
        }

        async fn delete(&self, entity: &AnyEntity) -> Result<(), GatewayError> {
            self.record(format!("delete {} {}", entity.kind(), entity.name()));
            Ok(())
        }
    }

    fn settings(dry_run: bool, cleanup: bool) -> Settings {
        Settings {
            namespace: "ns".to_string(),
            debounce: Duration::from_millis(10),
            dry_run,
            cleanup,
            two_way_sync: false,
        }
    }

    fn condition(name: &str, id: Option<&str>, expression: &str) -> Condition {
        Condition {
            id: id.map(str::to_string),
            name: name.to_string(),
            tags: BTreeSet::new(),
            expression: expression.to_string(),
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

    fn policy(name: &str, entitlements: &[&str]) -> Policy {
        Policy {
            id: None,
            name: name.to_string(),
            tags: BTreeSet::new(),
            disabled: false,
            expression: "return true;".to_string(),
            entitlements: entitlements.iter().map(|e| e.to_string()).collect(),
            created: None,
            updated: None,
            appgate_metadata: AppgateMetadata::default(),
        }
    }

    fn submissions(calls: &[String]) -> Vec<String> {
        calls
            .iter()
            .filter(|c| {
                c.starts_with("create") || c.starts_with("update") || c.starts_with("delete")
            })
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn dry_run_submits_nothing() {
        let gateway = MockGateway::default();
        let calls = gateway.calls.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(AppgateEvent {
            op: EventOp::Added,
            entity: policy("p1", &[]).into(),
        })
        .unwrap();
        drop(tx);

        ControlLoop::new(settings(true, false), gateway, rx)
            .run()
            .await
            .unwrap();
        assert_eq!(submissions(&calls.lock()), Vec::<String>::new());
    }

    #[tokio::test]
    async fn creates_run_in_dependency_order() {
        let gateway = MockGateway::default();
        let calls = gateway.calls.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        // Events arrive in reverse dependency order; the plan fixes it.
        for entity in [
            AnyEntity::Policy(policy("p1", &["e1"])),
            AnyEntity::Entitlement(entitlement("e1", &["c1"])),
            AnyEntity::Condition(condition("c1", None, "return true;")),
        ] {
            tx.send(AppgateEvent {
                op: EventOp::Added,
                entity,
            })
            .unwrap();
        }
        drop(tx);

        ControlLoop::new(settings(false, false), gateway, rx)
            .run()
            .await
            .unwrap();
        assert_eq!(
            submissions(&calls.lock()),
            vec![
                "create Condition c1",
                "create Entitlement e1",
                "create Policy p1",
            ]
        );
    }

    #[tokio::test]
    async fn dangling_references_skip_the_apply() {
        let gateway = MockGateway::default();
        let calls = gateway.calls.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(AppgateEvent {
            op: EventOp::Added,
            entity: entitlement("e1", &["cond-missing"]).into(),
        })
        .unwrap();
        drop(tx);

        ControlLoop::new(settings(false, false), gateway, rx)
            .run()
            .await
            .unwrap();
        assert_eq!(submissions(&calls.lock()), Vec::<String>::new());
    }

    #[tokio::test]
    async fn cleanup_mode_deletes_everything_but_builtin() {
        let gateway = MockGateway::default();
        let calls = gateway.calls.clone();
        {
            let mut remote = gateway.remote.lock();
            let mut builtin = condition("builtin-1", Some("id-b"), "return true;");
            builtin.tags.insert("builtin".to_string());
            remote.conditions.insert(builtin);
            remote
                .conditions
                .insert(condition("stray-1", Some("id-s"), "return true;"));
        }
        let (tx, rx) = mpsc::unbounded_channel::<AppgateEvent>();
        drop(tx);

        ControlLoop::new(settings(false, true), gateway, rx)
            .run()
            .await
            .unwrap();
        assert_eq!(submissions(&calls.lock()), vec!["delete Condition stray-1"]);
    }

    #[tokio::test]
    async fn modified_entities_carry_the_remote_id() {
        let gateway = MockGateway::default();
        let calls = gateway.calls.clone();
        gateway
            .remote
            .lock()
            .conditions
            .insert(condition("c1", Some("id-1"), "old"));
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(AppgateEvent {
            op: EventOp::Added,
            entity: condition("c1", None, "new").into(),
        })
        .unwrap();
        drop(tx);

        ControlLoop::new(settings(false, false), gateway, rx)
            .run()
            .await
            .unwrap();
        assert_eq!(
            submissions(&calls.lock()),
            vec!["update Condition c1 id-1"]
        );
    }
}
