use crate::reconcile::{self, ControlLoop, Settings};
use crate::secrets::KubeSecretLookup;
use crate::watch;
use anyhow::{anyhow, bail, Result};
use appgate_operator_appliance::ApplianceClient;
use appgate_operator_core::entity::AppgateEvent;
use appgate_operator_core::gateway::RemoteStateGateway;
use appgate_operator_core::projection::EntityLoader;
use appgate_operator_core::secrets::{SecretLookup, SecretsResolver};
use appgate_operator_k8s_api as k8s;
use clap::Parser;
use kube::runtime::watcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "appgate-operator",
    about = "Keeps declared security-policy entities in sync with an appgate controller"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "appgate_operator=info,warn",
        env = "APPGATE_OPERATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace whose declared entities are reconciled. Discovered from the
    /// kubeconfig context when not set.
    #[clap(long, env = "APPGATE_OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    /// Base URL of the controller's admin API.
    #[clap(long, env = "APPGATE_OPERATOR_HOST")]
    host: String,

    #[clap(long, env = "APPGATE_OPERATOR_USER")]
    user: String,

    #[clap(long, env = "APPGATE_OPERATOR_PASSWORD", hide_env_values = true)]
    password: String,

    /// Seconds the event queue must stay quiet before a reconciliation runs.
    #[clap(long, default_value = "30", env = "APPGATE_OPERATOR_TIMEOUT")]
    timeout: u64,

    /// Compute and log plans without submitting them.
    #[clap(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "APPGATE_OPERATOR_DRY_RUN"
    )]
    dry_run: bool,

    /// Start from a builtin-only expected state, deleting every entity the
    /// namespace does not declare.
    #[clap(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        env = "APPGATE_OPERATOR_CLEANUP"
    )]
    cleanup: bool,

    /// Refresh the remote state before every reconciliation.
    #[clap(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "APPGATE_OPERATOR_TWO_WAY_SYNC"
    )]
    two_way_sync: bool,

    /// Fernet key used to decrypt inline-encrypted secret fields.
    #[clap(long, env = "APPGATE_OPERATOR_FERNET_KEY", hide_env_values = true)]
    fernet_key: Option<String>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the reconciliation loop (the default).
    Run,
    /// Fetch the remote state and print one YAML document per entity kind.
    DumpEntities,
}

// === impl Args ===

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespace,
            host,
            user,
            password,
            timeout,
            dry_run,
            cleanup,
            two_way_sync,
            fernet_key,
            command,
        } = self;

        let admin = admin
            .into_builder()
            .with_prometheus(prometheus_client::registry::Registry::default());

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .build()
            .await?;

        let gateway = ApplianceClient::new(&host, &user, &password)?;

        match command.unwrap_or(Command::Run) {
            Command::DumpEntities => {
                gateway.login().await?;
                let state = reconcile::fetch_state(&gateway).await?;
                for (kind, document) in state.dump_documents()? {
                    println!("# {kind}");
                    println!("---");
                    print!("{document}");
                }
                Ok(())
            }
            Command::Run => {
                let namespace = match namespace {
                    Some(namespace) => namespace,
                    None => kube::Config::infer()
                        .await
                        .map(|config| config.default_namespace)
                        .map_err(|_| {
                            anyhow!("unable to discover a namespace, provide one with --namespace")
                        })?,
                };
                info!(
                    %namespace,
                    %host,
                    timeout,
                    dry_run,
                    cleanup,
                    two_way_sync,
                    "Operator starting"
                );

                let cipher = fernet_key
                    .map(|key| {
                        fernet::Fernet::new(&key).ok_or_else(|| anyhow!("invalid fernet key"))
                    })
                    .transpose()?;
                let lookup: Arc<dyn SecretLookup> =
                    Arc::new(KubeSecretLookup::new(runtime.client(), namespace.clone()));
                let loader = EntityLoader::new(SecretsResolver::new(cipher, Some(lookup)));

                let (tx, rx) = mpsc::unbounded_channel::<AppgateEvent>();

                let conditions = runtime
                    .watch_namespaced::<k8s::Condition>(namespace.clone(), watcher::Config::default());
                tokio::spawn(
                    watch::run(conditions, loader.clone(), tx.clone())
                        .instrument(info_span!("conditions")),
                );

                let entitlements = runtime
                    .watch_namespaced::<k8s::Entitlement>(namespace.clone(), watcher::Config::default());
                tokio::spawn(
                    watch::run(entitlements, loader.clone(), tx.clone())
                        .instrument(info_span!("entitlements")),
                );

                let policies = runtime
                    .watch_namespaced::<k8s::Policy>(namespace.clone(), watcher::Config::default());
                tokio::spawn(
                    watch::run(policies, loader, tx).instrument(info_span!("policies")),
                );

                let settings = Settings {
                    namespace,
                    debounce: Duration::from_secs(timeout),
                    dry_run,
                    cleanup,
                    two_way_sync,
                };
                let control_loop = ControlLoop::new(settings, gateway, rx);

                // Block on the loop and the shutdown signal together; a
                // fatal loop error aborts the process so supervision can
                // restart it cleanly.
                tokio::select! {
                    result = control_loop.run() => {
                        result?;
                        Ok(())
                    }
                    result = runtime.run() => {
                        if result.is_err() {
                            bail!("Aborted");
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}
