use anyhow::Context as _;
use appgate_operator_core::secrets::SecretLookup;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;

/// Resolves external secret references against Secrets in the operator's
/// namespace.
pub(crate) struct KubeSecretLookup {
    client: kube::Client,
    namespace: String,
}

impl KubeSecretLookup {
    pub(crate) fn new(client: kube::Client, namespace: String) -> Self {
        Self { client, namespace }
    }
}

impl SecretLookup for KubeSecretLookup {
    fn lookup(&self, name: &str, key: &str) -> anyhow::Result<String> {
        let api = Api::<Secret>::namespaced(self.client.clone(), &self.namespace);
        // Resolution is synchronous by contract; bridge onto the runtime.
        let secret =
            tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(api.get(name)))
                .with_context(|| format!("failed to read secret {name}"))?;
        let data = secret.data.unwrap_or_default();
        let value = data
            .get(key)
            .with_context(|| format!("secret {name} has no key {key}"))?;
        String::from_utf8(value.0.clone())
            .with_context(|| format!("secret {name}.{key} is not valid UTF-8"))
    }
}
