#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! REST client for the appgate controller's admin API.

use anyhow::{anyhow, Context as _};
use appgate_operator_core::entity::{AnyEntity, Kind};
use appgate_operator_core::gateway::{GatewayError, RemoteStateGateway};
use appgate_operator_core::projection::{self, EntityLoader, View};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

const ACCEPT_HEADER: &str = "application/vnd.appgate.peer-v13+json";
const LOGIN_PATH: &str = "/admin/login";

fn kind_path(kind: Kind) -> &'static str {
    match kind {
        Kind::Condition => "/admin/conditions",
        Kind::Entitlement => "/admin/entitlements",
        Kind::Policy => "/admin/policies",
    }
}

/// A bearer-token authenticated client for one controller.
///
/// Entities travel through the remote projection view: responses drop
/// write-only fields, submissions carry resolved secret fields and omit
/// read-only ones.
pub struct ApplianceClient {
    base: String,
    user: String,
    password: String,
    device_id: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    loader: EntityLoader,
}

impl ApplianceClient {
    pub fn new(controller: &str, user: &str, password: &str) -> anyhow::Result<Self> {
        // The controller serves a self-signed certificate.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build the HTTP client")?;
        Ok(Self {
            base: controller.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            device_id: Uuid::new_v4().to_string(),
            http,
            token: RwLock::new(None),
            loader: EntityLoader::default(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> anyhow::Result<Value> {
        debug!(%method, %path, "Controller request");
        let mut request = self
            .http
            .request(method, self.url(path))
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(token) = self.token.read().clone() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?.error_for_status()?;
        let text = response.text().await?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).context("controller returned malformed JSON")
    }

    fn load_any(&self, kind: Kind, raw: Value) -> anyhow::Result<AnyEntity> {
        let entity = match kind {
            Kind::Condition => AnyEntity::Condition(self.loader.load(raw, None, View::Remote)?),
            Kind::Entitlement => AnyEntity::Entitlement(self.loader.load(raw, None, View::Remote)?),
            Kind::Policy => AnyEntity::Policy(self.loader.load(raw, None, View::Remote)?),
        };
        Ok(entity)
    }

    fn dump_any(entity: &AnyEntity) -> Value {
        let fields = match entity {
            AnyEntity::Condition(c) => projection::dump_with_secrets(c),
            AnyEntity::Entitlement(e) => projection::dump_with_secrets(e),
            AnyEntity::Policy(p) => projection::dump_with_secrets(p),
        };
        Value::Object(fields)
    }

    fn apply_error(
        verb: &'static str,
        entity: &AnyEntity,
        source: anyhow::Error,
    ) -> GatewayError {
        GatewayError::Apply {
            verb,
            kind: entity.kind(),
            name: entity.name().to_string(),
            source,
        }
    }
}

#[async_trait::async_trait]
impl RemoteStateGateway for ApplianceClient {
    async fn login(&self) -> Result<(), GatewayError> {
        let body = json!({
            "providerName": "local",
            "username": self.user,
            "password": self.password,
            "deviceId": self.device_id,
        });
        let response = self
            .request(reqwest::Method::POST, LOGIN_PATH, Some(&body))
            .await
            .map_err(GatewayError::Authentication)?;
        let token = response
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::Authentication(anyhow!("login response carried no token"))
            })?;
        *self.token.write() = Some(token.to_string());
        Ok(())
    }

    async fn fetch(&self, kind: Kind) -> Result<Vec<AnyEntity>, GatewayError> {
        let fetch_error = |source| GatewayError::Fetch { kind, source };
        let response = self
            .request(reqwest::Method::GET, kind_path(kind), None)
            .await
            .map_err(fetch_error)?;
        let items = response
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| fetch_error(anyhow!("response carried no data")))?;
        items
            .into_iter()
            .map(|raw| self.load_any(kind, raw).map_err(fetch_error))
            .collect()
    }

    async fn create(&self, entity: &AnyEntity) -> Result<AnyEntity, GatewayError> {
        let body = Self::dump_any(entity);
        let response = self
            .request(reqwest::Method::POST, kind_path(entity.kind()), Some(&body))
            .await
            .map_err(|e| Self::apply_error("create", entity, e))?;
        self.load_any(entity.kind(), response)
            .map_err(|e| Self::apply_error("create", entity, e))
    }

    async fn update(&self, entity: &AnyEntity) -> Result<AnyEntity, GatewayError> {
        let id = entity
            .id()
            .ok_or_else(|| {
                Self::apply_error("update", entity, anyhow!("entity carries no id"))
            })?;
        let path = format!("{}/{id}", kind_path(entity.kind()));
        let body = Self::dump_any(entity);
        let response = self
            .request(reqwest::Method::PUT, &path, Some(&body))
            .await
            .map_err(|e| Self::apply_error("update", entity, e))?;
        self.load_any(entity.kind(), response)
            .map_err(|e| Self::apply_error("update", entity, e))
    }

    async fn delete(&self, entity: &AnyEntity) -> Result<(), GatewayError> {
        let id = entity
            .id()
            .ok_or_else(|| {
                Self::apply_error("delete", entity, anyhow!("entity carries no id"))
            })?;
        let path = format!("{}/{id}", kind_path(entity.kind()));
        self.request(reqwest::Method::DELETE, &path, None)
            .await
            .map_err(|e| Self::apply_error("delete", entity, e))?;
        Ok(())
    }
}
