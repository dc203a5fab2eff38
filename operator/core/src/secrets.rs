//! Resolution of raw password-field values.
//!
//! A declared password field is either an inline string (plain text, or a
//! Fernet token when a cipher is configured) or a reference to an externally
//! stored secret that is fetched through an injected lookup client.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Discriminator value marking an external secret reference.
pub const EXTERNAL_SECRET_TYPE: &str = "external/secret";

/// Looks up an externally stored secret by name and key.
pub trait SecretLookup: Send + Sync {
    fn lookup(&self, name: &str, key: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secret value is an {EXTERNAL_SECRET_TYPE} reference but no lookup client is configured")]
    MissingClient,
    #[error("secret reference is missing field {0}")]
    MissingField(&'static str),
    #[error("unable to decrypt secret value")]
    MalformedSecret,
    #[error("external secret lookup failed: {0}")]
    ExternalLookup(#[source] anyhow::Error),
    #[error("unrecognized secret value shape")]
    UnrecognizedShape,
}

/// Resolves raw password-field values into decrypted strings.
///
/// Resolution is synchronous and has no side effects beyond the lookup call.
#[derive(Clone, Default)]
pub struct SecretsResolver {
    cipher: Option<Arc<fernet::Fernet>>,
    lookup: Option<Arc<dyn SecretLookup>>,
}

impl SecretsResolver {
    pub fn new(cipher: Option<fernet::Fernet>, lookup: Option<Arc<dyn SecretLookup>>) -> Self {
        Self {
            cipher: cipher.map(Arc::new),
            lookup,
        }
    }

    pub fn resolve(&self, value: &Value) -> Result<String, SecretsError> {
        match value {
            Value::String(token) => match &self.cipher {
                Some(cipher) => {
                    let bytes = cipher
                        .decrypt(token)
                        .map_err(|_| SecretsError::MalformedSecret)?;
                    String::from_utf8(bytes).map_err(|_| SecretsError::MalformedSecret)
                }
                None => Ok(token.clone()),
            },
            Value::Object(fields)
                if fields.get("type").and_then(Value::as_str) == Some(EXTERNAL_SECRET_TYPE) =>
            {
                let lookup = self.lookup.as_ref().ok_or(SecretsError::MissingClient)?;
                let name = fields
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or(SecretsError::MissingField("name"))?;
                let key = fields
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or(SecretsError::MissingField("key"))?;
                lookup.lookup(name, key).map_err(SecretsError::ExternalLookup)
            }
            _ => Err(SecretsError::UnrecognizedShape),
        }
    }
}
