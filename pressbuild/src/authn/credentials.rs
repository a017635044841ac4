//! Connection credential resolution
//!
//! Credentials are owned by the surrounding platform. The orchestrator only
//! resolves them by reference for the duration of one `open()` and never
//! writes them back anywhere.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::errors::ProvisionError;
use crate::filesys::dir::Dir;

/// A resolved login secret
pub enum Credential {
    /// OpenSSH private key (PEM / OpenSSH format)
    PrivateKey(SecretString),

    /// Password for keyboard-interactive / password authentication
    Password(SecretString),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::PrivateKey(_) => "private_key",
            Credential::Password(_) => "password",
        }
    }

    /// The raw secret, for the session layer and the error redactor only
    pub fn secret(&self) -> &str {
        match self {
            Credential::PrivateKey(secret) | Credential::Password(secret) => secret.expose_secret(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({}, <redacted>)", self.kind())
    }
}

/// Resolver trait for testability
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve the credential referenced by a website's connection descriptor
    async fn resolve(&self, website_id: &str, reference: &str) -> Result<Credential, ProvisionError>;
}

/// On-disk credential entry written by the platform's secret manager
#[derive(Deserialize)]
struct CredentialFile {
    kind: String,
    secret: String,
}

/// Resolves `<dir>/<reference>.json` files
pub struct FileCredentialResolver {
    dir: Dir,
}

impl FileCredentialResolver {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    fn path_for(&self, reference: &str) -> Result<PathBuf, ProvisionError> {
        let valid = !reference.is_empty()
            && !reference.starts_with('.')
            && reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(ProvisionError::CredentialError(
                "credential reference contains invalid characters".to_string(),
            ));
        }
        Ok(self.dir.path().join(format!("{}.json", reference)))
    }
}

#[async_trait]
impl CredentialResolver for FileCredentialResolver {
    async fn resolve(&self, website_id: &str, reference: &str) -> Result<Credential, ProvisionError> {
        let file = crate::filesys::file::File::new(self.path_for(reference)?);
        if !file.exists().await {
            return Err(ProvisionError::CredentialError(format!(
                "no credential stored for website {}",
                website_id
            )));
        }

        let entry: CredentialFile = file.read_json().await.map_err(|e| {
            ProvisionError::CredentialError(format!("unreadable credential entry: {}", e))
        })?;

        debug!(website_id, kind = %entry.kind, "Resolved connection credential");
        parse_credential(entry.kind, entry.secret)
    }
}

fn parse_credential(kind: String, secret: String) -> Result<Credential, ProvisionError> {
    if secret.is_empty() {
        return Err(ProvisionError::CredentialError("credential secret is empty".to_string()));
    }
    match kind.as_str() {
        "private_key" | "key" => Ok(Credential::PrivateKey(SecretString::from(secret))),
        "password" => Ok(Credential::Password(SecretString::from(secret))),
        other => Err(ProvisionError::CredentialError(format!(
            "unsupported credential kind: {}",
            other
        ))),
    }
}

/// In-memory resolver, for embedding and tests
#[derive(Default)]
pub struct StaticCredentialResolver {
    entries: RwLock<HashMap<String, (String, String)>>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a credential of `kind` under `reference`
    pub fn insert(&self, reference: &str, kind: &str, secret: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(reference.to_string(), (kind.to_string(), secret.to_string()));
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, website_id: &str, reference: &str) -> Result<Credential, ProvisionError> {
        let entry = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.get(reference).cloned()
        };
        match entry {
            Some((kind, secret)) => parse_credential(kind, secret),
            None => Err(ProvisionError::CredentialError(format!(
                "no credential stored for website {}",
                website_id
            ))),
        }
    }
}
