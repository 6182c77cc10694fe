//! Secrets providers and redaction.
//!
//! Secrets are resolved per lease, live in memory only, and reach exactly
//! two places: the workspace inputs file and the lease's [`Redactor`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::SecretsError;

/// Fixed replacement for redacted secret material.
pub const MASK: &str = "***";

/// Provider declaration as it appears in a package manifest profile.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    File {
        path: PathBuf,
    },
    Vault {
        path: String,
        #[serde(rename = "mount-point")]
        mount_point: String,
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        token: Option<String>,
    },
}

/// Resolved secret values, keyed by name.
pub type Secrets = BTreeMap<String, SecretString>;

/// A source of secrets bound to a topic.
#[async_trait]
pub trait SecretsRead: Send + Sync + std::fmt::Debug {
    /// Fetch the current secret set. Called once per lease.
    async fn read(&self) -> Result<Secrets, SecretsError>;

    /// Human-readable description for logs; must not leak values.
    fn describe(&self) -> String;
}

/// Shared handle to a secrets provider.
pub type SecretsProvider = Arc<dyn SecretsRead>;

/// File-based provider: a JSON object of name -> value.
#[derive(Debug)]
pub struct FileSecrets {
    path: PathBuf,
}

impl FileSecrets {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretsRead for FileSecrets {
    async fn read(&self) -> Result<Secrets, SecretsError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| read_failed(&self.describe(), e))?;
        let values: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&raw).map_err(|e| read_failed(&self.describe(), e))?;
        Ok(into_secrets(values))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Vault KV-v2 provider. Reads a single secret version over HTTP.
#[derive(Debug)]
pub struct VaultSecrets {
    address: String,
    token: SecretString,
    mount_point: String,
    path: String,
    client: reqwest::Client,
}

impl VaultSecrets {
    pub fn new(
        address: impl Into<String>,
        token: SecretString,
        mount_point: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            token,
            mount_point: mount_point.into(),
            path: path.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SecretsRead for VaultSecrets {
    async fn read(&self) -> Result<Secrets, SecretsError> {
        let url = format!(
            "{}/v1/{}/data/{}",
            self.address.trim_end_matches('/'),
            self.mount_point,
            self.path
        );
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", self.token.expose_secret())
            .send()
            .await
            .map_err(|e| read_failed(&self.describe(), e))?;
        if !response.status().is_success() {
            return Err(SecretsError::ReadFailed {
                source_desc: self.describe(),
                reason: format!("status {}", response.status()),
            });
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| read_failed(&self.describe(), e))?;
        let data = body
            .get("data")
            .and_then(|d| d.get("data"))
            .and_then(|d| d.as_object())
            .ok_or_else(|| SecretsError::ReadFailed {
                source_desc: self.describe(),
                reason: "response missing data.data".to_string(),
            })?;
        Ok(into_secrets(
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ))
    }

    fn describe(&self) -> String {
        format!("vault {}:{}", self.mount_point, self.path)
    }
}

/// Build a provider from a manifest profile entry. Vault address/token fall
/// back to `VAULT_ADDR` / `VAULT_TOKEN`; missing either is fatal.
pub fn provider_from_config(config: &ProviderConfig) -> Result<SecretsProvider, SecretsError> {
    match config {
        ProviderConfig::File { path } => Ok(Arc::new(FileSecrets::new(path.clone()))),
        ProviderConfig::Vault {
            path,
            mount_point,
            address,
            token,
        } => {
            let address = address
                .clone()
                .or_else(|| std::env::var("VAULT_ADDR").ok())
                .ok_or(SecretsError::MissingConfig {
                    provider: "vault",
                    what: "address (VAULT_ADDR)",
                })?;
            let token = token
                .clone()
                .or_else(|| std::env::var("VAULT_TOKEN").ok())
                .ok_or(SecretsError::MissingConfig {
                    provider: "vault",
                    what: "token (VAULT_TOKEN)",
                })?;
            Ok(Arc::new(VaultSecrets::new(
                address,
                SecretString::from(token),
                mount_point.clone(),
                path.clone(),
            )))
        }
    }
}

/// Resolve the provider for a package given its manifest profiles and the
/// worker-level profile selection.
///
/// A selection that names a readable file is used directly as a file
/// provider. Otherwise: a single declared profile wins outright, then the
/// named (or `"default"`) profile is looked up.
pub fn resolve_profile(
    profiles: &BTreeMap<String, ProviderConfig>,
    selection: Option<&str>,
) -> Result<Option<SecretsProvider>, SecretsError> {
    if let Some(name) = selection {
        if Path::new(name).is_file() {
            return Ok(Some(Arc::new(FileSecrets::new(name))));
        }
    }

    if profiles.is_empty() {
        return Ok(None);
    }
    if profiles.len() == 1 {
        if let Some(config) = profiles.values().next() {
            return provider_from_config(config).map(Some);
        }
    }

    let name = selection.unwrap_or("default");
    let config = profiles
        .get(name)
        .ok_or_else(|| SecretsError::UnknownProfile {
            profile: name.to_string(),
            available: profiles.keys().cloned().collect::<Vec<_>>().join(", "),
        })?;
    provider_from_config(config).map(Some)
}

fn into_secrets(values: BTreeMap<String, serde_json::Value>) -> Secrets {
    values
        .into_iter()
        .map(|(name, value)| {
            let raw = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (name, SecretString::from(raw))
        })
        .collect()
}

fn read_failed(source_desc: &str, e: impl std::fmt::Display) -> SecretsError {
    SecretsError::ReadFailed {
        source_desc: source_desc.to_string(),
        reason: e.to_string(),
    }
}

/// Masks known secret values out of any string leaving the worker: log
/// lines, reported variables, synthesized error messages, artifacts.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    values: Vec<String>,
}

impl Redactor {
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        // Longest first, so overlapping secrets mask the longer match.
        let mut values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        Self { values }
    }

    pub fn from_secrets(secrets: &Secrets) -> Self {
        Self::new(secrets.values().map(|v| v.expose_secret().to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every occurrence of every secret with [`MASK`].
    pub fn mask(&self, input: &str) -> String {
        let mut output = input.to_string();
        for value in &self.values {
            if output.contains(value.as_str()) {
                output = output.replace(value.as_str(), MASK);
            }
        }
        output
    }

    /// Mask UTF-8 byte content; non-text bytes pass through unchanged.
    pub fn mask_bytes(&self, bytes: Vec<u8>) -> Vec<u8> {
        if self.is_empty() {
            return bytes;
        }
        match String::from_utf8(bytes) {
            Ok(text) => self.mask(&text).into_bytes(),
            Err(e) => e.into_bytes(),
        }
    }
}
