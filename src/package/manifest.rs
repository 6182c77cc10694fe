//! Package manifest model.
//!
//! Every package carries a `package.toml` at its root declaring the topics
//! it serves, each topic's entry and failure policy, and optional secrets
//! profiles:
//!
//! ```toml
//! [package]
//! name = "greeter"
//!
//! [topics."greet"]
//! entry = "greet_suite"
//! on-failure = "ERROR"
//! process-variables = true
//! search-path = ["lib", "resources"]
//!
//! [secrets.default]
//! provider = "file"
//! path = "secrets.json"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::secrets::ProviderConfig;

/// Manifest file name, relative to the package root.
pub const MANIFEST_FILE: &str = "package.toml";

/// What to report to the engine when a lease does not succeed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
#[clap(rename_all = "UPPER")]
pub enum FailurePolicy {
    /// Report a task failure; the engine decrements retries and
    /// eventually raises an incident.
    #[default]
    Fail,
    /// Report a BPMN error so the model's error boundary handles it.
    Error,
    /// Complete the task anyway; the outputs carry errorCode/errorMessage
    /// for the model to inspect.
    Complete,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Complete => "COMPLETE",
        };
        write!(f, "{s}")
    }
}

/// A parsed package manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub package: PackageMeta,
    #[serde(default)]
    pub topics: BTreeMap<String, TopicConfig>,
    #[serde(default)]
    pub secrets: BTreeMap<String, ProviderConfig>,
}

/// The `[package]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageMeta {
    #[serde(default)]
    pub name: Option<String>,
}

/// One `[topics."..."]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    /// Identifier of the callable inside the package.
    pub entry: String,
    /// Failure policy; falls back to the worker default when omitted.
    #[serde(rename = "on-failure")]
    pub on_failure: Option<FailurePolicy>,
    /// When true, all in-scope process variables are fetched and outputs
    /// are reported at process scope.
    #[serde(rename = "process-variables", default)]
    pub process_variables: bool,
    /// Explicit fetch filter: only these variable names are requested.
    #[serde(default)]
    pub variables: Option<Vec<String>>,
    /// Relative directories exposed to the executor via its search path.
    #[serde(rename = "search-path", default)]
    pub search_path: Vec<String>,
    /// Secrets profile for this topic, overriding the worker selection.
    #[serde(default)]
    pub secrets: Option<String>,
}

impl Manifest {
    /// Parse manifest text. Errors are wrapped into `PackageError` by the
    /// loader, which knows the path.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// A topic routing entry as the scheduler and runner consume it: manifest
/// config resolved against the worker defaults and its owning package.
#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub topic: String,
    pub entry: String,
    pub package_ref: PathBuf,
    pub on_failure: FailurePolicy,
    pub process_variables: bool,
    pub variables: Option<Vec<String>>,
    pub search_path: Vec<String>,
    pub secret_profile: Option<String>,
}
