//! Topic registry mapping engine topics to their serving packages.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::error::{ConfigError, Error};
use crate::package::{Package, TopicSpec};
use crate::secrets::{resolve_profile, SecretsProvider};

/// A topic resolved against its package and secrets provider.
pub struct ResolvedTopic {
    pub spec: TopicSpec,
    pub package: Arc<Package>,
    pub secrets: Option<SecretsProvider>,
}

/// Immutable topic -> spec map, built once at startup. Reads are lock-free
/// because nothing mutates it after construction.
pub struct TopicRegistry {
    topics: HashMap<String, Arc<ResolvedTopic>>,
}

impl TopicRegistry {
    /// Build the registry from the union of all packages. Duplicate topics
    /// across packages are ambiguous routing and fatal, as is an
    /// unresolvable secrets profile.
    pub fn build(packages: Vec<Package>, config: &WorkerConfig) -> Result<Self, Error> {
        let mut topics: HashMap<String, Arc<ResolvedTopic>> = HashMap::new();

        for package in packages {
            let package = Arc::new(package);
            for (topic, topic_config) in &package.manifest().topics {
                if let Some(existing) = topics.get(topic) {
                    return Err(ConfigError::DuplicateTopic {
                        topic: topic.clone(),
                        first: existing.package.display_name(),
                        second: package.display_name(),
                    }
                    .into());
                }

                let selection = topic_config
                    .secrets
                    .as_deref()
                    .or(config.secrets_profile.as_deref());
                let secrets = resolve_profile(&package.manifest().secrets, selection)
                    .map_err(Error::Secrets)?;

                let spec = TopicSpec {
                    topic: topic.clone(),
                    entry: topic_config.entry.clone(),
                    package_ref: package.path().to_path_buf(),
                    on_failure: topic_config
                        .on_failure
                        .unwrap_or(config.default_on_failure),
                    process_variables: topic_config.process_variables,
                    variables: topic_config.variables.clone(),
                    search_path: topic_config.search_path.clone(),
                    secret_profile: selection.map(String::from),
                };

                tracing::info!(
                    topic = %topic,
                    package = %package.display_name(),
                    fingerprint = %&package.fingerprint()[..12],
                    policy = %spec.on_failure,
                    "Registered topic"
                );

                topics.insert(
                    topic.clone(),
                    Arc::new(ResolvedTopic {
                        spec,
                        package: Arc::clone(&package),
                        secrets,
                    }),
                );
            }
        }

        if topics.is_empty() {
            return Err(ConfigError::NoTopics.into());
        }

        Ok(Self { topics })
    }

    pub fn get(&self, topic: &str) -> Option<Arc<ResolvedTopic>> {
        self.topics.get(topic).cloned()
    }

    /// Specs for assembling the fetch-and-lock request body.
    pub fn specs(&self) -> Vec<&TopicSpec> {
        let mut specs: Vec<&TopicSpec> = self.topics.values().map(|t| &t.spec).collect();
        specs.sort_by(|a, b| a.topic.cmp(&b.topic));
        specs
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{FailurePolicy, MANIFEST_FILE};

    fn package_with(manifest: &str) -> (tempfile::TempDir, Package) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest).unwrap();
        let package = Package::load(dir.path()).unwrap();
        (dir, package)
    }

    #[test]
    fn builds_registry_and_applies_default_policy() {
        let (_dir, package) = package_with(
            r#"
            [topics."greet"]
            entry = "greet_suite"

            [topics."farewell"]
            entry = "farewell_suite"
            on-failure = "COMPLETE"
        "#,
        );

        let config = WorkerConfig {
            default_on_failure: FailurePolicy::Error,
            ..WorkerConfig::default()
        };
        let registry = TopicRegistry::build(vec![package], &config).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("greet").unwrap().spec.on_failure,
            FailurePolicy::Error
        );
        assert_eq!(
            registry.get("farewell").unwrap().spec.on_failure,
            FailurePolicy::Complete
        );
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn duplicate_topic_across_packages_is_fatal() {
        let (_d1, first) = package_with(
            r#"
            [package]
            name = "alpha"
            [topics."greet"]
            entry = "a"
        "#,
        );
        let (_d2, second) = package_with(
            r#"
            [package]
            name = "beta"
            [topics."greet"]
            entry = "b"
        "#,
        );

        let result = TopicRegistry::build(vec![first, second], &WorkerConfig::default());
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::DuplicateTopic { topic, .. })) if topic == "greet"
        ));
    }

    #[test]
    fn no_topics_is_fatal() {
        let (_dir, package) = package_with("[package]\nname = \"empty\"\n");
        let result = TopicRegistry::build(vec![package], &WorkerConfig::default());
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::NoTopics))
        ));
    }

    #[test]
    fn unknown_secrets_profile_is_fatal() {
        let (_dir, package) = package_with(
            r#"
            [topics."greet"]
            entry = "a"
            secrets = "staging"

            [secrets.default]
            provider = "file"
            path = "secrets.json"

            [secrets.prod]
            provider = "file"
            path = "prod.json"
        "#,
        );
        let result = TopicRegistry::build(vec![package], &WorkerConfig::default());
        assert!(matches!(result, Err(Error::Secrets(_))));
    }

    #[test]
    fn specs_are_sorted_by_topic() {
        let (_dir, package) = package_with(
            r#"
            [topics."zeta"]
            entry = "z"
            [topics."alpha"]
            entry = "a"
        "#,
        );
        let registry =
            TopicRegistry::build(vec![package], &WorkerConfig::default()).unwrap();
        let names: Vec<&str> = registry.specs().iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
