//! Secrets resolvers: environment variables and a fixed map.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::ports::SecretsResolver;

/// Reads secrets from the process environment, optionally under a prefix
/// (`OPQUEUE_SECRET_` + key).
#[derive(Debug, Clone, Default)]
pub struct EnvSecretsResolver {
    prefix: String,
}

impl EnvSecretsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl SecretsResolver for EnvSecretsResolver {
    async fn resolve(&self, key: &str, _operator_uri: &str) -> anyhow::Result<Option<String>> {
        match std::env::var(self.var_name(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("secret `{key}` is not valid unicode: {e}")),
        }
    }
}

/// Fixed key/value secrets, for tests and the demo CLI.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretsResolver for StaticSecrets {
    async fn resolve(&self, key: &str, _operator_uri: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_resolver_reads_existing_variables() {
        // PATH is set in every test environment.
        let resolver = EnvSecretsResolver::new();
        assert!(resolver.resolve("PATH", "pkg/op").await.unwrap().is_some());

        let prefixed = EnvSecretsResolver::with_prefix("OPQUEUE_TEST_UNSET_");
        assert_eq!(prefixed.resolve("PATH", "pkg/op").await.unwrap(), None);
    }

    #[tokio::test]
    async fn static_secrets() {
        let secrets = StaticSecrets::new().with("API_KEY", "s3cret");
        assert_eq!(
            secrets.resolve("API_KEY", "pkg/op").await.unwrap().as_deref(),
            Some("s3cret")
        );
        assert_eq!(secrets.resolve("OTHER", "pkg/op").await.unwrap(), None);
    }
}
