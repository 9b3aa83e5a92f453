//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{RefreshError, Result};
use std::path::Path;
use tracing::debug;

/// Environment variables that carry credentials, per connection.
pub const SOURCE_USER_VAR: &str = "SOURCE_DB_USER";
pub const SOURCE_PASSWORD_VAR: &str = "SOURCE_DB_PASSWORD";
pub const TARGET_USER_VAR: &str = "TARGET_DB_USER";
pub const TARGET_PASSWORD_VAR: &str = "TARGET_DB_PASSWORD";

impl Config {
    /// Load configuration from a YAML file, resolving credentials from the environment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string, resolving credentials from the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_env(yaml, |key| std::env::var(key).ok())
    }

    /// Parse configuration using `env` to look up credential variables.
    pub fn from_yaml_with_env<F>(yaml: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.resolve_credentials(env);
        config.validate()?;
        Ok(config)
    }

    /// Fill user and password from the environment. Environment values win over YAML.
    pub fn resolve_credentials<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let pairs = [
            (&mut self.databases.source, SOURCE_USER_VAR, SOURCE_PASSWORD_VAR),
            (&mut self.databases.target, TARGET_USER_VAR, TARGET_PASSWORD_VAR),
        ];
        for (db, user_var, password_var) in pairs {
            if let Some(user) = env(user_var) {
                debug!("Using {} for {}", user_var, db.database);
                db.user = Some(user);
            }
            if let Some(password) = env(password_var) {
                db.password = Some(password);
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Result<&TableConfig> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| {
                RefreshError::Config(format!("Table '{}' not found in configuration", name))
            })
    }
}
