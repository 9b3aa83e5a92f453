//! Configuration validation.

use super::{AuthType, Config, DatabaseConfig, StrategyKind, SyncMode};
use crate::error::{RefreshError, Result};
use std::collections::HashSet;
use tracing::warn;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_database("databases.source", &config.databases.source)?;
    validate_database("databases.target", &config.databases.target)?;

    let source = &config.databases.source;
    let target = &config.databases.target;
    if source.host().eq_ignore_ascii_case(target.host())
        && source.port() == target.port()
        && source.database.eq_ignore_ascii_case(&target.database)
    {
        return Err(RefreshError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    if config.settings.default_batch_size == 0 {
        return Err(RefreshError::Config(
            "settings.default_batch_size must be at least 1".into(),
        ));
    }
    if config.settings.max_connections == 0 {
        return Err(RefreshError::Config(
            "settings.max_connections must be at least 1".into(),
        ));
    }

    let mut seen = HashSet::new();
    for table in &config.tables {
        if table.name.trim().is_empty() {
            return Err(RefreshError::Config("table name is required".into()));
        }
        if !seen.insert(table.name.to_lowercase()) {
            return Err(RefreshError::Config(format!(
                "table '{}' is configured more than once",
                table.name
            )));
        }
        if let Some(0) = table.batch_size {
            return Err(RefreshError::Config(format!(
                "tables.{}.batch_size must be at least 1",
                table.name
            )));
        }
        if let Some(0) = table.row_limit {
            return Err(RefreshError::Config(format!(
                "tables.{}.row_limit must be at least 1",
                table.name
            )));
        }
        if table.strategy == StrategyKind::StagingPartitionSwitch
            && table.partition_column().is_none()
        {
            return Err(RefreshError::Config(format!(
                "tables.{}: staging_partition_switch requires partition_column or incremental_column",
                table.name
            )));
        }
        if table.sync_mode != SyncMode::FullReplace && table.incremental_column.is_none() {
            warn!(
                "Table {} uses {} without incremental_column; it will always refresh fully",
                table.name, table.sync_mode
            );
        }
    }

    Ok(())
}

fn validate_database(prefix: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host().is_empty() {
        return Err(RefreshError::Config(format!("{}.server is required", prefix)));
    }
    if db.database.is_empty() {
        return Err(RefreshError::Config(format!(
            "{}.database is required",
            prefix
        )));
    }
    match db.auth_type {
        AuthType::Sql => {
            if db.user.as_deref().map_or(true, str::is_empty) {
                return Err(RefreshError::Config(format!(
                    "{}.user is required for sql authentication (set it in the environment)",
                    prefix
                )));
            }
        }
        AuthType::Windows => {
            return Err(RefreshError::Config(format!(
                "{}.auth_type 'windows' is not supported; use 'sql'",
                prefix
            )));
        }
    }
    Ok(())
}
