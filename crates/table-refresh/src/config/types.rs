//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source and target connections.
    pub databases: DatabasesConfig,

    /// Run-wide settings.
    #[serde(default)]
    pub settings: Settings,

    /// Tables to refresh, in run order.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Source and target database pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasesConfig {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,
}

/// Authentication mode for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// SQL Server login (user + password).
    #[default]
    Sql,
    /// Windows trusted connection.
    Windows,
}

/// SQL Server connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Server host, optionally with a port as `host,port`.
    pub server: String,

    /// Explicit port; overrides a port given in `server` (default: 1433).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Authentication mode (default: sql).
    #[serde(default)]
    pub auth_type: AuthType,

    /// Username. Usually resolved from the environment.
    #[serde(default)]
    pub user: Option<String>,

    /// Password. Usually resolved from the environment.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("auth_type", &self.auth_type)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

impl DatabaseConfig {
    /// Host part of `server`.
    pub fn host(&self) -> &str {
        match self.server.split_once(',') {
            Some((host, _)) => host.trim(),
            None => self.server.trim(),
        }
    }

    /// Effective port: explicit `port`, then `server`'s `,port` suffix, then 1433.
    pub fn port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        self.server
            .split_once(',')
            .and_then(|(_, port)| port.trim().parse().ok())
            .unwrap_or(1433)
    }

    /// Whether TLS should be required for this connection.
    pub fn encryption_enabled(&self) -> bool {
        !matches!(
            self.encrypt.to_lowercase().as_str(),
            "false" | "no" | "0" | "disable"
        )
    }
}

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Batch size hint kept for compatibility; strategies use their own defaults.
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Connection timeout in seconds (default: 30).
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,

    /// Command timeout in seconds (default: 300). Enforced per statement by the handler.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Accepted but not used: nothing is retried by the refresh engine.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Report what would run without touching data.
    #[serde(default)]
    pub dry_run: bool,

    /// Raise the default log level to debug.
    #[serde(default)]
    pub verbose_logging: bool,

    /// Pool size per connection (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_batch_size: default_batch_size(),
            connection_timeout: default_connection_timeout(),
            command_timeout: default_command_timeout(),
            max_retries: default_max_retries(),
            dry_run: false,
            verbose_logging: false,
            max_connections: default_max_connections(),
        }
    }
}

/// Refresh strategy for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Move rows straight into the live table.
    SimpleCopy,
    /// Load a staging table and switch partitions into the live table.
    StagingPartitionSwitch,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::SimpleCopy => "simple_copy",
            StrategyKind::StagingPartitionSwitch => "staging_partition_switch",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much data a refresh moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullReplace,
    Incremental,
    /// Full when the target is empty, incremental otherwise.
    SmartSync,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::FullReplace => "full_replace",
            SyncMode::Incremental => "incremental",
            SyncMode::SmartSync => "smart_sync",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of the incremental column, which decides the predicate shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalType {
    Identity,
    Date,
    Datetime,
}

/// Per-table refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name, identical in source and target.
    pub name: String,

    pub strategy: StrategyKind,

    pub sync_mode: SyncMode,

    /// Watermark column for incremental and smart sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_column: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_type: Option<IncrementalType>,

    /// Days to re-read behind a date watermark.
    #[serde(default)]
    pub date_buffer_days: u32,

    /// Truncate the target before a full refresh.
    #[serde(default)]
    pub truncate_target: bool,

    /// Rows per insert batch. Strategy default when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Limit a full read to the first N rows (sampling and testing only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u64>,

    /// Business-date column that drives partitioning (default: incremental_column).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_column: Option<String>,

    /// Partition function name (default: pf_<table>).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_function: Option<String>,

    /// Partition scheme name (default: ps_<table>).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_scheme: Option<String>,

    /// Filegroup given to new partitions (default: PRIMARY).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_filegroup: Option<String>,

    /// Accepted but not used; see DESIGN.md.
    #[serde(default)]
    pub fallback_to_full: bool,
}

impl TableConfig {
    /// Minimal config for a table; optional fields take their defaults.
    pub fn new(name: impl Into<String>, strategy: StrategyKind, sync_mode: SyncMode) -> Self {
        Self {
            name: name.into(),
            strategy,
            sync_mode,
            incremental_column: None,
            incremental_type: None,
            date_buffer_days: 0,
            truncate_target: false,
            batch_size: None,
            row_limit: None,
            partition_column: None,
            partition_function: None,
            partition_scheme: None,
            partition_filegroup: None,
            fallback_to_full: false,
        }
    }

    /// Column whose values decide partition boundaries.
    pub fn partition_column(&self) -> Option<&str> {
        self.partition_column
            .as_deref()
            .or(self.incremental_column.as_deref())
    }

    pub fn partition_function(&self) -> String {
        self.partition_function
            .clone()
            .unwrap_or_else(|| format!("pf_{}", self.name))
    }

    pub fn partition_scheme(&self) -> String {
        self.partition_scheme
            .clone()
            .unwrap_or_else(|| format!("ps_{}", self.name))
    }

    pub fn partition_filegroup(&self) -> &str {
        self.partition_filegroup.as_deref().unwrap_or("PRIMARY")
    }

    pub fn staging_table(&self) -> String {
        format!("{}_staging", self.name)
    }

    /// Batch size, falling back to the strategy's default.
    pub fn batch_size_or(&self, default: usize) -> usize {
        self.batch_size.unwrap_or(default)
    }
}

// Default value functions for serde
fn default_true_string() -> String {
    "true".to_string()
}

fn default_batch_size() -> usize {
    5000
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_connections() -> u32 {
    4
}
