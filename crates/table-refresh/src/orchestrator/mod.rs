//! Refresh orchestrator - runs configured tables against a source and target.

use crate::config::{Config, StrategyKind, SyncMode, TableConfig};
use crate::error::{RefreshError, Result};
use crate::handler::{DataHandler, MssqlHandler};
use crate::strategy::{self, RefreshResult, RefreshStatus};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Refresh orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn DataHandler>,
    target: Arc<dyn DataHandler>,
}

/// Row counts and watermarks of one table on both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStatus {
    pub table_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_mode: Option<SyncMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_count: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_count: Option<i64>,

    /// Highest incremental value in the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_max_value: Option<String>,

    /// Highest incremental value in the target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_max_value: Option<String>,

    /// Set when the status query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub last_checked: DateTime<Local>,
}

/// Result of probing both connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
}

/// Tally of a batch of refresh results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
    pub dry_run: usize,
    pub rows_processed: u64,
    /// Tables that ended with `error` status.
    pub failed_tables: Vec<String>,
}

impl BatchSummary {
    pub fn from_results(results: &[RefreshResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result.status {
                RefreshStatus::Success => summary.success += 1,
                RefreshStatus::DryRun => summary.dry_run += 1,
                RefreshStatus::Error => {
                    summary.errors += 1;
                    summary.failed_tables.push(result.table_name.clone());
                }
            }
            summary.rows_processed += result.rows_processed;
        }
        summary
    }

    /// `RefreshFailed` naming the failed tables, if any failed.
    pub fn into_result(self) -> Result<Self> {
        if self.failed_tables.is_empty() {
            Ok(self)
        } else {
            Err(RefreshError::RefreshFailed(self.failed_tables.join(", ")))
        }
    }
}

impl Orchestrator {
    /// Create an orchestrator over already connected handlers.
    pub fn new(config: Config, source: Arc<dyn DataHandler>, target: Arc<dyn DataHandler>) -> Self {
        Self {
            config,
            source,
            target,
        }
    }

    /// Connect to both databases in `config`.
    pub async fn connect(config: Config) -> Result<Self> {
        let source =
            MssqlHandler::connect(&config.databases.source, &config.settings, "source").await?;
        let target =
            MssqlHandler::connect(&config.databases.target, &config.settings, "target").await?;
        Ok(Self::new(config, Arc::new(source), Arc::new(target)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Refresh one table. Failures come back as an `error` result.
    pub async fn refresh_table(&self, table_name: &str) -> RefreshResult {
        let start_time = Local::now();
        let table = match self.config.table(table_name) {
            Ok(table) => table.clone(),
            Err(e) => {
                error!("Failed to refresh table {}: {}", table_name, e);
                return RefreshResult::failed(
                    table_name,
                    StrategyKind::SimpleCopy,
                    SyncMode::FullReplace,
                    start_time,
                    &e,
                );
            }
        };

        if self.config.settings.dry_run {
            info!(
                "DRY RUN: Would refresh table {} using {} ({})",
                table.name, table.strategy, table.sync_mode
            );
            return RefreshResult::dry_run(&table);
        }

        let (strategy_kind, sync_mode) = (table.strategy, table.sync_mode);
        let strategy = strategy::for_table(self.source.clone(), self.target.clone(), table);
        match strategy.refresh().await {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to refresh table {}: {}", table_name, e);
                RefreshResult::failed(table_name, strategy_kind, sync_mode, start_time, &e)
            }
        }
    }

    /// Refresh every configured table in order.
    pub async fn refresh_all_tables(&self) -> Vec<RefreshResult> {
        info!("Starting refresh for {} tables", self.config.tables.len());

        let mut results = Vec::with_capacity(self.config.tables.len());
        for table in &self.config.tables {
            results.push(self.refresh_table(&table.name).await);
        }

        let summary = BatchSummary::from_results(&results);
        info!(
            "Completed refresh for all tables. Success: {}, Errors: {}",
            summary.success, summary.errors
        );
        results
    }

    /// Counts and watermarks for one table, or all tables.
    pub async fn table_status(&self, table_name: Option<&str>) -> Result<Vec<TableStatus>> {
        let tables = match table_name {
            Some(name) => vec![self.config.table(name)?],
            None => self.config.tables.iter().collect(),
        };

        let mut statuses = Vec::with_capacity(tables.len());
        for table in tables {
            let mut status = TableStatus {
                table_name: table.name.clone(),
                strategy: None,
                sync_mode: None,
                source_count: None,
                target_count: None,
                source_max_value: None,
                target_max_value: None,
                error: None,
                last_checked: Local::now(),
            };

            match self.collect_status(table, &mut status).await {
                Ok(()) => {
                    status.strategy = Some(table.strategy);
                    status.sync_mode = Some(table.sync_mode);
                }
                Err(e) => {
                    error!("Failed to get status for table {}: {}", table.name, e);
                    status.source_count = None;
                    status.target_count = None;
                    status.source_max_value = None;
                    status.target_max_value = None;
                    status.error = Some(e.to_string());
                }
            }
            statuses.push(status);
        }

        Ok(statuses)
    }

    async fn collect_status(
        &self,
        table: &TableConfig,
        status: &mut TableStatus,
    ) -> Result<()> {
        status.source_count = Some(self.source.get_table_count(&table.name).await?);
        status.target_count = Some(self.target.get_table_count(&table.name).await?);

        if let Some(column) = &table.incremental_column {
            status.source_max_value = self
                .source
                .get_max_value(&table.name, column)
                .await?
                .map(|v| v.to_string());
            status.target_max_value = self
                .target
                .get_max_value(&table.name, column)
                .await?
                .map(|v| v.to_string());
        }
        Ok(())
    }

    /// Probe both connections with a trivial query.
    pub async fn health_check(&self) -> HealthCheckResult {
        let (source_connected, source_latency_ms, source_error) = probe(self.source.as_ref()).await;
        let (target_connected, target_latency_ms, target_error) = probe(self.target.as_ref()).await;

        info!(
            "Connection test results: source={}, target={}",
            source_connected, target_connected
        );

        HealthCheckResult {
            healthy: source_connected && target_connected,
            source_connected,
            source_latency_ms,
            source_error,
            target_connected,
            target_latency_ms,
            target_error,
        }
    }
}

async fn probe(handler: &dyn DataHandler) -> (bool, u64, Option<String>) {
    let start = Instant::now();
    let outcome = handler.test_connection().await;
    let latency_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(()) => (true, latency_ms, None),
        Err(e) => (false, latency_ms, Some(e.to_string())),
    }
}

impl HealthCheckResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthType, DatabaseConfig, DatabasesConfig, Settings};
    use crate::core::{Row, SqlValue};
    use crate::handler::testing::RecordingHandler;

    fn db(server: &str) -> DatabaseConfig {
        DatabaseConfig {
            server: server.to_string(),
            port: None,
            database: "Sales".to_string(),
            auth_type: AuthType::Sql,
            user: Some("sa".to_string()),
            password: Some("pw".to_string()),
            encrypt: "false".to_string(),
            trust_server_cert: false,
        }
    }

    fn config(tables: Vec<TableConfig>) -> Config {
        Config {
            databases: DatabasesConfig {
                source: db("src"),
                target: db("dst"),
            },
            settings: Settings::default(),
            tables,
        }
    }

    fn customers() -> TableConfig {
        let mut t = TableConfig::new("Customers", StrategyKind::SimpleCopy, SyncMode::Incremental);
        t.incremental_column = Some("customer_id".into());
        t
    }

    fn orders() -> TableConfig {
        TableConfig::new("Orders", StrategyKind::SimpleCopy, SyncMode::FullReplace)
    }

    fn orchestrator(
        config: Config,
        source: RecordingHandler,
        target: RecordingHandler,
    ) -> Orchestrator {
        Orchestrator::new(config, Arc::new(source), Arc::new(target))
    }

    #[tokio::test]
    async fn test_refresh_table_success() {
        let o = orchestrator(
            config(vec![orders()]),
            RecordingHandler::new().on_query(
                "SELECT * FROM Orders",
                vec![Row::new().with("id", SqlValue::I32(1))],
            ),
            RecordingHandler::new(),
        );

        let result = o.refresh_table("Orders").await;
        assert_eq!(result.status, RefreshStatus::Success);
        assert_eq!(result.rows_processed, 1);
    }

    #[tokio::test]
    async fn test_unknown_table_is_error_result() {
        let o = orchestrator(
            config(vec![orders()]),
            RecordingHandler::new(),
            RecordingHandler::new(),
        );

        let result = o.refresh_table("Missing").await;
        assert_eq!(result.status, RefreshStatus::Error);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let mut cfg = config(vec![orders()]);
        cfg.settings.dry_run = true;
        let source = Arc::new(RecordingHandler::new());
        let target = Arc::new(RecordingHandler::new());
        let o = Orchestrator::new(cfg, source.clone(), target.clone());

        let result = o.refresh_table("Orders").await;
        assert_eq!(result.status, RefreshStatus::DryRun);
        assert_eq!(result.sync_mode, "full_replace");
        assert!(source.calls().is_empty());
        assert!(target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_batch_continues_after_failure() {
        let o = orchestrator(
            config(vec![customers(), orders()]),
            RecordingHandler::new()
                .fail_query("FROM Customers")
                .on_query("FROM Orders", vec![Row::new().with("id", SqlValue::I32(1))]),
            RecordingHandler::new(),
        );

        let results = o.refresh_all_tables().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, RefreshStatus::Error);
        assert_eq!(results[0].strategy, StrategyKind::SimpleCopy);
        assert_eq!(results[1].status, RefreshStatus::Success);

        let summary = BatchSummary::from_results(&results);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.failed_tables, vec!["Customers".to_string()]);

        let err = summary.into_result().unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_REFRESH_FAILED);
    }

    #[tokio::test]
    async fn test_table_status_reports_counts_and_watermarks() {
        let o = orchestrator(
            config(vec![customers(), orders()]),
            RecordingHandler::new()
                .with_table_count(10)
                .with_max_value(SqlValue::I32(10)),
            RecordingHandler::new()
                .with_table_count(8)
                .with_max_value(SqlValue::I32(8)),
        );

        let statuses = o.table_status(None).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].source_count, Some(10));
        assert_eq!(statuses[0].target_count, Some(8));
        assert_eq!(statuses[0].target_max_value.as_deref(), Some("8"));
        assert!(statuses[1].source_max_value.is_none());

        let one = o.table_status(Some("Orders")).await.unwrap();
        assert_eq!(one.len(), 1);
        assert!(o.table_status(Some("Nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_health_check() {
        let healthy = orchestrator(
            config(vec![]),
            RecordingHandler::new(),
            RecordingHandler::new(),
        );
        let result = healthy.health_check().await;
        assert!(result.healthy);
        assert!(result.source_error.is_none());

        let broken = orchestrator(
            config(vec![]),
            RecordingHandler::new(),
            RecordingHandler::new().fail_query("SELECT 1"),
        );
        let result = broken.health_check().await;
        assert!(!result.healthy);
        assert!(result.source_connected);
        assert!(!result.target_connected);
        assert!(result.target_error.is_some());
    }
}
