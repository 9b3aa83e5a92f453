//! Refresh strategies and their shared read planning.
//!
//! A strategy moves one table from source to target. Both strategies decide
//! what to read the same way: [`plan_read`] picks full or incremental from
//! the sync mode and the target's current state, and [`read_rows`] runs the
//! resulting SELECT against the source.

pub mod partition;
pub mod predicate;
mod simple_copy;
mod staging_switch;

pub use partition::{required_partitions, PartitionPlanner};
pub use predicate::incremental_predicate;
pub use simple_copy::SimpleCopyStrategy;
pub use staging_switch::StagingSwitchStrategy;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{StrategyKind, SyncMode, TableConfig};
use crate::core::{Row, SqlValue};
use crate::error::{RefreshError, Result};
use crate::handler::DataHandler;

/// Result label of a full read.
pub const MODE_FULL_REPLACE: &str = "full_replace";
/// Result label of an incremental read.
pub const MODE_INCREMENTAL: &str = "incremental";
/// Result label of a smart sync that found the target empty.
pub const MODE_SMART_SYNC_FULL: &str = "smart_sync_full";
/// Result label of a smart sync against a populated target.
pub const MODE_SMART_SYNC_INCREMENTAL: &str = "smart_sync_incremental";

/// Outcome of one table refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Success,
    Error,
    DryRun,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Success => "success",
            RefreshStatus::Error => "error",
            RefreshStatus::DryRun => "dry_run",
        }
    }
}

impl std::fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one refresh of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResult {
    pub table_name: String,
    pub strategy: StrategyKind,
    /// Mode actually used, e.g. `smart_sync_full`.
    pub sync_mode: String,
    pub rows_processed: u64,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration_seconds: f64,
    pub status: RefreshStatus,
    /// Watermark the incremental read started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_from: Option<String>,
    /// Boundaries split in during a staging refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions_created: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RefreshResult {
    /// Successful refresh started at `start_time`, ending now.
    pub fn success(
        table: &TableConfig,
        sync_mode: &str,
        rows_processed: u64,
        start_time: DateTime<Local>,
    ) -> Self {
        let end_time = Local::now();
        Self {
            table_name: table.name.clone(),
            strategy: table.strategy,
            sync_mode: sync_mode.to_string(),
            rows_processed,
            start_time,
            end_time,
            duration_seconds: elapsed_seconds(start_time, end_time),
            status: RefreshStatus::Success,
            incremental_from: None,
            partitions_created: None,
            error: None,
        }
    }

    /// Failed refresh of `table_name`, stamped now.
    pub fn failed(
        table_name: &str,
        strategy: StrategyKind,
        sync_mode: SyncMode,
        start_time: DateTime<Local>,
        error: &RefreshError,
    ) -> Self {
        let end_time = Local::now();
        Self {
            table_name: table_name.to_string(),
            strategy,
            sync_mode: sync_mode.to_string(),
            rows_processed: 0,
            start_time,
            end_time,
            duration_seconds: elapsed_seconds(start_time, end_time),
            status: RefreshStatus::Error,
            incremental_from: None,
            partitions_created: None,
            error: Some(error.to_string()),
        }
    }

    /// What a refresh would do, without doing it.
    pub fn dry_run(table: &TableConfig) -> Self {
        let now = Local::now();
        Self {
            table_name: table.name.clone(),
            strategy: table.strategy,
            sync_mode: table.sync_mode.to_string(),
            rows_processed: 0,
            start_time: now,
            end_time: now,
            duration_seconds: 0.0,
            status: RefreshStatus::DryRun,
            incremental_from: None,
            partitions_created: None,
            error: None,
        }
    }

    pub fn with_incremental_from(mut self, watermark: Option<&SqlValue>) -> Self {
        self.incremental_from = watermark.map(ToString::to_string);
        self
    }

    pub fn with_partitions_created(mut self, partitions: Vec<i32>) -> Self {
        self.partitions_created = Some(partitions);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RefreshStatus::Success
    }

    /// Pretty JSON for CLI output.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn elapsed_seconds(start: DateTime<Local>, end: DateTime<Local>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// A way of refreshing one table.
#[async_trait]
pub trait RefreshStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Refresh the table; errors propagate to the caller.
    async fn refresh(&self) -> Result<RefreshResult>;
}

/// Strategy configured for `table`.
pub fn for_table(
    source: Arc<dyn DataHandler>,
    target: Arc<dyn DataHandler>,
    table: TableConfig,
) -> Box<dyn RefreshStrategy> {
    match table.strategy {
        StrategyKind::SimpleCopy => Box::new(SimpleCopyStrategy::new(source, target, table)),
        StrategyKind::StagingPartitionSwitch => {
            Box::new(StagingSwitchStrategy::new(source, target, table))
        }
    }
}

/// What a refresh will read, decided before reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPlan {
    /// Label reported in the result.
    pub sync_mode: &'static str,
    /// Highest incremental value in the target; `None` means a full read.
    pub watermark: Option<SqlValue>,
}

impl ReadPlan {
    fn full(sync_mode: &'static str) -> Self {
        Self {
            sync_mode,
            watermark: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.watermark.is_none()
    }
}

/// Decide between a full and an incremental read for `table`.
///
/// Incremental modes without a watermark (no column configured, empty target
/// or all-null column) degrade to a full read.
pub async fn plan_read(target: &dyn DataHandler, table: &TableConfig) -> Result<ReadPlan> {
    match table.sync_mode {
        SyncMode::FullReplace => Ok(ReadPlan::full(MODE_FULL_REPLACE)),
        SyncMode::Incremental => match watermark(target, table).await? {
            Some(w) => Ok(ReadPlan {
                sync_mode: MODE_INCREMENTAL,
                watermark: Some(w),
            }),
            None => {
                info!(
                    "No existing data found, performing full refresh for {}",
                    table.name
                );
                Ok(ReadPlan::full(MODE_FULL_REPLACE))
            }
        },
        SyncMode::SmartSync => {
            let target_count = target.get_table_count(&table.name).await?;
            if target_count == 0 {
                info!(
                    "Target table {} is empty, performing full refresh",
                    table.name
                );
                return Ok(ReadPlan::full(MODE_SMART_SYNC_FULL));
            }
            info!(
                "Target table {} has {} rows, performing incremental refresh",
                table.name, target_count
            );
            Ok(ReadPlan {
                sync_mode: MODE_SMART_SYNC_INCREMENTAL,
                watermark: watermark(target, table).await?,
            })
        }
    }
}

async fn watermark(target: &dyn DataHandler, table: &TableConfig) -> Result<Option<SqlValue>> {
    match &table.incremental_column {
        Some(column) => target.get_max_value(&table.name, column).await,
        None => Ok(None),
    }
}

/// `SELECT *` over the whole table, honoring `row_limit`.
pub fn full_select(table: &TableConfig) -> String {
    let mut sql = format!("SELECT * FROM {}", table.name);
    if let Some(limit) = table.row_limit {
        sql.push_str(&format!(
            " ORDER BY 1 OFFSET 0 ROWS FETCH NEXT {} ROWS ONLY",
            limit
        ));
    }
    sql
}

/// SELECT for `plan` against `table`.
pub fn select_for(table: &TableConfig, plan: &ReadPlan) -> String {
    match (&plan.watermark, &table.incremental_column) {
        (Some(w), Some(column)) => format!(
            "SELECT * FROM {} WHERE {}",
            table.name,
            incremental_predicate(table, column, w)
        ),
        _ => full_select(table),
    }
}

/// Read the rows `plan` selects from the source.
pub async fn read_rows(
    source: &dyn DataHandler,
    table: &TableConfig,
    plan: &ReadPlan,
) -> Result<Vec<Row>> {
    source.execute_query(&select_for(table, plan)).await
}
