//! Refresh through a staging table and partition switching.
//!
//! Rows are loaded into `<table>_staging`, which is aligned on the table's
//! partition scheme. Each affected partition of the live table is then
//! switched out to a holder table and replaced by the staged partition, so
//! readers of the live table never see a half-loaded day.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tracing::{debug, error, info, warn};

use super::partition::{required_partitions, PartitionPlanner};
use super::{plan_read, read_rows, RefreshResult, RefreshStrategy};
use crate::config::{StrategyKind, TableConfig};
use crate::core::SqlValue;
use crate::error::{RefreshError, Result};
use crate::handler::DataHandler;

const DEFAULT_BATCH_SIZE: usize = 10_000;

pub struct StagingSwitchStrategy {
    source: Arc<dyn DataHandler>,
    target: Arc<dyn DataHandler>,
    table: TableConfig,
}

/// What the load phase produced, for the result.
struct Loaded {
    sync_mode: &'static str,
    watermark: Option<SqlValue>,
    rows_inserted: u64,
    partitions_created: Vec<i32>,
}

impl StagingSwitchStrategy {
    pub fn new(source: Arc<dyn DataHandler>, target: Arc<dyn DataHandler>, table: TableConfig) -> Self {
        Self {
            source,
            target,
            table,
        }
    }

    fn planner(&self) -> PartitionPlanner<'_> {
        PartitionPlanner::new(self.target.as_ref(), &self.table)
    }

    async fn load_and_switch(&self, staging: &str) -> Result<Loaded> {
        let plan = plan_read(self.target.as_ref(), &self.table).await?;
        let rows = read_rows(self.source.as_ref(), &self.table, &plan).await?;
        debug!("Read {} rows from source {}", rows.len(), self.table.name);

        let mut partitions_created = Vec::new();
        let mut rows_inserted = 0;

        if !rows.is_empty() {
            let column = self.table.partition_column().ok_or_else(|| {
                RefreshError::Config(format!(
                    "table {} has no partition column for staging_partition_switch",
                    self.table.name
                ))
            })?;
            let required = required_partitions(&rows, column);
            partitions_created = self.planner().ensure_partitions(&required).await?;

            self.create_aligned(staging, column).await?;
            rows_inserted = self
                .target
                .bulk_insert(staging, &rows, self.table.batch_size_or(DEFAULT_BATCH_SIZE))
                .await?;

            if rows_inserted > 0 {
                self.replicate_indexes(staging).await;
                if required.is_empty() {
                    warn!(
                        "Staged {} rows for {} but none had a usable {} value; nothing switched",
                        rows_inserted, self.table.name, column
                    );
                    rows_inserted = 0;
                } else {
                    self.switch_partitions(staging, column, &required).await?;
                }
            }
        }

        Ok(Loaded {
            sync_mode: plan.sync_mode,
            watermark: plan.watermark,
            rows_inserted,
            partitions_created,
        })
    }

    /// Empty copy of the live table, clustered on the partition scheme so its
    /// partition numbers match the live table's. Used for staging and holders.
    async fn create_aligned(&self, name: &str, partition_column: &str) -> Result<()> {
        self.target
            .execute_non_query(&format!(
                "SELECT TOP 0 * INTO {} FROM {}",
                name, self.table.name
            ))
            .await?;
        self.target
            .execute_non_query(&format!(
                "CREATE CLUSTERED INDEX CIX_{name} ON {name} ({column}) ON {scheme}({column})",
                name = name,
                column = partition_column,
                scheme = self.table.partition_scheme(),
            ))
            .await?;
        debug!("Created partition-aligned table {}", name);
        Ok(())
    }

    /// Copy the live table's non-clustered indexes onto staging.
    ///
    /// Failures are logged; the switch itself reports any mismatch.
    async fn replicate_indexes(&self, staging: &str) {
        let sql = format!(
            "SELECT i.name AS index_name, i.is_unique, \
             STRING_AGG(QUOTENAME(c.name), ', ') WITHIN GROUP (ORDER BY ic.key_ordinal) AS columns \
             FROM sys.indexes i \
             INNER JOIN sys.index_columns ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id \
             INNER JOIN sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
             WHERE i.object_id = OBJECT_ID('{}') AND i.type = 2 AND ic.is_included_column = 0 \
             GROUP BY i.name, i.is_unique, i.index_id \
             ORDER BY i.index_id",
            self.table.name.replace('\'', "''")
        );

        let indexes = match self.target.execute_query(&sql).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to read indexes of {}: {}", self.table.name, e);
                return;
            }
        };

        for index in &indexes {
            let (Some(SqlValue::String(name)), Some(SqlValue::String(columns))) =
                (index.get("index_name"), index.get("columns"))
            else {
                continue;
            };
            let unique = matches!(index.get("is_unique"), Some(SqlValue::Bool(true)));
            let index_name = format!("{}_staging", name);
            let create = format!(
                "CREATE {}NONCLUSTERED INDEX {} ON {} ({})",
                if unique { "UNIQUE " } else { "" },
                index_name,
                staging,
                columns
            );
            match self.target.execute_non_query(&create).await {
                Ok(_) => debug!("Created index {} on staging table", index_name),
                Err(e) => warn!("Failed to create index {} on {}: {}", index_name, staging, e),
            }
        }
    }

    /// Swap each boundary's partition from staging into the live table.
    /// The first failure stops the remaining switches.
    async fn switch_partitions(
        &self,
        staging: &str,
        partition_column: &str,
        boundaries: &[i32],
    ) -> Result<()> {
        for &boundary in boundaries {
            let holder = format!("{}_temp_{}", self.table.name, boundary);
            match self
                .switch_partition(staging, partition_column, boundary, &holder)
                .await
            {
                Ok(partition_number) => info!(
                    "Switched partition {} for date {} into {}",
                    partition_number, boundary, self.table.name
                ),
                Err(e) => {
                    error!(
                        "Failed to switch partition for date {} on {}; holder table {} left in place: {}",
                        boundary, self.table.name, holder, e
                    );
                    return Err(match e {
                        RefreshError::Partition { .. } => e,
                        other => RefreshError::partition(
                            &self.table.name,
                            format!("switch for date {} failed: {}", boundary, other),
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    async fn switch_partition(
        &self,
        staging: &str,
        partition_column: &str,
        boundary: i32,
        holder: &str,
    ) -> Result<i32> {
        let partition_number = self.planner().partition_number(boundary).await?;
        let live = &self.table.name;

        self.create_aligned(holder, partition_column).await?;
        let statements = [
            format!(
                "ALTER TABLE {} SWITCH PARTITION {} TO {} PARTITION {}",
                live, partition_number, holder, partition_number
            ),
            format!(
                "ALTER TABLE {} SWITCH PARTITION {} TO {} PARTITION {}",
                staging, partition_number, live, partition_number
            ),
            format!("DROP TABLE IF EXISTS {}", holder),
        ];
        for sql in &statements {
            self.target.execute_non_query(sql).await?;
        }
        Ok(partition_number)
    }

    /// Drop staging. Never fails the refresh.
    async fn cleanup_staging(&self, staging: &str) {
        match self
            .target
            .execute_non_query(&format!("DROP TABLE IF EXISTS {}", staging))
            .await
        {
            Ok(_) => debug!("Cleaned up staging table {}", staging),
            Err(e) => warn!("Failed to cleanup staging table {}: {}", staging, e),
        }
    }
}

#[async_trait]
impl RefreshStrategy for StagingSwitchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::StagingPartitionSwitch
    }

    async fn refresh(&self) -> Result<RefreshResult> {
        info!(
            "Starting staging partition switch refresh for table {}",
            self.table.name
        );
        let start_time = Local::now();
        let staging = self.table.staging_table();

        let outcome = self.load_and_switch(&staging).await;
        self.cleanup_staging(&staging).await;

        match outcome {
            Ok(loaded) => Ok(RefreshResult::success(
                &self.table,
                loaded.sync_mode,
                loaded.rows_inserted,
                start_time,
            )
            .with_incremental_from(loaded.watermark.as_ref())
            .with_partitions_created(loaded.partitions_created)),
            Err(e) => {
                error!(
                    "Staging partition switch failed for {}: {}",
                    self.table.name, e
                );
                Err(e)
            }
        }
    }
}
