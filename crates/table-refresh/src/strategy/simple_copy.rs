//! Direct copy from source into the live target table.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tracing::{debug, info};

use super::{plan_read, read_rows, RefreshResult, RefreshStrategy};
use crate::config::{StrategyKind, TableConfig};
use crate::error::Result;
use crate::handler::DataHandler;

const DEFAULT_BATCH_SIZE: usize = 5000;

/// Appends source rows straight into the target table.
///
/// Full reads optionally truncate the target first. Nothing is staged, so a
/// failure part-way leaves the batches already inserted in place.
pub struct SimpleCopyStrategy {
    source: Arc<dyn DataHandler>,
    target: Arc<dyn DataHandler>,
    table: TableConfig,
}

impl SimpleCopyStrategy {
    pub fn new(source: Arc<dyn DataHandler>, target: Arc<dyn DataHandler>, table: TableConfig) -> Self {
        Self {
            source,
            target,
            table,
        }
    }
}

#[async_trait]
impl RefreshStrategy for SimpleCopyStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SimpleCopy
    }

    async fn refresh(&self) -> Result<RefreshResult> {
        info!("Starting simple copy refresh for table {}", self.table.name);
        let start_time = Local::now();

        let plan = plan_read(self.target.as_ref(), &self.table).await?;

        if plan.is_full() && self.table.truncate_target {
            self.target.truncate_table(&self.table.name).await?;
        }

        let rows = read_rows(self.source.as_ref(), &self.table, &plan).await?;
        debug!("Read {} rows from source {}", rows.len(), self.table.name);

        let rows_processed = if rows.is_empty() {
            0
        } else {
            self.target
                .bulk_insert(
                    &self.table.name,
                    &rows,
                    self.table.batch_size_or(DEFAULT_BATCH_SIZE),
                )
                .await?
        };

        info!(
            "Simple copy of {} finished: {} rows ({})",
            self.table.name, rows_processed, plan.sync_mode
        );

        Ok(
            RefreshResult::success(&self.table, plan.sync_mode, rows_processed, start_time)
                .with_incremental_from(plan.watermark.as_ref()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IncrementalType, SyncMode};
    use crate::core::{Row, SqlValue};
    use crate::error::RefreshError;
    use crate::handler::testing::{Call, RecordingHandler};
    use crate::strategy::RefreshStatus;

    fn table(mode: SyncMode) -> TableConfig {
        let mut t = TableConfig::new("Customers", StrategyKind::SimpleCopy, mode);
        t.incremental_column = Some("customer_id".into());
        t.incremental_type = Some(IncrementalType::Identity);
        t
    }

    fn customers(n: i32) -> Vec<Row> {
        (1..=n)
            .map(|i| {
                Row::new()
                    .with("customer_id", SqlValue::I32(i))
                    .with("name", SqlValue::String(format!("customer {}", i)))
            })
            .collect()
    }

    fn strategy(
        source: RecordingHandler,
        target: RecordingHandler,
        table: TableConfig,
    ) -> (Arc<RecordingHandler>, Arc<RecordingHandler>, SimpleCopyStrategy) {
        let source = Arc::new(source);
        let target = Arc::new(target);
        let s = SimpleCopyStrategy::new(source.clone(), target.clone(), table);
        (source, target, s)
    }

    #[tokio::test]
    async fn test_full_refresh_truncates_and_inserts() {
        let mut t = table(SyncMode::FullReplace);
        t.truncate_target = true;
        let (source, target, s) = strategy(
            RecordingHandler::new().on_query("SELECT * FROM Customers", customers(3)),
            RecordingHandler::new(),
            t,
        );

        let result = s.refresh().await.unwrap();

        assert_eq!(result.status, RefreshStatus::Success);
        assert_eq!(result.rows_processed, 3);
        assert_eq!(result.sync_mode, "full_replace");
        assert!(result.incremental_from.is_none());
        assert_eq!(source.queries(), vec!["SELECT * FROM Customers"]);
        assert_eq!(
            target.calls(),
            vec![
                Call::Truncate("Customers".into()),
                Call::BulkInsert {
                    table: "Customers".into(),
                    rows: 3,
                    batch_size: 5000
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_full_refresh_with_empty_source_skips_insert() {
        let (_, target, s) = strategy(
            RecordingHandler::new(),
            RecordingHandler::new(),
            table(SyncMode::FullReplace),
        );

        let result = s.refresh().await.unwrap();

        assert_eq!(result.status, RefreshStatus::Success);
        assert_eq!(result.rows_processed, 0);
        assert!(target.bulk_inserts().is_empty());
    }

    #[tokio::test]
    async fn test_row_limit_and_batch_size() {
        let mut t = table(SyncMode::FullReplace);
        t.row_limit = Some(2);
        t.batch_size = Some(1);
        let (source, target, s) = strategy(
            RecordingHandler::new().on_query("FETCH NEXT 2 ROWS ONLY", customers(2)),
            RecordingHandler::new(),
            t,
        );

        s.refresh().await.unwrap();

        assert_eq!(
            source.queries(),
            vec!["SELECT * FROM Customers ORDER BY 1 OFFSET 0 ROWS FETCH NEXT 2 ROWS ONLY"]
        );
        assert_eq!(target.bulk_inserts(), vec![("Customers".to_string(), 2, 1)]);
    }

    #[tokio::test]
    async fn test_incremental_reads_past_watermark() {
        let mut t = table(SyncMode::Incremental);
        t.truncate_target = true;
        let (source, target, s) = strategy(
            RecordingHandler::new().on_query("customer_id > 100", customers(2)),
            RecordingHandler::new().with_max_value(SqlValue::I32(100)),
            t,
        );

        let result = s.refresh().await.unwrap();

        assert_eq!(result.sync_mode, "incremental");
        assert_eq!(result.rows_processed, 2);
        assert_eq!(result.incremental_from.as_deref(), Some("100"));
        assert_eq!(
            source.queries(),
            vec!["SELECT * FROM Customers WHERE customer_id > 100"]
        );
        // Incremental reads never truncate.
        assert!(!target
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Truncate(_))));
    }

    #[tokio::test]
    async fn test_incremental_without_watermark_runs_full() {
        let (source, _, s) = strategy(
            RecordingHandler::new().on_query("SELECT * FROM Customers", customers(4)),
            RecordingHandler::new(),
            table(SyncMode::Incremental),
        );

        let result = s.refresh().await.unwrap();

        assert_eq!(result.sync_mode, "full_replace");
        assert_eq!(result.rows_processed, 4);
        assert!(result.incremental_from.is_none());
        assert_eq!(source.queries(), vec!["SELECT * FROM Customers"]);
    }

    #[tokio::test]
    async fn test_smart_sync_empty_target_is_full() {
        let (_, _, s) = strategy(
            RecordingHandler::new().on_query("SELECT * FROM Customers", customers(1)),
            RecordingHandler::new(),
            table(SyncMode::SmartSync),
        );

        let result = s.refresh().await.unwrap();
        assert_eq!(result.sync_mode, "smart_sync_full");
    }

    #[tokio::test]
    async fn test_smart_sync_populated_target_is_incremental() {
        let (source, _, s) = strategy(
            RecordingHandler::new(),
            RecordingHandler::new()
                .with_table_count(50)
                .with_max_value(SqlValue::I32(50)),
            table(SyncMode::SmartSync),
        );

        let result = s.refresh().await.unwrap();
        assert_eq!(result.sync_mode, "smart_sync_incremental");
        assert_eq!(result.rows_processed, 0);
        assert_eq!(
            source.queries(),
            vec!["SELECT * FROM Customers WHERE customer_id > 50"]
        );
    }

    #[tokio::test]
    async fn test_insert_failure_propagates() {
        let (_, _, s) = strategy(
            RecordingHandler::new().on_query("SELECT * FROM Customers", customers(2)),
            RecordingHandler::new().fail_insert("Customers"),
            table(SyncMode::FullReplace),
        );

        let err = s.refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::Query { .. }));
    }

    #[tokio::test]
    async fn test_result_timing() {
        let (_, _, s) = strategy(
            RecordingHandler::new(),
            RecordingHandler::new(),
            table(SyncMode::FullReplace),
        );

        let result = s.refresh().await.unwrap();
        assert!(result.end_time >= result.start_time);
        assert!(result.duration_seconds >= 0.0);
    }
}
