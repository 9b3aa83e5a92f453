//! Partition boundary planning for range-partitioned target tables.
//!
//! Boundaries are `YYYYMMDD` integers. The planner derives the boundaries a
//! batch of rows needs, compares them with the partition function on the
//! target and splits in whatever is missing.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, warn};

use crate::config::TableConfig;
use crate::core::{Row, SqlValue};
use crate::error::{RefreshError, Result};
use crate::handler::DataHandler;

/// Boundaries needed by `rows`, ascending and without duplicates.
///
/// Nulls and empty text are ignored. Values that cannot be read as a day are
/// logged and skipped.
pub fn required_partitions(rows: &[Row], partition_column: &str) -> Vec<i32> {
    let mut boundaries = BTreeSet::new();

    for row in rows {
        let Some(value) = row.get(partition_column) else {
            continue;
        };
        if value.is_null() || matches!(value, SqlValue::String(s) if s.trim().is_empty()) {
            continue;
        }
        match boundary_of(value) {
            Some(boundary) => {
                boundaries.insert(boundary);
            }
            None => warn!("Could not parse partition date from: {}", value),
        }
    }

    boundaries.into_iter().collect()
}

/// Day key of a partition value.
fn boundary_of(value: &SqlValue) -> Option<i32> {
    if let Some(day) = value.as_date() {
        return Some(day_key(day));
    }
    match value {
        SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_) => {
            value.as_i64().and_then(|v| i32::try_from(v).ok())
        }
        SqlValue::Bool(_) | SqlValue::Bytes(_) => None,
        other => parse_day_key(&other.to_string()),
    }
}

fn day_key(day: NaiveDate) -> i32 {
    day.year() * 10_000 + day.month() as i32 * 100 + day.day() as i32
}

/// Read the first eight characters of `text` as `YYYYMMDD`.
fn parse_day_key(text: &str) -> Option<i32> {
    let head = text.trim().get(..8)?;
    if !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = head[..4].parse().ok()?;
    let month: u32 = head[4..6].parse().ok()?;
    let day: u32 = head[6..].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day).map(day_key)
}

/// Plans and applies partition boundaries for one table on the target.
pub struct PartitionPlanner<'a> {
    target: &'a dyn DataHandler,
    table: &'a TableConfig,
}

impl<'a> PartitionPlanner<'a> {
    pub fn new(target: &'a dyn DataHandler, table: &'a TableConfig) -> Self {
        Self { target, table }
    }

    /// Boundaries already defined by the table's range partition function.
    pub async fn existing_partitions(&self) -> Result<Vec<i32>> {
        let sql = format!(
            "SELECT DISTINCT CAST(prv.value AS INT) AS partition_value \
             FROM sys.partition_schemes ps \
             INNER JOIN sys.partition_functions pf ON ps.function_id = pf.function_id \
             INNER JOIN sys.partition_range_values prv ON pf.function_id = prv.function_id \
             INNER JOIN sys.indexes i ON ps.data_space_id = i.data_space_id \
             INNER JOIN sys.objects o ON i.object_id = o.object_id \
             WHERE o.name = '{}' AND pf.type = 'R' \
             ORDER BY partition_value",
            object_name(&self.table.name).replace('\'', "''")
        );

        let rows = self.target.execute_query(&sql).await?;
        let mut boundaries: Vec<i32> = rows
            .iter()
            .filter_map(|row| row.get("partition_value").and_then(SqlValue::as_i64))
            .filter_map(|v| i32::try_from(v).ok())
            .collect();
        boundaries.sort_unstable();
        boundaries.dedup();

        debug!(
            "Table {} has {} existing partition boundaries",
            self.table.name,
            boundaries.len()
        );
        Ok(boundaries)
    }

    /// Split in every boundary of `required` that the target lacks, ascending.
    ///
    /// Returns exactly the boundaries created. A failed split stops the run;
    /// boundaries created before it stay.
    pub async fn ensure_partitions(&self, required: &[i32]) -> Result<Vec<i32>> {
        if required.is_empty() {
            return Ok(Vec::new());
        }

        let existing: BTreeSet<i32> = self.existing_partitions().await?.into_iter().collect();
        let missing: BTreeSet<i32> = required
            .iter()
            .copied()
            .filter(|b| !existing.contains(b))
            .collect();

        let mut created = Vec::with_capacity(missing.len());
        for boundary in missing {
            self.create_partition(boundary).await.map_err(|e| {
                RefreshError::partition(
                    &self.table.name,
                    format!("failed to create partition for date {}: {}", boundary, e),
                )
            })?;
            info!(
                "Created partition for date {} on table {}",
                boundary, self.table.name
            );
            created.push(boundary);
        }

        Ok(created)
    }

    async fn create_partition(&self, boundary: i32) -> Result<()> {
        self.target
            .execute_non_query(&format!(
                "ALTER PARTITION SCHEME {} NEXT USED [{}]",
                self.table.partition_scheme(),
                self.table.partition_filegroup()
            ))
            .await?;
        self.target
            .execute_non_query(&format!(
                "ALTER PARTITION FUNCTION {}() SPLIT RANGE ({})",
                self.table.partition_function(),
                boundary
            ))
            .await?;
        debug!("Created partition boundary at {}", boundary);
        Ok(())
    }

    /// Partition number that holds `boundary`.
    pub async fn partition_number(&self, boundary: i32) -> Result<i32> {
        let sql = format!(
            "SELECT $PARTITION.{}({}) AS partition_number",
            self.table.partition_function(),
            boundary
        );
        let rows = self.target.execute_query(&sql).await?;
        rows.first()
            .and_then(|row| row.get("partition_number"))
            .and_then(SqlValue::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| {
                RefreshError::partition(
                    &self.table.name,
                    format!("could not determine partition number for date {}", boundary),
                )
            })
    }
}

/// Bare object name of a possibly schema-qualified table (`dbo.[T]` -> `T`).
fn object_name(table: &str) -> &str {
    let name = table.rsplit('.').next().unwrap_or(table);
    name.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StrategyKind, SyncMode};
    use crate::handler::testing::RecordingHandler;

    fn rows(values: Vec<SqlValue>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| Row::new().with("id", SqlValue::I32(1)).with("report_date", v))
            .collect()
    }

    fn table() -> TableConfig {
        let mut t = TableConfig::new(
            "DailyReports",
            StrategyKind::StagingPartitionSwitch,
            SyncMode::Incremental,
        );
        t.incremental_column = Some("report_date".into());
        t
    }

    fn boundaries(values: &[i32]) -> Vec<Row> {
        values
            .iter()
            .map(|v| Row::new().with("partition_value", SqlValue::I32(*v)))
            .collect()
    }

    #[test]
    fn test_mixed_shapes_collapse_to_days() {
        let dt = NaiveDate::from_ymd_opt(2025, 2, 8)
            .unwrap()
            .and_hms_opt(15, 45, 0)
            .unwrap();
        let data = rows(vec![
            SqlValue::I32(20250207),
            SqlValue::DateTime(dt),
            SqlValue::I32(20250207),
        ]);
        assert_eq!(
            required_partitions(&data, "report_date"),
            vec![20250207, 20250208]
        );
    }

    #[test]
    fn test_equal_days_give_equal_boundaries() {
        let day = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        let data = rows(vec![
            SqlValue::Date(day),
            SqlValue::DateTime(day.and_hms_opt(23, 59, 59).unwrap()),
            SqlValue::I64(20241231),
            SqlValue::String("20241231".into()),
            SqlValue::String("20241231T120000".into()),
        ]);
        assert_eq!(required_partitions(&data, "report_date"), vec![20241231]);
    }

    #[test]
    fn test_nulls_empty_and_garbage_are_skipped() {
        let data = rows(vec![
            SqlValue::Null(crate::core::SqlNullType::Date),
            SqlValue::String("   ".into()),
            SqlValue::String("not a date".into()),
            SqlValue::String("20251399".into()),
            SqlValue::String("2025-03-01".into()),
            SqlValue::I32(20250301),
        ]);
        assert_eq!(required_partitions(&data, "report_date"), vec![20250301]);
    }

    #[test]
    fn test_missing_column_yields_nothing() {
        let data = rows(vec![SqlValue::I32(20250101)]);
        assert!(required_partitions(&data, "other_column").is_empty());
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name("DailyReports"), "DailyReports");
        assert_eq!(object_name("dbo.[DailyReports]"), "DailyReports");
    }

    #[tokio::test]
    async fn test_ensure_creates_only_missing_ascending() {
        let target = RecordingHandler::new()
            .on_query("sys.partition_range_values", boundaries(&[20250102, 20250101]));
        let table = table();
        let planner = PartitionPlanner::new(&target, &table);

        let created = planner
            .ensure_partitions(&[20250101, 20250102, 20250103, 20250105])
            .await
            .unwrap();

        assert_eq!(created, vec![20250103, 20250105]);
        assert_eq!(
            target.statements(),
            vec![
                "ALTER PARTITION SCHEME ps_DailyReports NEXT USED [PRIMARY]",
                "ALTER PARTITION FUNCTION pf_DailyReports() SPLIT RANGE (20250103)",
                "ALTER PARTITION SCHEME ps_DailyReports NEXT USED [PRIMARY]",
                "ALTER PARTITION FUNCTION pf_DailyReports() SPLIT RANGE (20250105)",
            ]
        );
    }

    #[tokio::test]
    async fn test_new_partition_uses_configured_filegroup() {
        let target = RecordingHandler::new();
        let mut table = table();
        table.partition_filegroup = Some("FG_Reports".into());
        let planner = PartitionPlanner::new(&target, &table);

        planner.ensure_partitions(&[20250301]).await.unwrap();

        assert_eq!(
            target.statements()[0],
            "ALTER PARTITION SCHEME ps_DailyReports NEXT USED [FG_Reports]"
        );
    }

    #[tokio::test]
    async fn test_ensure_with_all_existing_creates_nothing() {
        let target =
            RecordingHandler::new().on_query("sys.partition_range_values", boundaries(&[20250101]));
        let table = table();
        let planner = PartitionPlanner::new(&target, &table);

        assert!(planner.ensure_partitions(&[20250101]).await.unwrap().is_empty());
        assert!(target.statements().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_with_nothing_required_skips_lookup() {
        let target = RecordingHandler::new();
        let table = table();
        let planner = PartitionPlanner::new(&target, &table);

        assert!(planner.ensure_partitions(&[]).await.unwrap().is_empty());
        assert!(target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_split_is_partition_error() {
        let target = RecordingHandler::new().fail_non_query("SPLIT RANGE (20250102)");
        let table = table();
        let planner = PartitionPlanner::new(&target, &table);

        let err = planner
            .ensure_partitions(&[20250101, 20250102, 20250103])
            .await
            .unwrap_err();

        assert!(matches!(err, RefreshError::Partition { .. }));
        let splits: Vec<String> = target
            .statements()
            .into_iter()
            .filter(|s| s.contains("SPLIT"))
            .collect();
        // 20250101 stays; 20250103 is never attempted.
        assert_eq!(splits.len(), 2);
    }

    #[tokio::test]
    async fn test_existing_lookup_failure_propagates() {
        let target = RecordingHandler::new().fail_query("sys.partition_range_values");
        let table = table();
        let planner = PartitionPlanner::new(&target, &table);

        assert!(planner.ensure_partitions(&[20250101]).await.is_err());
    }

    #[tokio::test]
    async fn test_partition_number() {
        let target = RecordingHandler::new().on_query(
            "$PARTITION.pf_DailyReports(20250207)",
            vec![Row::new().with("partition_number", SqlValue::I32(38))],
        );
        let table = table();
        let planner = PartitionPlanner::new(&target, &table);

        assert_eq!(planner.partition_number(20250207).await.unwrap(), 38);
        assert!(matches!(
            planner.partition_number(20250208).await.unwrap_err(),
            RefreshError::Partition { .. }
        ));
    }
}
