//! Recording in-memory handler for strategy tests.

use std::sync::Mutex;

use async_trait::async_trait;

use super::DataHandler;
use crate::core::{Row, SqlValue};
use crate::error::{RefreshError, Result};

/// One call made against a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Query(String),
    NonQuery(String),
    MaxValue { table: String, column: String },
    Count(String),
    Truncate(String),
    BulkInsert { table: String, rows: usize, batch_size: usize },
}

/// Handler that records every call and answers from canned responses.
///
/// Query responses and failures are matched by SQL substring; the first
/// registered match wins.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<Call>>,
    responses: Vec<(String, Vec<Row>)>,
    query_failures: Vec<String>,
    non_query_failures: Vec<String>,
    insert_failures: Vec<String>,
    max_value: Option<SqlValue>,
    table_count: i64,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries containing `pattern` with `rows`.
    pub fn on_query(mut self, pattern: &str, rows: Vec<Row>) -> Self {
        self.responses.push((pattern.to_string(), rows));
        self
    }

    /// Fail queries containing `pattern`.
    pub fn fail_query(mut self, pattern: &str) -> Self {
        self.query_failures.push(pattern.to_string());
        self
    }

    /// Fail statements containing `pattern`.
    pub fn fail_non_query(mut self, pattern: &str) -> Self {
        self.non_query_failures.push(pattern.to_string());
        self
    }

    /// Fail bulk inserts into `table`.
    pub fn fail_insert(mut self, table: &str) -> Self {
        self.insert_failures.push(table.to_string());
        self
    }

    pub fn with_max_value(mut self, value: SqlValue) -> Self {
        self.max_value = Some(value);
        self
    }

    pub fn with_table_count(mut self, count: i64) -> Self {
        self.table_count = count;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Statements (non-queries) only, whitespace-normalized.
    pub fn statements(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::NonQuery(sql) => Some(normalize(&sql)),
                _ => None,
            })
            .collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Query(sql) => Some(normalize(&sql)),
                _ => None,
            })
            .collect()
    }

    pub fn bulk_inserts(&self) -> Vec<(String, usize, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BulkInsert {
                    table,
                    rows,
                    batch_size,
                } => Some((table, rows, batch_size)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Collapse runs of whitespace so multi-line SQL compares as one line.
pub fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl DataHandler for RecordingHandler {
    async fn execute_query(&self, sql: &str) -> Result<Vec<Row>> {
        self.record(Call::Query(sql.to_string()));
        if self.query_failures.iter().any(|p| sql.contains(p.as_str())) {
            return Err(RefreshError::query("test", format!("query failed: {}", normalize(sql))));
        }
        Ok(self
            .responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn execute_non_query(&self, sql: &str) -> Result<u64> {
        self.record(Call::NonQuery(sql.to_string()));
        if self.non_query_failures.iter().any(|p| sql.contains(p.as_str())) {
            return Err(RefreshError::query(
                "test",
                format!("statement failed: {}", normalize(sql)),
            ));
        }
        Ok(0)
    }

    async fn get_max_value(&self, table: &str, column: &str) -> Result<Option<SqlValue>> {
        self.record(Call::MaxValue {
            table: table.to_string(),
            column: column.to_string(),
        });
        Ok(self.max_value.clone())
    }

    async fn get_table_count(&self, table: &str) -> Result<i64> {
        self.record(Call::Count(table.to_string()));
        Ok(self.table_count)
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        self.record(Call::Truncate(table.to_string()));
        Ok(())
    }

    async fn bulk_insert(&self, table: &str, rows: &[Row], batch_size: usize) -> Result<u64> {
        self.record(Call::BulkInsert {
            table: table.to_string(),
            rows: rows.len(),
            batch_size,
        });
        if self.insert_failures.iter().any(|t| t == table) {
            return Err(RefreshError::query(table, "bulk insert failed"));
        }
        Ok(rows.len() as u64)
    }
}
