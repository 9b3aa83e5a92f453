//! Data-handler capability consumed by the refresh strategies.
//!
//! A [`DataHandler`] wraps one already-connected database. Strategies receive
//! one for the source and one for the target and drive them in sequence; they
//! never touch connections or pools directly.

mod mssql;

#[cfg(test)]
pub(crate) mod testing;

pub use mssql::MssqlHandler;

use async_trait::async_trait;

use crate::core::{Row, SqlValue};
use crate::error::Result;

/// Query and load operations against one database.
#[async_trait]
pub trait DataHandler: Send + Sync {
    /// Run a query and return all rows of the first result set.
    async fn execute_query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Run a statement and return the affected row count.
    async fn execute_non_query(&self, sql: &str) -> Result<u64>;

    /// Highest value of `column` in `table`.
    ///
    /// `None` when the table is empty or the column holds only NULLs.
    async fn get_max_value(&self, table: &str, column: &str) -> Result<Option<SqlValue>>;

    /// Number of rows in `table`.
    async fn get_table_count(&self, table: &str) -> Result<i64>;

    /// Remove all rows from `table`.
    async fn truncate_table(&self, table: &str) -> Result<()>;

    /// Insert `rows` into `table` in batches of `batch_size`; returns rows inserted.
    async fn bulk_insert(&self, table: &str, rows: &[Row], batch_size: usize) -> Result<u64>;

    /// Round-trip a trivial query to prove the connection works.
    async fn test_connection(&self) -> Result<()> {
        self.execute_query("SELECT 1 AS ok").await.map(|_| ())
    }
}
