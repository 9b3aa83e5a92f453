//! # table-refresh
//!
//! Refreshes SQL Server tables in a target database from a source database.
//!
//! Each configured table is moved by one of two strategies:
//!
//! - **Simple copy** appends source rows straight into the live table,
//!   optionally truncating it first
//! - **Staging partition switch** loads a staging table and swaps whole
//!   partitions into a range-partitioned live table
//!
//! Both read either the whole table or only rows past the target's current
//! watermark, as chosen by the table's sync mode.
//!
//! ## Example
//!
//! ```rust,no_run
//! use table_refresh::{Config, Orchestrator, RefreshError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RefreshError> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::connect(config).await?;
//!     for result in orchestrator.refresh_all_tables().await {
//!         println!("{}: {} rows", result.table_name, result.rows_processed);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod orchestrator;
pub mod strategy;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, Settings, StrategyKind, SyncMode, TableConfig};
pub use crate::core::{Row, SqlNullType, SqlValue};
pub use error::{RefreshError, Result};
pub use handler::{DataHandler, MssqlHandler};
pub use orchestrator::{BatchSummary, HealthCheckResult, Orchestrator, TableStatus};
pub use strategy::{RefreshResult, RefreshStatus, RefreshStrategy};
