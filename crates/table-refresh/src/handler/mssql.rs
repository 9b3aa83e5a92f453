//! SQL Server data handler over a pooled tiberius client.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use tiberius::{
    AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, ToSql, TokenRow,
};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use super::DataHandler;
use crate::config::{DatabaseConfig, Settings};
use crate::core::{Row, SqlNullType, SqlValue};
use crate::error::{RefreshError, Result};

/// Maximum string length (in bytes) for TDS bulk insert.
/// Tiberius bulk insert has a hard limit of 65535 bytes for UTF-16 encoded strings.
const BULK_INSERT_STRING_LIMIT: usize = 65535;

/// SQL Server caps a single statement at 2100 parameters.
const MAX_PARAMS_PER_STATEMENT: usize = 2100;

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: DatabaseConfig,
}

impl TiberiusConnectionManager {
    fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(self.config.host());
        config.port(self.config.port());
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            self.config.user.as_deref().unwrap_or_default(),
            self.config.password.as_deref().unwrap_or_default(),
        ));

        if self.config.encryption_enabled() {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// SQL Server handler. One instance per source or target connection.
pub struct MssqlHandler {
    pool: Pool<TiberiusConnectionManager>,
    label: String,
    command_timeout: Duration,
}

impl MssqlHandler {
    /// Build the pool and prove it can reach the server.
    ///
    /// `label` names the connection in logs and errors ("source", "target").
    pub async fn connect(
        config: &DatabaseConfig,
        settings: &Settings,
        label: impl Into<String>,
    ) -> Result<Self> {
        let label = label.into();
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(settings.max_connections)
            .connection_timeout(Duration::from_secs(settings.connection_timeout.max(1)))
            .build(manager)
            .await
            .map_err(|e| RefreshError::pool(e, format!("creating {} pool", label)))?;

        let handler = Self {
            pool,
            label,
            command_timeout: Duration::from_secs(settings.command_timeout.max(1)),
        };
        handler.test_connection().await?;

        info!(
            "Connected to {}: {}:{}/{} (pool_size={})",
            handler.label,
            config.host(),
            config.port(),
            config.database,
            settings.max_connections
        );

        Ok(handler)
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| RefreshError::pool(e, format!("getting {} connection", self.label)))
    }

    /// Bound a database call (or one insert batch) by the command timeout.
    async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RefreshError::query(
                what,
                format!(
                    "{} command timed out after {}s",
                    self.label,
                    self.command_timeout.as_secs()
                ),
            )),
        }
    }

    /// Check if a row contains any string values that exceed the bulk insert limit.
    fn row_has_oversized_strings(row: &Row) -> bool {
        row.values().any(|value| match value {
            // len_utf16() counts code units; two bytes each.
            SqlValue::String(s) => {
                s.chars().map(|c| c.len_utf16() * 2).sum::<usize>() > BULK_INSERT_STRING_LIMIT
            }
            _ => false,
        })
    }

    /// Load one batch through the TDS bulk-load API, with parameterized
    /// INSERT for rows the bulk path cannot carry.
    async fn insert_batch(
        conn: &mut PooledConnection<'_, TiberiusConnectionManager>,
        table: &str,
        rows: &[Row],
    ) -> Result<u64> {
        let (oversized, bulk): (Vec<&Row>, Vec<&Row>) =
            rows.iter().partition(|row| Self::row_has_oversized_strings(row));

        let mut total_inserted = 0u64;

        if !bulk.is_empty() {
            let mut bulk_load = conn
                .bulk_insert(table)
                .await
                .map_err(|e| RefreshError::query(table, format!("bulk insert init: {}", e)))?;

            for row in &bulk {
                let mut token_row = TokenRow::new();
                for value in row.values() {
                    token_row.push(sql_value_to_column_data(value));
                }
                bulk_load
                    .send(token_row)
                    .await
                    .map_err(|e| RefreshError::query(table, format!("bulk insert send: {}", e)))?;
            }

            let result = bulk_load
                .finalize()
                .await
                .map_err(|e| RefreshError::query(table, format!("bulk insert finalize: {}", e)))?;
            debug!(
                "Bulk inserted {} rows into {} (reported: {})",
                bulk.len(),
                table,
                result.total()
            );
            total_inserted += bulk.len() as u64;
        }

        if !oversized.is_empty() {
            debug!(
                "Falling back to INSERT for {} rows with oversized strings in {}",
                oversized.len(),
                table
            );
            total_inserted += Self::insert_rows_fallback(conn, table, &oversized).await?;
        }

        Ok(total_inserted)
    }

    /// Insert rows using parameterized multi-row INSERT statements.
    async fn insert_rows_fallback(
        conn: &mut PooledConnection<'_, TiberiusConnectionManager>,
        table: &str,
        rows: &[&Row],
    ) -> Result<u64> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };

        let cols: Vec<String> = first.columns().map(quote_ident).collect();
        let cols_per_row = cols.len().max(1);
        let max_rows_per_statement = (MAX_PARAMS_PER_STATEMENT / cols_per_row).max(1);

        let mut total_inserted = 0u64;
        for chunk in rows.chunks(max_rows_per_statement) {
            let sql = build_insert_sql(table, &cols, chunk.len());

            let params: Vec<Box<dyn ToSql>> = chunk
                .iter()
                .flat_map(|row| row.values().map(sql_value_to_sql_param))
                .collect();
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

            conn.execute(sql.as_str(), &param_refs).await.map_err(|e| {
                RefreshError::query(table, format!("batched INSERT ({} rows): {}", chunk.len(), e))
            })?;
            total_inserted += chunk.len() as u64;
        }

        Ok(total_inserted)
    }
}

#[async_trait]
impl DataHandler for MssqlHandler {
    async fn execute_query(&self, sql: &str) -> Result<Vec<Row>> {
        self.timed(&self.label, async {
            let mut conn = self.get_conn().await?;
            let rows = conn.simple_query(sql).await?.into_first_result().await?;
            Ok(rows.into_iter().map(convert_row).collect())
        })
        .await
    }

    async fn execute_non_query(&self, sql: &str) -> Result<u64> {
        self.timed(&self.label, async {
            let mut conn = self.get_conn().await?;
            let result = conn.execute(sql, &[]).await?;
            Ok(result.total())
        })
        .await
    }

    async fn get_max_value(&self, table: &str, column: &str) -> Result<Option<SqlValue>> {
        let sql = format!("SELECT MAX({}) AS max_value FROM {}", column, table);
        let rows = self.execute_query(&sql).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get_index(0))
            .filter(|value| !value.is_null())
            .cloned())
    }

    async fn get_table_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT_BIG(*) AS row_count FROM {}", table);
        let rows = self.execute_query(&sql).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get_index(0))
            .and_then(SqlValue::as_i64)
            .unwrap_or(0))
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        self.execute_non_query(&format!("TRUNCATE TABLE {}", table))
            .await?;
        info!("Truncated table {}", table);
        Ok(())
    }

    async fn bulk_insert(&self, table: &str, rows: &[Row], batch_size: usize) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn().await?;
        let mut total_inserted = 0u64;
        for batch in rows.chunks(batch_size.max(1)) {
            total_inserted += self
                .timed(table, Self::insert_batch(&mut conn, table, batch))
                .await?;
            debug!("Inserted batch of {} rows into {}", batch.len(), table);
        }
        Ok(total_inserted)
    }
}

/// Quote an MSSQL identifier with brackets.
fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `INSERT INTO t (cols) VALUES (@P1, @P2), (@P3, @P4), ...` for `rows` rows.
fn build_insert_sql(table: &str, cols: &[String], rows: usize) -> String {
    let mut param_idx = 1;
    let groups: Vec<String> = (0..rows)
        .map(|_| {
            let placeholders: Vec<String> = (0..cols.len())
                .map(|_| {
                    let p = format!("@P{}", param_idx);
                    param_idx += 1;
                    p
                })
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        cols.join(", "),
        groups.join(", ")
    )
}

/// Decode a tiberius row into an owned [`Row`].
fn convert_row(row: tiberius::Row) -> Row {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut out = Row::with_capacity(names.len());
    for (name, data) in names.into_iter().zip(row) {
        out.push(name, column_data_to_sql_value(data));
    }
    out
}

/// Map a tiberius cell to [`SqlValue`]. Undecodable temporal cells become NULL.
fn column_data_to_sql_value(data: ColumnData<'static>) -> SqlValue {
    match data {
        ColumnData::U8(v) => v
            .map(|v| SqlValue::I16(i16::from(v)))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I16(v) => v.map(SqlValue::I16).unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I32(v) => v.map(SqlValue::I32).unwrap_or(SqlValue::Null(SqlNullType::I32)),
        ColumnData::I64(v) => v.map(SqlValue::I64).unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::F32(v) => v.map(SqlValue::F32).unwrap_or(SqlValue::Null(SqlNullType::F32)),
        ColumnData::F64(v) => v.map(SqlValue::F64).unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnData::Bit(v) => v.map(SqlValue::Bool).unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        ColumnData::String(v) => v
            .map(|s| SqlValue::String(s.into_owned()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid).unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        ColumnData::Binary(v) => v
            .map(|b| SqlValue::Bytes(b.into_owned()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        ColumnData::Numeric(v) => match v {
            Some(n) => Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale()))
                .map(SqlValue::Decimal)
                .unwrap_or_else(|_| SqlValue::String(n.to_string())),
            None => SqlValue::Null(SqlNullType::Decimal),
        },
        ColumnData::Xml(v) => v
            .map(|x| SqlValue::String(x.into_owned().into_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        ColumnData::Date(_) => NaiveDate::from_sql(&data)
            .ok()
            .flatten()
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)
            .ok()
            .flatten()
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(&data)
            .ok()
            .flatten()
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        #[allow(unreachable_patterns)]
        _ => NaiveDateTime::from_sql(&data)
            .ok()
            .flatten()
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
    }
}

/// Convert SqlValue to a boxed ToSql trait object for parameterized queries.
fn sql_value_to_sql_param(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(_) => Box::new(Option::<String>::None),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::String(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(b.clone()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(d.and_time(NaiveTime::MIN)),
        SqlValue::Time(t) => Box::new(*t),
    }
}

/// Days since 0001-01-01, the TDS date epoch.
fn tds_days(date: NaiveDate) -> Option<u32> {
    u32::try_from(date.num_days_from_ce() - 1).ok()
}

/// 100ns increments since midnight (time scale 7).
fn tds_time(time: NaiveTime) -> tiberius::time::Time {
    let nanos =
        u64::from(time.num_seconds_from_midnight()) * 1_000_000_000 + u64::from(time.nanosecond());
    tiberius::time::Time::new(nanos / 100, 7)
}

fn tds_datetime2(dt: NaiveDateTime) -> Option<tiberius::time::DateTime2> {
    let days = tds_days(dt.date())?;
    Some(tiberius::time::DateTime2::new(
        tiberius::time::Date::new(days),
        tds_time(dt.time()),
    ))
}

/// Convert SqlValue to tiberius ColumnData for bulk insert.
fn sql_value_to_column_data(value: &SqlValue) -> ColumnData<'static> {
    match value {
        SqlValue::Null(null_type) => match null_type {
            SqlNullType::Bool => ColumnData::Bit(None),
            SqlNullType::I16 => ColumnData::I16(None),
            SqlNullType::I32 => ColumnData::I32(None),
            SqlNullType::I64 => ColumnData::I64(None),
            SqlNullType::F32 => ColumnData::F32(None),
            SqlNullType::F64 => ColumnData::F64(None),
            SqlNullType::String => ColumnData::String(None),
            SqlNullType::Bytes => ColumnData::Binary(None),
            SqlNullType::Uuid => ColumnData::Guid(None),
            SqlNullType::Decimal => ColumnData::Numeric(None),
            SqlNullType::DateTime => ColumnData::DateTime2(None),
            SqlNullType::DateTimeOffset => ColumnData::DateTimeOffset(None),
            SqlNullType::Date => ColumnData::DateTime2(None),
            SqlNullType::Time => ColumnData::Time(None),
        },
        SqlValue::Bool(b) => ColumnData::Bit(Some(*b)),
        SqlValue::I16(i) => ColumnData::I16(Some(*i)),
        SqlValue::I32(i) => ColumnData::I32(Some(*i)),
        SqlValue::I64(i) => ColumnData::I64(Some(*i)),
        SqlValue::F32(f) => {
            if f.is_finite() {
                ColumnData::F32(Some(*f))
            } else {
                warn!("Converting F32 NaN/Infinity to NULL for MSSQL compatibility");
                ColumnData::F32(None)
            }
        }
        SqlValue::F64(f) => {
            if f.is_finite() {
                ColumnData::F64(Some(*f))
            } else {
                warn!("Converting F64 NaN/Infinity to NULL for MSSQL compatibility");
                ColumnData::F64(None)
            }
        }
        SqlValue::String(s) => ColumnData::String(Some(Cow::Owned(s.clone()))),
        SqlValue::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.clone()))),
        SqlValue::Uuid(u) => ColumnData::Guid(Some(*u)),
        SqlValue::Decimal(d) => ColumnData::Numeric(Some(
            tiberius::numeric::Numeric::new_with_scale(d.mantissa(), d.scale() as u8),
        )),
        SqlValue::DateTime(dt) => match tds_datetime2(*dt) {
            Some(v) => ColumnData::DateTime2(Some(v)),
            None => {
                warn!("DateTime {} out of TDS range, converting to NULL", dt);
                ColumnData::DateTime2(None)
            }
        },
        SqlValue::DateTimeOffset(dto) => match tds_datetime2(dto.naive_utc()) {
            Some(v) => {
                let offset_minutes = (dto.offset().local_minus_utc() / 60) as i16;
                ColumnData::DateTimeOffset(Some(tiberius::time::DateTimeOffset::new(
                    v,
                    offset_minutes,
                )))
            }
            None => {
                warn!("DateTimeOffset {} out of TDS range, converting to NULL", dto);
                ColumnData::DateTimeOffset(None)
            }
        },
        // Bulk load of DATE goes through DateTime2 at midnight.
        SqlValue::Date(d) => match tds_datetime2(d.and_time(NaiveTime::MIN)) {
            Some(v) => ColumnData::DateTime2(Some(v)),
            None => {
                warn!("Date {} out of TDS range, converting to NULL", d);
                ColumnData::DateTime2(None)
            }
        },
        SqlValue::Time(t) => ColumnData::Time(Some(tds_time(*t))),
    }
}
