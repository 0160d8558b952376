// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Statement execution over sqlx's `Any` driver: pool setup, transaction
//! handles shared across await points, argument binding, and column
//! decoding into [`ScalarValue`]s.

use crate::compiler::SqlWithArguments;
use crate::errors::{Error, Result};
use crate::schema::{FieldDef, FieldType};
use crate::value::ScalarValue;
use async_lock::Mutex;
use sqlx::any::{Any, AnyArguments, AnyKind, AnyPool, AnyPoolOptions, AnyRow};
use sqlx::{Executor, Row, Transaction, ValueRef};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;

/// A transaction behind a shared async mutex, so a handle can be cloned into
/// the places that execute against it. `None` after commit/rollback.
pub type TransactionStatic = Arc<Mutex<Option<Transaction<'static, Any>>>>;

/// A named transaction handle. Carries the database name so nested
/// `run_in_transaction` calls can tell "same database, reuse" apart from
/// "different database, refuse".
#[derive(Clone)]
pub struct TxHandle {
    inner: TransactionStatic,
    db_name: String,
}

impl TxHandle {
    pub fn database_name(&self) -> &str {
        &self.db_name
    }

    pub async fn commit(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        match guard.take() {
            Some(tx) => {
                log::trace!("commit transaction on `{}`", self.db_name);
                tx.commit().await.map_err(|e| Error::database("commit", e))
            }
            None => Err(Error::NoTransaction),
        }
    }

    /// Rolls the transaction back; a no-op if it was already committed.
    pub async fn rollback(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        match guard.take() {
            Some(tx) => {
                log::trace!("rollback transaction on `{}`", self.db_name);
                tx.rollback()
                    .await
                    .map_err(|e| Error::database("rollback", e))
            }
            None => Ok(()),
        }
    }
}

/// Execution summary of a single statement.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// A named database handle: the shared pool plus the driver identity used
/// for registry lookups.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    name: String,
    driver: String,
}

impl Database {
    /// Connects a pool, deriving the driver identity from the connection
    /// kind. SQLite connections get WAL journaling.
    pub async fn connect(name: &str, uri: &str, max_connections: usize) -> Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections as u32)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if matches!(conn.kind(), AnyKind::Sqlite) {
                        conn.execute("PRAGMA journal_mode=WAL;").await?;
                    }
                    Ok(())
                })
            })
            .connect(uri)
            .await
            .map_err(|e| Error::database("connect", e))?;
        let driver = match pool.any_kind() {
            AnyKind::Postgres => "postgres",
            AnyKind::MySql => "mysql",
            AnyKind::Sqlite => "sqlite",
        };
        Ok(Self {
            pool,
            name: name.to_owned(),
            driver: driver.to_owned(),
        })
    }

    /// Overrides the derived driver identity, e.g. `"mariadb"` for a MariaDB
    /// server reached over the MySQL wire protocol.
    pub fn with_driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_owned();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub async fn begin(&self) -> Result<TxHandle> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(Error::FailedStartTransaction)?;
        log::trace!("begin transaction on `{}`", self.name);
        Ok(TxHandle {
            inner: Arc::new(Mutex::new(Some(tx))),
            db_name: self.name.clone(),
        })
    }

    /// Runs `f` inside a transaction. A matching-database outer transaction
    /// is reused (commit stays with the outer scope); a different database
    /// is refused. A core-owned transaction commits on success and rolls
    /// back on any error.
    pub async fn run_in_transaction<T, F, Fut>(&self, ctx: Option<&TxHandle>, f: F) -> Result<T>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if let Some(outer) = ctx {
            if outer.database_name() != self.name {
                return Err(Error::CrossDatabaseTransaction {
                    outer: outer.database_name().to_owned(),
                    inner: self.name.clone(),
                });
            }
            return f(outer.clone()).await;
        }
        let tx = self.begin().await?;
        match f(tx.clone()).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    fn prepare<'q>(q: &'q SqlWithArguments) -> Result<sqlx::query::Query<'q, Any, AnyArguments<'q>>> {
        let mut query = sqlx::query::<Any>(&q.sql);
        for arg in &q.args {
            query = match arg {
                ScalarValue::Null => query.bind(Option::<String>::None),
                ScalarValue::Bool(v) => query.bind(*v as i64),
                ScalarValue::I64(v) => query.bind(*v),
                ScalarValue::F64(v) => query.bind(*v),
                ScalarValue::String(v) => query.bind(v.clone()),
                ScalarValue::DateTime(v) => {
                    let text = v.format(&Rfc3339).map_err(|_| Error::TypeMismatch {
                        model: "<arguments>".to_owned(),
                        field: "<datetime>".to_owned(),
                        detail: "datetime is not representable as RFC 3339".to_owned(),
                    })?;
                    query.bind(text)
                }
                ScalarValue::Bytes(_) => {
                    return Err(Error::TypeMismatch {
                        model: "<arguments>".to_owned(),
                        field: "<bytes>".to_owned(),
                        detail: "binary arguments are not supported by the any driver".to_owned(),
                    })
                }
            };
        }
        Ok(query)
    }

    pub async fn fetch_all(
        &self,
        q: &SqlWithArguments,
        tx: Option<&TxHandle>,
    ) -> Result<Vec<AnyRow>> {
        log::debug!("fetch: {} ({} args)", q.sql, q.args.len());
        let query = Self::prepare(q)?;
        match tx {
            Some(handle) => {
                let mut guard = handle.inner.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionNil)?;
                query
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(|e| Error::database("query", e))
            }
            None => query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::database("query", e)),
        }
    }

    /// Fetches exactly one row; zero rows map to [`Error::NoRows`].
    pub async fn fetch_one(&self, q: &SqlWithArguments, tx: Option<&TxHandle>) -> Result<AnyRow> {
        log::debug!("fetch one: {} ({} args)", q.sql, q.args.len());
        let query = Self::prepare(q)?;
        let result = match tx {
            Some(handle) => {
                let mut guard = handle.inner.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionNil)?;
                query.fetch_one(&mut *tx).await
            }
            None => query.fetch_one(&self.pool).await,
        };
        result.map_err(|e| match e {
            sqlx::Error::RowNotFound => Error::NoRows,
            other => Error::database("query", other),
        })
    }

    pub async fn execute(
        &self,
        q: &SqlWithArguments,
        tx: Option<&TxHandle>,
    ) -> Result<ExecResult> {
        log::debug!("exec: {} ({} args)", q.sql, q.args.len());
        let query = Self::prepare(q)?;
        let done = match tx {
            Some(handle) => {
                let mut guard = handle.inner.lock().await;
                let tx = guard.as_mut().ok_or(Error::TransactionNil)?;
                query
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::database("exec", e))?
            }
            None => query
                .execute(&self.pool)
                .await
                .map_err(|e| Error::database("exec", e))?,
        };
        Ok(ExecResult {
            rows_affected: done.rows_affected(),
            last_insert_id: done.last_insert_id(),
        })
    }

    /// Runs several statements, wrapping them in a core-owned transaction if
    /// more than one and none is already active, summing `rows_affected`.
    pub async fn execute_all(
        &self,
        statements: &[SqlWithArguments],
        tx: Option<&TxHandle>,
    ) -> Result<u64> {
        if statements.len() <= 1 || tx.is_some() {
            let mut total = 0;
            for q in statements {
                total += self.execute(q, tx).await?.rows_affected;
            }
            return Ok(total);
        }
        self.run_in_transaction(None, |tx| async move {
            let mut total = 0;
            for q in statements {
                total += self.execute(q, Some(&tx)).await?.rows_affected;
            }
            Ok(total)
        })
        .await
    }
}

pub fn column_is_null(row: &AnyRow, idx: usize) -> bool {
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

/// Decodes one column into the scalar shape the field declares.
pub fn decode_field(row: &AnyRow, idx: usize, field: &FieldDef, model: &str) -> Result<ScalarValue> {
    if column_is_null(row, idx) {
        return Ok(ScalarValue::Null);
    }
    let mismatch = |detail: String| Error::TypeMismatch {
        model: model.to_owned(),
        field: field.name.clone(),
        detail,
    };
    let value = match field.ty {
        FieldType::Bool => {
            let v: i32 = row.try_get(idx).map_err(|e| mismatch(e.to_string()))?;
            ScalarValue::Bool(v != 0)
        }
        FieldType::I64 => {
            let v: i64 = row.try_get(idx).map_err(|e| mismatch(e.to_string()))?;
            ScalarValue::I64(v)
        }
        FieldType::F64 => {
            let v: f64 = row.try_get(idx).map_err(|e| mismatch(e.to_string()))?;
            ScalarValue::F64(v)
        }
        FieldType::Text => {
            let v: String = row.try_get(idx).map_err(|e| mismatch(e.to_string()))?;
            ScalarValue::String(v)
        }
        FieldType::DateTime => {
            let v: String = row.try_get(idx).map_err(|e| mismatch(e.to_string()))?;
            let parsed = time::OffsetDateTime::parse(&v, &Rfc3339)
                .map_err(|e| mismatch(format!("invalid RFC 3339 datetime: {e}")))?;
            ScalarValue::DateTime(parsed)
        }
        FieldType::Bytes => {
            return Err(mismatch(
                "binary columns are not supported by the any driver".to_owned(),
            ))
        }
    };
    Ok(value)
}

/// Decodes a column of unknown type (an annotation), preferring integers,
/// then floats, then text.
pub fn decode_any(row: &AnyRow, idx: usize) -> ScalarValue {
    if column_is_null(row, idx) {
        return ScalarValue::Null;
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return ScalarValue::I64(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return ScalarValue::F64(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return ScalarValue::String(v);
    }
    ScalarValue::Null
}
