// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

/// Error kinds surfaced by the query-set layer.
///
/// Programmer errors (unknown field in a selector, wrong selector type,
/// duplicate update expression) panic instead; everything here is either a
/// contract violation or a driver failure and is meant to be matched on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no database handle is attached to this query set")]
    NoDatabase,
    #[error("no driver or compiler registered under `{0}`")]
    UnknownDriver(String),
    #[error("model `{0}` has no table name")]
    NoTableName(String),
    #[error("operation requires a WHERE clause")]
    NoWhereClause,
    #[error("object {model}: field `{field}` is not nullable but holds a null value")]
    FieldNull { model: String, field: String },
    #[error("driver did not report a last inserted id")]
    LastInsertId,
    #[error("unsupported lookup `{0}`")]
    UnsupportedLookup(String),
    #[error("query matched no rows")]
    NoRows,
    #[error("query matched {found} rows, expected exactly one")]
    MultipleRows { found: String },
    #[error("query returned no results")]
    NoResults,
    #[error("a transaction is already active on this handle")]
    TransactionStarted,
    #[error("failed to start a transaction")]
    FailedStartTransaction(#[source] sqlx::Error),
    #[error("transaction handle is empty")]
    TransactionNil,
    #[error("no transaction is active")]
    NoTransaction,
    #[error("transaction spans two databases: `{outer}` and `{inner}`")]
    CrossDatabaseTransaction { outer: String, inner: String },
    #[error("object {model}: type mismatch on field `{field}`: {detail}")]
    TypeMismatch {
        model: String,
        field: String,
        detail: String,
    },
    #[error("model `{model}` has no field `{field}`")]
    FieldNotFound { model: String, field: String },
    #[error("nil pointer: {0}")]
    NilPointer(String),
    #[error("object {0}: no unique key could be derived for row deduplication")]
    NoUniqueKey(String),
    #[error("{op}: driver error")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{label} hook failed")]
    Hook {
        label: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    /// Wraps a driver failure with the operation that produced it.
    pub fn database(op: &'static str, source: sqlx::Error) -> Self {
        Error::Database { op, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
