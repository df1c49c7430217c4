//! Request and reply shapes of the persistence queue.

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;

use crate::error::DbError;

/// A positional query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// SQL NULL
    Null,
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Param::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Param::I32(n) => ToSqlOutput::Borrowed(ValueRef::Integer(i64::from(*n))),
            Param::I64(n) => ToSqlOutput::Borrowed(ValueRef::Integer(*n)),
            Param::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Param::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// One column of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Any SQLite integer
    I64(i64),
    /// SQLite real
    Real(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl Value {
    /// Integer content, if this is an integer column.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(n) => Some(*n),
            _ => None,
        }
    }

    /// Text content, if this is a text column.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Blob content, if this is a blob column.
    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// Behavior flags of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// This query and the next must share a transaction
    pub chain_next: bool,
    /// Commit the open transaction after this query
    pub last_in_batch: bool,
    /// Execute outside any transaction
    pub single: bool,
    /// Do not prepare-and-cache the statement
    pub nocache: bool,
}

/// A unit of work for the service thread.
pub enum DbRequest {
    /// Execute one query.
    Query(QueryRequest),
    /// Commit anything pending and terminate the service.
    Shutdown,
}

/// The query variant of [`DbRequest`].
pub struct QueryRequest {
    /// Static query template. Statement caching is keyed by this text,
    /// so templates must be genuinely static, never built per call.
    pub sql: &'static str,
    /// Positional parameters
    pub params: Vec<Param>,
    /// Behavior flags
    pub flags: Flags,
    /// Reply channel; rows stream here one message each, closed off by
    /// a final [`DbReply::Done`]. `None` discards results.
    pub reply: Option<crossbeam_channel::Sender<DbReply>>,
    /// Indices of the result columns the caller wants, in reply order.
    /// `None` returns every column of the statement.
    pub columns: Option<Vec<usize>>,
    /// Ask for `last_insert_rowid` in the final reply
    pub want_last_insert: bool,
}

impl QueryRequest {
    /// Request with default flags, no reply, all columns.
    #[must_use]
    pub fn new(sql: &'static str, params: Vec<Param>) -> Self {
        QueryRequest {
            sql,
            params,
            flags: Flags::default(),
            reply: None,
            columns: None,
            want_last_insert: false,
        }
    }
}

/// Messages delivered on a request's reply channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DbReply {
    /// One result row
    Row(Vec<Value>),
    /// Sentinel closing the reply stream
    Done {
        /// Overall status of the request
        result: Result<(), DbError>,
        /// Rowid of the last insert, when requested
        last_insert_id: Option<i64>,
    },
}
