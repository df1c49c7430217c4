//! The service thread and its caller-side handle.

use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rusqlite::{params_from_iter, Connection, Statement};
use tracing::{debug, error, warn};

use crate::error::DbError;
use crate::request::{DbReply, DbRequest, Flags, Param, QueryRequest, Value};
use crate::schema;

/// Commit an open batch once writes go quiet this long.
const TXN_TIMEOUT: Duration = Duration::from_secs(5);

const STMT_CACHE_CAPACITY: usize = 64;

/// Caller-side handle to the persistence service.
///
/// Cloneable; submitting is always non-blocking. Requests submitted by
/// one thread execute in submission order.
#[derive(Clone)]
pub struct DbHandle {
    tx: Sender<DbRequest>,
}

impl DbHandle {
    /// Submit a raw request. Never blocks.
    pub fn submit(&self, req: DbRequest) {
        if self.tx.send(req).is_err() {
            warn!("persistence request dropped: service stopped");
        }
    }

    /// Fire-and-forget execution with default flags.
    pub fn exec(&self, sql: &'static str, params: Vec<Param>) {
        self.exec_with(sql, params, Flags::default());
    }

    /// Fire-and-forget execution with explicit flags.
    pub fn exec_with(&self, sql: &'static str, params: Vec<Param>, flags: Flags) {
        self.submit(DbRequest::Query(QueryRequest {
            flags,
            ..QueryRequest::new(sql, params)
        }));
    }

    /// Execute and block on the full result set.
    ///
    /// Blocks the calling thread on the reply channel; from async
    /// contexts, call through `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// The query's failure status, or [`DbError::ServiceStopped`].
    pub fn fetch(
        &self,
        sql: &'static str,
        params: Vec<Param>,
    ) -> Result<Vec<Vec<Value>>, DbError> {
        self.fetch_with(sql, params, Flags::default(), None)
            .map(|(rows, _)| rows)
    }

    /// As [`DbHandle::fetch`], with flags and a column selection.
    ///
    /// # Errors
    ///
    /// The query's failure status, or [`DbError::ServiceStopped`].
    pub fn fetch_with(
        &self,
        sql: &'static str,
        params: Vec<Param>,
        flags: Flags,
        columns: Option<Vec<usize>>,
    ) -> Result<(Vec<Vec<Value>>, Option<i64>), DbError> {
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        self.submit(DbRequest::Query(QueryRequest {
            sql,
            params,
            flags,
            reply: Some(reply_tx),
            columns,
            want_last_insert: false,
        }));
        collect(&reply_rx)
    }

    /// Execute an insert and block for its generated row id.
    ///
    /// # Errors
    ///
    /// The query's failure status, or [`DbError::ServiceStopped`].
    pub fn insert_id(&self, sql: &'static str, params: Vec<Param>) -> Result<i64, DbError> {
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        self.submit(DbRequest::Query(QueryRequest {
            sql,
            params,
            flags: Flags::default(),
            reply: Some(reply_tx),
            columns: None,
            want_last_insert: true,
        }));
        let (_, id) = collect(&reply_rx)?;
        id.ok_or(DbError::ServiceStopped)
    }
}

fn collect(
    rx: &Receiver<DbReply>,
) -> Result<(Vec<Vec<Value>>, Option<i64>), DbError> {
    let mut rows = Vec::new();
    loop {
        match rx.recv() {
            Ok(DbReply::Row(row)) => rows.push(row),
            Ok(DbReply::Done {
                result,
                last_insert_id,
            }) => return result.map(|()| (rows, last_insert_id)),
            Err(_) => return Err(DbError::ServiceStopped),
        }
    }
}

/// The running persistence service: one thread, one connection.
pub struct DbService {
    handle: DbHandle,
    thread: Option<JoinHandle<()>>,
}

impl DbService {
    /// Open (or create) the store and start the service thread.
    ///
    /// # Errors
    ///
    /// Open failures and schema-version mismatches; see
    /// [`schema::init`].
    pub fn open(path: &Path) -> Result<DbService, DbError> {
        let conn = Connection::open(path).map_err(|e| DbError::Open(e.to_string()))?;
        Self::start(conn)
    }

    /// As [`DbService::open`] with an in-memory store. Test use.
    ///
    /// # Errors
    ///
    /// As [`DbService::open`].
    pub fn open_in_memory() -> Result<DbService, DbError> {
        let conn = Connection::open_in_memory().map_err(|e| DbError::Open(e.to_string()))?;
        Self::start(conn)
    }

    fn start(conn: Connection) -> Result<DbService, DbError> {
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(|e| DbError::Open(e.to_string()))?;
        schema::init(&conn)?;
        conn.set_prepared_statement_cache_capacity(STMT_CACHE_CAPACITY);

        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("dctide-db".to_string())
            .spawn(move || Service { conn, rx }.run())
            .map_err(|e| DbError::Open(e.to_string()))?;
        Ok(DbService {
            handle: DbHandle { tx },
            thread: Some(thread),
        })
    }

    /// Handle for submitting requests.
    #[must_use]
    pub fn handle(&self) -> DbHandle {
        self.handle.clone()
    }

    /// Flush pending work and stop the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.tx.send(DbRequest::Shutdown);
            if thread.join().is_err() {
                error!("persistence thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DbService {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Service {
    conn: Connection,
    rx: Receiver<DbRequest>,
}

impl Service {
    fn run(mut self) {
        let mut txn_open = false;
        // Absolute commit deadline, armed when a batch opens.
        let mut deadline: Option<Instant> = None;
        // Deferred replies of executed chain members. A chain is only
        // answered once it resolves: success replies would otherwise
        // race a rollback caused by a later member.
        let mut chain: Vec<(Option<Sender<DbReply>>, Option<i64>)> = Vec::new();
        // Previous request demanded the next one share its transaction.
        let mut chain_pending = false;
        // A chained request failed; successors in the chain are
        // answered with an error, unexecuted.
        let mut drain_chain = false;

        loop {
            let req = if chain_pending || drain_chain {
                // The chain overrides the deadline: the next request
                // must reach this transaction (or its error).
                match self.rx.recv() {
                    Ok(r) => r,
                    Err(_) => break,
                }
            } else if let Some(dl) = deadline {
                match self.rx.recv_deadline(dl) {
                    Ok(r) => r,
                    Err(RecvTimeoutError::Timeout) => {
                        self.commit(&mut txn_open);
                        deadline = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.rx.recv() {
                    Ok(r) => r,
                    Err(_) => break,
                }
            };

            let q = match req {
                DbRequest::Shutdown => break,
                DbRequest::Query(q) => q,
            };

            if drain_chain {
                send_done(&q.reply, Err(DbError::ChainAborted), None);
                drain_chain = q.flags.chain_next;
                continue;
            }

            if q.flags.single {
                if txn_open {
                    self.commit(&mut txn_open);
                    deadline = None;
                }
                let (result, last_id) = self.execute(&q);
                send_done(&q.reply, result, last_id);
                chain_pending = false;
                continue;
            }

            if !txn_open {
                if let Err(e) = self.conn.execute_batch("BEGIN") {
                    error!("cannot open transaction: {e}");
                    send_done(&q.reply, Err(DbError::Query(e.to_string())), None);
                    continue;
                }
                txn_open = true;
                deadline = Some(Instant::now() + TXN_TIMEOUT);
            }

            let in_chain = chain_pending || q.flags.chain_next;
            let (result, last_id) = self.execute(&q);
            match result {
                Ok(()) => {
                    if in_chain {
                        chain.push((q.reply.clone(), last_id));
                        if !q.flags.chain_next {
                            // Chain resolved: release the held replies.
                            for (reply, id) in chain.drain(..) {
                                send_done(&reply, Ok(()), id);
                            }
                        }
                    } else {
                        send_done(&q.reply, Ok(()), last_id);
                    }
                    if q.flags.last_in_batch {
                        self.commit(&mut txn_open);
                        deadline = None;
                    }
                    chain_pending = q.flags.chain_next;
                }
                Err(e) => {
                    self.rollback(&mut txn_open);
                    deadline = None;
                    // Executed chain members rolled back with the
                    // transaction; they observe the failure too.
                    for (reply, _) in chain.drain(..) {
                        send_done(&reply, Err(DbError::ChainAborted), None);
                    }
                    send_done(&q.reply, Err(e), None);
                    drain_chain = q.flags.chain_next;
                    chain_pending = false;
                }
            }
        }

        // Anything still deferred resolves with the final commit.
        self.commit(&mut txn_open);
        for (reply, id) in chain.drain(..) {
            send_done(&reply, Ok(()), id);
        }
        debug!("persistence service stopped");
    }

    fn commit(&mut self, txn_open: &mut bool) {
        if *txn_open {
            if let Err(e) = self.conn.execute_batch("COMMIT") {
                error!("commit failed: {e}");
                let _ = self.conn.execute_batch("ROLLBACK");
            }
            *txn_open = false;
        }
    }

    fn rollback(&mut self, txn_open: &mut bool) {
        if *txn_open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                error!("rollback failed: {e}");
            }
            *txn_open = false;
        }
    }

    /// Run one query, streaming rows to the reply channel. The final
    /// status is the caller's to deliver: chained requests hold it back
    /// until the chain resolves.
    fn execute(&mut self, q: &QueryRequest) -> (Result<(), DbError>, Option<i64>) {
        match run_query(&self.conn, q) {
            Ok(()) => {
                let id = q
                    .want_last_insert
                    .then(|| self.conn.last_insert_rowid());
                (Ok(()), id)
            }
            Err(e) => {
                warn!(sql = q.sql, "query failed: {e}");
                (Err(e), None)
            }
        }
    }
}

fn send_done(
    reply: &Option<Sender<DbReply>>,
    result: Result<(), DbError>,
    last_insert_id: Option<i64>,
) {
    if let Some(reply) = reply {
        let _ = reply.send(DbReply::Done {
            result,
            last_insert_id,
        });
    }
}

fn run_query(conn: &Connection, q: &QueryRequest) -> Result<(), DbError> {
    let to_db = |e: rusqlite::Error| DbError::Query(e.to_string());
    if q.flags.nocache {
        let mut stmt = conn.prepare(q.sql).map_err(to_db)?;
        stream_rows(&mut stmt, q)
    } else {
        let mut stmt = conn.prepare_cached(q.sql).map_err(to_db)?;
        stream_rows(&mut stmt, q)
    }
}

fn stream_rows(stmt: &mut Statement<'_>, q: &QueryRequest) -> Result<(), DbError> {
    let to_db = |e: rusqlite::Error| DbError::Query(e.to_string());
    let ncols = stmt.column_count();
    let mut rows = stmt
        .query(params_from_iter(q.params.iter()))
        .map_err(to_db)?;
    while let Some(row) = rows.next().map_err(to_db)? {
        let Some(reply) = &q.reply else { continue };
        let mut vals = Vec::new();
        match &q.columns {
            Some(idx) => {
                for &i in idx {
                    vals.push(value_at(row, i)?);
                }
            }
            None => {
                for i in 0..ncols {
                    vals.push(value_at(row, i)?);
                }
            }
        }
        let _ = reply.send(DbReply::Row(vals));
    }
    Ok(())
}

fn value_at(row: &rusqlite::Row<'_>, i: usize) -> Result<Value, DbError> {
    use rusqlite::types::ValueRef;
    let v = row
        .get_ref(i)
        .map_err(|e| DbError::Query(e.to_string()))?;
    Ok(match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::I64(n),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries;

    fn svc() -> DbService {
        DbService::open_in_memory().unwrap()
    }

    #[test]
    fn test_set_then_get_vars() {
        let svc = svc();
        let h = svc.handle();
        h.exec(
            queries::VARS_SET,
            vec![
                Param::Text("nick".into()),
                Param::I64(0),
                Param::Text("alice".into()),
            ],
        );
        h.exec(
            queries::VARS_SET,
            vec![
                Param::Text("nick".into()),
                Param::I64(0),
                Param::Text("bob".into()),
            ],
        );
        let rows = h
            .fetch(
                queries::VARS_GET,
                vec![Param::Text("nick".into()), Param::I64(0)],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_text(), Some("bob"));
    }

    #[test]
    fn test_rows_stream_with_sentinel() {
        let svc = svc();
        let h = svc.handle();
        for (name, hub) in [("a", 1i64), ("b", 2), ("c", 3)] {
            h.exec(
                queries::VARS_SET,
                vec![
                    Param::Text(name.into()),
                    Param::I64(hub),
                    Param::Text("v".into()),
                ],
            );
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        h.submit(DbRequest::Query(QueryRequest {
            sql: queries::VARS_LOAD,
            params: vec![],
            flags: Flags::default(),
            reply: Some(tx),
            columns: Some(vec![0]),
            want_last_insert: false,
        }));
        let mut rows = 0;
        loop {
            match rx.recv().unwrap() {
                DbReply::Row(r) => {
                    assert_eq!(r.len(), 1);
                    rows += 1;
                }
                DbReply::Done { result, .. } => {
                    result.unwrap();
                    break;
                }
            }
        }
        assert_eq!(rows, 3);
    }

    #[test]
    fn test_last_insert_id() {
        let svc = svc();
        let h = svc.handle();
        let id1 = h
            .insert_id(
                queries::HASHFILES_UPSERT,
                vec![
                    Param::Text("/a".into()),
                    Param::Text("T".into()),
                    Param::I64(0),
                ],
            )
            .unwrap();
        let id2 = h
            .insert_id(
                queries::HASHFILES_UPSERT,
                vec![
                    Param::Text("/b".into()),
                    Param::Text("T".into()),
                    Param::I64(0),
                ],
            )
            .unwrap();
        assert!(id2 > id1);
    }

    #[test]
    fn test_chained_failure_rolls_back_all() {
        let svc = svc();
        let h = svc.handle();
        // Seed one row so the re-insert below violates the primary key
        // only through the raw INSERT template.
        h.exec(
            queries::SHARE_UPSERT,
            vec![Param::Text("docs".into()), Param::Text("/d".into())],
        );

        const RAW_INSERT: &str = "INSERT INTO share (name, path) VALUES (?1, ?2)";
        let chain = Flags {
            chain_next: true,
            ..Flags::default()
        };

        let mut replies = Vec::new();
        for (name, flags) in [
            ("one", chain),
            ("docs", chain), // fails: primary key
            ("two", Flags::default()),
        ] {
            let (tx, rx) = crossbeam_channel::unbounded();
            h.submit(DbRequest::Query(QueryRequest {
                sql: RAW_INSERT,
                params: vec![Param::Text(name.into()), Param::Text("/x".into())],
                flags,
                reply: Some(tx),
                columns: None,
                want_last_insert: false,
            }));
            replies.push(rx);
        }

        let status: Vec<_> = replies
            .iter()
            .map(|rx| collect(rx).map(|_| ()))
            .collect();
        // First executed but rolled back with the chain; second failed;
        // third was drained unexecuted. All three observe an error.
        assert_eq!(status[0], Err(DbError::ChainAborted));
        assert!(matches!(status[1], Err(DbError::Query(_))));
        assert_eq!(status[2], Err(DbError::ChainAborted));

        let rows = h.fetch(queries::SHARE_LOAD, vec![]).unwrap();
        let names: Vec<_> = rows
            .iter()
            .map(|r| r[0].as_text().unwrap().to_string())
            .collect();
        assert_eq!(names, ["docs"]);
    }

    #[test]
    fn test_single_commits_pending_batch() {
        let svc = svc();
        let h = svc.handle();
        h.exec(
            queries::SHARE_UPSERT,
            vec![Param::Text("a".into()), Param::Text("/a".into())],
        );
        h.exec_with(
            queries::SHARE_UPSERT,
            vec![Param::Text("b".into()), Param::Text("/b".into())],
            Flags {
                single: true,
                ..Flags::default()
            },
        );
        let rows = h.fetch(queries::SHARE_LOAD, vec![]).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");
        {
            let svc = DbService::open(&path).unwrap();
            svc.handle().exec_with(
                queries::VARS_SET,
                vec![
                    Param::Text("slots".into()),
                    Param::I64(0),
                    Param::Text("4".into()),
                ],
                Flags {
                    last_in_batch: true,
                    ..Flags::default()
                },
            );
            svc.shutdown();
        }
        let svc = DbService::open(&path).unwrap();
        let rows = svc
            .handle()
            .fetch(
                queries::VARS_GET,
                vec![Param::Text("slots".into()), Param::I64(0)],
            )
            .unwrap();
        assert_eq!(rows[0][0].as_text(), Some("4"));
    }
}
