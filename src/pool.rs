//! Per-thread SQLite connections for reading postings from disk.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, params};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    ranker::{FieldStats, PostingSource},
    schema::Schema,
    segment_id::SegmentId,
    store::{self, open_read_connection},
    writer::{DocId, Posting, StoredDocument},
};

/// Read connections to one segment file, one per calling thread.
///
/// A thread gets its connection on first use and keeps it for the life of
/// the pool; connections are never shared between threads. [`shutdown`]
/// closes every issued connection exactly once, including those of threads
/// that have already exited.
///
/// Entries are keyed by [`ThreadId`] and never evicted before shutdown, so
/// the pool holds one connection per distinct thread that ever queried it.
/// A pool lives as long as its [`PooledSource`], which is replaced on every
/// index reload; dropping the source shuts the pool down.
///
/// [`shutdown`]: ConnectionPool::shutdown
pub struct ConnectionPool {
    path: PathBuf,
    connections: DashMap<ThreadId, Mutex<Connection>>,
    /// `false` once shut down. Held shared for the duration of every
    /// borrow so shutdown waits for in-flight queries.
    open: RwLock<bool>,
    issued: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            connections: DashMap::new(),
            open: RwLock::new(true),
            issued: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with the calling thread's connection.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R>,
    ) -> Result<R> {
        let open = self.open.read();
        if !*open {
            return Err(Error::InvalidState("connection pool is shut down"));
        }

        let id = thread::current().id();
        if !self.connections.contains_key(&id) {
            let conn = open_read_connection(&self.path)?;
            self.connections.insert(id, Mutex::new(conn));
            self.issued.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "segdex::pool",
                path = %self.path.display(),
                "issued connection"
            );
        }

        let entry = self
            .connections
            .get(&id)
            .ok_or(Error::InvalidState("connection pool is shut down"))?;
        let conn = entry.lock();
        f(&conn)
    }

    /// Connections handed out so far.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    /// Connections currently held.
    pub fn live(&self) -> usize {
        self.connections.len()
    }

    pub fn is_shut_down(&self) -> bool {
        !*self.open.read()
    }

    /// Close every connection. Returns how many were closed; a second call
    /// closes nothing.
    pub fn shutdown(&self) -> usize {
        let mut open = self.open.write();
        if !*open {
            return 0;
        }
        *open = false;

        let ids: Vec<ThreadId> =
            self.connections.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, conn)) = self.connections.remove(&id) {
                if let Err((_, err)) = conn.into_inner().close() {
                    warn!(
                        target: "segdex::pool",
                        error = %err,
                        "closing pooled connection failed"
                    );
                }
                closed += 1;
            }
        }
        debug!(target: "segdex::pool", closed, "connection pool shut down");
        closed
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A [`PostingSource`] that reads postings from a segment file on demand.
///
/// Documents and field lengths are loaded once; postings and vocabularies
/// go through the [`ConnectionPool`].
pub struct PooledSource {
    id: SegmentId,
    schema: Schema,
    pool: Arc<ConnectionPool>,
    documents: Vec<StoredDocument>,
    lengths: BTreeMap<String, Vec<u32>>,
    stats: BTreeMap<String, FieldStats>,
}

impl PooledSource {
    pub fn open(path: &Path, id: &SegmentId) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotFound {
                kind: "segment",
                name: id.to_string(),
            });
        }
        let pool = Arc::new(ConnectionPool::new(path));
        let (schema, documents, lengths) = pool
            .with_connection(|conn| load_summary(conn, id))
            .map_err(|err| store::as_corrupt(id, err))?;

        let stats = lengths
            .iter()
            .map(|(field, lens)| {
                let docs = lens.iter().filter(|&&l| l > 0).count();
                let total: u64 = lens.iter().map(|&l| u64::from(l)).sum();
                let avg_length =
                    if docs == 0 { 0.0 } else { total as f64 / docs as f64 };
                (field.clone(), FieldStats {
                    avg_length,
                    docs_with_field: docs,
                })
            })
            .collect();

        Ok(Self {
            id: id.clone(),
            schema,
            pool,
            documents,
            lengths,
            stats,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl Drop for PooledSource {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// Schema, stored documents and per-field lengths of a segment file.
type Summary = (Schema, Vec<StoredDocument>, BTreeMap<String, Vec<u32>>);

fn load_summary(
    conn: &Connection,
    id: &SegmentId,
) -> Result<Summary> {
    let meta = store::read_meta(conn, id)?;
    let schema_json: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema'",
        [],
        |row| row.get(0),
    )?;
    let schema = Schema::from_json(&schema_json)?;
    let documents = store::read_documents(conn, id)?;
    let n = documents.len();
    if n != meta.doc_count {
        return Err(Error::corrupt(
            id.as_str(),
            format!("meta counts {} documents, found {n}", meta.doc_count),
        ));
    }

    let mut lengths: BTreeMap<String, Vec<u32>> = schema
        .searchable_fields()
        .map(|f| (f.name.clone(), vec![0; n]))
        .collect();
    let mut stmt =
        conn.prepare("SELECT field, doc_id, length FROM field_lengths")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let field: String = row.get(0)?;
        let doc: DocId = row.get(1)?;
        if let Some(slot) = lengths
            .get_mut(&field)
            .and_then(|l| l.get_mut(doc as usize))
        {
            *slot = row.get(2)?;
        }
    }
    Ok((schema, documents, lengths))
}

impl PostingSource for PooledSource {
    fn segment_id(&self) -> &SegmentId {
        &self.id
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn doc_count(&self) -> usize {
        self.documents.len()
    }

    fn field_stats(&self, field: &str) -> Option<FieldStats> {
        self.stats.get(field).copied()
    }

    fn field_lengths(&self, field: &str) -> Option<&[u32]> {
        self.lengths.get(field).map(Vec::as_slice)
    }

    fn postings(&self, field: &str, term: &str) -> Result<Cow<'_, [Posting]>> {
        let n = self.documents.len();
        let postings = self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT doc_id, tf, positions FROM postings
                 WHERE field = ?1 AND term = ?2 ORDER BY doc_id",
            )?;
            let mut rows = stmt.query(params![field, term])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(store::read_posting(row, &self.id, n)?);
            }
            Ok(out)
        })?;
        Ok(Cow::Owned(postings))
    }

    fn visit_vocabulary(
        &self,
        field: &str,
        visit: &mut dyn FnMut(&str),
    ) -> Result<()> {
        self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT term FROM postings WHERE field = ?1
                 ORDER BY term",
            )?;
            let mut rows = stmt.query(params![field])?;
            while let Some(row) = rows.next()? {
                let term: String = row.get(0)?;
                visit(&term);
            }
            Ok(())
        })
    }

    fn visit_terms(&self, visit: &mut dyn FnMut(&str, &str)) -> Result<()> {
        self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT field, term FROM postings ORDER BY field, term",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let field: String = row.get(0)?;
                let term: String = row.get(1)?;
                visit(&field, &term);
            }
            Ok(())
        })
    }

    fn document(&self, doc: DocId) -> Option<&StoredDocument> {
        self.documents.get(doc as usize)
    }
}
