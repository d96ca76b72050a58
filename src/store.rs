//! On-disk persistence of segments as single-file SQLite databases.
//!
//! Each segment lives at `<data_root>/__search_segments/<id>.sqlite`.
//! Files are written under a temporary name and renamed into place, so a
//! partially written segment is never visible under a valid name.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    schema::Schema,
    scoring,
    segment_id::SegmentId,
    writer::{DocId, FieldIndex, FieldValue, Posting, Segment, StoredDocument},
};

/// Directory under the data root holding segment files.
pub const SEGMENTS_DIR: &str = "__search_segments";

/// Version of the table layout written by this crate.
pub const FORMAT_VERSION: &str = "1";

const TMP_SUFFIX: &str = ".tmp";

const CREATE_TABLES: &str = "
    CREATE TABLE meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE documents (
        doc_id INTEGER PRIMARY KEY,
        url TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        excerpt TEXT NOT NULL,
        tags TEXT NOT NULL,
        timestamp REAL,
        stored TEXT NOT NULL
    );
    CREATE TABLE field_lengths (
        field TEXT NOT NULL,
        doc_id INTEGER NOT NULL,
        length INTEGER NOT NULL,
        PRIMARY KEY (field, doc_id)
    ) WITHOUT ROWID;
    CREATE TABLE postings (
        term TEXT NOT NULL,
        field TEXT NOT NULL,
        doc_id INTEGER NOT NULL,
        tf INTEGER NOT NULL,
        idf REAL NOT NULL,
        boost REAL NOT NULL,
        positions BLOB NOT NULL,
        PRIMARY KEY (field, term, doc_id)
    ) WITHOUT ROWID;
";

/// Open a connection tuned for reading a finished segment.
pub(crate) fn open_read_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.pragma_update(None, "cache_size", -16_384)?;
    conn.pragma_update(None, "mmap_size", 268_435_456)?;
    conn.pragma_update(None, "query_only", "ON")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(conn)
}

fn open_write_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // page_size only takes effect before the first table is created.
    conn.pragma_update(None, "page_size", 8_192)?;
    conn.pragma_update(None, "cache_size", -65_536)?;
    conn.pragma_update(None, "cache_spill", "OFF")?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

/// Metadata of a segment file, read without loading postings.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMeta {
    pub id: SegmentId,
    pub format_version: String,
    pub doc_count: usize,
    pub fingerprint: String,
    pub created_at: u64,
}

/// One segment file on disk.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    pub id: SegmentId,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// `None` when the metadata could not be read.
    pub meta: Option<SegmentMeta>,
}

/// Outcome of [`SegmentStore::compact`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactReport {
    pub vacuumed: usize,
    pub temp_files_removed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Segment files of one data root.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    /// Use the segment directory under `data_root`, creating it if needed.
    pub fn open(data_root: &Path) -> Result<Self> {
        let dir = data_root.join(SEGMENTS_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &SegmentId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    /// Persist `segment` atomically and return its final path.
    pub fn save(&self, segment: &Segment) -> Result<PathBuf> {
        let final_path = self.path_for(segment.id());
        let tmp_path = self
            .dir
            .join(format!("{}{TMP_SUFFIX}", segment.id().file_name()));
        remove_with_sidecars(&tmp_path)?;

        let result = write_segment(&tmp_path, segment);
        if let Err(err) = result {
            let _ = remove_with_sidecars(&tmp_path);
            return Err(err);
        }

        fs::File::open(&tmp_path)?.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.dir)?;

        info!(
            target: "segdex::store",
            segment = %segment.id(),
            documents = segment.doc_count(),
            path = %final_path.display(),
            "saved segment"
        );
        Ok(final_path)
    }

    /// Load and validate a segment.
    pub fn load(&self, id: &SegmentId) -> Result<Segment> {
        let path = self.path_for(id);
        if !path.is_file() {
            return Err(Error::NotFound {
                kind: "segment",
                name: id.to_string(),
            });
        }

        let segment = open_read_connection(&path)
            .and_then(|conn| read_segment(&conn, id))
            .map_err(|err| as_corrupt(id, err))?;

        info!(
            target: "segdex::store",
            segment = %id,
            documents = segment.doc_count(),
            "loaded segment"
        );
        Ok(segment)
    }

    /// Ids of all segment files, oldest first. Files whose names were not
    /// produced by the writer are skipped.
    pub fn segment_ids(&self) -> Result<Vec<SegmentId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(SegmentId::from_file_name) {
                Some(id) if id.is_generated() => ids.push(id),
                Some(id) => debug!(
                    target: "segdex::store",
                    file = %id,
                    "skipping foreign file in segment directory"
                ),
                None => {}
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn latest_segment_id(&self) -> Result<Option<SegmentId>> {
        Ok(self.segment_ids()?.pop())
    }

    /// Metadata of one segment without loading its postings.
    pub fn read_meta(&self, id: &SegmentId) -> Result<SegmentMeta> {
        let path = self.path_for(id);
        if !path.is_file() {
            return Err(Error::NotFound {
                kind: "segment",
                name: id.to_string(),
            });
        }
        open_read_connection(&path)
            .and_then(|conn| read_meta(&conn, id))
            .map_err(|err| as_corrupt(id, err))
    }

    pub fn latest_meta(&self) -> Result<Option<SegmentMeta>> {
        match self.latest_segment_id()? {
            Some(id) => self.read_meta(&id).map(Some),
            None => Ok(None),
        }
    }

    pub fn latest_doc_count(&self) -> Result<Option<usize>> {
        Ok(self.latest_meta()?.map(|m| m.doc_count))
    }

    pub fn latest_fingerprint(&self) -> Result<Option<String>> {
        Ok(self.latest_meta()?.map(|m| m.fingerprint))
    }

    /// Every segment file with its metadata, oldest first.
    pub fn list(&self) -> Result<Vec<SegmentFile>> {
        let mut files = Vec::new();
        for id in self.segment_ids()? {
            let path = self.path_for(&id);
            let size_bytes = fs::metadata(&path)?.len();
            let meta = match self.read_meta(&id) {
                Ok(meta) => Some(meta),
                Err(err) => {
                    warn!(
                        target: "segdex::store",
                        segment = %id,
                        error = %err,
                        "unreadable segment metadata"
                    );
                    None
                }
            };
            files.push(SegmentFile {
                id,
                path,
                size_bytes,
                meta,
            });
        }
        Ok(files)
    }

    /// Reclaim space in every segment file and delete leftover temporary
    /// files. Must not run while a writer is saving into this store.
    pub fn compact(&self) -> Result<CompactReport> {
        let mut report = CompactReport::default();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(TMP_SUFFIX));
            if is_tmp {
                fs::remove_file(&path)?;
                report.temp_files_removed += 1;
            }
        }

        for id in self.segment_ids()? {
            let path = self.path_for(&id);
            report.bytes_before += fs::metadata(&path)?.len();

            let conn = Connection::open(&path)?;
            conn.execute_batch("VACUUM;")?;
            conn.close().map_err(|(_, err)| err)?;

            report.bytes_after += fs::metadata(&path)?.len();
            report.vacuumed += 1;
        }

        info!(
            target: "segdex::store",
            vacuumed = report.vacuumed,
            temp_files_removed = report.temp_files_removed,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            "compacted segment store"
        );
        Ok(report)
    }

    /// Delete all but the newest `keep` segments; returns the removed ids.
    pub fn prune(&self, keep: usize) -> Result<Vec<SegmentId>> {
        let ids = self.segment_ids()?;
        let excess = ids.len().saturating_sub(keep);
        let removed: Vec<SegmentId> = ids.into_iter().take(excess).collect();
        for id in &removed {
            remove_with_sidecars(&self.path_for(id))?;
        }
        if !removed.is_empty() {
            info!(
                target: "segdex::store",
                removed = removed.len(),
                kept = keep,
                "pruned old segments"
            );
        }
        Ok(removed)
    }
}

/// Storage errors while reading a segment mean the file is unusable,
/// except for transient ones.
pub(crate) fn as_corrupt(id: &SegmentId, err: Error) -> Error {
    match err {
        Error::Sqlite(_) | Error::Json(_) if !err.is_retryable() => {
            Error::corrupt(id.as_str(), err.to_string())
        }
        other => other,
    }
}

fn remove_with_sidecars(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        match fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn encode_positions(positions: &[u32]) -> Vec<u8> {
    let le: Vec<u32> = positions.iter().map(|p| p.to_le()).collect();
    bytemuck::cast_slice(&le).to_vec()
}

fn decode_positions(blob: &[u8]) -> Option<Vec<u32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| u32::from_le(bytemuck::pod_read_unaligned(chunk)))
            .collect(),
    )
}

fn write_segment(path: &Path, segment: &Segment) -> Result<()> {
    let mut conn = open_write_connection(path)?;
    let n = segment.doc_count();

    let tx = conn.transaction()?;
    tx.execute_batch(CREATE_TABLES)?;
    {
        let mut meta =
            tx.prepare("INSERT INTO meta (key, value) VALUES (?1, ?2)")?;
        let schema = segment.schema().to_json()?;
        let doc_count = n.to_string();
        let created_at = segment.created_at().to_string();
        let entries = [
            ("format_version", FORMAT_VERSION),
            ("segment_id", segment.id().as_str()),
            ("schema", schema.as_str()),
            ("fingerprint", segment.fingerprint()),
            ("doc_count", doc_count.as_str()),
            ("created_at", created_at.as_str()),
        ];
        for (key, value) in entries {
            meta.execute(params![key, value])?;
        }

        let mut docs = tx.prepare(
            "INSERT INTO documents
                (doc_id, url, title, excerpt, tags, timestamp, stored)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for doc in segment.documents() {
            docs.execute(params![
                doc.doc_id,
                doc.url,
                doc.title,
                doc.excerpt,
                serde_json::to_string(&doc.tags)?,
                doc.timestamp,
                serde_json::to_string(&doc.stored)?,
            ])?;
        }

        let mut lengths = tx.prepare(
            "INSERT INTO field_lengths (field, doc_id, length)
             VALUES (?1, ?2, ?3)",
        )?;
        let mut postings = tx.prepare(
            "INSERT INTO postings
                (term, field, doc_id, tf, idf, boost, positions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for (field, index) in segment.fields() {
            let boost = segment.schema().field(field).map_or(1.0, |f| f.boost);
            for (doc, length) in index.lengths() {
                lengths.execute(params![field, doc, length])?;
            }
            for (term, list) in index.terms() {
                let idf = scoring::idf(list.len(), n);
                for posting in list {
                    postings.execute(params![
                        term,
                        field,
                        posting.doc,
                        posting.tf,
                        idf,
                        boost,
                        encode_positions(&posting.positions),
                    ])?;
                }
            }
        }
    }
    tx.commit()?;

    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    // Finished segments are immutable; a rollback journal header lets
    // read-only connections open them without -wal/-shm sidecars.
    conn.pragma_update_and_check(None, "journal_mode", "DELETE", |row| {
        row.get::<_, String>(0)
    })?;
    conn.close().map_err(|(_, err)| err)?;
    Ok(())
}

pub(crate) fn read_meta(
    conn: &Connection,
    expected: &SegmentId,
) -> Result<SegmentMeta> {
    let mut stmt = conn.prepare("SELECT key, value FROM meta")?;
    let rows: HashMap<String, String> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let get = |key: &str| {
        rows.get(key).cloned().ok_or_else(|| {
            Error::corrupt(expected.as_str(), format!("missing meta '{key}'"))
        })
    };

    let format_version = get("format_version")?;
    if format_version != FORMAT_VERSION {
        return Err(Error::corrupt(
            expected.as_str(),
            format!("unsupported format version {format_version}"),
        ));
    }
    let id = SegmentId::new(get("segment_id")?);
    if &id != expected {
        return Err(Error::corrupt(
            expected.as_str(),
            format!("file holds segment {id}"),
        ));
    }
    let doc_count = get("doc_count")?.parse().map_err(|_| {
        Error::corrupt(expected.as_str(), "doc_count is not a number")
    })?;
    let created_at = get("created_at")?.parse().map_err(|_| {
        Error::corrupt(expected.as_str(), "created_at is not a number")
    })?;

    Ok(SegmentMeta {
        id,
        format_version,
        doc_count,
        fingerprint: get("fingerprint")?,
        created_at,
    })
}

fn read_segment(conn: &Connection, id: &SegmentId) -> Result<Segment> {
    let meta = read_meta(conn, id)?;
    let schema_json: String = conn
        .query_row("SELECT value FROM meta WHERE key = 'schema'", [], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or_else(|| Error::corrupt(id.as_str(), "missing meta 'schema'"))?;
    let schema = Schema::from_json(&schema_json).map_err(|err| {
        Error::corrupt(id.as_str(), format!("invalid schema: {err}"))
    })?;

    let documents = read_documents(conn, id)?;
    if documents.len() != meta.doc_count {
        return Err(Error::corrupt(
            id.as_str(),
            format!(
                "{} documents stored, metadata says {}",
                documents.len(),
                meta.doc_count
            ),
        ));
    }
    let n = documents.len();

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
        let length: u32 = row.get(2)?;
        let slot = lengths
            .get_mut(&field)
            .and_then(|l| l.get_mut(doc as usize))
            .ok_or_else(|| {
                Error::corrupt(
                    id.as_str(),
                    format!("length for unknown field/document {field}/{doc}"),
                )
            })?;
        *slot = length;
    }

    let mut terms: BTreeMap<String, BTreeMap<String, Vec<Posting>>> =
        lengths.keys().map(|f| (f.clone(), BTreeMap::new())).collect();
    let mut stmt = conn.prepare(
        "SELECT field, term, doc_id, tf, positions FROM postings
         ORDER BY field, term, doc_id",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let field: String = row.get(0)?;
        let term: String = row.get(1)?;
        let posting = read_posting(row, id, n)?;
        terms
            .get_mut(&field)
            .ok_or_else(|| {
                Error::corrupt(
                    id.as_str(),
                    format!("postings for unknown field {field}"),
                )
            })?
            .entry(term)
            .or_default()
            .push(posting);
    }

    let fields = lengths
        .into_iter()
        .map(|(field, lengths)| {
            let field_terms = terms.remove(&field).unwrap_or_default();
            (field, FieldIndex::from_parts(field_terms, lengths))
        })
        .collect();

    Ok(Segment::from_parts(
        meta.id,
        schema,
        fields,
        documents,
        meta.fingerprint,
        meta.created_at,
    ))
}

pub(crate) fn read_posting(
    row: &rusqlite::Row<'_>,
    id: &SegmentId,
    doc_count: usize,
) -> Result<Posting> {
    let doc: DocId = row.get("doc_id")?;
    let tf: u32 = row.get("tf")?;
    let blob: Vec<u8> = row.get("positions")?;
    if doc as usize >= doc_count {
        return Err(Error::corrupt(
            id.as_str(),
            format!("posting references unknown document {doc}"),
        ));
    }
    let positions = decode_positions(&blob)
        .filter(|p| p.len() == tf as usize)
        .ok_or_else(|| {
            Error::corrupt(
                id.as_str(),
                format!("positions of document {doc} disagree with tf {tf}"),
            )
        })?;
    Ok(Posting { doc, tf, positions })
}

pub(crate) fn read_documents(
    conn: &Connection,
    id: &SegmentId,
) -> Result<Vec<StoredDocument>> {
    let mut stmt = conn.prepare(
        "SELECT doc_id, url, title, excerpt, tags, timestamp, stored
         FROM documents ORDER BY doc_id",
    )?;
    let mut rows = stmt.query([])?;
    let mut documents = Vec::new();
    while let Some(row) = rows.next()? {
        let doc_id: DocId = row.get(0)?;
        if doc_id as usize != documents.len() {
            return Err(Error::corrupt(
                id.as_str(),
                format!("document ids are not dense at {doc_id}"),
            ));
        }
        let tags: String = row.get(4)?;
        let stored: String = row.get(6)?;
        let stored: BTreeMap<String, FieldValue> =
            serde_json::from_str(&stored)?;
        documents.push(StoredDocument {
            doc_id,
            url: row.get(1)?,
            title: row.get(2)?,
            excerpt: row.get(3)?,
            tags: serde_json::from_str(&tags)?,
            timestamp: row.get(5)?,
            stored,
        });
    }
    Ok(documents)
}
