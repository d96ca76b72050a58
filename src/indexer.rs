//! Building and publishing segments.

use std::{io::BufRead, path::PathBuf};

use tracing::info;

use crate::{
    error::{Error, Result},
    schema::Schema,
    segment_id::SegmentId,
    store::SegmentStore,
    writer::{Document, Segment, SegmentWriter},
};

/// What [`publish`] did with a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publish {
    /// The segment was written to this path.
    Saved(PathBuf),
    /// The newest stored segment already has the same content and schema.
    Unchanged(SegmentId),
}

impl Publish {
    pub fn is_saved(&self) -> bool {
        matches!(self, Publish::Saved(_))
    }
}

/// Save `segment` unless the newest stored segment has the same
/// fingerprint, which covers both the schema and the stored content.
pub fn publish(store: &SegmentStore, segment: &Segment) -> Result<Publish> {
    if let Some(latest) = store.latest_meta()?
        && latest.fingerprint == segment.fingerprint()
    {
        info!(
            target: "segdex::indexer",
            segment = %latest.id,
            documents = latest.doc_count,
            "content unchanged, skipping save"
        );
        return Ok(Publish::Unchanged(latest.id));
    }

    let path = store.save(segment)?;
    info!(
        target: "segdex::indexer",
        segment = %segment.id(),
        documents = segment.doc_count(),
        "published segment"
    );
    Ok(Publish::Saved(path))
}

/// Build a segment from `documents` in order.
pub fn build_segment<I>(schema: Schema, documents: I) -> Result<Segment>
where
    I: IntoIterator<Item = Document>,
{
    let mut writer = SegmentWriter::new(schema)?;
    for doc in documents {
        writer.add_document(doc)?;
    }
    writer.build()
}

/// Build `documents` with `schema` and publish the result.
pub fn index_documents<I>(
    store: &SegmentStore,
    schema: Schema,
    documents: I,
) -> Result<Publish>
where
    I: IntoIterator<Item = Document>,
{
    let segment = build_segment(schema, documents)?;
    publish(store, &segment)
}

/// Parse one JSON object per line. Blank lines are skipped.
pub fn read_jsonl(reader: impl BufRead) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document = serde_json::from_str(&line).map_err(|err| {
            Error::InvalidDocument(format!("line {}: {err}", idx + 1))
        })?;
        documents.push(doc);
    }
    Ok(documents)
}
