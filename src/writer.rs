//! Builds immutable segments from ingested documents.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    analyzer::FieldAnalyzers,
    error::{Error, Result},
    markdown,
    schema::{FieldKind, Schema, fields},
    segment_id::SegmentId,
};

/// Ordinal of a document inside one segment, in insertion order.
pub type DocId = u32;

/// One ingest-time field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
    Number(f64),
}

impl FieldValue {
    /// The value as a list of strings; numbers are rendered.
    pub fn as_strings(&self) -> Vec<String> {
        match self {
            FieldValue::Text(text) => vec![text.clone()],
            FieldValue::List(items) => items.clone(),
            FieldValue::Number(n) => vec![n.to_string()],
        }
    }

    /// The value as one string; list items are joined by newlines.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(text) => text.clone(),
            FieldValue::List(items) => items.join("\n"),
            FieldValue::Number(n) => n.to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(text) => text.trim().parse().ok(),
            FieldValue::List(_) => None,
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(text) => text.trim().is_empty(),
            FieldValue::List(items) => items.iter().all(|i| i.trim().is_empty()),
            FieldValue::Number(_) => false,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

/// A document as supplied by the ingestion side: field name to value.
///
/// Deserializes from a flat JSON object of strings, string arrays and
/// numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    /// Non-blank text of `field`.
    pub fn text(&self, field: &str) -> Option<String> {
        self.get(field)
            .filter(|v| !v.is_blank())
            .map(FieldValue::as_text)
    }

    fn has(&self, field: &str) -> bool {
        self.get(field).is_some_and(|v| !v.is_blank())
    }
}

/// Occurrences of one term in one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub doc: DocId,
    pub tf: u32,
    /// Token positions, ascending.
    pub positions: Vec<u32>,
}

/// Inverted index and length statistics of one field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldIndex {
    /// Term to postings sorted by document.
    terms: BTreeMap<String, Vec<Posting>>,
    /// Token count per document; zero when the document lacks the field.
    lengths: Vec<u32>,
}

impl FieldIndex {
    pub(crate) fn from_parts(
        terms: BTreeMap<String, Vec<Posting>>,
        lengths: Vec<u32>,
    ) -> Self {
        Self { terms, lengths }
    }

    pub fn postings(&self, term: &str) -> Option<&[Posting]> {
        self.terms.get(term).map(Vec::as_slice)
    }

    pub fn doc_freq(&self, term: &str) -> usize {
        self.terms.get(term).map_or(0, Vec::len)
    }

    pub fn terms(&self) -> impl Iterator<Item = (&str, &[Posting])> {
        self.terms.iter().map(|(t, p)| (t.as_str(), p.as_slice()))
    }

    pub fn vocabulary(&self) -> impl Iterator<Item = &str> {
        self.terms.keys().map(String::as_str)
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// Token count per document ordinal.
    pub fn doc_lengths(&self) -> &[u32] {
        &self.lengths
    }

    pub fn doc_length(&self, doc: DocId) -> u32 {
        self.lengths.get(doc as usize).copied().unwrap_or(0)
    }

    /// `(doc, length)` for documents that have the field.
    pub fn lengths(&self) -> impl Iterator<Item = (DocId, u32)> + '_ {
        self.lengths
            .iter()
            .enumerate()
            .filter(|(_, len)| **len > 0)
            .map(|(doc, len)| (doc as DocId, *len))
    }

    pub fn total_length(&self) -> u64 {
        self.lengths.iter().map(|&l| u64::from(l)).sum()
    }

    /// Number of documents with at least one token in the field.
    pub fn docs_with_field(&self) -> usize {
        self.lengths.iter().filter(|&&l| l > 0).count()
    }

    /// Mean length over documents that have the field; 0 when none do.
    pub fn avg_length(&self) -> f64 {
        let docs = self.docs_with_field();
        if docs == 0 {
            0.0
        } else {
            self.total_length() as f64 / docs as f64
        }
    }
}

/// Values kept for rendering a hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub doc_id: DocId,
    /// Value of the unique field.
    pub url: String,
    pub title: String,
    pub excerpt: String,
    pub tags: Vec<String>,
    pub timestamp: Option<f64>,
    /// Every stored field, verbatim.
    pub stored: BTreeMap<String, FieldValue>,
}

impl StoredDocument {
    pub fn text(&self, field: &str) -> Option<String> {
        self.stored.get(field).map(FieldValue::as_text)
    }
}

/// An immutable, searchable unit of documents.
#[derive(Debug, Clone)]
pub struct Segment {
    id: SegmentId,
    schema: Schema,
    fields: BTreeMap<String, FieldIndex>,
    documents: Vec<StoredDocument>,
    fingerprint: String,
    created_at: u64,
}

impl Segment {
    pub(crate) fn from_parts(
        id: SegmentId,
        schema: Schema,
        fields: BTreeMap<String, FieldIndex>,
        documents: Vec<StoredDocument>,
        fingerprint: String,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            schema,
            fields,
            documents,
            fingerprint,
            created_at,
        }
    }

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn doc_count(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[StoredDocument] {
        &self.documents
    }

    pub fn document(&self, doc: DocId) -> Option<&StoredDocument> {
        self.documents.get(doc as usize)
    }

    pub fn field(&self, name: &str) -> Option<&FieldIndex> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldIndex)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f))
    }

    /// BLAKE3 hex digest of the stored content.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }
}

static LAST_CREATED_AT: AtomicU64 = AtomicU64::new(0);

/// Wall-clock milliseconds, strictly increasing within the process so
/// segment ids built in the same millisecond still sort in build order.
fn next_created_at() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut last = LAST_CREATED_AT.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_CREATED_AT.compare_exchange_weak(
            last,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// Content fingerprint of a set of stored documents under `schema`.
///
/// Hashes the schema, then `(url, stored values)` pairs sorted by url, so
/// insertion order never changes the digest but a schema change does.
pub fn fingerprint(
    schema: &Schema,
    documents: &[StoredDocument],
) -> Result<String> {
    let mut sorted: Vec<&StoredDocument> = documents.iter().collect();
    sorted.sort_by(|a, b| a.url.cmp(&b.url));

    let mut hasher = blake3::Hasher::new();
    hasher.update(schema.to_json()?.as_bytes());
    hasher.update(&[0xfe]);
    for doc in sorted {
        hasher.update(doc.url.as_bytes());
        hasher.update(&[0]);
        hasher.update(&serde_json::to_vec(&doc.stored)?);
        hasher.update(&[0xff]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[derive(Default)]
struct FieldBuilder {
    terms: HashMap<String, Vec<Posting>>,
    lengths: Vec<u32>,
}

impl FieldBuilder {
    fn finish(self) -> FieldIndex {
        FieldIndex {
            terms: self.terms.into_iter().collect(),
            lengths: self.lengths,
        }
    }
}

/// Accumulates documents into a [`Segment`].
///
/// A writer is single-use: after [`SegmentWriter::build`] every call fails
/// with [`Error::InvalidState`]. Dropping a writer has no side effects.
pub struct SegmentWriter {
    schema: Schema,
    analyzers: FieldAnalyzers,
    seen: HashSet<String>,
    fields: BTreeMap<String, FieldBuilder>,
    documents: Vec<StoredDocument>,
    built: bool,
}

impl SegmentWriter {
    pub fn new(schema: Schema) -> Result<Self> {
        let analyzers = FieldAnalyzers::for_schema(&schema)?;
        let fields = analyzers
            .iter()
            .map(|(def, _)| (def.name.clone(), FieldBuilder::default()))
            .collect();
        Ok(Self {
            schema,
            analyzers,
            seen: HashSet::new(),
            fields,
            documents: Vec::new(),
            built: false,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Analyze and add one document, returning its ordinal.
    pub fn add_document(&mut self, mut doc: Document) -> Result<DocId> {
        if self.built {
            return Err(Error::InvalidState("segment writer already built"));
        }

        let unique = self.schema.unique_field().name.clone();
        let id = doc
            .text(&unique)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                Error::InvalidDocument(format!("missing '{unique}' value"))
            })?;
        if self.seen.contains(&id) {
            return Err(Error::InvalidDocument(format!(
                "duplicate {unique} '{id}'"
            )));
        }

        self.derive_signals(&mut doc, &id);
        self.check_numeric(&mut doc, &id)?;

        let ordinal = DocId::try_from(self.documents.len()).map_err(|_| {
            Error::InvalidDocument("segment document limit reached".into())
        })?;

        for (def, analyzer) in self.analyzers.iter() {
            let Some(builder) = self.fields.get_mut(&def.name) else {
                continue;
            };
            builder.lengths.push(0);
            let Some(value) = doc.get(&def.name) else {
                continue;
            };

            let mut positions: HashMap<String, Vec<u32>> = HashMap::new();
            let mut offset = 0u32;
            let mut length = 0u32;
            for item in value.as_strings() {
                let mut last = None;
                for token in analyzer.tokens(&item) {
                    let position = offset + token.position;
                    positions.entry(token.text).or_default().push(position);
                    length += 1;
                    last = Some(position);
                }
                // Items of a list never form a phrase across the boundary.
                if let Some(last) = last {
                    offset = last + 2;
                }
            }

            if let Some(slot) = builder.lengths.last_mut() {
                *slot = length;
            }
            for (term, mut pos) in positions {
                pos.sort_unstable();
                builder.terms.entry(term).or_default().push(Posting {
                    doc: ordinal,
                    tf: pos.len() as u32,
                    positions: pos,
                });
            }
        }

        let stored = self.stored_document(ordinal, &id, &doc);
        self.documents.push(stored);
        self.seen.insert(id);
        Ok(ordinal)
    }

    /// Freeze everything added so far into a segment.
    pub fn build(&mut self) -> Result<Segment> {
        if self.built {
            return Err(Error::InvalidState("segment writer already built"));
        }
        self.built = true;

        let documents = std::mem::take(&mut self.documents);
        let fields: BTreeMap<String, FieldIndex> =
            std::mem::take(&mut self.fields)
                .into_iter()
                .map(|(name, builder)| (name, builder.finish()))
                .collect();
        self.seen.clear();

        let fingerprint = fingerprint(&self.schema, &documents)?;
        let created_at = next_created_at();
        let id = SegmentId::generate(created_at, &fingerprint);

        debug!(
            target: "segdex::writer",
            segment = %id,
            documents = documents.len(),
            fields = fields.len(),
            "built segment"
        );

        Ok(Segment {
            id,
            schema: self.schema.clone(),
            fields,
            documents,
            fingerprint,
            created_at,
        })
    }

    /// Fill in documentation fields the ingestion side did not supply.
    fn derive_signals(&self, doc: &mut Document, id: &str) {
        let schema = &self.schema;
        let body = doc.text(fields::BODY).unwrap_or_default();
        let path = doc.text(fields::PATH);

        if let Some(all) = doc.remove(fields::HEADINGS) {
            let lines = all.as_strings();
            let lines: Vec<&str> = lines.iter().flat_map(|l| l.lines()).collect();
            let tiers = markdown::split_headings(lines);
            self.set_headings(doc, tiers);
        } else if !body.is_empty() {
            let tiers = markdown::extract_headings(&body);
            self.set_headings(doc, tiers);
        }

        if schema.has_field(fields::TITLE) && !doc.has(fields::TITLE) {
            let title = markdown::extract_title(&body, path.as_deref(), id);
            doc.set(fields::TITLE, title);
        }

        if schema.has_field(fields::EXCERPT) && !doc.has(fields::EXCERPT) {
            if let Some(excerpt) = markdown::extract_excerpt(&body) {
                doc.set(fields::EXCERPT, excerpt);
            }
        }

        if schema.has_field(fields::TAGS) {
            if let Some(tags) = doc.remove(fields::TAGS) {
                let raw = tags.as_strings();
                let coerced =
                    markdown::coerce_tags(raw.iter().map(String::as_str));
                if !coerced.is_empty() {
                    doc.set(fields::TAGS, coerced);
                }
            }
        }

        if schema.has_field(fields::LANGUAGE) && !doc.has(fields::LANGUAGE) {
            let language = path
                .as_deref()
                .and_then(markdown::language_from_path)
                .or_else(|| markdown::language_from_path(id))
                .unwrap_or_else(|| "en".to_string());
            doc.set(fields::LANGUAGE, language);
        }
    }

    fn set_headings(&self, doc: &mut Document, tiers: markdown::Headings) {
        let targets = [
            (fields::HEADINGS_H1, tiers.h1),
            (fields::HEADINGS_H2, tiers.h2),
            (fields::HEADINGS_H3, tiers.h3),
        ];
        for (field, values) in targets {
            if self.schema.has_field(field)
                && !doc.has(field)
                && !values.is_empty()
            {
                doc.set(field, values);
            }
        }
    }

    fn check_numeric(&self, doc: &mut Document, id: &str) -> Result<()> {
        for def in self.schema.fields() {
            if def.kind != FieldKind::Numeric {
                continue;
            }
            let Some(value) = doc.get(&def.name) else {
                continue;
            };
            let number = value.as_number().ok_or_else(|| {
                Error::InvalidDocument(format!(
                    "field '{}' of '{id}' is not a number",
                    def.name
                ))
            })?;
            doc.set(&def.name, number);
        }
        Ok(())
    }

    fn stored_document(
        &self,
        ordinal: DocId,
        id: &str,
        doc: &Document,
    ) -> StoredDocument {
        let stored: BTreeMap<String, FieldValue> = self
            .schema
            .stored_fields()
            .filter_map(|def| {
                doc.get(&def.name).map(|v| (def.name.clone(), v.clone()))
            })
            .collect();

        StoredDocument {
            doc_id: ordinal,
            url: id.to_string(),
            title: doc.text(fields::TITLE).unwrap_or_else(|| id.to_string()),
            excerpt: doc.text(fields::EXCERPT).unwrap_or_default(),
            tags: doc
                .get(fields::TAGS)
                .map(FieldValue::as_strings)
                .unwrap_or_default(),
            timestamp: doc.get(fields::TIMESTAMP).and_then(FieldValue::as_number),
            stored,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn doc(url: &str, body: &str) -> Document {
        Document::new().with("url", url).with("body", body)
    }

    fn build(docs: Vec<Document>) -> Segment {
        let mut writer = SegmentWriter::new(Schema::documentation()).unwrap();
        for d in docs {
            writer.add_document(d).unwrap();
        }
        writer.build().unwrap()
    }

    #[test]
    fn postings_record_tf_and_positions() {
        let segment = build(vec![
            doc("/a", "webhook retries and webhook signatures"),
            doc("/b", "signatures only"),
        ]);
        let body = segment.field("body").unwrap();
        let postings = body.postings("webhook").unwrap();
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].doc, 0);
        assert_eq!(postings[0].tf, 2);
        assert_eq!(postings[0].positions, vec![0, 3]);
        assert_eq!(body.doc_freq("signatur"), 2);
        assert_eq!(body.doc_length(0), 4);
        assert_eq!(body.doc_length(1), 2);
        assert!((body.avg_length() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn derives_documentation_signals() {
        let body = "# Configure Webhooks\n\nWebhooks notify your server when events happen.\n\n## Retries\n\n### Backoff";
        let segment = build(vec![
            doc("https://docs.example.com/fr/webhooks", body)
                .with("tags", "events, http"),
        ]);
        let stored = segment.document(0).unwrap();
        assert_eq!(stored.title, "Configure Webhooks");
        assert_eq!(
            stored.excerpt,
            "Webhooks notify your server when events happen."
        );
        assert_eq!(stored.tags, vec!["events", "http"]);
        assert_eq!(stored.text("language").as_deref(), Some("fr"));
        assert!(
            segment
                .field("headings_h2")
                .unwrap()
                .postings("retri")
                .is_some()
        );
        assert!(segment.field("headings_h3").unwrap().doc_length(0) > 0);
    }

    #[test]
    fn headings_alias_is_split() {
        let segment = build(vec![
            doc("/a", "text").with(
                "headings",
                vec!["# Top".to_string(), "## Middle".to_string()],
            ),
        ]);
        assert!(segment.field("headings_h1").unwrap().doc_length(0) > 0);
        assert!(segment.field("headings_h2").unwrap().doc_length(0) > 0);
        assert_eq!(segment.field("headings_h3").unwrap().doc_length(0), 0);
    }

    #[test]
    fn explicit_values_win() {
        let segment = build(vec![
            doc("/x", "# Heading")
                .with("title", "Given")
                .with("language", "de"),
        ]);
        let stored = segment.document(0).unwrap();
        assert_eq!(stored.title, "Given");
        assert_eq!(stored.text("language").as_deref(), Some("de"));
    }

    #[test]
    fn missing_or_duplicate_id_is_rejected() {
        let mut writer = SegmentWriter::new(Schema::documentation()).unwrap();
        let missing = writer.add_document(Document::new().with("body", "x"));
        assert!(matches!(missing, Err(Error::InvalidDocument(_))));

        writer.add_document(doc("/a", "x")).unwrap();
        let dup = writer.add_document(doc("/a", "y"));
        assert!(matches!(dup, Err(Error::InvalidDocument(_))));
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn non_numeric_timestamp_is_rejected() {
        let mut writer = SegmentWriter::new(Schema::documentation()).unwrap();
        let bad = writer.add_document(doc("/a", "x").with("timestamp", "soon"));
        assert!(matches!(bad, Err(Error::InvalidDocument(_))));
        writer
            .add_document(doc("/b", "x").with("timestamp", "1700000000"))
            .unwrap();
        let segment = writer.build().unwrap();
        assert_eq!(segment.document(0).unwrap().timestamp, Some(1.7e9));
    }

    #[test]
    fn writer_is_single_use() {
        let mut writer = SegmentWriter::new(Schema::documentation()).unwrap();
        writer.add_document(doc("/a", "x")).unwrap();
        writer.build().unwrap();
        assert!(matches!(writer.build(), Err(Error::InvalidState(_))));
        assert!(matches!(
            writer.add_document(doc("/b", "y")),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn empty_segment_builds() {
        let segment = build(Vec::new());
        assert!(segment.is_empty());
        assert_eq!(segment.field("body").unwrap().avg_length(), 0.0);
    }

    #[test]
    fn document_parses_from_json() {
        let doc: Document = serde_json::from_str(
            r#"{"url": "/a", "tags": ["x", "y"], "timestamp": 12}"#,
        )
        .unwrap();
        assert_eq!(doc.get("tags"), Some(&FieldValue::List(vec![
            "x".into(),
            "y".into()
        ])));
        assert_eq!(doc.get("timestamp"), Some(&FieldValue::Number(12.0)));
    }

    proptest! {
        #[test]
        fn fingerprint_ignores_insertion_order(
            bodies in proptest::collection::vec("[a-z ]{0,30}", 1..8),
            seed in any::<u64>(),
        ) {
            let docs: Vec<Document> = bodies
                .iter()
                .enumerate()
                .map(|(i, b)| doc(&format!("/doc/{i}"), b))
                .collect();
            let mut shuffled = docs.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            if seed % 2 == 0 {
                shuffled.reverse();
            }

            let a = build(docs);
            let b = build(shuffled);
            prop_assert_eq!(a.fingerprint(), b.fingerprint());
        }
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = build(vec![doc("/a", "one")]);
        let b = build(vec![doc("/a", "two")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
