//! Ranking strategies over a segment's postings.
//!
//! Every strategy is a [`ScoringEngine`] over some [`PostingSource`]: the
//! in-memory [`Segment`], a [`BloomFiltered`] wrapper, or the pooled
//! SQLite reader. The kernel (scalar or vectorized) is picked at
//! construction; callers only see [`Ranker`].

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
};

use tracing::debug;

use crate::{
    bloom::BloomFilter,
    error::{Error, Result},
    fuzzy,
    pool::PooledSource,
    query::{FieldTerms, KeywordSet, MatchStage, PreparedQuery},
    schema::Schema,
    scoring::{self, ScoringParams},
    segment_id::SegmentId,
    simd::{self, ScoreBatch},
    store::SegmentStore,
    writer::{DocId, Posting, Segment, StoredDocument},
};

/// Segments with more documents than this get a Bloom prefilter under
/// [`RankerStrategy::Auto`].
pub const BLOOM_THRESHOLD: usize = 1_000;

/// Literal terms shorter than this are not prefix-expanded.
pub const MIN_PREFIX_LEN: usize = 4;

const MAX_FUZZY_EXPANSIONS: usize = 5;
const MAX_PREFIX_EXPANSIONS: usize = 10;

/// Length statistics of one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldStats {
    pub avg_length: f64,
    pub docs_with_field: usize,
}

/// Read access to the postings and stored documents of one segment.
pub trait PostingSource: Send + Sync {
    fn segment_id(&self) -> &SegmentId;

    fn schema(&self) -> &Schema;

    fn doc_count(&self) -> usize;

    fn field_stats(&self, field: &str) -> Option<FieldStats>;

    /// Token counts per document ordinal for `field`.
    fn field_lengths(&self, field: &str) -> Option<&[u32]>;

    /// Postings of `term` in `field`, sorted by document; empty if absent.
    fn postings(&self, field: &str, term: &str) -> Result<Cow<'_, [Posting]>>;

    /// Visit every distinct term of `field` in ascending order.
    fn visit_vocabulary(
        &self,
        field: &str,
        visit: &mut dyn FnMut(&str),
    ) -> Result<()>;

    /// Visit every `(field, term)` pair.
    fn visit_terms(&self, visit: &mut dyn FnMut(&str, &str)) -> Result<()>;

    fn document(&self, doc: DocId) -> Option<&StoredDocument>;

    /// `false` only if `term` is certainly absent from `field`.
    fn might_contain(&self, _field: &str, _term: &str) -> bool {
        true
    }
}

impl PostingSource for Segment {
    fn segment_id(&self) -> &SegmentId {
        self.id()
    }

    fn schema(&self) -> &Schema {
        Segment::schema(self)
    }

    fn doc_count(&self) -> usize {
        Segment::doc_count(self)
    }

    fn field_stats(&self, field: &str) -> Option<FieldStats> {
        self.field(field).map(|index| FieldStats {
            avg_length: index.avg_length(),
            docs_with_field: index.docs_with_field(),
        })
    }

    fn field_lengths(&self, field: &str) -> Option<&[u32]> {
        self.field(field).map(|index| index.doc_lengths())
    }

    fn postings(&self, field: &str, term: &str) -> Result<Cow<'_, [Posting]>> {
        Ok(Cow::Borrowed(
            self.field(field)
                .and_then(|index| index.postings(term))
                .unwrap_or(&[]),
        ))
    }

    fn visit_vocabulary(
        &self,
        field: &str,
        visit: &mut dyn FnMut(&str),
    ) -> Result<()> {
        if let Some(index) = self.field(field) {
            index.vocabulary().for_each(visit);
        }
        Ok(())
    }

    fn visit_terms(&self, visit: &mut dyn FnMut(&str, &str)) -> Result<()> {
        for (field, index) in self.fields() {
            for term in index.vocabulary() {
                visit(field, term);
            }
        }
        Ok(())
    }

    fn document(&self, doc: DocId) -> Option<&StoredDocument> {
        Segment::document(self, doc)
    }
}

/// A posting source that skips lookups of terms a Bloom filter rules out.
pub struct BloomFiltered<S> {
    inner: S,
    filter: BloomFilter,
}

impl<S: PostingSource> BloomFiltered<S> {
    /// Build the filter from every `(field, term)` pair of `inner`.
    pub fn new(inner: S) -> Result<Self> {
        let mut keys: Vec<(String, String)> = Vec::new();
        inner.visit_terms(&mut |field, term| {
            keys.push((field.to_string(), term.to_string()));
        })?;
        let filter = BloomFilter::from_keys(
            keys.iter().map(|(f, t)| (f.as_str(), t.as_str())),
        );
        debug!(
            target: "segdex::ranker",
            keys = filter.len(),
            bits = filter.bit_len(),
            "built bloom prefilter"
        );
        Ok(Self { inner, filter })
    }

    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }
}

impl<S: PostingSource> PostingSource for BloomFiltered<S> {
    fn segment_id(&self) -> &SegmentId {
        self.inner.segment_id()
    }

    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn doc_count(&self) -> usize {
        self.inner.doc_count()
    }

    fn field_stats(&self, field: &str) -> Option<FieldStats> {
        self.inner.field_stats(field)
    }

    fn field_lengths(&self, field: &str) -> Option<&[u32]> {
        self.inner.field_lengths(field)
    }

    fn postings(&self, field: &str, term: &str) -> Result<Cow<'_, [Posting]>> {
        if !self.filter.might_contain(field, term) {
            return Ok(Cow::Borrowed(&[]));
        }
        self.inner.postings(field, term)
    }

    fn visit_vocabulary(
        &self,
        field: &str,
        visit: &mut dyn FnMut(&str),
    ) -> Result<()> {
        self.inner.visit_vocabulary(field, visit)
    }

    fn visit_terms(&self, visit: &mut dyn FnMut(&str, &str)) -> Result<()> {
        self.inner.visit_terms(visit)
    }

    fn document(&self, doc: DocId) -> Option<&StoredDocument> {
        self.inner.document(doc)
    }

    fn might_contain(&self, field: &str, term: &str) -> bool {
        self.filter.might_contain(field, term)
    }
}

/// Options for one ranking call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RankOptions {
    /// Match whole words only: no fuzzy or prefix expansion.
    pub word_match: bool,
    /// Keep at most this many hits.
    pub limit: Option<usize>,
}

/// One scored document.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHit {
    pub doc: DocId,
    pub score: f64,
    /// Distinct literal query terms found in the document.
    pub literal_matches: usize,
    /// Strongest stage that contributed to the score.
    pub stage: MatchStage,
    /// Query word behind the largest contribution of that stage.
    pub variant: String,
    /// Fields that contributed, in query field order.
    pub fields: Vec<String>,
}

/// Hits in rank order plus work counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    pub hits: Vec<RankedHit>,
    /// Documents that matched at least one term.
    pub candidates: usize,
    /// Posting lists fetched.
    pub lookups: usize,
    /// Lookups avoided by the prefilter.
    pub skipped: usize,
    /// Fuzzy and prefix terms added from the vocabulary.
    pub expansions: usize,
}

/// Something that turns a prepared query into ranked hits.
pub trait Ranker: Send + Sync {
    /// Short name of the strategy, reported in search statistics.
    fn strategy(&self) -> &'static str;

    fn source(&self) -> &dyn PostingSource;

    fn rank(
        &self,
        prepared: &PreparedQuery,
        options: &RankOptions,
    ) -> Result<Ranking>;
}

/// How BM25 weights are computed for a batch of postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Scalar,
    Vectorized,
}

impl Kernel {
    fn score(self, batch: &ScoreBatch, params: &ScoringParams) -> Vec<f64> {
        match self {
            Kernel::Scalar => simd::score_scalar(batch, params.k1, params.b),
            Kernel::Vectorized => {
                simd::score_vectorized(batch, params.k1, params.b)
            }
        }
    }
}

/// BM25 with proximity over any [`PostingSource`].
pub struct ScoringEngine<S> {
    source: S,
    params: ScoringParams,
    kernel: Kernel,
    name: &'static str,
}

struct QueryTerm {
    term: String,
    stage: MatchStage,
    variant: String,
    weight: f64,
}

#[derive(Default)]
struct FieldHit {
    score: f64,
    stage: Option<(MatchStage, f64, usize)>,
    literal_terms: Vec<usize>,
}

struct DocHit {
    score: f64,
    literal: HashSet<String>,
    stage: MatchStage,
    best: f64,
    variant: String,
    fields: Vec<String>,
}

impl<S: PostingSource> ScoringEngine<S> {
    pub fn new(
        source: S,
        params: ScoringParams,
        kernel: Kernel,
        name: &'static str,
    ) -> Self {
        Self {
            source,
            params,
            kernel,
            name,
        }
    }

    pub fn params(&self) -> &ScoringParams {
        &self.params
    }

    /// Query terms of one field: literal and synonym terms, then fuzzy and
    /// prefix expansions from the field vocabulary.
    fn field_terms(
        &self,
        field: &FieldTerms,
        keywords: &KeywordSet,
        options: &RankOptions,
        ranking: &mut Ranking,
    ) -> Result<Vec<QueryTerm>> {
        let mut terms: Vec<QueryTerm> = field
            .terms
            .iter()
            .map(|t| QueryTerm {
                term: t.term.clone(),
                stage: t.stage,
                variant: t.variant.clone(),
                weight: self.params.term_weight(t.stage, 0),
            })
            .collect();
        if options.word_match {
            return Ok(terms);
        }

        let mut fuzzy_targets = Vec::new();
        let mut prefix_targets = Vec::new();
        for literal in field.literal_terms() {
            if keywords.is_acronym(&literal.variant)
                || keywords.is_acronym(&literal.term)
            {
                continue;
            }
            let present = self
                .source
                .might_contain(&field.field, &literal.term)
                && !self
                    .source
                    .postings(&field.field, &literal.term)?
                    .is_empty();
            let len = literal.term.chars().count();
            if !present && fuzzy::get_max_edit_distance(len) > 0 {
                fuzzy_targets.push(literal);
            }
            if len >= MIN_PREFIX_LEN {
                prefix_targets.push(literal);
            }
        }
        if fuzzy_targets.is_empty() && prefix_targets.is_empty() {
            return Ok(terms);
        }

        let mut fuzzy_candidates: Vec<Vec<String>> =
            vec![Vec::new(); fuzzy_targets.len()];
        let mut prefixed: Vec<Vec<String>> =
            vec![Vec::new(); prefix_targets.len()];
        self.source.visit_vocabulary(&field.field, &mut |word| {
            let word_len = word.chars().count();
            for (i, target) in fuzzy_targets.iter().enumerate() {
                let len = target.term.chars().count();
                let max = fuzzy::get_max_edit_distance(len);
                if word_len.abs_diff(len) <= max {
                    fuzzy_candidates[i].push(word.to_string());
                }
            }
            for (i, target) in prefix_targets.iter().enumerate() {
                if prefixed[i].len() < MAX_PREFIX_EXPANSIONS
                    && word.len() > target.term.len()
                    && word.starts_with(target.term.as_str())
                {
                    prefixed[i].push(word.to_string());
                }
            }
        })?;

        let mut known: HashSet<String> =
            terms.iter().map(|t| t.term.clone()).collect();
        for (target, candidates) in fuzzy_targets.iter().zip(&fuzzy_candidates)
        {
            let matches = fuzzy::find_fuzzy_matches(
                &target.term,
                candidates.iter().map(String::as_str),
                None,
            );
            for found in matches
                .into_iter()
                .filter(|m| m.distance > 0)
                .take(MAX_FUZZY_EXPANSIONS)
            {
                if known.insert(found.term.clone()) {
                    terms.push(QueryTerm {
                        term: found.term,
                        stage: MatchStage::Fuzzy,
                        variant: target.variant.clone(),
                        weight: self
                            .params
                            .term_weight(MatchStage::Fuzzy, found.distance),
                    });
                    ranking.expansions += 1;
                }
            }
        }
        for (target, words) in prefix_targets.iter().zip(prefixed) {
            for word in words {
                if known.insert(word.clone()) {
                    terms.push(QueryTerm {
                        term: word,
                        stage: MatchStage::Prefix,
                        variant: target.variant.clone(),
                        weight: self.params.term_weight(MatchStage::Prefix, 0),
                    });
                    ranking.expansions += 1;
                }
            }
        }

        Ok(terms)
    }
}

impl<S: PostingSource> Ranker for ScoringEngine<S> {
    fn strategy(&self) -> &'static str {
        self.name
    }

    fn source(&self) -> &dyn PostingSource {
        &self.source
    }

    fn rank(
        &self,
        prepared: &PreparedQuery,
        options: &RankOptions,
    ) -> Result<Ranking> {
        let mut ranking = Ranking::default();
        let n = self.source.doc_count();
        if n == 0 || prepared.is_empty() {
            return Ok(ranking);
        }

        let mut docs: HashMap<DocId, DocHit> = HashMap::new();

        for field in &prepared.fields {
            let Some(stats) = self.source.field_stats(&field.field) else {
                continue;
            };
            if stats.docs_with_field == 0 {
                continue;
            }
            let lengths =
                self.source.field_lengths(&field.field).unwrap_or(&[]);
            let terms = self.field_terms(
                field,
                &prepared.query.keywords,
                options,
                &mut ranking,
            )?;

            let mut batch = ScoreBatch::default();
            let mut rows: Vec<(DocId, usize)> = Vec::new();
            let mut positions: HashMap<DocId, Vec<Vec<u32>>> = HashMap::new();

            for (idx, term) in terms.iter().enumerate() {
                if !self.source.might_contain(&field.field, &term.term) {
                    ranking.skipped += 1;
                    continue;
                }
                ranking.lookups += 1;
                let postings = self.source.postings(&field.field, &term.term)?;
                if postings.is_empty() {
                    continue;
                }
                let factor = scoring::idf(postings.len(), n)
                    * field.boost
                    * term.weight;
                for posting in postings.iter() {
                    let dl = lengths
                        .get(posting.doc as usize)
                        .copied()
                        .unwrap_or(0);
                    batch.push(
                        f64::from(posting.tf),
                        f64::from(dl),
                        stats.avg_length,
                        factor,
                    );
                    rows.push((posting.doc, idx));
                    if term.stage.is_literal() {
                        positions
                            .entry(posting.doc)
                            .or_default()
                            .push(posting.positions.clone());
                    }
                }
            }
            if rows.is_empty() {
                continue;
            }

            let scores = self.kernel.score(&batch, &self.params);
            let mut field_hits: HashMap<DocId, FieldHit> = HashMap::new();
            for (&(doc, idx), score) in rows.iter().zip(scores) {
                let hit = field_hits.entry(doc).or_default();
                hit.score += score;
                let stage = terms[idx].stage;
                let better = match hit.stage {
                    None => true,
                    Some((s, best, _)) => {
                        stage < s || (stage == s && score > best)
                    }
                };
                if better {
                    hit.stage = Some((stage, score, idx));
                }
                if stage.is_literal() {
                    hit.literal_terms.push(idx);
                }
            }

            for (doc, hit) in field_hits {
                let Some((stage, best, idx)) = hit.stage else {
                    continue;
                };
                let bonus = match positions.get(&doc) {
                    Some(lists) if lists.len() >= 2 => scoring::proximity_bonus(
                        lists.len(),
                        scoring::min_span(lists),
                    ),
                    _ => 1.0,
                };
                let entry = docs.entry(doc).or_insert_with(|| DocHit {
                    score: 0.0,
                    literal: HashSet::new(),
                    stage,
                    best: f64::NEG_INFINITY,
                    variant: String::new(),
                    fields: Vec::new(),
                });
                entry.score += hit.score * bonus;
                entry.fields.push(field.field.clone());
                for i in hit.literal_terms {
                    entry.literal.insert(terms[i].term.clone());
                }
                let stronger = stage < entry.stage
                    || (stage == entry.stage && best > entry.best);
                if stronger {
                    entry.stage = stage;
                    entry.best = best;
                    entry.variant = terms[idx].variant.clone();
                }
            }
        }

        ranking.candidates = docs.len();
        let mut hits: Vec<RankedHit> = docs
            .into_iter()
            .filter(|(_, hit)| hit.score.is_finite() && hit.score > 0.0)
            .map(|(doc, hit)| RankedHit {
                doc,
                score: hit.score,
                literal_matches: hit.literal.len(),
                stage: hit.stage,
                variant: hit.variant,
                fields: hit.fields,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.literal_matches.cmp(&a.literal_matches))
                .then_with(|| a.doc.cmp(&b.doc))
        });
        if let Some(limit) = options.limit {
            hits.truncate(limit);
        }
        ranking.hits = hits;
        Ok(ranking)
    }
}

/// Which read path a search index uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RankerStrategy {
    /// In-memory segment, scalar kernel.
    Plain,
    /// In-memory segment behind a Bloom prefilter.
    Bloom,
    /// In-memory segment, vectorized kernel.
    Vectorized,
    /// Postings read from SQLite through per-thread connections.
    Pooled,
    /// Vectorized when SIMD is available, plus the prefilter for large
    /// segments.
    #[default]
    Auto,
}

impl RankerStrategy {
    pub const ALL: [RankerStrategy; 5] = [
        RankerStrategy::Plain,
        RankerStrategy::Bloom,
        RankerStrategy::Vectorized,
        RankerStrategy::Pooled,
        RankerStrategy::Auto,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RankerStrategy::Plain => "plain",
            RankerStrategy::Bloom => "bloom",
            RankerStrategy::Vectorized => "vectorized",
            RankerStrategy::Pooled => "pooled",
            RankerStrategy::Auto => "auto",
        }
    }
}

impl fmt::Display for RankerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RankerStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RankerStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s.trim())
            .ok_or_else(|| {
                Error::Configuration(format!("unknown ranking strategy '{s}'"))
            })
    }
}

/// Build a ranker over an in-memory segment.
///
/// [`RankerStrategy::Pooled`] needs the segment file; use [`open_ranker`].
pub fn build_ranker(
    strategy: RankerStrategy,
    segment: Segment,
    params: ScoringParams,
) -> Result<Box<dyn Ranker>> {
    let ranker: Box<dyn Ranker> = match strategy {
        RankerStrategy::Plain => Box::new(ScoringEngine::new(
            segment,
            params,
            Kernel::Scalar,
            "plain",
        )),
        RankerStrategy::Bloom => Box::new(ScoringEngine::new(
            BloomFiltered::new(segment)?,
            params,
            Kernel::Scalar,
            "bloom",
        )),
        RankerStrategy::Vectorized => Box::new(ScoringEngine::new(
            segment,
            params,
            Kernel::Vectorized,
            "vectorized",
        )),
        RankerStrategy::Pooled => {
            return Err(Error::Configuration(
                "the pooled strategy reads from a segment file".into(),
            ));
        }
        RankerStrategy::Auto => {
            let large = segment.doc_count() > BLOOM_THRESHOLD;
            match (simd::simd_available(), large) {
                (true, true) => Box::new(ScoringEngine::new(
                    BloomFiltered::new(segment)?,
                    params,
                    Kernel::Vectorized,
                    "vectorized+bloom",
                )),
                (true, false) => Box::new(ScoringEngine::new(
                    segment,
                    params,
                    Kernel::Vectorized,
                    "vectorized",
                )),
                (false, true) => Box::new(ScoringEngine::new(
                    BloomFiltered::new(segment)?,
                    params,
                    Kernel::Scalar,
                    "bloom",
                )),
                (false, false) => Box::new(ScoringEngine::new(
                    segment,
                    params,
                    Kernel::Scalar,
                    "plain",
                )),
            }
        }
    };
    Ok(ranker)
}

/// Open segment `id` from `store` with the given strategy.
pub fn open_ranker(
    store: &SegmentStore,
    id: &SegmentId,
    strategy: RankerStrategy,
    params: ScoringParams,
) -> Result<Box<dyn Ranker>> {
    if strategy == RankerStrategy::Pooled {
        let source = PooledSource::open(&store.path_for(id), id)?;
        return Ok(Box::new(ScoringEngine::new(
            source,
            params,
            Kernel::Scalar,
            "pooled",
        )));
    }
    let segment = store.load(id)?;
    build_ranker(strategy, segment, params)
}
