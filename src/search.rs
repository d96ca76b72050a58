//! The query façade: rank, truncate, snippet.

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    analyzer::FieldAnalyzers,
    config::EngineConfig,
    error::{Error, Result},
    metrics::SearchMetrics,
    query::{MatchStage, QueryAnalyzer, SearchQuery},
    ranker::{self, RankOptions, RankedHit, Ranker},
    segment_id::SegmentId,
    snippet::SnippetBuilder,
    store::{SEGMENTS_DIR, SegmentStore},
};

pub const DEFAULT_MAX_RESULTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    pub max_results: usize,
    /// Whole-word matching only: no fuzzy or prefix expansion.
    pub word_match: bool,
    pub include_stats: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            word_match: false,
            include_stats: false,
        }
    }
}

/// Why a result matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchTrace {
    pub stage: MatchStage,
    /// The query word that produced the strongest match.
    pub variant: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub relevance_score: f64,
    pub match_trace: MatchTrace,
}

/// Timings in milliseconds and counters of one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchStats {
    pub strategy: String,
    pub segment_id: String,
    pub doc_count: usize,
    pub candidates: usize,
    pub returned: usize,
    pub lookups: usize,
    pub skipped_lookups: usize,
    pub expansions: usize,
    pub analysis_ms: f64,
    pub ranking_ms: f64,
    pub snippet_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SearchStats>,
}

impl SearchResponse {
    pub fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            results: Vec::new(),
            stats: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// One loaded segment with everything needed to query it.
struct Snapshot {
    ranker: Box<dyn Ranker>,
    analyzers: FieldAnalyzers,
}

impl Snapshot {
    fn open(store: &SegmentStore, config: &EngineConfig) -> Result<Self> {
        let id = store.latest_segment_id()?.ok_or_else(|| Error::NotFound {
            kind: "segment",
            name: store.dir().display().to_string(),
        })?;
        Self::open_id(store, &id, config)
    }

    fn open_id(
        store: &SegmentStore,
        id: &SegmentId,
        config: &EngineConfig,
    ) -> Result<Self> {
        let ranker = ranker::open_ranker(
            store,
            id,
            config.strategy,
            config.scoring_params(),
        )?;
        let analyzers = FieldAnalyzers::for_schema(ranker.source().schema())?;
        Ok(Self { ranker, analyzers })
    }

    fn segment_id(&self) -> &SegmentId {
        self.ranker.source().segment_id()
    }
}

/// Searches the newest segment of one data root.
///
/// Queries run against an `Arc` snapshot of the loaded segment, so
/// [`reload`](Self::reload) and [`close`](Self::close) never wait for or
/// disturb queries already in flight.
pub struct SegmentSearchIndex {
    store: SegmentStore,
    config: EngineConfig,
    analyzer: QueryAnalyzer,
    snippets: SnippetBuilder,
    current: RwLock<Option<Arc<Snapshot>>>,
    metrics: Option<Arc<SearchMetrics>>,
}

impl SegmentSearchIndex {
    /// Load the newest segment under `data_root`.
    pub fn open(data_root: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = SegmentStore::open(data_root)?;
        let snapshot = Snapshot::open(&store, &config)?;
        info!(
            target: "segdex::search",
            segment = %snapshot.segment_id(),
            documents = snapshot.ranker.source().doc_count(),
            strategy = snapshot.ranker.strategy(),
            "opened search index"
        );
        Ok(Self {
            snippets: SnippetBuilder::new(
                config.docs_root.clone(),
                config.snippet_timeout,
            ),
            store,
            config,
            analyzer: QueryAnalyzer::default(),
            current: RwLock::new(Some(Arc::new(snapshot))),
            metrics: None,
        })
    }

    /// Record the latency of every search in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<SearchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &QueryAnalyzer {
        &self.analyzer
    }

    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current.read().clone()
    }

    pub fn segment_id(&self) -> Option<SegmentId> {
        self.snapshot().map(|s| s.segment_id().clone())
    }

    pub fn doc_count(&self) -> usize {
        self.snapshot()
            .map_or(0, |s| s.ranker.source().doc_count())
    }

    pub fn strategy(&self) -> Option<&'static str> {
        self.snapshot().map(|s| s.ranker.strategy())
    }

    pub fn is_closed(&self) -> bool {
        self.current.read().is_none()
    }

    /// Swap in the newest stored segment if it differs from the loaded one.
    /// Returns whether a new segment was loaded.
    pub fn reload(&self) -> Result<bool> {
        let current = self
            .snapshot()
            .ok_or(Error::InvalidState("search index is closed"))?;
        let Some(latest) = self.store.latest_segment_id()? else {
            return Ok(false);
        };
        if &latest == current.segment_id() {
            return Ok(false);
        }

        let snapshot = Arc::new(Snapshot::open_id(
            &self.store,
            &latest,
            &self.config,
        )?);
        let mut slot = self.current.write();
        if slot.is_none() {
            return Err(Error::InvalidState("search index is closed"));
        }
        *slot = Some(snapshot);
        drop(slot);

        info!(
            target: "segdex::search",
            from = %current.segment_id(),
            to = %latest,
            "reloaded search index"
        );
        Ok(true)
    }

    /// Release the loaded segment. Idempotent; later searches return empty
    /// responses.
    pub fn close(&self) {
        let previous = self.current.write().take();
        if let Some(snapshot) = previous {
            debug!(
                target: "segdex::search",
                segment = %snapshot.segment_id(),
                "closed search index"
            );
        }
    }

    /// Search for `text`, returning at most `max_results` results.
    pub fn search(
        &self,
        text: &str,
        max_results: usize,
    ) -> Result<SearchResponse> {
        let query = self.analyzer.analyze(text, None);
        self.search_with(
            &query,
            &SearchOptions {
                max_results,
                ..SearchOptions::default()
            },
        )
    }

    pub fn search_with(
        &self,
        query: &SearchQuery,
        options: &SearchOptions,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let Some(snapshot) = self.snapshot() else {
            return Ok(SearchResponse::empty(&query.text));
        };
        if query.is_empty() || options.max_results == 0 {
            return Ok(SearchResponse::empty(&query.text));
        }

        let prepared = self.analyzer.prepare(query, &snapshot.analyzers);
        if prepared.is_empty() {
            return Ok(SearchResponse::empty(&query.text));
        }
        let analysis = started.elapsed();

        let ranking = snapshot.ranker.rank(
            &prepared,
            &RankOptions {
                word_match: options.word_match,
                limit: Some(options.max_results),
            },
        )?;
        let ranked = started.elapsed();

        let source = snapshot.ranker.source();
        let results: Vec<SearchResult> = ranking
            .hits
            .par_iter()
            .filter_map(|hit| self.render(source, hit, &query.tokens))
            .collect();
        let total = started.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics.record(total);
        }
        debug!(
            target: "segdex::search",
            query = %query.text,
            strategy = snapshot.ranker.strategy(),
            candidates = ranking.candidates,
            results = results.len(),
            elapsed_ms = millis(total),
            "search finished"
        );

        let stats = options.include_stats.then(|| SearchStats {
            strategy: snapshot.ranker.strategy().to_string(),
            segment_id: snapshot.segment_id().to_string(),
            doc_count: source.doc_count(),
            candidates: ranking.candidates,
            returned: results.len(),
            lookups: ranking.lookups,
            skipped_lookups: ranking.skipped,
            expansions: ranking.expansions,
            analysis_ms: millis(analysis),
            ranking_ms: millis(ranked - analysis),
            snippet_ms: millis(total - ranked),
            total_ms: millis(total),
        });

        Ok(SearchResponse {
            query: query.text.clone(),
            results,
            stats,
        })
    }

    fn render(
        &self,
        source: &dyn ranker::PostingSource,
        hit: &RankedHit,
        terms: &[String],
    ) -> Option<SearchResult> {
        let doc = source.document(hit.doc)?;
        Some(SearchResult {
            url: doc.url.clone(),
            title: doc.title.clone(),
            snippet: self.snippets.build(doc, terms),
            relevance_score: hit.score,
            match_trace: MatchTrace {
                stage: hit.stage,
                variant: hit.variant.clone(),
                fields: hit.fields.clone(),
            },
        })
    }

    /// Run [`search_with`](Self::search_with) on the blocking thread pool.
    pub async fn search_async(
        self: Arc<Self>,
        query: SearchQuery,
        options: SearchOptions,
    ) -> Result<SearchResponse> {
        tokio::task::spawn_blocking(move || self.search_with(&query, &options))
            .await
            .map_err(|_| Error::InvalidState("search task did not complete"))?
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

/// Search the newest segment under `data_dir` with default settings.
///
/// Never fails: a missing, unreadable or corrupt segment gives an empty
/// response without stats.
pub fn search_documents(
    query: &SearchQuery,
    data_dir: &Path,
    options: &SearchOptions,
) -> SearchResponse {
    search_documents_with(query, data_dir, options, EngineConfig::default())
}

pub fn search_documents_with(
    query: &SearchQuery,
    data_dir: &Path,
    options: &SearchOptions,
    config: EngineConfig,
) -> SearchResponse {
    if query.is_empty() || !data_dir.join(SEGMENTS_DIR).is_dir() {
        return SearchResponse::empty(&query.text);
    }

    let result = SegmentSearchIndex::open(data_dir, config)
        .and_then(|index| index.search_with(query, options));
    match result {
        Ok(response) => response,
        Err(Error::NotFound { .. }) => SearchResponse::empty(&query.text),
        Err(err) => {
            warn!(
                target: "segdex::search",
                data_dir = %data_dir.display(),
                tenant = query.tenant.as_deref().unwrap_or("-"),
                error = %err,
                "search degraded to an empty response"
            );
            SearchResponse::empty(&query.text)
        }
    }
}

/// Format a response for human-readable terminal output.
pub fn format_human(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in response.results.iter().enumerate() {
        println!(
            "{:>3}. [{:.3}] {} ({:?} via \"{}\")",
            i + 1,
            r.relevance_score,
            r.url,
            r.match_trace.stage,
            r.match_trace.variant,
        );
        if !r.title.is_empty() {
            println!("     {}", r.title);
        }
        if !r.snippet.is_empty() {
            println!("     {}", r.snippet);
        }
    }
    println!("\n{} result(s)", response.results.len());

    if let Some(stats) = &response.stats {
        println!(
            "{} candidates of {} documents, {:.2} ms ({})",
            stats.candidates, stats.doc_count, stats.total_ms, stats.strategy
        );
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        indexer,
        ranker::RankerStrategy,
        schema::Schema,
        writer::Document,
    };

    fn docs() -> Vec<Document> {
        vec![
            Document::new()
                .with("url", "/webhooks")
                .with("title", "Webhooks")
                .with("body", "Configure webhook retries and signatures."),
            Document::new()
                .with("url", "/oauth")
                .with("title", "OAuth")
                .with("body", "Exchange an authorization code for a token."),
            Document::new()
                .with("url", "/cli")
                .with("title", "CLI")
                .with("body", "Install the command line tool."),
        ]
    }

    fn indexed(documents: Vec<Document>) -> TempDir {
        let tmp = TempDir::new().unwrap();
        let store = SegmentStore::open(tmp.path()).unwrap();
        indexer::index_documents(&store, Schema::documentation(), documents)
            .unwrap();
        tmp
    }

    fn open(tmp: &TempDir) -> SegmentSearchIndex {
        SegmentSearchIndex::open(tmp.path(), EngineConfig::default()).unwrap()
    }

    #[test]
    fn finds_and_highlights() {
        let tmp = indexed(docs());
        let response = open(&tmp).search("webhook", 5).unwrap();

        assert_eq!(response.results[0].url, "/webhooks");
        assert!(response.results[0].snippet.contains("**webhook**"));
        assert_eq!(response.results[0].match_trace.stage, MatchStage::Exact);
        assert!(response.stats.is_none());
    }

    #[test]
    fn max_results_truncates() {
        let tmp = indexed(docs());
        let index = open(&tmp);
        let response = index.search("webhook oauth install", 2).unwrap();
        assert_eq!(response.results.len(), 2);
        assert!(index.search("webhook", 0).unwrap().is_empty());
    }

    #[test]
    fn empty_queries_return_nothing() {
        let tmp = indexed(docs());
        let index = open(&tmp);
        for text in ["", "   ", "the and of", "?!"] {
            assert!(index.search(text, 10).unwrap().is_empty(), "{text:?}");
        }
    }

    #[test]
    fn stats_are_optional() {
        let tmp = indexed(docs());
        let index = open(&tmp);
        let query = SearchQuery::new("token");
        let response = index
            .search_with(
                &query,
                &SearchOptions {
                    include_stats: true,
                    ..SearchOptions::default()
                },
            )
            .unwrap();
        let stats = response.stats.unwrap();
        assert_eq!(stats.doc_count, 3);
        assert_eq!(stats.returned, response.results.len());
        assert!(stats.total_ms >= stats.ranking_ms);
        assert!(!stats.strategy.is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let tmp = indexed(docs());
        let index = open(&tmp);
        index.close();
        index.close();
        assert!(index.is_closed());
        assert!(index.search("webhook", 5).unwrap().is_empty());
        assert!(matches!(index.reload(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn reload_swaps_in_newer_segment() {
        let tmp = indexed(docs());
        let index = open(&tmp);
        assert!(!index.reload().unwrap());
        assert!(index.search("kubernetes", 5).unwrap().is_empty());

        let mut more = docs();
        more.push(
            Document::new()
                .with("url", "/k8s")
                .with("body", "Deploying on kubernetes clusters."),
        );
        let store = SegmentStore::open(tmp.path()).unwrap();
        indexer::index_documents(&store, Schema::documentation(), more)
            .unwrap();

        assert!(index.reload().unwrap());
        assert_eq!(index.doc_count(), 4);
        let response = index.search("kubernetes", 5).unwrap();
        assert_eq!(response.results[0].url, "/k8s");
    }

    #[test]
    fn every_strategy_returns_the_same_urls() {
        let tmp = indexed(docs());
        let mut expected = None;
        for strategy in RankerStrategy::ALL {
            let config = EngineConfig {
                strategy,
                ..EngineConfig::default()
            };
            let index = SegmentSearchIndex::open(tmp.path(), config).unwrap();
            let urls: Vec<String> = index
                .search("webhook token", 10)
                .unwrap()
                .results
                .into_iter()
                .map(|r| r.url)
                .collect();
            match &expected {
                None => expected = Some(urls),
                Some(first) => assert_eq!(&urls, first, "{strategy}"),
            }
        }
    }

    #[test]
    fn concurrent_searches_share_the_index() {
        let tmp = indexed(docs());
        let metrics = Arc::new(SearchMetrics::default());
        let index = Arc::new(open(&tmp).with_metrics(Arc::clone(&metrics)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    index.search("oauth token", 5).unwrap().results.len()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap() > 0);
        }
        assert_eq!(metrics.len(), 4);
    }

    #[test]
    fn missing_or_corrupt_segments_degrade() {
        let tmp = TempDir::new().unwrap();
        let query = SearchQuery::new("webhook");
        let options = SearchOptions::default();
        assert!(search_documents(&query, tmp.path(), &options).is_empty());

        let store = SegmentStore::open(tmp.path()).unwrap();
        assert!(search_documents(&query, tmp.path(), &options).is_empty());

        std::fs::write(
            store.dir().join("seg-0000000000001-abc.sqlite"),
            vec![0x42; 4096],
        )
        .unwrap();
        let response = search_documents(&query, tmp.path(), &options);
        assert!(response.is_empty());
        assert!(response.stats.is_none());
    }

    #[test]
    fn search_async_runs_on_blocking_pool() {
        let tmp = indexed(docs());
        let index = Arc::new(open(&tmp));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let response = runtime
            .block_on(index.search_async(
                SearchQuery::new("webhook"),
                SearchOptions::default(),
            ))
            .unwrap();
        assert_eq!(response.results[0].url, "/webhooks");
    }
}
