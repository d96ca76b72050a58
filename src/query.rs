//! Query analysis: raw text to a [`SearchQuery`], then per-field term
//! lists with synonym expansion.

use std::collections::HashSet;

use serde::Serialize;

use crate::{
    analyzer::{self, Analyzer, FieldAnalyzers},
    synonyms::SynonymTable,
};

/// Vocabulary that marks a word as a technical term.
const TECHNICAL_TERMS: &[&str] = &[
    "api", "auth", "cache", "cli", "config", "container", "cookie", "cors",
    "csv", "database", "deploy", "docker", "dns", "endpoint", "env",
    "graphql", "grpc", "header", "http", "https", "index", "json", "jwt",
    "kubernetes", "lambda", "middleware", "oauth", "payload", "plugin",
    "proxy", "query", "queue", "regex", "rest", "schema", "sdk", "server",
    "session", "sql", "ssh", "ssl", "token", "tls", "url", "webhook",
    "websocket", "xml", "yaml",
];

/// Verbs that usually describe a task in documentation queries.
const VERBS: &[&str] = &[
    "add", "build", "call", "configure", "connect", "create", "debug",
    "delete", "deploy", "disable", "enable", "fetch", "fix", "get",
    "handle", "install", "integrate", "list", "migrate", "parse", "remove",
    "reset", "run", "send", "set", "setup", "start", "stop", "sync", "test",
    "update", "upgrade", "use", "validate", "verify",
];

/// How a query term was derived; ordered from strongest to weakest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MatchStage {
    /// The analyzed query word itself.
    Exact,
    /// A synonym of a query word.
    Synonym,
    /// A vocabulary term within edit distance of a query word.
    Fuzzy,
    /// A vocabulary term extending a query word.
    Prefix,
}

impl MatchStage {
    pub fn is_literal(self) -> bool {
        self == MatchStage::Exact
    }
}

/// Words of the raw query text, classified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeywordSet {
    /// Upper-case abbreviations such as `API` or `HTTP2`.
    pub acronyms: Vec<String>,
    /// Compound identifiers such as `OAuth`, `snake_case` or `os.path`.
    pub technical_nouns: Vec<String>,
    /// Words from the technical vocabulary, lowercased.
    pub technical_terms: Vec<String>,
    /// Task verbs and their inflections, lowercased.
    pub verb_forms: Vec<String>,
}

impl KeywordSet {
    pub fn extract(text: &str) -> Self {
        let mut set = KeywordSet::default();

        for raw in text.split_whitespace() {
            let word = raw.trim_matches(|c: char| {
                !(c.is_alphanumeric() || c == '_' || c == '.')
            });
            let word = word.trim_matches('.');
            if word.is_empty() {
                continue;
            }
            let lower = word.to_lowercase();

            if is_acronym(word) {
                push_unique(&mut set.acronyms, word.to_string());
            } else if is_compound_identifier(word) {
                push_unique(&mut set.technical_nouns, word.to_string());
            }
            if TECHNICAL_TERMS.contains(&lower.as_str()) {
                push_unique(&mut set.technical_terms, lower.clone());
            }
            if is_verb_form(&lower) {
                push_unique(&mut set.verb_forms, lower);
            }
        }

        set
    }

    /// Whether `term` (any case) is one of the query's acronyms.
    pub fn is_acronym(&self, term: &str) -> bool {
        self.acronyms.iter().any(|a| a.eq_ignore_ascii_case(term))
    }

    pub fn is_empty(&self) -> bool {
        self.acronyms.is_empty()
            && self.technical_nouns.is_empty()
            && self.technical_terms.is_empty()
            && self.verb_forms.is_empty()
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn is_acronym(word: &str) -> bool {
    let upper = word.chars().filter(|c| c.is_uppercase()).count();
    word.chars().count() >= 2
        && upper >= 2
        && word.chars().all(|c| c.is_uppercase() || c.is_ascii_digit())
}

fn is_compound_identifier(word: &str) -> bool {
    let inner_separator = word.contains('_') || word.contains('.');
    inner_separator || analyzer::split_identifier(word).len() > 1
}

fn is_verb_form(lower: &str) -> bool {
    if VERBS.contains(&lower) {
        return true;
    }
    let stems = [
        lower.strip_suffix("ing"),
        lower.strip_suffix("ed"),
        lower.strip_suffix("es"),
        lower.strip_suffix('s'),
    ];
    stems.into_iter().flatten().any(|stem| {
        VERBS.contains(&stem)
            || VERBS.iter().any(|v| v.strip_suffix('e') == Some(stem))
    })
}

/// An analyzed user query.
///
/// Built once per query by [`QueryAnalyzer::analyze`] and then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    pub text: String,
    /// Lowercased words with stopwords removed, unstemmed.
    pub tokens: Vec<String>,
    pub keywords: KeywordSet,
    pub tenant: Option<String>,
}

impl SearchQuery {
    /// Analyze `text` with the default synonym table and no tenant.
    pub fn new(text: &str) -> Self {
        QueryAnalyzer::default().analyze(text, None)
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// One term to look up in a field, with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedTerm {
    pub term: String,
    pub stage: MatchStage,
    /// The query word this term was derived from.
    pub variant: String,
}

/// Terms to look up in one field: literal terms first, then expansions.
#[derive(Debug, Clone)]
pub struct FieldTerms {
    pub field: String,
    pub boost: f64,
    pub terms: Vec<ExpandedTerm>,
    /// How many leading entries of `terms` are literal query terms.
    pub base_term_count: usize,
}

impl FieldTerms {
    pub fn literal_terms(&self) -> &[ExpandedTerm] {
        &self.terms[..self.base_term_count]
    }

    fn contains(&self, term: &str) -> bool {
        self.terms.iter().any(|t| t.term == term)
    }
}

/// A query with per-field term lists, ready for scoring.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub query: SearchQuery,
    pub fields: Vec<FieldTerms>,
}

impl PreparedQuery {
    pub fn is_empty(&self) -> bool {
        self.fields.iter().all(|f| f.terms.is_empty())
    }

    /// Distinct literal terms across all fields, in first-seen order.
    pub fn literal_terms(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.fields
            .iter()
            .flat_map(|f| f.literal_terms())
            .map(|t| t.term.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }
}

/// Turns raw query text into [`SearchQuery`] and [`PreparedQuery`] values.
#[derive(Debug, Clone)]
pub struct QueryAnalyzer {
    normalizer: Analyzer,
    synonyms: SynonymTable,
}

impl Default for QueryAnalyzer {
    fn default() -> Self {
        Self::new(SynonymTable::with_defaults())
    }
}

impl QueryAnalyzer {
    pub fn new(synonyms: SynonymTable) -> Self {
        let normalizer = analyzer::get_analyzer(analyzer::STANDARD_NOSTEM)
            .unwrap_or_else(|_| unreachable!("registered analyzer"));
        Self {
            normalizer,
            synonyms,
        }
    }

    pub fn synonyms(&self) -> &SynonymTable {
        &self.synonyms
    }

    /// Normalize and classify `text`. Never fails; text without words
    /// yields a query with no tokens.
    pub fn analyze(&self, text: &str, tenant: Option<&str>) -> SearchQuery {
        SearchQuery {
            text: text.to_string(),
            tokens: self.normalizer.terms(text),
            keywords: KeywordSet::extract(text),
            tenant: tenant.map(str::to_string),
        }
    }

    /// Build per-field term lists for `query`.
    ///
    /// Each field gets its analyzer's literal terms (deduplicated, in query
    /// order) followed by analyzed synonyms of the query words.
    pub fn prepare(
        &self,
        query: &SearchQuery,
        analyzers: &FieldAnalyzers,
    ) -> PreparedQuery {
        let mut fields = Vec::new();

        for (def, analyzer) in analyzers.iter() {
            let mut terms = FieldTerms {
                field: def.name.clone(),
                boost: def.boost,
                terms: Vec::new(),
                base_term_count: 0,
            };

            for (term, variant) in literal_terms(analyzer, query) {
                if !terms.contains(&term) {
                    terms.terms.push(ExpandedTerm {
                        term,
                        stage: MatchStage::Exact,
                        variant,
                    });
                }
            }
            terms.base_term_count = terms.terms.len();

            for word in &query.tokens {
                for synonym in self.synonyms.expand(word) {
                    for term in analyzer.terms(&synonym) {
                        if !terms.contains(&term) {
                            terms.terms.push(ExpandedTerm {
                                term,
                                stage: MatchStage::Synonym,
                                variant: word.clone(),
                            });
                        }
                    }
                }
            }

            fields.push(terms);
        }

        PreparedQuery {
            query: query.clone(),
            fields,
        }
    }
}

/// Literal terms of a query for one analyzer, paired with the query word
/// that produced each.
fn literal_terms(
    analyzer: &Analyzer,
    query: &SearchQuery,
) -> Vec<(String, String)> {
    match analyzer {
        // Keyword fields hold short values like tags; match words singly.
        Analyzer::Keyword => query
            .tokens
            .iter()
            .flat_map(|word| {
                analyzer
                    .terms(word)
                    .into_iter()
                    .map(move |t| (t, word.clone()))
            })
            .collect(),
        _ => query
            .text
            .split_whitespace()
            .flat_map(|word| {
                analyzer
                    .terms(word)
                    .into_iter()
                    .map(|t| (t, word.to_lowercase()))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn prepare(text: &str) -> PreparedQuery {
        let analyzers =
            FieldAnalyzers::for_schema(&Schema::documentation()).unwrap();
        let qa = QueryAnalyzer::default();
        qa.prepare(&qa.analyze(text, None), &analyzers)
    }

    fn field<'a>(prepared: &'a PreparedQuery, name: &str) -> &'a FieldTerms {
        prepared.fields.iter().find(|f| f.field == name).unwrap()
    }

    #[test]
    fn analyze_normalizes_tokens() {
        let query = SearchQuery::new("The Webhook Integration");
        assert_eq!(query.tokens, vec!["webhook", "integration"]);
        assert_eq!(query.tenant, None);
    }

    #[test]
    fn empty_and_blank_queries_have_no_tokens() {
        assert!(SearchQuery::new("").is_empty());
        assert!(SearchQuery::new("   ").is_empty());
        assert!(SearchQuery::new("the of and").is_empty());
        assert!(prepare("   ").is_empty());
    }

    #[test]
    fn base_terms_come_first_and_are_deduplicated() {
        let prepared = prepare("auth setup auth");
        let body = field(&prepared, "body");
        assert_eq!(body.base_term_count, 2);
        assert!(
            body.literal_terms()
                .iter()
                .all(|t| t.stage == MatchStage::Exact)
        );
        assert!(
            body.terms[2..]
                .iter()
                .all(|t| t.stage == MatchStage::Synonym)
        );
        assert!(body.terms.len() > 2);
    }

    #[test]
    fn synonyms_are_analyzed_per_field() {
        let prepared = prepare("async");
        let body = field(&prepared, "body");
        let expanded: Vec<_> = body.terms.iter().map(|t| &t.term).collect();
        // The standard analyzer stems the expansion.
        assert!(expanded.iter().any(|t| t.starts_with("asynchron")));
        assert_eq!(body.terms[1].variant, "async");
    }

    #[test]
    fn keyword_fields_match_words_singly() {
        let prepared = prepare("Rust Tutorial");
        let tags = field(&prepared, "tags");
        let terms: Vec<_> = tags.terms.iter().map(|t| t.term.as_str()).collect();
        assert_eq!(terms, vec!["rust", "tutorial"]);
    }

    #[test]
    fn keyword_classification() {
        let keywords = KeywordSet::extract(
            "How to configure OAuth for the API using snake_case webhooks?",
        );
        assert_eq!(keywords.acronyms, vec!["API"]);
        assert!(keywords.technical_nouns.contains(&"OAuth".to_string()));
        assert!(
            keywords.technical_nouns.contains(&"snake_case".to_string())
        );
        assert!(keywords.technical_terms.contains(&"oauth".to_string()));
        assert!(keywords.technical_terms.contains(&"api".to_string()));
        assert!(keywords.verb_forms.contains(&"configure".to_string()));
        assert!(keywords.verb_forms.contains(&"using".to_string()));
        assert!(keywords.is_acronym("api"));
    }

    #[test]
    fn literal_terms_are_distinct_across_fields() {
        let prepared = prepare("webhook webhook integration");
        let literal = prepared.literal_terms();
        let unique: HashSet<_> = literal.iter().collect();
        assert_eq!(literal.len(), unique.len());
    }
}
