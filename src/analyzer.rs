//! Text analyzers that turn field values into positioned tokens.
//!
//! The registry is fixed: `standard` (lowercase, stopwords, English
//! stemming), `standard_nostem`, `code` (identifier-preserving) and
//! `keyword` (the whole value is one token). Analysis never fails; input
//! that yields nothing produces an empty token sequence.

use tantivy::tokenizer::{
    Language,
    LowerCaser,
    RemoveLongFilter,
    SimpleTokenizer,
    Stemmer,
    StopWordFilter,
    TextAnalyzer,
    TokenStream as _,
};

use crate::{
    error::{Error, Result},
    schema::{FieldDef, Schema},
};

pub const STANDARD: &str = "standard";
pub const STANDARD_NOSTEM: &str = "standard_nostem";
pub const CODE: &str = "code";
pub const KEYWORD: &str = "keyword";

const REGISTRY: &[&str] = &[STANDARD, STANDARD_NOSTEM, CODE, KEYWORD];

/// Tokens longer than this are dropped by the standard analyzer.
const MAX_TOKEN_LEN: usize = 40;

pub const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from",
    "has", "have", "if", "in", "into", "is", "it", "its", "of", "on", "or",
    "so", "such", "that", "the", "their", "then", "there", "these", "they",
    "this", "to", "was", "were", "will", "with", "you", "your",
];

/// A single analyzed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    /// Ordinal of the source word; stopword gaps are preserved.
    pub position: u32,
}

/// Finite token sequence produced by one analysis run.
pub type Tokens = std::vec::IntoIter<Token>;

pub fn is_registered(name: &str) -> bool {
    REGISTRY.contains(&name)
}

/// Resolve an analyzer by its registry name.
pub fn get_analyzer(name: &str) -> Result<Analyzer> {
    match name {
        STANDARD => Ok(Analyzer::Standard {
            stem: true,
            inner: standard_pipeline(true),
        }),
        STANDARD_NOSTEM => Ok(Analyzer::Standard {
            stem: false,
            inner: standard_pipeline(false),
        }),
        CODE => Ok(Analyzer::Code),
        KEYWORD => Ok(Analyzer::Keyword),
        other => Err(Error::Configuration(format!(
            "unknown analyzer '{other}'"
        ))),
    }
}

fn standard_pipeline(stem: bool) -> TextAnalyzer {
    let stopwords =
        StopWordFilter::remove(STOPWORDS.iter().map(|w| w.to_string()));
    if stem {
        TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
            .filter(LowerCaser)
            .filter(stopwords)
            .filter(Stemmer::new(Language::English))
            .build()
    } else {
        TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
            .filter(LowerCaser)
            .filter(stopwords)
            .build()
    }
}

#[derive(Clone)]
pub enum Analyzer {
    Standard { stem: bool, inner: TextAnalyzer },
    Code,
    Keyword,
}

impl std::fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Analyzer {
    pub fn name(&self) -> &'static str {
        match self {
            Analyzer::Standard { stem: true, .. } => STANDARD,
            Analyzer::Standard { stem: false, .. } => STANDARD_NOSTEM,
            Analyzer::Code => CODE,
            Analyzer::Keyword => KEYWORD,
        }
    }

    /// Analyze `text`. Calling again on the same input restarts the
    /// sequence from the first token.
    pub fn tokens(&self, text: &str) -> Tokens {
        let tokens = match self {
            Analyzer::Standard { inner, .. } => standard_tokens(inner, text),
            Analyzer::Code => code_tokens(text),
            Analyzer::Keyword => keyword_tokens(text),
        };
        tokens.into_iter()
    }

    /// Token texts only, in order, duplicates kept.
    pub fn terms(&self, text: &str) -> Vec<String> {
        self.tokens(text).map(|t| t.text).collect()
    }
}

/// The analyzer of every searchable field of a schema, resolved once.
#[derive(Debug, Clone)]
pub struct FieldAnalyzers {
    entries: Vec<(FieldDef, Analyzer)>,
}

impl FieldAnalyzers {
    pub fn for_schema(schema: &Schema) -> Result<Self> {
        let mut entries = Vec::new();
        for field in schema.searchable_fields() {
            if let Some(name) = field.analyzer_name() {
                entries.push((field.clone(), get_analyzer(name)?));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, field: &str) -> Option<&Analyzer> {
        self.entries
            .iter()
            .find(|(def, _)| def.name == field)
            .map(|(_, analyzer)| analyzer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldDef, &Analyzer)> {
        self.entries.iter().map(|(def, analyzer)| (def, analyzer))
    }
}

fn standard_tokens(inner: &TextAnalyzer, text: &str) -> Vec<Token> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    // token_stream needs exclusive access; the analyzer is cheap to clone.
    let mut analyzer = inner.clone();
    let mut stream = analyzer.token_stream(text);
    let mut out = Vec::new();
    stream.process(&mut |token| {
        out.push(Token {
            text: token.text.clone(),
            position: token.position as u32,
        });
    });
    out
}

fn keyword_tokens(text: &str) -> Vec<Token> {
    let value = text.trim();
    if value.is_empty() {
        return Vec::new();
    }
    vec![Token {
        text: value.to_lowercase(),
        position: 0,
    }]
}

fn is_code_separator(c: char) -> bool {
    !(c.is_alphanumeric() || c == '_' || c == '.')
}

fn code_tokens(text: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut position = 0u32;

    for raw in text.split(is_code_separator) {
        let word = raw.trim_matches(|c| c == '.' || c == '_');
        if word.is_empty() {
            continue;
        }

        let whole = word.to_lowercase();
        let parts = split_identifier(word);
        out.push(Token {
            text: whole.clone(),
            position,
        });
        // Part `i` sits at `position + i`, as if the identifier had been
        // written out word by word.
        if parts.len() > 1 {
            let mut emitted = vec![whole];
            for (offset, part) in (0u32..).zip(parts.iter()) {
                let part = part.to_lowercase();
                if !emitted.contains(&part) {
                    out.push(Token {
                        text: part.clone(),
                        position: position + offset,
                    });
                    emitted.push(part);
                }
            }
        }
        position += parts.len().max(1) as u32;
    }

    out
}

/// Split a compound identifier on `_`, `.` and case humps.
///
/// `parseHTTPRequest` → `parse`, `HTTP`, `Request`; `os.path_join` →
/// `os`, `path`, `join`.
pub fn split_identifier(word: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for piece in word.split(['_', '.']) {
        if piece.is_empty() {
            continue;
        }
        let chars: Vec<(usize, char)> = piece.char_indices().collect();
        let mut start = 0;
        for i in 1..chars.len() {
            let (idx, c) = chars[i];
            let prev = chars[i - 1].1;
            let next_is_lower =
                chars.get(i + 1).is_some_and(|(_, n)| n.is_lowercase());
            let hump = prev.is_lowercase() && c.is_uppercase()
                || prev.is_uppercase() && c.is_uppercase() && next_is_lower;
            if hump {
                parts.push(&piece[start..idx]);
                start = idx;
            }
        }
        parts.push(&piece[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(name: &str, text: &str) -> Vec<String> {
        get_analyzer(name).unwrap().terms(text)
    }

    #[test]
    fn registry_rejects_unknown_names() {
        assert!(get_analyzer("whitespace").is_err());
        for name in REGISTRY {
            assert_eq!(get_analyzer(name).unwrap().name(), *name);
        }
    }

    #[test]
    fn standard_lowercases_and_drops_stopwords() {
        assert_eq!(
            terms(STANDARD_NOSTEM, "The Webhook and the Integration"),
            vec!["webhook", "integration"]
        );
    }

    #[test]
    fn standard_stems() {
        let stemmed = terms(STANDARD, "running runners");
        assert_eq!(stemmed[0], "run");
        assert!(stemmed[1].starts_with("runner"));
    }

    #[test]
    fn standard_keeps_position_gaps() {
        let analyzer = get_analyzer(STANDARD_NOSTEM).unwrap();
        let tokens: Vec<_> = analyzer.tokens("webhook of the api").collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].position, 0);
        assert_eq!(tokens[1].position, 3);
    }

    #[test]
    fn empty_input_yields_nothing() {
        for name in REGISTRY {
            assert!(terms(name, "").is_empty());
            assert!(terms(name, "   \n\t").is_empty());
        }
    }

    #[test]
    fn tokens_restart_on_each_call() {
        let analyzer = get_analyzer(STANDARD).unwrap();
        let first: Vec<_> = analyzer.tokens("alpha beta").collect();
        let second: Vec<_> = analyzer.tokens("alpha beta").collect();
        assert_eq!(first, second);
    }

    #[test]
    fn code_preserves_identifiers() {
        let out = terms(CODE, "call parseHttpRequest(os.path, snake_case)");
        assert!(out.contains(&"parsehttprequest".to_string()));
        assert!(out.contains(&"request".to_string()));
        assert!(out.contains(&"os.path".to_string()));
        assert!(out.contains(&"snake_case".to_string()));
        assert!(out.contains(&"snake".to_string()));
    }

    #[test]
    fn code_parts_take_consecutive_positions() {
        let analyzer = get_analyzer(CODE).unwrap();
        let tokens: Vec<(String, u32)> = analyzer
            .tokens("parseHttpRequest next")
            .map(|t| (t.text, t.position))
            .collect();
        assert_eq!(tokens, vec![
            ("parsehttprequest".to_string(), 0),
            ("parse".to_string(), 0),
            ("http".to_string(), 1),
            ("request".to_string(), 2),
            ("next".to_string(), 3),
        ]);

        let spread = |text: &str| {
            let tokens: Vec<_> = analyzer.tokens(text).collect();
            let at = |term: &str| {
                tokens.iter().find(|t| t.text == term).unwrap().position
            };
            at("bar").abs_diff(at("foo"))
        };
        assert_eq!(spread("fooBar"), spread("foo bar"));
    }

    #[test]
    fn code_treats_brackets_as_separators() {
        assert_eq!(terms(CODE, "Vec<String>{x}[y]"), vec![
            "vec", "string", "x", "y"
        ]);
    }

    #[test]
    fn code_parts_share_position() {
        let analyzer = get_analyzer(CODE).unwrap();
        let tokens: Vec<_> = analyzer.tokens("getUser next").collect();
        assert!(tokens.iter().filter(|t| t.position == 0).count() >= 3);
        assert_eq!(tokens.last().unwrap().position, 1);
    }

    #[test]
    fn code_does_not_stem() {
        assert_eq!(terms(CODE, "running"), vec!["running"]);
    }

    #[test]
    fn keyword_is_single_token() {
        assert_eq!(terms(KEYWORD, "  Getting Started "), vec![
            "getting started"
        ]);
    }

    #[test]
    fn split_identifier_handles_acronyms() {
        assert_eq!(split_identifier("parseHTTPRequest"), vec![
            "parse", "HTTP", "Request"
        ]);
        assert_eq!(split_identifier("os.path_join"), vec!["os", "path", "join"]);
        assert_eq!(split_identifier("plain"), vec!["plain"]);
    }
}
