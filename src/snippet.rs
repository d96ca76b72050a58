//! Result snippets with highlighted query terms.

use std::{
    fs,
    path::{Component, Path, PathBuf},
    sync::{OnceLock, mpsc},
    time::Duration,
};

use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use crate::{markdown, schema::fields, writer::StoredDocument};

/// Maximum number of characters in a snippet before truncation.
pub const SNIPPET_MAX_CHARS: usize = 400;

/// Characters taken from the start of the text when no line matches.
pub const PREFIX_CHARS: usize = 200;

/// Lines kept before the first matching line.
const LINES_BEFORE: usize = 1;

/// Lines kept after the first matching line.
const LINES_AFTER: usize = 2;

pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_millis(200);

/// Source reads that may run at once; later reads queue behind them.
const MAX_SOURCE_READS: usize = 8;

/// Terms shorter than this only highlight whole words.
const MIN_HIGHLIGHT_PREFIX: usize = 4;

/// Where snippet text comes from, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetSource {
    /// The document's source file under the docs root.
    File,
    /// The stored body or excerpt.
    Stored,
    /// Nothing matched; a prefix of the available text.
    Prefix,
}

/// Builds snippets for ranked documents.
#[derive(Debug, Clone)]
pub struct SnippetBuilder {
    docs_root: Option<PathBuf>,
    timeout: Duration,
}

impl Default for SnippetBuilder {
    fn default() -> Self {
        Self::new(None, DEFAULT_SOURCE_TIMEOUT)
    }
}

impl SnippetBuilder {
    pub fn new(docs_root: Option<PathBuf>, timeout: Duration) -> Self {
        Self { docs_root, timeout }
    }

    /// Snippet for `doc` with `terms` highlighted. Never fails; a document
    /// with no text yields an empty string.
    pub fn build(&self, doc: &StoredDocument, terms: &[String]) -> String {
        self.build_with_source(doc, terms).0
    }

    pub fn build_with_source(
        &self,
        doc: &StoredDocument,
        terms: &[String],
    ) -> (String, SnippetSource) {
        if let Some(text) = self.source_text(doc)
            && let Some(window) = matching_window(&text, terms)
        {
            return (highlight(&window, terms), SnippetSource::File);
        }

        let stored = [doc.text(fields::BODY), Some(doc.excerpt.clone())];
        for text in stored.iter().flatten() {
            if let Some(window) = matching_window(text, terms) {
                return (highlight(&window, terms), SnippetSource::Stored);
            }
        }

        let fallback = stored
            .into_iter()
            .flatten()
            .find(|t| !t.trim().is_empty())
            .unwrap_or_default();
        let prefix = markdown::truncate_chars(fallback.trim(), PREFIX_CHARS);
        (highlight(&prefix, terms), SnippetSource::Prefix)
    }

    fn source_text(&self, doc: &StoredDocument) -> Option<String> {
        let root = self.docs_root.as_deref()?;
        let relative = doc.text(fields::PATH)?;
        let path = resolve_source(root, &relative)?;
        read_with_timeout(&path, self.timeout)
    }
}

/// Join `relative` onto `root`, refusing paths that would leave it.
fn resolve_source(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative.trim_start_matches('/'));
    let escapes = relative.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes || relative.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(relative))
}

/// Runtime whose blocking pool performs source reads.
fn reader_runtime() -> Option<&'static Runtime> {
    static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(MAX_SOURCE_READS)
                .thread_name("segdex-snippet")
                .enable_time()
                .build()
                .map_err(|err| {
                    warn!(
                        target: "segdex::snippet",
                        error = %err,
                        "source reader unavailable, using stored text"
                    );
                })
                .ok()
        })
        .as_ref()
}

/// Read `path` on the reader's blocking pool, giving up after `timeout`.
///
/// A read that times out finishes in the background and its result is
/// dropped. At most [`MAX_SOURCE_READS`] reads hold a thread at once.
pub fn read_with_timeout(path: &Path, timeout: Duration) -> Option<String> {
    let runtime = reader_runtime()?;
    let (tx, rx) = mpsc::channel();
    let owned = path.to_path_buf();
    runtime.spawn(async move {
        let read =
            tokio::task::spawn_blocking(move || fs::read_to_string(&owned));
        let _ = tx.send(tokio::time::timeout(timeout, read).await);
    });

    let error = match rx.recv() {
        Ok(Ok(Ok(Ok(text)))) => return Some(text),
        Ok(Ok(Ok(Err(err)))) => err.to_string(),
        Ok(Ok(Err(err))) => err.to_string(),
        Ok(Err(_)) => {
            warn!(
                target: "segdex::snippet",
                path = %path.display(),
                timeout_ms = timeout.as_millis() as u64,
                "source read timed out, using stored text"
            );
            return None;
        }
        Err(_) => "source reader stopped".to_string(),
    };
    debug!(
        target: "segdex::snippet",
        path = %path.display(),
        error = %error,
        "source file unreadable"
    );
    None
}

/// Lines around the first line containing any of `terms`, truncated to
/// [`SNIPPET_MAX_CHARS`]. `None` when no line matches.
pub fn matching_window(text: &str, terms: &[String]) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let idx = lines.iter().position(|line| {
        let line = line.to_lowercase();
        terms.iter().any(|t| !t.is_empty() && line.contains(t.as_str()))
    })?;

    let start = idx.saturating_sub(LINES_BEFORE);
    let end = (idx + LINES_AFTER + 1).min(lines.len());
    let window = lines[start..end]
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut snippet = markdown::truncate_chars(&window, SNIPPET_MAX_CHARS);
    if snippet.len() < window.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}

/// Wrap words matching `terms` in `**`.
///
/// A word matches a term when it equals it ignoring case, or, for terms of
/// at least four characters, starts with it.
pub fn highlight(text: &str, terms: &[String]) -> String {
    if terms.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text;
    while let Some(start) = rest.find(|c: char| c.is_alphanumeric()) {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let end = rest
            .find(|c: char| !c.is_alphanumeric())
            .unwrap_or(rest.len());
        let word = &rest[..end];
        if matches_term(word, terms) {
            out.push_str("**");
            out.push_str(word);
            out.push_str("**");
        } else {
            out.push_str(word);
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

fn matches_term(word: &str, terms: &[String]) -> bool {
    let lower = word.to_lowercase();
    terms.iter().any(|term| {
        lower == *term
            || (term.chars().count() >= MIN_HIGHLIGHT_PREFIX
                && lower.starts_with(term.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::writer::FieldValue;

    fn doc(body: &str, path: Option<&str>) -> StoredDocument {
        let mut stored = BTreeMap::new();
        stored.insert(fields::BODY.to_string(), FieldValue::from(body));
        if let Some(path) = path {
            stored.insert(fields::PATH.to_string(), FieldValue::from(path));
        }
        StoredDocument {
            doc_id: 0,
            url: "/doc".into(),
            title: "Doc".into(),
            excerpt: String::new(),
            tags: Vec::new(),
            timestamp: None,
            stored,
        }
    }

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn highlights_whole_words_and_prefixes() {
        let out = highlight(
            "Webhook retries and webhooks, not a hook.",
            &terms(&["webhook", "retries", "hook"]),
        );
        assert_eq!(
            out,
            "**Webhook** **retries** and **webhooks**, not a **hook**."
        );
    }

    #[test]
    fn short_terms_only_match_whole_words() {
        assert_eq!(highlight("api apis", &terms(&["api"])), "**api** apis");
    }

    #[test]
    fn window_around_first_match() {
        let text = "intro\nsetup\nconfigure the webhook\nretry\nmore\nend";
        let window = matching_window(text, &terms(&["webhook"])).unwrap();
        assert_eq!(window, "setup configure the webhook retry more");
        assert!(matching_window(text, &terms(&["absent"])).is_none());
    }

    #[test]
    fn long_windows_are_truncated() {
        let text = format!("webhook {}", "a".repeat(1_000));
        let window = matching_window(&text, &terms(&["webhook"])).unwrap();
        assert!(window.ends_with("..."));
        assert_eq!(window.chars().count(), SNIPPET_MAX_CHARS + 3);
    }

    #[test]
    fn prefers_source_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("guides")).unwrap();
        fs::write(
            tmp.path().join("guides/hooks.md"),
            "# Hooks\n\nSigned webhook payloads.\n",
        )
        .unwrap();

        let builder = SnippetBuilder::new(
            Some(tmp.path().to_path_buf()),
            Duration::from_secs(5),
        );
        let (snippet, source) = builder.build_with_source(
            &doc("stored webhook text", Some("guides/hooks.md")),
            &terms(&["webhook"]),
        );
        assert_eq!(source, SnippetSource::File);
        assert!(snippet.contains("Signed **webhook** payloads."));
    }

    #[cfg(unix)]
    #[test]
    fn stalled_source_read_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let fifo = tmp.path().join("stalled.md");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .unwrap();
        assert!(status.success());

        // Opening a FIFO without a writer blocks until one appears.
        let started = std::time::Instant::now();
        let text = read_with_timeout(&fifo, Duration::from_millis(50));
        assert!(text.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));

        // Let the stalled read finish so it frees its pool thread.
        drop(fs::OpenOptions::new().write(true).open(&fifo).unwrap());
    }

    #[test]
    fn repeated_reads_share_the_reader_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("page.md");
        fs::write(&path, "webhook").unwrap();
        for _ in 0..(MAX_SOURCE_READS * 4) {
            assert_eq!(
                read_with_timeout(&path, Duration::from_secs(5)).as_deref(),
                Some("webhook")
            );
        }
    }

    #[test]
    fn falls_back_to_stored_text() {
        let tmp = tempfile::tempdir().unwrap();
        let builder = SnippetBuilder::new(
            Some(tmp.path().to_path_buf()),
            DEFAULT_SOURCE_TIMEOUT,
        );
        let (snippet, source) = builder.build_with_source(
            &doc("Retry the webhook delivery.", Some("missing.md")),
            &terms(&["webhook"]),
        );
        assert_eq!(source, SnippetSource::Stored);
        assert_eq!(snippet, "Retry the **webhook** delivery.");
    }

    #[test]
    fn falls_back_to_prefix() {
        let body = "x".repeat(500);
        let (snippet, source) = SnippetBuilder::default()
            .build_with_source(&doc(&body, None), &terms(&["webhook"]));
        assert_eq!(source, SnippetSource::Prefix);
        assert_eq!(snippet.chars().count(), PREFIX_CHARS);
    }

    #[test]
    fn refuses_paths_outside_root() {
        let root = Path::new("/docs");
        assert!(resolve_source(root, "../etc/passwd").is_none());
        assert!(resolve_source(root, "").is_none());
        assert_eq!(
            resolve_source(root, "/guide/a.md"),
            Some(PathBuf::from("/docs/guide/a.md"))
        );
    }

    #[test]
    fn empty_document_gives_empty_snippet() {
        let snippet = SnippetBuilder::default().build(&doc("", None), &[]);
        assert!(snippet.is_empty());
    }
}
