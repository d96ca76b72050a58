//! Signals derived from markdown bodies at ingest time.

use std::path::Path;

/// Excerpts are cut to this many characters.
pub const EXCERPT_MAX_CHARS: usize = 300;

/// Paragraphs shorter than this are not considered substantive.
const MIN_PARAGRAPH_CHARS: usize = 20;

/// Extract a title from a markdown body.
///
/// Uses the first non-empty `# ` heading, then the file stem of `path`,
/// then `fallback`.
pub fn extract_title(body: &str, path: Option<&str>, fallback: &str) -> String {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("# ") {
            let title = heading.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }

    path.and_then(|p| Path::new(p).file_stem())
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Headings grouped by tier: `#`, `##`, and everything deeper.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Headings {
    pub h1: Vec<String>,
    pub h2: Vec<String>,
    pub h3: Vec<String>,
}

impl Headings {
    pub fn is_empty(&self) -> bool {
        self.h1.is_empty() && self.h2.is_empty() && self.h3.is_empty()
    }
}

/// Collect ATX headings outside fenced code blocks.
pub fn extract_headings(body: &str) -> Headings {
    let mut headings = Headings::default();
    let mut in_fence = false;

    for line in body.lines() {
        let trimmed = line.trim();
        if is_fence(trimmed) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some((level, text)) = parse_heading(trimmed) {
            match level {
                1 => headings.h1.push(text),
                2 => headings.h2.push(text),
                _ => headings.h3.push(text),
            }
        }
    }

    headings
}

/// Sort pre-extracted heading lines (with or without `#` markers) into
/// tiers. Lines without markers count as second-tier headings.
pub fn split_headings<'a, I>(lines: I) -> Headings
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headings = Headings::default();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_heading(trimmed) {
            Some((1, text)) => headings.h1.push(text),
            Some((2, text)) => headings.h2.push(text),
            Some((_, text)) => headings.h3.push(text),
            None => headings.h2.push(trimmed.to_string()),
        }
    }
    headings
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let level = line.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(' ') {
        return None;
    }
    let text = rest.trim().trim_end_matches('#').trim();
    (!text.is_empty()).then(|| (level, text.to_string()))
}

fn is_fence(line: &str) -> bool {
    line.starts_with("```") || line.starts_with("~~~")
}

fn is_structural(line: &str) -> bool {
    line.starts_with('#')
        || line.starts_with('|')
        || line.starts_with('>')
        || line.starts_with("- ")
        || line.starts_with("* ")
        || line.starts_with("+ ")
        || line.starts_with("<")
        || line.split_once(". ").is_some_and(|(n, _)| {
            !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())
        })
}

/// The first substantive paragraph of a markdown body, cut to
/// [`EXCERPT_MAX_CHARS`].
///
/// Headings, fenced code, a leading front-matter block, lists, tables,
/// quotes and HTML lines are skipped.
pub fn extract_excerpt(body: &str) -> Option<String> {
    let mut lines = body.lines().peekable();

    // Front matter only counts at the very top.
    if lines.peek().is_some_and(|l| l.trim() == "---") {
        lines.next();
        for line in lines.by_ref() {
            if line.trim() == "---" {
                break;
            }
        }
    }

    let mut in_fence = false;
    let mut paragraph: Vec<&str> = Vec::new();

    for line in lines {
        let trimmed = line.trim();
        if is_fence(trimmed) {
            in_fence = !in_fence;
            if let Some(found) = finish_paragraph(&mut paragraph) {
                return Some(found);
            }
            continue;
        }
        if in_fence {
            continue;
        }
        if trimmed.is_empty() || is_structural(trimmed) {
            if let Some(found) = finish_paragraph(&mut paragraph) {
                return Some(found);
            }
            continue;
        }
        paragraph.push(trimmed);
    }

    finish_paragraph(&mut paragraph)
}

fn finish_paragraph(paragraph: &mut Vec<&str>) -> Option<String> {
    if paragraph.is_empty() {
        return None;
    }
    let text = paragraph.join(" ");
    paragraph.clear();
    if text.chars().count() < MIN_PARAGRAPH_CHARS {
        return None;
    }
    Some(truncate_chars(&text, EXCERPT_MAX_CHARS))
}

/// Cut `text` to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Split tag values given as one comma-separated string or as a list.
pub fn coerce_tags<'a, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tags: Vec<String> = Vec::new();
    for value in values {
        for tag in value.split(',') {
            let tag = tag.trim();
            if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
    }
    tags
}

/// Locale code from a path segment such as `/fr/` or `/pt-br/`.
pub fn language_from_path(path: &str) -> Option<String> {
    path.split('/').find_map(|segment| {
        let lower = segment.to_ascii_lowercase();
        let (lang, region) = match lower.split_once(['-', '_']) {
            Some((lang, region)) => (lang, Some(region)),
            None => (lower.as_str(), None),
        };
        let lang_ok =
            lang.len() == 2 && lang.chars().all(|c| c.is_ascii_lowercase());
        let region_ok = region.is_none_or(|r| {
            r.len() == 2 && r.chars().all(|c| c.is_ascii_alphabetic())
        });
        // Two-letter directory names that are not locales.
        let reserved = matches!(lang, "js" | "ts" | "go" | "db" | "ui");
        (lang_ok && region_ok && !reserved).then(|| lower.replace('_', "-"))
    })
}
