//! Symmetric synonym groups for query expansion.

use std::collections::BTreeMap;

/// Abbreviation groups common in technical documentation. Every member of
/// a group expands to every other member.
pub const DEFAULT_GROUPS: &[&[&str]] = &[
    &["async", "asynchronous"],
    &["auth", "authentication", "authorization"],
    &["config", "configuration", "configure"],
    &["repo", "repository"],
    &["env", "environment"],
    &["db", "database"],
    &["docs", "documentation"],
    &["k8s", "kubernetes"],
    &["js", "javascript"],
    &["ts", "typescript"],
    &["app", "application"],
    &["param", "parameter"],
    &["arg", "argument"],
    &["dir", "directory"],
    &["msg", "message"],
    &["impl", "implementation"],
];

/// Lookup from a lowercase word to its group members.
#[derive(Debug, Clone, Default)]
pub struct SynonymTable {
    groups: Vec<Vec<String>>,
    index: BTreeMap<String, Vec<usize>>,
}

impl SynonymTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for group in DEFAULT_GROUPS {
            table.add_group(group.iter().copied());
        }
        table
    }

    /// Register a group of mutually equivalent words.
    ///
    /// Groups with fewer than two distinct members are ignored.
    pub fn add_group<'a, I>(&mut self, words: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut group: Vec<String> = Vec::new();
        for word in words {
            let word = word.trim().to_lowercase();
            if !word.is_empty() && !group.contains(&word) {
                group.push(word);
            }
        }
        if group.len() < 2 {
            return;
        }

        let id = self.groups.len();
        for word in &group {
            self.index.entry(word.clone()).or_default().push(id);
        }
        self.groups.push(group);
    }

    /// Alternate words for `word`, excluding `word` itself.
    ///
    /// The order is stable: groups in registration order, members in
    /// declaration order, duplicates removed.
    pub fn expand(&self, word: &str) -> Vec<String> {
        let word = word.to_lowercase();
        let Some(ids) = self.index.get(&word) else {
            return Vec::new();
        };

        let mut out: Vec<String> = Vec::new();
        for &id in ids {
            for member in &self.groups[id] {
                if *member != word && !out.contains(member) {
                    out.push(member.clone());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_abbreviations() {
        let table = SynonymTable::with_defaults();
        assert_eq!(table.expand("async"), vec!["asynchronous"]);
        assert_eq!(table.expand("auth"), vec![
            "authentication",
            "authorization"
        ]);
        assert_eq!(table.expand("Configuration"), vec!["config", "configure"]);
    }

    #[test]
    fn unknown_word_has_no_expansion() {
        let table = SynonymTable::with_defaults();
        assert!(table.expand("webhook").is_empty());
        assert!(table.expand("").is_empty());
    }

    #[test]
    fn default_pairs_are_symmetric() {
        let table = SynonymTable::with_defaults();
        for group in DEFAULT_GROUPS {
            for x in *group {
                for y in *group {
                    if x == y {
                        continue;
                    }
                    let forward = table.expand(x).contains(&y.to_string());
                    let backward = table.expand(y).contains(&x.to_string());
                    assert!(forward && backward, "{x} <-> {y}");
                }
            }
        }
    }

    #[test]
    fn expansion_is_deterministic() {
        let a = SynonymTable::with_defaults();
        let b = SynonymTable::with_defaults();
        assert_eq!(a.expand("auth"), b.expand("auth"));
    }

    #[test]
    fn tiny_groups_are_ignored() {
        let mut table = SynonymTable::new();
        table.add_group(["solo"]);
        table.add_group(["dup", "DUP"]);
        assert!(table.is_empty());
    }

    #[test]
    fn word_in_two_groups_merges_without_duplicates() {
        let mut table = SynonymTable::new();
        table.add_group(["doc", "document"]);
        table.add_group(["doc", "docs", "document"]);
        assert_eq!(table.expand("doc"), vec!["document", "docs"]);
    }
}
