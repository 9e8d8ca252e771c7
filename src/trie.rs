//! Prefix trie over dotted field paths.

use std::collections::HashMap;

/// Membership structure answering "is this path, or an ancestor of it,
/// already claimed".
///
/// Paths are split on `.`; inserting the empty path claims the whole
/// message, so every query afterwards reports a common prefix.
#[derive(Debug, Clone, Default)]
pub struct FieldPathTrie {
    root: TrieNode,
}

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    terminal: bool,
}

impl FieldPathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` and everything below it.
    pub fn insert(&mut self, path: &str) {
        let mut node = &mut self.root;
        for segment in split(path) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.terminal = true;
    }

    /// True if any prefix of `path` (inclusive) has been inserted.
    pub fn has_common_prefix(&self, path: &str) -> bool {
        let mut node = &self.root;
        if node.terminal {
            return true;
        }
        for segment in split(path) {
            match node.children.get(segment) {
                Some(child) if child.terminal => return true,
                Some(child) => node = child,
                None => return false,
            }
        }
        false
    }

    /// True when nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        !self.root.terminal && self.root.children.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for FieldPathTrie {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut trie = FieldPathTrie::new();
        for path in iter {
            trie.insert(path.as_ref());
        }
        trie
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_path_and_descendants() {
        let trie: FieldPathTrie = ["a.b", "c"].into_iter().collect();

        assert!(trie.has_common_prefix("a.b"));
        assert!(trie.has_common_prefix("a.b.c"));
        assert!(trie.has_common_prefix("c"));
        assert!(trie.has_common_prefix("c.d.e"));

        assert!(!trie.has_common_prefix("a"));
        assert!(!trie.has_common_prefix("a.bc"));
        assert!(!trie.has_common_prefix("a.c"));
        assert!(!trie.has_common_prefix("b"));
    }

    #[test]
    fn empty_path_claims_everything() {
        let mut trie = FieldPathTrie::new();
        assert!(trie.is_empty());
        assert!(!trie.has_common_prefix("anything"));

        trie.insert("");
        assert!(!trie.is_empty());
        assert!(trie.has_common_prefix("anything"));
        assert!(trie.has_common_prefix("a.b.c"));
    }

    #[test]
    fn agrees_with_brute_force_prefix_check() {
        let inserted = ["id", "note.text", "note.author.name", "table"];
        let trie: FieldPathTrie = inserted.iter().collect();

        let queries = [
            "id",
            "idx",
            "note",
            "note.text",
            "note.text.x",
            "note.author",
            "note.author.name",
            "note.author.email",
            "table",
            "tables",
            "other",
        ];

        for query in queries {
            let query_parts: Vec<&str> = query.split('.').collect();
            let expected = inserted.iter().any(|s| {
                let s_parts: Vec<&str> = s.split('.').collect();
                s_parts.len() <= query_parts.len() && query_parts[..s_parts.len()] == s_parts[..]
            });
            assert_eq!(trie.has_common_prefix(query), expected, "query {query}");
        }
    }
}
