// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use std::collections::HashMap;

/// Returns the longest possible prefix of `s` that is at most `max_len`
/// bytes long and ends at a character boundary so that we don't break
/// multi-byte characters.
fn max_prefix(s: &str, max_len: usize) -> &str {
    if max_len >= s.len() {
        return s;
    }
    let mut idx = max_len;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    &s[..idx]
}

/// Truncates a database identifier (column/table alias) to 63 bytes to make
/// it Postgres-compatible.
pub fn truncate_identifier(s: &str) -> &str {
    max_prefix(s, 63)
}

/// Produces table and field aliases that stay stable for the lifetime of a
/// query set. A table alias is bound to its full dotted path, so resolving
/// the same path twice yields the same alias; field aliases are scoped to a
/// table alias. Cloning continues from the parent's state.
#[derive(Clone, Debug, Default)]
pub struct AliasGenerator {
    table_by_path: HashMap<String, String>,
    table_counters: HashMap<String, usize>,
    field_by_key: HashMap<String, String>,
    field_counters: HashMap<String, usize>,
}

impl AliasGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alias for `table` reached via the dotted `path`. The first alias for a
    /// table is `<table>_1`, the next distinct path gets `<table>_2`, etc.
    pub fn table_alias(&mut self, table: &str, path: &str) -> String {
        let key = format!("{table}\u{0}{path}");
        if let Some(alias) = self.table_by_path.get(&key) {
            return alias.clone();
        }
        let n = self
            .table_counters
            .entry(table.to_owned())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        let alias = truncate_identifier(&format!("{table}_{n}")).to_owned();
        self.table_by_path.insert(key, alias.clone());
        alias
    }

    /// Alias for `field` projected out of the table addressed as
    /// `table_alias`. Stable per `(table_alias, field)` pair.
    pub fn field_alias(&mut self, table_alias: &str, field: &str) -> String {
        let key = format!("{table_alias}\u{0}{field}");
        if let Some(alias) = self.field_by_key.get(&key) {
            return alias.clone();
        }
        let base = format!("{table_alias}_{field}");
        let n = self
            .field_counters
            .entry(base.clone())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        let alias = if *n == 1 {
            base
        } else {
            format!("{base}_{n}")
        };
        let alias = truncate_identifier(&alias).to_owned();
        self.field_by_key.insert(key, alias.clone());
        alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_aliases_are_stable_per_path() {
        let mut gen = AliasGenerator::new();
        let a = gen.table_alias("books", "Author.Books");
        let b = gen.table_alias("books", "Author.Books");
        assert_eq!(a, b);
        assert_eq!(a, "books_1");

        let c = gen.table_alias("books", "Editor.Books");
        assert_eq!(c, "books_2");
    }

    #[test]
    fn test_clone_continues_from_parent() {
        let mut gen = AliasGenerator::new();
        let a = gen.table_alias("books", "Author.Books");

        let mut forked = gen.clone();
        assert_eq!(forked.table_alias("books", "Author.Books"), a);
        assert_eq!(forked.table_alias("books", "Editor.Books"), "books_2");
    }

    #[test]
    fn test_field_aliases() {
        let mut gen = AliasGenerator::new();
        assert_eq!(gen.field_alias("books_1", "title"), "books_1_title");
        assert_eq!(gen.field_alias("books_1", "title"), "books_1_title");
    }

    #[test]
    fn test_truncate_identifier() {
        let long = "x".repeat(80);
        assert_eq!(truncate_identifier(&long).len(), 63);
        assert_eq!(truncate_identifier("short"), "short");
    }
}
