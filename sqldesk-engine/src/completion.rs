//! Editor completions
//!
//! SQL keywords plus the tables and columns of the bound connection, matched
//! by case-insensitive prefix.

use std::collections::BTreeSet;

/// Most candidates returned for one prefix
pub const MAX_COMPLETIONS: usize = 10;

const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "IN", "LIKE", "BETWEEN", "ORDER", "BY", "ASC",
    "DESC", "LIMIT", "OFFSET", "GROUP", "HAVING", "JOIN", "LEFT", "RIGHT", "INNER", "OUTER",
    "FULL", "CROSS", "ON", "INSERT", "INTO", "VALUES", "UPDATE", "SET", "DELETE", "CREATE",
    "TABLE", "INDEX", "VIEW", "DROP", "ALTER", "ADD", "COLUMN", "PRIMARY", "KEY", "FOREIGN",
    "REFERENCES", "UNIQUE", "NULL", "DEFAULT", "CONSTRAINT", "CASCADE", "DISTINCT", "AS", "CASE",
    "WHEN", "THEN", "ELSE", "END", "COUNT", "SUM", "AVG", "MIN", "MAX", "COALESCE", "NULLIF",
    "CAST", "UNION", "ALL", "EXISTS", "ANY",
];

/// Completion candidates, kept sorted and free of duplicates
#[derive(Debug, Clone)]
pub struct Completions {
    candidates: BTreeSet<String>,
}

impl Default for Completions {
    fn default() -> Self {
        Self::keywords()
    }
}

impl Completions {
    /// Only the SQL keywords
    pub fn keywords() -> Self {
        Self {
            candidates: KEYWORDS.iter().map(|keyword| keyword.to_string()).collect(),
        }
    }

    /// Add a table as `table` and `schema.table`, and each column as
    /// `column` and `table.column`
    pub fn add_table<'a>(
        &mut self,
        schema: &str,
        table: &str,
        columns: impl IntoIterator<Item = &'a str>,
    ) {
        self.candidates.insert(table.to_string());
        self.candidates.insert(format!("{schema}.{table}"));
        for column in columns {
            self.candidates.insert(column.to_string());
            self.candidates.insert(format!("{table}.{column}"));
        }
    }

    /// The first [`MAX_COMPLETIONS`] candidates starting with `prefix`,
    /// ignoring case; an empty prefix matches nothing
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        if prefix.is_empty() {
            return Vec::new();
        }
        let prefix = prefix.to_lowercase();
        self.candidates
            .iter()
            .filter(|candidate| candidate.to_lowercase().starts_with(&prefix))
            .take(MAX_COMPLETIONS)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_match_any_case() {
        let completions = Completions::keywords();
        assert_eq!(completions.matching("sel"), vec!["SELECT"]);
        assert_eq!(completions.matching("Un"), vec!["UNION", "UNIQUE"]);
        assert!(completions.matching("").is_empty());
        assert!(completions.matching("zzz").is_empty());
    }

    #[test]
    fn test_tables_and_columns() {
        let mut completions = Completions::keywords();
        completions.add_table("public", "users", ["id", "email"]);
        completions.add_table("audit", "users", ["id"]);

        assert_eq!(
            completions.matching("us"),
            vec!["users", "users.email", "users.id"]
        );
        assert_eq!(completions.matching("public."), vec!["public.users"]);
        assert_eq!(completions.matching("EM"), vec!["email"]);
    }

    #[test]
    fn test_at_most_ten_candidates() {
        let mut completions = Completions::keywords();
        let columns: Vec<String> = (0..20).map(|n| format!("c{n:02}")).collect();
        completions.add_table("main", "wide", columns.iter().map(String::as_str));

        let matched = completions.matching("c");
        assert_eq!(matched.len(), MAX_COMPLETIONS);
        assert_eq!(matched[0], "CASCADE");
    }
}
