//! Statement classification
//!
//! SQL is parsed with `sqlparser` using the dialect of the backend it will
//! run on. The parsed statements drive the destructive-statement classifier,
//! the top-level `ORDER BY` hint, the paging rewrite used by the executor,
//! editable result detection and the safety check that gates destructive
//! statements on dangerous connections. Input the parser rejects falls back
//! to the lexical splitter in [`split`].

mod split;

pub use split::{split_statements, Statement};

use crate::profile::BackendKind;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{self, GroupByExpr, Ident, Query, SetExpr, TableFactor};
use sqlparser::dialect::{Dialect, GenericDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::fmt;

/// Alias given to the wrapped statement by [`Analysis::rewrite_for_page`]
pub const PAGE_ALIAS: &str = "sqldesk_page";

const POSTGRES_DIALECTS: &[&dyn Dialect] = &[&PostgreSqlDialect {}, &GenericDialect {}];
const SQLITE_DIALECTS: &[&dyn Dialect] = &[&SQLiteDialect {}, &GenericDialect {}];
const ANY_DIALECTS: &[&dyn Dialect] = &[&PostgreSqlDialect {}, &SQLiteDialect {}, &GenericDialect {}];

/// Kind of a SQL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Truncate,
    /// Recognized but not data-shaped (`EXPLAIN`, `BEGIN`, `GRANT`, `PRAGMA`, ...)
    Other,
    /// Could not be lexed (unterminated string or comment) or no leading keyword
    Unknown,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Create => "CREATE",
            StatementKind::Alter => "ALTER",
            StatementKind::Drop => "DROP",
            StatementKind::Truncate => "TRUNCATE",
            StatementKind::Other => "OTHER",
            StatementKind::Unknown => "UNKNOWN",
        }
    }

    /// Whether the statement mutates or drops existing data or schema
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            StatementKind::Delete
                | StatementKind::Update
                | StatementKind::Drop
                | StatementKind::Truncate
                | StatementKind::Alter
        )
    }

    /// Whether confirming this kind should require typing the connection name
    pub fn is_irreversible(&self) -> bool {
        matches!(self, StatementKind::Drop | StatementKind::Truncate)
    }

    pub fn risk_description(&self) -> &'static str {
        match self {
            StatementKind::Delete => "DELETE will remove rows from the table",
            StatementKind::Drop => "DROP will permanently delete the table or database",
            StatementKind::Truncate => "TRUNCATE will remove ALL rows from the table",
            StatementKind::Update => "UPDATE will modify existing data",
            StatementKind::Insert => "INSERT will add new data",
            StatementKind::Alter => "ALTER will modify the table structure",
            StatementKind::Create => "CREATE will add new schema objects",
            StatementKind::Select => "SELECT only reads data",
            StatementKind::Other | StatementKind::Unknown => "This query may modify data",
        }
    }

    fn modifies_data(&self) -> bool {
        self.is_destructive() || *self == StatementKind::Insert
    }

    /// Ordering used to pick the most dangerous statement of a script
    fn danger(&self) -> u8 {
        match self {
            StatementKind::Drop => 9,
            StatementKind::Truncate => 8,
            StatementKind::Delete => 7,
            StatementKind::Update => 6,
            StatementKind::Alter => 5,
            StatementKind::Insert => 4,
            StatementKind::Create => 3,
            StatementKind::Select => 2,
            StatementKind::Other => 1,
            StatementKind::Unknown => 0,
        }
    }

    fn from_keyword(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "SELECT" | "VALUES" | "TABLE" => StatementKind::Select,
            "INSERT" => StatementKind::Insert,
            "UPDATE" | "MERGE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            "CREATE" => StatementKind::Create,
            "ALTER" => StatementKind::Alter,
            "DROP" => StatementKind::Drop,
            "TRUNCATE" => StatementKind::Truncate,
            _ => StatementKind::Other,
        }
    }

    fn most_dangerous(self, other: Self) -> Self {
        if other.danger() > self.danger() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`classify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub kind: StatementKind,
    pub is_destructive: bool,
}

/// The single table a result set can be edited through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub schema: Option<String>,
    pub table: String,
}

/// SQL parsed once for every question the engine asks about it
#[derive(Debug, Clone)]
pub struct Analysis<'a> {
    backend: Option<BackendKind>,
    statements: Vec<Statement<'a>>,
    /// `None` when no dialect could parse the input
    parsed: Option<Vec<ast::Statement>>,
}

impl<'a> Analysis<'a> {
    /// Parse with the dialect of `backend`, or try Postgres, SQLite and the
    /// generic dialect in turn when the backend is not known
    pub fn new(sql: &'a str, backend: Option<BackendKind>) -> Self {
        let dialects = match backend {
            Some(BackendKind::Postgres) => POSTGRES_DIALECTS,
            Some(BackendKind::Sqlite) => SQLITE_DIALECTS,
            None => ANY_DIALECTS,
        };
        let parsed = dialects
            .iter()
            .find_map(|dialect| Parser::parse_sql(*dialect, sql).ok());

        Self {
            backend,
            statements: split_statements(sql),
            parsed,
        }
    }

    /// Whether a dialect accepted the input
    pub fn is_parsed(&self) -> bool {
        self.parsed.is_some()
    }

    pub fn statement_count(&self) -> usize {
        match &self.parsed {
            Some(parsed) => parsed.len(),
            None => self.statements.len(),
        }
    }

    /// Kind of each statement, in order
    pub fn kinds(&self) -> Vec<StatementKind> {
        match &self.parsed {
            Some(parsed) => parsed.iter().map(statement_kind).collect(),
            None => self.statements.iter().map(|statement| statement.kind).collect(),
        }
    }

    /// The most dangerous statement decides for the whole script
    pub fn classification(&self) -> Classification {
        let kind = self
            .kinds()
            .into_iter()
            .reduce(StatementKind::most_dangerous)
            .unwrap_or(StatementKind::Unknown);

        Classification {
            kind,
            is_destructive: kind.is_destructive(),
        }
    }

    /// Whether the first query of the input orders its result
    ///
    /// Only the outermost `ORDER BY` counts; ordering inside subqueries or
    /// window definitions does not order the result.
    pub fn has_order_by(&self) -> bool {
        match &self.parsed {
            Some(parsed) => parsed.iter().find_map(|statement| match statement {
                ast::Statement::Query(query) => Some(query.order_by.is_some()),
                _ => None,
            }) == Some(true),
            None => self.statements.first().is_some_and(|statement| {
                statement.kind == StatementKind::Select && split::has_order_by(statement.text)
            }),
        }
    }

    /// Wrap a lone read-only query so the backend applies paging
    ///
    /// Returns `None` for scripts, statements other than a plain query, and
    /// anything no dialect could parse; those run unchanged.
    pub fn rewrite_for_page(&self, limit: usize, offset: u64) -> Option<String> {
        let [ast::Statement::Query(query)] = self.parsed.as_deref()? else {
            return None;
        };
        let [statement] = self.statements.as_slice() else {
            return None;
        };
        if query_kind(query) != StatementKind::Select {
            return None;
        }

        // Newlines keep a trailing line comment from swallowing the closing paren
        Some(format!(
            "SELECT * FROM (\n{}\n) AS {PAGE_ALIAS} LIMIT {} OFFSET {offset}",
            statement.text,
            limit.saturating_add(1)
        ))
    }

    /// The table behind a result set, if its rows map one-to-one onto rows
    /// of a single table
    ///
    /// # Returns
    ///
    /// The schema (when the query names one) and table, or the reason the
    /// result cannot be edited
    pub fn source_table(&self) -> Result<SourceTable, &'static str> {
        let parsed = self.parsed.as_deref().ok_or("Could not parse SQL")?;
        match parsed {
            [ast::Statement::Query(query)] => self.editable_query(query),
            [_] => Err("Not a SELECT query"),
            _ => Err("Multiple statements"),
        }
    }

    fn editable_query(&self, query: &Query) -> Result<SourceTable, &'static str> {
        if query.with.is_some() {
            return Err("Query uses CTEs");
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err("Query uses set operations");
        };
        if select.into.is_some() {
            return Err("Query creates a table");
        }
        if select.distinct.is_some() {
            return Err("Query uses DISTINCT");
        }
        match &select.group_by {
            GroupByExpr::Expressions(expressions, _) if !expressions.is_empty() => {
                return Err("Query uses GROUP BY");
            }
            GroupByExpr::All(_) => return Err("Query uses GROUP BY ALL"),
            _ => {}
        }
        if select.having.is_some() {
            return Err("Query uses HAVING");
        }

        let [from] = select.from.as_slice() else {
            return Err("Query must have exactly one table in FROM");
        };
        if !from.joins.is_empty() {
            return Err("Query uses JOINs");
        }
        let TableFactor::Table { name, args, .. } = &from.relation else {
            return Err("FROM clause is not a simple table");
        };
        if args.is_some() {
            return Err("FROM clause is a table-valued function");
        }

        let parts = name
            .0
            .iter()
            .map(|part| part.as_ident().map(|ident| self.identifier(ident)))
            .collect::<Option<Vec<_>>>()
            .ok_or("Could not parse table name")?;

        // catalog.schema.table keeps the last two parts
        match parts.as_slice() {
            [table] => Ok(SourceTable {
                schema: None,
                table: table.clone(),
            }),
            [.., schema, table] => Ok(SourceTable {
                schema: Some(schema.clone()),
                table: table.clone(),
            }),
            [] => Err("Could not parse table name"),
        }
    }

    /// Catalog spelling of an identifier: Postgres folds unquoted names to
    /// lower case
    fn identifier(&self, ident: &Ident) -> String {
        match (self.backend, ident.quote_style) {
            (Some(BackendKind::Postgres), None) => ident.value.to_lowercase(),
            _ => ident.value.clone(),
        }
    }
}

/// Classify a script by its most dangerous statement
pub fn classify(sql: &str) -> Classification {
    Analysis::new(sql, None).classification()
}

/// Whether the first query of `sql` has a top-level `ORDER BY`
pub fn has_order_by(sql: &str) -> bool {
    Analysis::new(sql, None).has_order_by()
}

/// Page a lone query on the backend; see [`Analysis::rewrite_for_page`]
pub fn rewrite_for_page(sql: &str, limit: usize, offset: u64) -> Option<String> {
    Analysis::new(sql, None).rewrite_for_page(limit, offset)
}

fn statement_kind(statement: &ast::Statement) -> StatementKind {
    match statement {
        ast::Statement::Query(query) => query_kind(query),
        ast::Statement::Insert { .. } => StatementKind::Insert,
        ast::Statement::Update { .. } => StatementKind::Update,
        ast::Statement::Delete { .. } => StatementKind::Delete,
        ast::Statement::Drop { .. } => StatementKind::Drop,
        ast::Statement::Truncate { .. } => StatementKind::Truncate,
        ast::Statement::AlterTable { .. } | ast::Statement::AlterIndex { .. } => StatementKind::Alter,
        ast::Statement::CreateTable { .. }
        | ast::Statement::CreateIndex { .. }
        | ast::Statement::CreateView { .. }
        | ast::Statement::CreateSchema { .. }
        | ast::Statement::CreateDatabase { .. } => StatementKind::Create,
        // DROP FUNCTION, ALTER ROLE, MERGE and the rest go by their verb
        other => split::statement_kind(&other.to_string()),
    }
}

/// Kind of a query: its body, escalated by any data-modifying CTE
fn query_kind(query: &Query) -> StatementKind {
    let body = set_expr_kind(&query.body);
    let Some(with) = &query.with else {
        return body;
    };

    with.cte_tables
        .iter()
        .map(|cte| query_kind(&cte.query))
        .filter(StatementKind::modifies_data)
        .fold(body, StatementKind::most_dangerous)
}

fn set_expr_kind(body: &SetExpr) -> StatementKind {
    match body {
        // SELECT ... INTO new_table creates a table
        SetExpr::Select(select) if select.into.is_some() => StatementKind::Create,
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => StatementKind::Select,
        SetExpr::Query(query) => query_kind(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_kind(left).most_dangerous(set_expr_kind(right))
        }
        SetExpr::Insert(statement) | SetExpr::Update(statement) => statement_kind(statement),
        other => split::statement_kind(&other.to_string()),
    }
}

/// How strongly a statement must be confirmed before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Confirmation {
    None,
    YesNo,
    TypeConnectionName,
}

/// Outcome of the pre-execution safety gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyCheck {
    pub kind: StatementKind,
    pub is_destructive: bool,
    pub is_dangerous_connection: bool,
    pub connection_name: String,
    pub requires_confirmation: bool,
    pub confirmation: Confirmation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
}

impl SafetyCheck {
    /// # Arguments
    ///
    /// * `sql` - Statement or script about to run
    /// * `connection_name` - Profile name, shown in the warning
    /// * `is_dangerous_connection` - Whether the profile is tagged as production
    /// * `backend` - Dialect to parse with, if known
    pub fn check(
        sql: &str,
        connection_name: &str,
        is_dangerous_connection: bool,
        backend: Option<BackendKind>,
    ) -> Self {
        let Classification {
            kind,
            is_destructive,
        } = Analysis::new(sql, backend).classification();

        let requires_confirmation = is_destructive && is_dangerous_connection;
        let confirmation = match (requires_confirmation, kind.is_irreversible()) {
            (false, _) => Confirmation::None,
            (true, true) => Confirmation::TypeConnectionName,
            (true, false) => Confirmation::YesNo,
        };
        let warning_message = requires_confirmation.then(|| {
            format!(
                "You are about to execute a {kind} query on '{connection_name}'.\n\n{}",
                kind.risk_description()
            )
        });

        Self {
            kind,
            is_destructive,
            is_dangerous_connection,
            connection_name: connection_name.to_string(),
            requires_confirmation,
            confirmation,
            warning_message,
        }
    }

    /// The check used when classification is unavailable: nothing to confirm
    pub fn unchecked(connection_name: &str, is_dangerous_connection: bool) -> Self {
        Self {
            kind: StatementKind::Unknown,
            is_destructive: false,
            is_dangerous_connection,
            connection_name: connection_name.to_string(),
            requires_confirmation: false,
            confirmation: Confirmation::None,
            warning_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<StatementKind> {
        Analysis::new(sql, None).kinds()
    }

    fn source(sql: &str, backend: Option<BackendKind>) -> Result<SourceTable, &'static str> {
        Analysis::new(sql, backend).source_table()
    }

    #[test]
    fn test_classify_delete() {
        let classification = classify("DELETE FROM users WHERE id = 1");
        assert_eq!(classification.kind, StatementKind::Delete);
        assert!(classification.is_destructive);
    }

    #[test]
    fn test_destructive_kinds() {
        for (sql, destructive) in [
            ("select 1", false),
            ("INSERT INTO t VALUES (1)", false),
            ("update t set a = 1", true),
            ("DROP TABLE t", true),
            ("truncate t", true),
            ("ALTER TABLE t ADD COLUMN b int", true),
            ("CREATE TABLE t (a int)", false),
            ("EXPLAIN SELECT 1", false),
        ] {
            assert_eq!(classify(sql).is_destructive, destructive, "{sql}");
        }
    }

    #[test]
    fn test_parsed_input_uses_the_syntax_tree() {
        let analysis = Analysis::new("SELECT 'DROP TABLE x; --' AS note FROM t", None);
        assert!(analysis.is_parsed());
        assert_eq!(analysis.kinds(), vec![StatementKind::Select]);

        assert_eq!(kinds("INSERT INTO t SELECT * FROM u"), vec![StatementKind::Insert]);
        assert_eq!(kinds("DROP FUNCTION IF EXISTS f"), vec![StatementKind::Drop]);
        assert_eq!(kinds("CREATE INDEX i ON t (a)"), vec![StatementKind::Create]);
    }

    #[test]
    fn test_unparsable_input_falls_back_to_the_lexer() {
        let analysis = Analysis::new("DELETE FROM t WHERE a = 'oops", None);
        assert!(!analysis.is_parsed());
        assert_eq!(analysis.kinds(), vec![StatementKind::Unknown]);
        assert!(!classify("DROP TABLE 'x").is_destructive);
        assert_eq!(kinds("+"), vec![StatementKind::Unknown]);
    }

    #[test]
    fn test_backend_dialect_is_used() {
        let sqlite = Analysis::new("SELECT `name` FROM `users`", Some(BackendKind::Sqlite));
        assert!(sqlite.is_parsed());

        let postgres = Analysis::new("SELECT payload::jsonb FROM events", Some(BackendKind::Postgres));
        assert!(postgres.is_parsed());
        assert_eq!(postgres.kinds(), vec![StatementKind::Select]);
    }

    #[test]
    fn test_with_uses_main_verb() {
        assert_eq!(kinds("WITH x AS (SELECT 1) SELECT * FROM x"), vec![StatementKind::Select]);
        assert_eq!(
            kinds("WITH gone AS (DELETE FROM t RETURNING *) SELECT * FROM gone"),
            vec![StatementKind::Delete]
        );
        assert_eq!(
            kinds("WITH moved AS (INSERT INTO archive SELECT * FROM t RETURNING *) SELECT * FROM moved"),
            vec![StatementKind::Insert]
        );
    }

    #[test]
    fn test_select_into_creates() {
        assert_eq!(kinds("SELECT * INTO backup FROM t"), vec![StatementKind::Create]);
        assert_eq!(kinds("SELECT (SELECT 1) AS x"), vec![StatementKind::Select]);
        assert_eq!(kinds("(SELECT 1) UNION (SELECT 2)"), vec![StatementKind::Select]);
    }

    #[test]
    fn test_most_dangerous_statement_wins() {
        assert_eq!(classify("SELECT 1; DELETE FROM t; DROP TABLE t").kind, StatementKind::Drop);
        assert_eq!(classify("INSERT INTO t VALUES (1); UPDATE t SET a = 2").kind, StatementKind::Update);
        assert_eq!(classify("BEGIN; SELECT 1; COMMIT").kind, StatementKind::Select);
        assert_eq!(classify("").kind, StatementKind::Unknown);
    }

    #[test]
    fn test_has_order_by() {
        assert!(has_order_by("SELECT * FROM t ORDER BY a"));
        assert!(has_order_by("select * from t order\n  by a desc"));
        assert!(has_order_by("SELECT a FROM t UNION SELECT b FROM u ORDER BY 1"));
        assert!(!has_order_by("SELECT * FROM t"));
        assert!(!has_order_by("SELECT row_number() OVER (ORDER BY a) FROM t"));
        assert!(!has_order_by("SELECT * FROM (SELECT * FROM t ORDER BY a) s"));
        assert!(!has_order_by("SELECT 'ORDER BY' FROM t -- ORDER BY a"));
        assert!(!has_order_by("DELETE FROM t"));
    }

    #[test]
    fn test_rewrite_for_page() {
        assert_eq!(
            rewrite_for_page("SELECT * FROM t;  ", 1000, 2000).as_deref(),
            Some("SELECT * FROM (\nSELECT * FROM t\n) AS sqldesk_page LIMIT 1001 OFFSET 2000")
        );
        assert_eq!(
            rewrite_for_page("SELECT 1 -- note", 10, 0).as_deref(),
            Some("SELECT * FROM (\nSELECT 1 -- note\n) AS sqldesk_page LIMIT 11 OFFSET 0")
        );
        assert_eq!(rewrite_for_page("DELETE FROM t", 1000, 0), None);
        assert_eq!(rewrite_for_page("SELECT * INTO backup FROM t", 1000, 0), None);
        assert_eq!(rewrite_for_page("EXPLAIN SELECT 1", 1000, 0), None);
        assert_eq!(rewrite_for_page("SELECT 1; SELECT 2", 1000, 0), None);
        assert_eq!(rewrite_for_page("SELECT 'open", 1000, 0), None);
    }

    #[test]
    fn test_plain_select_is_editable() {
        assert_eq!(
            source("SELECT * FROM users WHERE id > 3 ORDER BY id", None),
            Ok(SourceTable {
                schema: None,
                table: "users".into()
            })
        );
        assert_eq!(
            source("SELECT id, name FROM app.Users", Some(BackendKind::Postgres)),
            Ok(SourceTable {
                schema: Some("app".into()),
                table: "users".into()
            })
        );
        assert_eq!(
            source("SELECT * FROM \"App\".\"Users\"", Some(BackendKind::Postgres)),
            Ok(SourceTable {
                schema: Some("App".into()),
                table: "Users".into()
            })
        );
        assert_eq!(
            source("SELECT * FROM db.main.items", Some(BackendKind::Sqlite))
                .map(|source| source.schema),
            Ok(Some("main".into()))
        );
    }

    #[test]
    fn test_shaped_results_are_not_editable() {
        for (sql, reason) in [
            ("SELECT DISTINCT a FROM t", "Query uses DISTINCT"),
            ("SELECT a, count(*) FROM t GROUP BY a", "Query uses GROUP BY"),
            ("SELECT count(*) FROM t HAVING count(*) > 1", "Query uses HAVING"),
            ("SELECT * FROM a JOIN b ON a.id = b.id", "Query uses JOINs"),
            ("SELECT * FROM a, b", "Query must have exactly one table in FROM"),
            ("WITH x AS (SELECT 1) SELECT * FROM x", "Query uses CTEs"),
            ("SELECT 1 UNION SELECT 2", "Query uses set operations"),
            ("SELECT * FROM (SELECT 1) s", "FROM clause is not a simple table"),
            ("SELECT * FROM generate_series(1, 3)", "FROM clause is a table-valued function"),
            ("DELETE FROM t", "Not a SELECT query"),
            ("SELECT * FROM a; SELECT * FROM b", "Multiple statements"),
            ("SELECT 'open", "Could not parse SQL"),
        ] {
            assert_eq!(source(sql, Some(BackendKind::Postgres)), Err(reason), "{sql}");
        }
    }

    #[test]
    fn test_safety_check_on_dangerous_connection() {
        let check = SafetyCheck::check("DELETE FROM users WHERE id = 1", "prod-db", true, None);
        assert!(check.requires_confirmation);
        assert_eq!(check.confirmation, Confirmation::YesNo);
        assert_eq!(
            check.warning_message.as_deref(),
            Some("You are about to execute a DELETE query on 'prod-db'.\n\nDELETE will remove rows from the table")
        );

        let check = SafetyCheck::check("DROP TABLE users", "prod-db", true, Some(BackendKind::Postgres));
        assert_eq!(check.confirmation, Confirmation::TypeConnectionName);
    }

    #[test]
    fn test_safety_check_on_safe_connection() {
        let check = SafetyCheck::check("DROP TABLE users", "local", false, Some(BackendKind::Sqlite));
        assert!(check.is_destructive);
        assert!(!check.requires_confirmation);
        assert_eq!(check.confirmation, Confirmation::None);
        assert_eq!(check.warning_message, None);

        let check = SafetyCheck::check("INSERT INTO t VALUES (1)", "prod-db", true, None);
        assert!(!check.requires_confirmation);
    }

    #[test]
    fn test_safety_check_serializes_camel_case() {
        let json = serde_json::to_value(SafetyCheck::check("TRUNCATE t", "p", true, None)).unwrap();
        assert_eq!(json["kind"], "TRUNCATE");
        assert_eq!(json["requiresConfirmation"], true);
        assert_eq!(json["confirmation"], "typeConnectionName");
    }
}
