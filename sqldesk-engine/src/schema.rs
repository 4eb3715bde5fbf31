//! Serializable types returned to the UI
//!
//! Result pages from the executor and the structures discovered by schema
//! introspection.

use crate::classify::StatementKind;
use crate::decode::Cell;
use crate::profile::{BackendKind, ConnectionProfile, Environment};
use serde::{Deserialize, Serialize};

/// One page of results from executing a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Column names in result order
    pub columns: Vec<String>,

    /// Declared column type names, parallel to `columns`
    pub column_types: Vec<String>,

    /// Decoded rows; NULL is [`Cell::Null`], never an empty string
    pub rows: Vec<Vec<Cell>>,

    /// Number of rows in this page, always `rows.len()`
    pub row_count: usize,

    /// Wall-clock execution time in milliseconds
    pub execution_time_ms: u64,

    /// Set when the page is full and more rows exist
    pub truncated: bool,

    /// Whether the SQL carries a top-level `ORDER BY`; without one, pages may
    /// drift between requests
    pub has_order_by: bool,

    /// Rows changed by a statement that returned no columns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,

    /// Index of the first row of this page
    pub offset: u64,

    /// Kind of the most dangerous statement that ran
    pub kind: StatementKind,
}

/// A table or view (for the schema tree)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub is_view: bool,
}

/// Information about a single column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    /// Column name
    pub name: String,

    /// Declared type as written in the catalog (e.g., "integer", "varchar(255)")
    pub data_type: String,

    /// Whether the column allows NULL values
    pub nullable: bool,

    /// Default value expression (if any)
    pub default_value: Option<String>,

    /// Whether this column is part of the primary key
    pub is_primary_key: bool,
}

/// Index information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    /// Index name
    pub name: String,

    /// Columns covered by the index, in index order
    pub columns: Vec<String>,

    /// Whether the index enforces uniqueness
    pub unique: bool,

    /// Whether the index backs the primary key
    pub is_primary: bool,
}

/// Foreign key constraint, possibly spanning several columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    /// Constraint name
    pub name: String,

    /// Referencing columns in this table
    pub columns: Vec<String>,

    /// Schema of the referenced table, when the backend has schemas
    pub references_schema: Option<String>,

    /// Referenced table name
    pub references_table: String,

    /// Referenced columns, parallel to `columns`
    pub references_columns: Vec<String>,
}

/// Complete structure of a table or view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub is_view: bool,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Primary key column names in declaration order
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|column| column.is_primary_key)
            .map(|column| column.name.as_str())
            .collect()
    }
}

/// One primary key column of the row being edited, with its displayed value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub column: String,
    pub value: String,
}

/// A single-cell edit from the result grid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdate {
    pub schema: String,
    pub table: String,
    pub column: String,

    /// New display text; `None` stores NULL
    pub value: Option<String>,

    /// Addresses exactly one row
    pub primary_key: Vec<KeyValue>,
}

/// Whether a result can be edited in place, and against which table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditableInfo {
    pub editable: bool,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub primary_key: Vec<String>,
    /// Why the result is read-only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EditableInfo {
    pub fn read_only(reason: impl Into<String>) -> Self {
        Self {
            editable: false,
            schema: None,
            table: None,
            primary_key: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// A live connection as reported by `list_open`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenConnection {
    pub name: String,
    pub backend: BackendKind,
    /// Number of `open` calls not yet matched by a `close`
    pub ref_count: usize,
    pub tunneled: bool,
}

/// A saved profile together with its derived classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    #[serde(flatten)]
    pub profile: ConnectionProfile,
    pub environment: Environment,
    pub is_dangerous: bool,
}

impl From<ConnectionProfile> for ProfileSummary {
    fn from(profile: ConnectionProfile) -> Self {
        Self {
            environment: profile.environment(),
            is_dangerous: profile.is_dangerous(),
            profile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_result_serializes_null_cells() {
        let result = QueryResult {
            columns: vec!["a".into(), "b".into()],
            column_types: vec!["TEXT".into(), "TEXT".into()],
            rows: vec![vec![Cell::Null, Cell::Text(String::new())]],
            row_count: 1,
            execution_time_ms: 3,
            truncated: false,
            has_order_by: false,
            affected_rows: None,
            offset: 0,
            kind: StatementKind::Select,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["rows"][0][0], serde_json::Value::Null);
        assert_eq!(json["rows"][0][1], "");
        assert_eq!(json["columnTypes"][0], "TEXT");
        assert!(json.get("affectedRows").is_none());
    }

    #[test]
    fn test_cell_update_accepts_null_value() {
        let update: CellUpdate = serde_json::from_value(serde_json::json!({
            "schema": "public",
            "table": "users",
            "column": "email",
            "value": null,
            "primaryKey": [{"column": "id", "value": "7"}]
        }))
        .unwrap();
        assert_eq!(update.value, None);
        assert_eq!(update.primary_key[0].value, "7");
    }

    #[test]
    fn test_profile_summary_flattens_profile() {
        let summary = ProfileSummary::from(
            ConnectionProfile::sqlite("local", "/tmp/a.db").with_tags(["prod"]),
        );
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["name"], "local");
        assert_eq!(json["type"], "sqlite");
        assert_eq!(json["environment"], "production");
        assert_eq!(json["isDangerous"], true);
    }
}
