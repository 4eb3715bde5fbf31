//! Database abstraction layer
//!
//! One provider per backend, each owning the pool of an opened profile and
//! implementing streaming execution and catalog introspection.

pub mod traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

// Re-export the main trait
pub use traits::{DatabaseProvider, FetchRequest, Fetched};

use crate::profile::{BackendKind, ConnectionProfile};
use crate::schema::CellUpdate;
use crate::{Error, Result};
use sqlx::pool::PoolConnection;
use tokio_util::sync::CancellationToken;

/// A connection borrowed from a profile's pool
///
/// Dropping it returns the connection to the pool.
pub enum PooledConn {
    #[cfg(feature = "postgres")]
    Postgres(PoolConnection<sqlx::Postgres>),

    #[cfg(feature = "sqlite")]
    Sqlite(PoolConnection<sqlx::Sqlite>),
}

impl PooledConn {
    pub fn backend(&self) -> BackendKind {
        match self {
            #[cfg(feature = "postgres")]
            PooledConn::Postgres(_) => BackendKind::Postgres,
            #[cfg(feature = "sqlite")]
            PooledConn::Sqlite(_) => BackendKind::Sqlite,
        }
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConn").field(&self.backend()).finish()
    }
}

/// A transaction holding one pooled connection until it ends
///
/// Dropping it without committing rolls it back and returns the connection
/// to the pool.
pub enum OpenTransaction {
    #[cfg(feature = "postgres")]
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),

    #[cfg(feature = "sqlite")]
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>),
}

impl OpenTransaction {
    pub fn backend(&self) -> BackendKind {
        match self {
            #[cfg(feature = "postgres")]
            OpenTransaction::Postgres(_) => BackendKind::Postgres,
            #[cfg(feature = "sqlite")]
            OpenTransaction::Sqlite(_) => BackendKind::Sqlite,
        }
    }

    pub async fn commit(self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            OpenTransaction::Postgres(transaction) => transaction.commit().await?,
            #[cfg(feature = "sqlite")]
            OpenTransaction::Sqlite(transaction) => transaction.commit().await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            OpenTransaction::Postgres(transaction) => transaction.rollback().await?,
            #[cfg(feature = "sqlite")]
            OpenTransaction::Sqlite(transaction) => transaction.rollback().await?,
        }
        Ok(())
    }

    #[cfg(feature = "postgres")]
    pub(crate) fn postgres(&mut self) -> Result<&mut sqlx::PgConnection> {
        match self {
            OpenTransaction::Postgres(transaction) => Ok(&mut **transaction),
            #[allow(unreachable_patterns)]
            other => Err(Error::Transaction(format!(
                "the open transaction belongs to a {} connection",
                other.backend()
            ))),
        }
    }

    #[cfg(feature = "sqlite")]
    pub(crate) fn sqlite(&mut self) -> Result<&mut sqlx::SqliteConnection> {
        match self {
            OpenTransaction::Sqlite(transaction) => Ok(&mut **transaction),
            #[allow(unreachable_patterns)]
            other => Err(Error::Transaction(format!(
                "the open transaction belongs to a {} connection",
                other.backend()
            ))),
        }
    }
}

impl std::fmt::Debug for OpenTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OpenTransaction").field(&self.backend()).finish()
    }
}

/// Names a connection in connect errors
#[derive(Debug, Clone)]
pub struct ConnectionLabel {
    pub profile: String,
    pub target: String,
}

impl ConnectionLabel {
    pub fn new(profile: &ConnectionProfile) -> Self {
        Self {
            profile: profile.name.clone(),
            target: profile.target_description(),
        }
    }

    pub fn connect_failed(&self, cause: impl std::fmt::Display) -> Error {
        Error::ConnectFailed {
            profile: self.profile.clone(),
            target: self.target.clone(),
            cause: cause.to_string(),
        }
    }
}

/// Acquire from a pool unless the token fires first
pub(crate) async fn acquire_cancellable<DB: sqlx::Database>(
    pool: &sqlx::Pool<DB>,
    label: &ConnectionLabel,
    cancel: &CancellationToken,
) -> Result<PoolConnection<DB>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        acquired = pool.acquire() => acquired.map_err(|error| label.connect_failed(error)),
    }
}

/// Keeps the rows of one fetch within its budget
///
/// Rows are kept raw so backends can resolve column types after the stream
/// has released the connection. Only the first result set that produced rows
/// is kept; later result sets of a script are consumed for their effects.
pub(crate) struct RowCollector<R> {
    max_rows: usize,
    skip_rows: u64,
    single_statement: bool,
    skipped: u64,
    rows: Vec<R>,
    rows_affected: u64,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Stop,
}

impl<R> RowCollector<R> {
    pub fn new(request: &FetchRequest<'_>) -> Self {
        Self {
            max_rows: request.max_rows,
            skip_rows: request.skip_rows,
            single_statement: request.single_statement,
            skipped: 0,
            rows: Vec::with_capacity(request.max_rows.min(4096)),
            rows_affected: 0,
            closed: false,
        }
    }

    pub fn push_row(&mut self, row: R) -> Step {
        if self.closed || self.rows.len() >= self.max_rows {
            return self.when_full();
        }
        if self.skipped < self.skip_rows {
            self.skipped += 1;
            return Step::Continue;
        }

        self.rows.push(row);
        if self.rows.len() >= self.max_rows {
            self.when_full()
        } else {
            Step::Continue
        }
    }

    /// A statement finished
    pub fn push_done(&mut self, rows_affected: u64) {
        self.rows_affected += rows_affected;
        if !self.rows.is_empty() || self.skipped > 0 {
            self.closed = true;
        }
    }

    fn when_full(&self) -> Step {
        if self.single_statement {
            Step::Stop
        } else {
            Step::Continue
        }
    }

    pub fn finish(self) -> (Vec<R>, u64) {
        (self.rows, self.rows_affected)
    }
}

/// Names and declared type names of result columns
pub(crate) fn column_names_and_types<C: sqlx::Column>(columns: &[C]) -> (Vec<String>, Vec<String>) {
    use sqlx::TypeInfo;

    columns
        .iter()
        .map(|column| {
            (
                column.name().to_string(),
                column.type_info().name().to_string(),
            )
        })
        .unzip()
}

/// Quote an identifier (schema, table or column name)
///
/// Double quotes inside the identifier are escaped by doubling them.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Reject identifiers no catalog can hold before they reach a query
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(Error::InvalidIdentifier("empty identifier".to_string()));
    }
    if identifier.contains('\0') {
        return Err(Error::InvalidIdentifier(format!(
            "{:?} contains a NUL character",
            identifier
        )));
    }
    Ok(())
}

/// An UPDATE of one cell, keyed by the row's primary key
///
/// `placeholder(n, column)` renders the n-th (1-based) bind parameter for a
/// column; parameters are the new value followed by the key values, in
/// `update.primary_key` order.
pub(crate) fn cell_update_statement(
    update: &CellUpdate,
    mut placeholder: impl FnMut(usize, &str) -> String,
) -> Result<String> {
    validate_identifier(&update.schema)?;
    validate_identifier(&update.table)?;
    validate_identifier(&update.column)?;
    if update.primary_key.is_empty() {
        return Err(Error::NotEditable(format!(
            "{}.{} has no primary key to address the row",
            update.schema, update.table
        )));
    }

    let mut statement = format!(
        "UPDATE {}.{} SET {} = {} WHERE ",
        quote_identifier(&update.schema),
        quote_identifier(&update.table),
        quote_identifier(&update.column),
        placeholder(1, &update.column),
    );
    for (position, key) in update.primary_key.iter().enumerate() {
        validate_identifier(&key.column)?;
        if position > 0 {
            statement.push_str(" AND ");
        }
        statement.push_str(&format!(
            "{} = {}",
            quote_identifier(&key.column),
            placeholder(position + 2, &key.column)
        ));
    }
    Ok(statement)
}

/// Every column a cell update names must exist on its table
pub(crate) fn check_update_columns(update: &CellUpdate, exists: impl Fn(&str) -> bool) -> Result<()> {
    let columns = std::iter::once(&update.column)
        .chain(update.primary_key.iter().map(|key| &key.column));
    for column in columns {
        if !exists(column) {
            return Err(Error::NotEditable(format!(
                "{}.{} has no column {column:?}",
                update.schema, update.table
            )));
        }
    }
    Ok(())
}

/// Accept a cell update only when its key matched exactly one row
pub(crate) fn single_row(affected: u64) -> Result<u64> {
    match affected {
        1 => Ok(1),
        0 => Err(Error::NotEditable(
            "no row was updated; it may have been changed or deleted".to_string(),
        )),
        n => Err(Error::NotEditable(format!(
            "the key matched {n} rows; nothing was changed"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::KeyValue;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("user\"s"), "\"user\"\"s\"");
        assert_eq!(quote_identifier("my table"), "\"my table\"");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("weird \"name\"; --").is_ok());
        assert!(matches!(
            validate_identifier(""),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(matches!(
            validate_identifier("bad\0name"),
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_connect_failed_carries_label() {
        let label = ConnectionLabel::new(&ConnectionProfile::sqlite("local", "/nope.db"));
        match label.connect_failed("file not found") {
            Error::ConnectFailed {
                profile,
                target,
                cause,
            } => {
                assert_eq!(profile, "local");
                assert_eq!(target, "sqlite:/nope.db");
                assert_eq!(cause, "file not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn update(primary_key: &[(&str, &str)]) -> CellUpdate {
        CellUpdate {
            schema: "main".into(),
            table: "order items".into(),
            column: "qty".into(),
            value: Some("3".into()),
            primary_key: primary_key
                .iter()
                .map(|(column, value)| KeyValue {
                    column: column.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_cell_update_statement() {
        let statement =
            cell_update_statement(&update(&[("order_id", "1"), ("line", "2")]), |n, _| format!("?{n}"))
                .unwrap();
        assert_eq!(
            statement,
            "UPDATE \"main\".\"order items\" SET \"qty\" = ?1 WHERE \"order_id\" = ?2 AND \"line\" = ?3"
        );
    }

    #[test]
    fn test_cell_update_needs_a_key() {
        assert!(matches!(
            cell_update_statement(&update(&[]), |n, _| format!("${n}")),
            Err(Error::NotEditable(_))
        ));
        assert!(matches!(
            cell_update_statement(&update(&[("", "1")]), |n, _| format!("${n}")),
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_update_columns_must_exist() {
        let known = ["order_id", "line", "qty"];
        let exists = |column: &str| known.contains(&column);
        check_update_columns(&update(&[("order_id", "1"), ("line", "2")]), exists).unwrap();

        let error = check_update_columns(&update(&[("sku", "A-1")]), exists).unwrap_err();
        assert!(matches!(error, Error::NotEditable(_)));
        assert!(error.to_string().contains("sku"));

        let none = |_: &str| false;
        assert!(matches!(
            check_update_columns(&update(&[("order_id", "1")]), none),
            Err(Error::NotEditable(_))
        ));
    }

    #[test]
    fn test_single_row() {
        assert_eq!(single_row(1).unwrap(), 1);
        assert!(matches!(single_row(0), Err(Error::NotEditable(_))));
        assert!(matches!(single_row(2), Err(Error::NotEditable(_))));
    }

    fn collector(max_rows: usize, skip_rows: u64, single_statement: bool) -> RowCollector<u32> {
        let cancel = CancellationToken::new();
        RowCollector::new(&FetchRequest {
            sql: "",
            max_rows,
            skip_rows,
            single_statement,
            cancel: &cancel,
        })
    }

    #[test]
    fn test_collector_stops_single_statement_at_budget() {
        let mut rows = collector(3, 0, true);
        assert_eq!(rows.push_row(1), Step::Continue);
        assert_eq!(rows.push_row(2), Step::Continue);
        assert_eq!(rows.push_row(3), Step::Stop);
        assert_eq!(rows.finish().0, vec![1, 2, 3]);
    }

    #[test]
    fn test_collector_skips_offset_rows() {
        let mut rows = collector(2, 3, true);
        for row in 0..10 {
            if rows.push_row(row) == Step::Stop {
                break;
            }
        }
        assert_eq!(rows.finish().0, vec![3, 4]);
    }

    #[test]
    fn test_collector_drains_scripts() {
        let mut rows = collector(2, 0, false);
        rows.push_row(1);
        assert_eq!(rows.push_row(2), Step::Continue);
        assert_eq!(rows.push_row(3), Step::Continue);
        rows.push_done(0);
        rows.push_done(5);
        assert_eq!(rows.push_row(99), Step::Continue);
        rows.push_done(2);

        let (kept, affected) = rows.finish();
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(affected, 7);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_acquire_cancellable_observes_token() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let label = ConnectionLabel::new(&ConnectionProfile::sqlite("mem", ":memory:"));
        let token = CancellationToken::new();

        let held = acquire_cancellable(&pool, &label, &token).await.unwrap();
        token.cancel();
        assert!(matches!(
            acquire_cancellable(&pool, &label, &token).await,
            Err(Error::Cancelled)
        ));
        drop(held);
    }
}
