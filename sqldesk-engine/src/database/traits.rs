//! Database provider trait
//!
//! This trait defines the interface that every backend implementation must
//! provide. A provider owns the connection pool of one opened profile.

use crate::database::{OpenTransaction, PooledConn};
use crate::decode::Cell;
use crate::profile::BackendKind;
use crate::schema::{CellUpdate, ColumnInfo, TableInfo, TableSchema};
use crate::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// What to stream for one execution
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// SQL to run, already rewritten for paging when that was possible
    pub sql: &'a str,

    /// Stop consuming the stream once this many rows were kept
    pub max_rows: usize,

    /// Rows to discard before keeping any, when paging was not pushed down
    pub skip_rows: u64,

    /// A lone statement may be abandoned once the row budget is met; a
    /// script is drained so its later statements still run
    pub single_statement: bool,

    /// Cancelled when the user cancels or a newer query supersedes this one
    pub cancel: &'a CancellationToken,
}

/// Raw outcome of a fetch, before paging is applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fetched {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub rows_affected: u64,
}

/// Backend seam for execution and schema introspection
///
/// Implementations acquire a pooled connection for each call and return it
/// to the pool on every exit path. Calls given an [`OpenTransaction`] run on
/// the connection it holds instead.
#[async_trait]
pub trait DatabaseProvider: Send + Sync + 'static {
    fn backend(&self) -> BackendKind;

    /// Borrow a connection from the pool
    ///
    /// Suspends while the pool is saturated, up to the configured acquire
    /// timeout; the connection goes back to the pool when dropped.
    async fn acquire(&self) -> Result<PooledConn>;

    /// Start a transaction on a connection taken from the pool
    ///
    /// The connection stays out of the pool until the transaction is
    /// committed, rolled back or dropped.
    async fn begin(&self) -> Result<OpenTransaction>;

    /// Run SQL and stream its rows
    ///
    /// # Arguments
    ///
    /// * `request` - SQL, row budget and cancellation token
    /// * `transaction` - Open transaction to run inside, if any
    ///
    /// # Returns
    ///
    /// Columns, decoded rows (at most `request.max_rows`) and the affected row
    /// count, or [`crate::Error::Cancelled`] if the token fired first
    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        transaction: Option<&mut OpenTransaction>,
    ) -> Result<Fetched>;

    /// Have the backend parse and plan SQL without running it
    async fn prepare(&self, sql: &str) -> Result<()>;

    /// Change one cell of the row addressed by its primary key
    ///
    /// The change is kept only if exactly one row matched.
    ///
    /// # Returns
    ///
    /// The number of rows changed (always 1), or
    /// [`crate::Error::NotEditable`] when no row or several rows matched
    async fn update_cell(
        &self,
        update: &CellUpdate,
        transaction: Option<&mut OpenTransaction>,
    ) -> Result<u64>;

    /// List schema names, system schemas excluded
    async fn list_schemas(&self) -> Result<Vec<String>>;

    /// List tables and views of a schema
    ///
    /// # Arguments
    ///
    /// * `schema` - Name of the schema
    async fn list_tables(&self, schema: &str) -> Result<Vec<TableInfo>>;

    /// List the columns of a table or view
    ///
    /// # Arguments
    ///
    /// * `schema` - Name of the schema
    /// * `table` - Name of the table
    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Full structure of a table: columns, indexes and foreign keys
    ///
    /// # Arguments
    ///
    /// * `schema` - Name of the schema
    /// * `table` - Name of the table
    async fn describe_table(&self, schema: &str, table: &str) -> Result<TableSchema>;

    /// Close every pooled connection
    async fn close(&self);
}
