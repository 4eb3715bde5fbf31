//! Query executor
//!
//! Runs user SQL against a live connection and cuts the result into pages.
//! A lone SELECT-shaped statement is wrapped so the backend applies
//! `LIMIT page+1 OFFSET n` itself; everything else streams with an early stop
//! and skips the offset rows on the client. One row beyond the page is read
//! as a lookahead: if it arrives the page is marked truncated and the extra
//! row is dropped.

use crate::classify::Analysis;
use crate::database::{DatabaseProvider, FetchRequest, Fetched, OpenTransaction};
use crate::schema::QueryResult;
use crate::{Error, Result};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// One page to produce
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub sql: &'a str,
    /// Index of the first row of the page
    pub offset: u64,
    /// Rows per page
    pub row_limit: usize,
    pub cancel: &'a CancellationToken,
}

/// Execute SQL and return one page of its result
///
/// # Arguments
///
/// * `provider` - Backend of the session's live connection
/// * `page` - SQL, page position and size, cancellation token
/// * `transaction` - The session's open transaction, if any
///
/// # Returns
///
/// The page, or [`Error::Cancelled`] if the token fired at any point; a
/// cancelled query never yields a partial page
pub async fn execute(
    provider: &dyn DatabaseProvider,
    page: PageRequest<'_>,
    transaction: Option<&mut OpenTransaction>,
) -> Result<QueryResult> {
    let started = Instant::now();
    if page.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let analysis = Analysis::new(page.sql, Some(provider.backend()));
    let kind = analysis.classification().kind;
    let single_statement = analysis.statement_count() <= 1;
    let row_limit = page.row_limit.max(1);
    let lookahead = row_limit.saturating_add(1);

    // A failed statement aborts a Postgres transaction, so inside one the
    // statement runs exactly as written
    let fetched = match transaction {
        Some(transaction) => {
            provider
                .fetch(unwrapped(&page, lookahead, single_statement), Some(transaction))
                .await?
        }
        None => match analysis.rewrite_for_page(row_limit, page.offset) {
            Some(paged) => fetch_paged(provider, &page, &paged, lookahead).await?,
            None => {
                provider
                    .fetch(unwrapped(&page, lookahead, single_statement), None)
                    .await?
            }
        },
    };

    if page.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut rows = fetched.rows;
    let truncated = rows.len() > row_limit;
    rows.truncate(row_limit);

    let affected_rows = fetched.columns.is_empty().then_some(fetched.rows_affected);

    Ok(QueryResult {
        row_count: rows.len(),
        columns: fetched.columns,
        column_types: fetched.column_types,
        rows,
        execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        truncated,
        has_order_by: analysis.has_order_by(),
        affected_rows,
        offset: page.offset,
        kind,
    })
}

/// Run the wrapped statement
///
/// The wrapper can be rejected where the statement alone is fine (e.g.
/// duplicate column names). Only then does the statement run again,
/// unwrapped; any other failure is reported as is, so nothing runs twice.
async fn fetch_paged(
    provider: &dyn DatabaseProvider,
    page: &PageRequest<'_>,
    paged: &str,
    lookahead: usize,
) -> Result<Fetched> {
    tracing::debug!(offset = page.offset, "Paging pushed down to the backend");
    let pushed_down = provider
        .fetch(
            FetchRequest {
                sql: paged,
                max_rows: lookahead,
                skip_rows: 0,
                single_statement: true,
                cancel: page.cancel,
            },
            None,
        )
        .await;

    match pushed_down {
        Err(Error::SyntaxOrRuntimeError { message }) => {
            let wrapper_rejected =
                provider.prepare(paged).await.is_err() && provider.prepare(page.sql).await.is_ok();
            if !wrapper_rejected {
                return Err(Error::SyntaxOrRuntimeError { message });
            }
            tracing::debug!(%message, "Paged statement rejected, running it unwrapped");
            provider.fetch(unwrapped(page, lookahead, true), None).await
        }
        other => other,
    }
}

fn unwrapped<'a>(
    page: &PageRequest<'a>,
    lookahead: usize,
    single_statement: bool,
) -> FetchRequest<'a> {
    FetchRequest {
        sql: page.sql,
        max_rows: lookahead,
        skip_rows: page.offset,
        single_statement,
        cancel: page.cancel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::StatementKind;
    use crate::database::PooledConn;
    use crate::decode::Cell;
    use crate::profile::BackendKind;
    use crate::schema::{CellUpdate, ColumnInfo, TableInfo, TableSchema};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves `total` numbered rows and records every request it gets
    struct Numbers {
        total: u64,
        /// The backend refuses to plan the paging wrapper
        reject_wrapped: bool,
        /// Every statement fails to plan and to run
        fail_all: bool,
        /// Statements plan fine but fail while running
        fail_at_runtime: bool,
        requests: Mutex<Vec<(String, usize, u64, bool)>>,
    }

    impl Numbers {
        fn new(total: u64) -> Self {
            Self {
                total,
                reject_wrapped: false,
                fail_all: false,
                fail_at_runtime: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<(String, usize, u64, bool)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DatabaseProvider for Numbers {
        fn backend(&self) -> BackendKind {
            BackendKind::Sqlite
        }

        async fn acquire(&self) -> Result<PooledConn> {
            Err(Error::NotConnected("test provider".into()))
        }

        async fn begin(&self) -> Result<OpenTransaction> {
            Err(Error::NotConnected("test provider".into()))
        }

        async fn prepare(&self, sql: &str) -> Result<()> {
            if self.fail_all || (self.reject_wrapped && sql.contains("sqldesk_page")) {
                return Err(Error::SyntaxOrRuntimeError {
                    message: "cannot plan statement".into(),
                });
            }
            Ok(())
        }

        async fn update_cell(
            &self,
            _update: &CellUpdate,
            _transaction: Option<&mut OpenTransaction>,
        ) -> Result<u64> {
            Err(Error::NotEditable("test provider".into()))
        }

        async fn fetch(
            &self,
            request: FetchRequest<'_>,
            _transaction: Option<&mut OpenTransaction>,
        ) -> Result<Fetched> {
            self.requests.lock().unwrap().push((
                request.sql.to_string(),
                request.max_rows,
                request.skip_rows,
                request.single_statement,
            ));
            if request.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if self.fail_all || self.fail_at_runtime {
                return Err(Error::SyntaxOrRuntimeError {
                    message: "division by zero".into(),
                });
            }
            let wrapped = request.sql.contains("sqldesk_page");
            if wrapped && self.reject_wrapped {
                return Err(Error::SyntaxOrRuntimeError {
                    message: "duplicate column name".into(),
                });
            }
            if request.sql.starts_with("UPDATE") {
                return Ok(Fetched {
                    rows_affected: 7,
                    ..Fetched::default()
                });
            }

            // The wrapped form carries its own OFFSET; emulate it
            let offset = if wrapped {
                request
                    .sql
                    .rsplit("OFFSET ")
                    .next()
                    .and_then(|n| n.trim().parse::<u64>().ok())
                    .unwrap_or(0)
            } else {
                0
            };

            let rows = (offset..self.total)
                .skip(request.skip_rows as usize)
                .take(request.max_rows)
                .map(|n| vec![Cell::Text(n.to_string())])
                .collect();

            Ok(Fetched {
                columns: vec!["n".into()],
                column_types: vec!["INTEGER".into()],
                rows,
                rows_affected: 0,
            })
        }

        async fn list_schemas(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn list_tables(&self, _schema: &str) -> Result<Vec<TableInfo>> {
            Ok(Vec::new())
        }

        async fn list_columns(&self, _schema: &str, _table: &str) -> Result<Vec<ColumnInfo>> {
            Ok(Vec::new())
        }

        async fn describe_table(&self, schema: &str, table: &str) -> Result<TableSchema> {
            Err(Error::introspection(format!("no such table: {schema}.{table}")))
        }

        async fn close(&self) {}
    }

    fn page<'a>(sql: &'a str, offset: u64, cancel: &'a CancellationToken) -> PageRequest<'a> {
        PageRequest {
            sql,
            offset,
            row_limit: 10,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_full_page_is_truncated() {
        let provider = Numbers::new(25);
        let cancel = CancellationToken::new();
        let result = execute(&provider, page("SELECT n FROM numbers", 0, &cancel), None)
            .await
            .unwrap();

        assert_eq!(result.row_count, 10);
        assert_eq!(result.rows.len(), 10);
        assert!(result.truncated);
        assert_eq!(result.rows[9], vec![Cell::Text("9".into())]);
        assert_eq!(result.kind, StatementKind::Select);
        assert_eq!(result.affected_rows, None);

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].0.ends_with("LIMIT 11 OFFSET 0"));
        assert_eq!(requests[0].1, 11);
    }

    #[tokio::test]
    async fn test_last_page_is_not_truncated() {
        let provider = Numbers::new(25);
        let cancel = CancellationToken::new();
        let result = execute(&provider, page("SELECT n FROM numbers;", 20, &cancel), None)
            .await
            .unwrap();

        assert_eq!(result.row_count, 5);
        assert!(!result.truncated);
        assert_eq!(result.offset, 20);
        assert_eq!(result.rows[0], vec![Cell::Text("20".into())]);
    }

    #[tokio::test]
    async fn test_exactly_one_page_is_not_truncated() {
        let provider = Numbers::new(10);
        let cancel = CancellationToken::new();
        let result = execute(&provider, page("SELECT n FROM numbers", 0, &cancel), None)
            .await
            .unwrap();
        assert_eq!(result.row_count, 10);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_scripts_page_on_the_client() {
        let provider = Numbers::new(25);
        let cancel = CancellationToken::new();
        let result = execute(
            &provider,
            page("CREATE TEMP TABLE x (a); SELECT n FROM numbers", 10, &cancel),
            None,
        )
        .await
        .unwrap();

        let requests = provider.requests();
        assert!(!requests[0].0.contains("sqldesk_page"));
        assert_eq!(requests[0].2, 10);
        assert!(!requests[0].3);
        assert_eq!(result.rows[0], vec![Cell::Text("10".into())]);
        assert!(result.truncated);
        assert_eq!(result.kind, StatementKind::Create);
    }

    #[tokio::test]
    async fn test_rejected_wrapper_falls_back() {
        let mut provider = Numbers::new(3);
        provider.reject_wrapped = true;
        let cancel = CancellationToken::new();
        let result = execute(&provider, page("SELECT n, n FROM numbers", 1, &cancel), None)
            .await
            .unwrap();

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].0, "SELECT n, n FROM numbers");
        assert_eq!(requests[1].2, 1);
        assert_eq!(result.row_count, 2);
    }

    #[tokio::test]
    async fn test_failing_select_runs_once() {
        let mut provider = Numbers::new(3);
        provider.fail_all = true;
        let cancel = CancellationToken::new();
        let result = execute(&provider, page("SELECT n / 0 FROM numbers", 0, &cancel), None).await;

        match result {
            Err(Error::SyntaxOrRuntimeError { message }) => assert_eq!(message, "division by zero"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_runtime_error_is_not_retried_unwrapped() {
        let mut provider = Numbers::new(3);
        provider.fail_at_runtime = true;
        let cancel = CancellationToken::new();
        let result = execute(&provider, page("SELECT n / 0 FROM numbers", 0, &cancel), None).await;

        assert!(matches!(result, Err(Error::SyntaxOrRuntimeError { .. })));
        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].0.contains("sqldesk_page"));
    }

    #[tokio::test]
    async fn test_dml_reports_affected_rows() {
        let provider = Numbers::new(0);
        let cancel = CancellationToken::new();
        let result = execute(&provider, page("UPDATE numbers SET n = n + 1", 0, &cancel), None)
            .await
            .unwrap();

        assert!(result.columns.is_empty());
        assert_eq!(result.affected_rows, Some(7));
        assert_eq!(result.kind, StatementKind::Update);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = Numbers::new(5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = execute(&provider, page("SELECT n FROM numbers", 0, &cancel), None).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_order_by_hint() {
        let provider = Numbers::new(5);
        let cancel = CancellationToken::new();
        let ordered = execute(&provider, page("SELECT n FROM numbers ORDER BY n", 0, &cancel), None)
            .await
            .unwrap();
        let unordered = execute(&provider, page("SELECT n FROM numbers", 0, &cancel), None)
            .await
            .unwrap();
        assert!(ordered.has_order_by);
        assert!(!unordered.has_order_by);
    }
}
