//! Transactions pinned to sessions
//!
//! `BEGIN` takes a connection out of the pool and keeps it for the session
//! until `COMMIT` or `ROLLBACK`. Every query of the session runs on that
//! connection meanwhile, one at a time.

use crate::database::OpenTransaction;
use crate::session::SessionId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, MutexGuard};

/// How a transaction ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Rollback,
}

/// A session's open transaction
///
/// The slot is emptied when the transaction ends, so a query that was
/// waiting for it finds nothing to run on instead of a stale connection.
#[derive(Debug, Clone)]
pub struct PinnedTransaction {
    connection: String,
    slot: Arc<Mutex<Option<OpenTransaction>>>,
}

impl PinnedTransaction {
    /// Name of the connection the transaction was started on
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Wait for the queries ahead of us, then hold the transaction
    pub async fn lock(&self) -> MutexGuard<'_, Option<OpenTransaction>> {
        self.slot.lock().await
    }

    /// Commit or roll back
    pub async fn end(&self, outcome: Outcome) -> Result<()> {
        let transaction = self
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Transaction("the transaction has already ended".to_string()))?;
        match outcome {
            Outcome::Commit => transaction.commit().await,
            Outcome::Rollback => transaction.rollback().await,
        }
    }

    /// Roll back and hand the connection back, logging instead of failing
    pub async fn discard(&self) {
        if let Err(error) = self.end(Outcome::Rollback).await {
            tracing::warn!(connection = %self.connection, %error, "Could not roll back discarded transaction");
        }
    }
}

/// Open transactions by session
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    open: std::sync::Mutex<HashMap<SessionId, PinnedTransaction>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, PinnedTransaction>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin a transaction to a session
    ///
    /// # Returns
    ///
    /// [`Error::Transaction`] when the session already has one; the new
    /// transaction is then dropped, which rolls it back
    pub fn pin(&self, session: &SessionId, connection: &str, transaction: OpenTransaction) -> Result<()> {
        let mut open = self.open();
        if open.contains_key(session) {
            return Err(Error::Transaction(format!(
                "session '{session}' already has an open transaction"
            )));
        }
        open.insert(
            session.clone(),
            PinnedTransaction {
                connection: connection.to_string(),
                slot: Arc::new(Mutex::new(Some(transaction))),
            },
        );
        Ok(())
    }

    pub fn get(&self, session: &SessionId) -> Option<PinnedTransaction> {
        self.open().get(session).cloned()
    }

    /// Unpin a session's transaction; ending it is up to the caller
    pub fn take(&self, session: &SessionId) -> Option<PinnedTransaction> {
        self.open().remove(session)
    }

    pub fn is_open(&self, session: &SessionId) -> bool {
        self.open().contains_key(session)
    }

    /// Unpin every transaction started on `connection`
    pub fn take_connection(&self, connection: &str) -> Vec<PinnedTransaction> {
        let mut open = self.open();
        let sessions: Vec<SessionId> = open
            .iter()
            .filter(|(_, pinned)| pinned.connection == connection)
            .map(|(session, _)| session.clone())
            .collect();
        sessions
            .iter()
            .filter_map(|session| open.remove(session))
            .collect()
    }

    /// Unpin every transaction
    pub fn take_all(&self) -> Vec<PinnedTransaction> {
        self.open().drain().map(|(_, pinned)| pinned).collect()
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::database::{DatabaseProvider, FetchRequest};
    use crate::decode::Cell;
    use crate::profile::ConnectionProfile;
    use crate::SqliteProvider;
    use tokio_util::sync::CancellationToken;

    async fn provider() -> SqliteProvider {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();
        let label = crate::database::ConnectionLabel::new(&ConnectionProfile::sqlite("mem", ":memory:"));
        SqliteProvider::new(pool, label)
    }

    async fn count(provider: &SqliteProvider, transaction: Option<&mut OpenTransaction>) -> Cell {
        let cancel = CancellationToken::new();
        let fetched = provider
            .fetch(
                FetchRequest {
                    sql: "SELECT count(*) FROM t",
                    max_rows: 1,
                    skip_rows: 0,
                    single_statement: true,
                    cancel: &cancel,
                },
                transaction,
            )
            .await
            .unwrap();
        fetched.rows[0][0].clone()
    }

    #[tokio::test]
    async fn test_one_transaction_per_session() {
        let provider = provider().await;
        let registry = TransactionRegistry::new();
        let session = SessionId::new("tab-1");

        registry.pin(&session, "mem", provider.begin().await.unwrap()).unwrap();
        assert!(registry.is_open(&session));
        assert_eq!(registry.get(&session).unwrap().connection(), "mem");

        // The pool has a single connection and the pinned transaction holds it
        let second = tokio::time::timeout(std::time::Duration::from_millis(200), provider.begin()).await;
        assert!(second.is_err());

        let pinned = registry.take(&session).unwrap();
        pinned.end(Outcome::Commit).await.unwrap();
        assert!(matches!(
            pinned.end(Outcome::Commit).await,
            Err(Error::Transaction(_))
        ));
        assert!(!registry.is_open(&session));
    }

    #[tokio::test]
    async fn test_discard_rolls_back() {
        let provider = provider().await;
        let registry = TransactionRegistry::new();
        let session = SessionId::new("tab-1");
        registry.pin(&session, "mem", provider.begin().await.unwrap()).unwrap();

        let pinned = registry.get(&session).unwrap();
        {
            let mut slot = pinned.lock().await;
            let cancel = CancellationToken::new();
            provider
                .fetch(
                    FetchRequest {
                        sql: "DELETE FROM t",
                        max_rows: 1,
                        skip_rows: 0,
                        single_statement: true,
                        cancel: &cancel,
                    },
                    slot.as_mut(),
                )
                .await
                .unwrap();
            assert_eq!(count(&provider, slot.as_mut()).await, Cell::Text("0".into()));
        }

        let taken = registry.take_connection("mem");
        assert_eq!(taken.len(), 1);
        taken[0].discard().await;
        assert!(registry.take_all().is_empty());
        assert_eq!(count(&provider, None).await, Cell::Text("1".into()));
    }
}
