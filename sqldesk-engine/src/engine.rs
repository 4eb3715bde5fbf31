//! Engine facade
//!
//! [`Engine`] ties the profile store, the pool manager, the session registry
//! and the sessions' open transactions together and exposes the operations a
//! UI adapter calls.

use crate::classify::{Analysis, SafetyCheck};
use crate::completion::Completions;
use crate::config::EngineConfig;
use crate::database::DatabaseProvider;
use crate::executor::{self, PageRequest};
use crate::pool::{LiveConnection, PoolManager};
use crate::profile::{
    ConnectionProfile, ConnectionSecrets, InMemoryProfileStore, InMemorySettingsStore,
    ProfileStore, SettingsStore,
};
use crate::profile::BackendKind;
use crate::schema::{
    CellUpdate, ColumnInfo, EditableInfo, OpenConnection, ProfileSummary, QueryResult, TableInfo,
    TableSchema,
};
use crate::session::{SessionId, SessionRegistry};
use crate::transaction::{Outcome, PinnedTransaction, TransactionRegistry};
use crate::{Error, Result};
use std::sync::Arc;

/// The SQL client engine
pub struct Engine {
    config: EngineConfig,
    profiles: Arc<dyn ProfileStore>,
    settings: Arc<dyn SettingsStore>,
    pools: PoolManager,
    sessions: SessionRegistry,
    transactions: TransactionRegistry,
}

impl Engine {
    /// Create an engine over the given stores
    ///
    /// # Arguments
    ///
    /// * `config` - Page size, pool sizing and timeouts
    /// * `profiles` - Saved connection profiles and their credentials
    /// * `settings` - UI preferences, passed through untouched
    pub fn new(
        config: EngineConfig,
        profiles: Arc<dyn ProfileStore>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            pools: PoolManager::new(config.clone()),
            sessions: SessionRegistry::new(),
            transactions: TransactionRegistry::new(),
            config,
            profiles,
            settings,
        }
    }

    /// An engine whose profiles and settings live only in memory
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(InMemorySettingsStore::new()),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Connection lifecycle

    async fn profile(&self, name: &str) -> Result<ConnectionProfile> {
        self.profiles
            .get(name)
            .await?
            .ok_or_else(|| Error::ProfileNotFound(name.to_string()))
    }

    /// Open a saved profile, or take another reference on it
    pub async fn open(&self, name: &str) -> Result<OpenConnection> {
        let profile = self.profile(name).await?;
        let secrets = self.profiles.secrets(name).await?;
        let connection = self.pools.open(&profile, &secrets).await?;
        Ok(self.describe_open(&connection))
    }

    fn describe_open(&self, connection: &LiveConnection) -> OpenConnection {
        OpenConnection {
            name: connection.name().to_string(),
            backend: connection.backend(),
            ref_count: self.pools.ref_count(connection.name()),
            tunneled: connection.is_tunneled(),
        }
    }

    /// Release one reference; returns whether the connection was torn down
    ///
    /// Sessions still bound to a torn-down connection are detached and their
    /// open transactions rolled back.
    pub async fn close(&self, name: &str) -> bool {
        self.pools
            .release(name, async {
                let detached = self.sessions.unbind_connection(name);
                if !detached.is_empty() {
                    tracing::debug!(connection = %name, sessions = detached.len(), "Detached sessions");
                }
                discard_all(self.transactions.take_connection(name)).await;
            })
            .await
    }

    pub fn list_open(&self) -> Vec<OpenConnection> {
        self.pools.list_open()
    }

    /// Connect and disconnect once without registering anything
    ///
    /// # Arguments
    ///
    /// * `profile` - Profile to try, saved or not
    /// * `secrets` - Credentials to try; `None` uses the stored ones, if any
    pub async fn test(
        &self,
        profile: &ConnectionProfile,
        secrets: Option<ConnectionSecrets>,
    ) -> Result<()> {
        let secrets = match secrets {
            Some(secrets) => secrets,
            None => match self.profiles.secrets(&profile.name).await {
                Ok(stored) => stored,
                Err(Error::ProfileNotFound(_)) => ConnectionSecrets::default(),
                Err(error) => return Err(error),
            },
        };
        self.pools.test(profile, &secrets).await
    }

    /// Roll back open transactions and close every live connection
    pub async fn shutdown(&self) {
        discard_all(self.transactions.take_all()).await;
        self.pools.close_all().await;
    }

    // Sessions

    /// Bind a session to an open connection, or detach it with `None`
    ///
    /// The connection cannot be closed while the binding is made. Moving the
    /// session to another connection rolls back its open transaction.
    pub async fn bind_session(&self, session: &SessionId, connection: Option<&str>) -> Result<()> {
        let previous = match connection {
            Some(name) => {
                self.pools
                    .with_open(name, || self.sessions.bind(session, Some(name.to_string())))
                    .await?
            }
            None => self.sessions.bind(session, None),
        };

        if previous.as_deref() != connection {
            if let Some(pinned) = self.transactions.take(session) {
                tracing::info!(session = %session, connection = %pinned.connection(), "Rolling back transaction of rebound session");
                pinned.discard().await;
            }
        }
        Ok(())
    }

    /// Forget a session (its tab closed), cancelling its query and rolling
    /// back its open transaction
    pub async fn drop_session(&self, session: &SessionId) -> bool {
        let removed = self.sessions.remove(session);
        if let Some(pinned) = self.transactions.take(session) {
            pinned.discard().await;
        }
        removed
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn session_connection(&self, session: &SessionId) -> Result<Arc<LiveConnection>> {
        let name = self
            .sessions
            .connection_of(session)
            .ok_or_else(|| Error::NotConnected(format!("session '{session}' is not bound")))?;
        self.pools.connection(&name)
    }

    // Queries

    /// Run SQL on a session and return one page of the result
    ///
    /// A query already running on the session is superseded: it is
    /// cancelled and whatever it produces afterwards is discarded.
    ///
    /// # Arguments
    ///
    /// * `session` - A bound session
    /// * `sql` - One statement or a script
    /// * `offset` - First row of the page; `None` starts at row 0
    ///
    /// # Returns
    ///
    /// The page, [`Error::Cancelled`] when cancelled or superseded, or the
    /// backend's error verbatim
    pub async fn execute(
        &self,
        session: &SessionId,
        sql: &str,
        offset: Option<u64>,
    ) -> Result<QueryResult> {
        let ticket = self.sessions.begin_query(session)?;
        let connection = match self.pools.connection(&ticket.connection) {
            Ok(connection) => connection,
            Err(error) => {
                self.sessions.finish(&ticket);
                return Err(error);
            }
        };

        let page = PageRequest {
            sql,
            offset: offset.unwrap_or(0),
            row_limit: self.config.row_limit,
            cancel: &ticket.cancel,
        };
        let outcome = match self.pinned(session, &ticket.connection) {
            Some(pinned) => {
                // Queued behind the session's previous query, which was just
                // superseded
                tokio::select! {
                    biased;
                    _ = ticket.cancel.cancelled() => Err(Error::Cancelled),
                    mut slot = pinned.lock() => match slot.as_mut() {
                        Some(transaction) => {
                            executor::execute(connection.provider(), page, Some(transaction)).await
                        }
                        None => Err(ended()),
                    },
                }
            }
            None => executor::execute(connection.provider(), page, None).await,
        };

        if !self.sessions.finish(&ticket) {
            return Err(Error::Cancelled);
        }

        match &outcome {
            Ok(result) => tracing::info!(
                session = %session,
                generation = ticket.generation,
                connection = %ticket.connection,
                kind = %result.kind,
                rows = result.row_count,
                truncated = result.truncated,
                elapsed_ms = result.execution_time_ms,
                "Query finished"
            ),
            Err(Error::Cancelled) => tracing::info!(
                session = %session,
                generation = ticket.generation,
                "Query cancelled"
            ),
            Err(error) => tracing::info!(
                session = %session,
                generation = ticket.generation,
                kind = error.kind(),
                "Query failed"
            ),
        }
        outcome
    }

    /// Cancel the query running on a session; returns whether one was running
    pub fn cancel(&self, session: &SessionId) -> bool {
        self.sessions.cancel(session)
    }

    /// Classify SQL against the session's connection before it runs
    ///
    /// Never fails: when the connection cannot be resolved the check reports
    /// that nothing needs confirming.
    pub async fn check_safety(&self, session: &SessionId, sql: &str) -> SafetyCheck {
        let Some(name) = self.sessions.connection_of(session) else {
            tracing::warn!(session = %session, "Safety check on an unbound session");
            return SafetyCheck::unchecked("", false);
        };

        match self.profiles.get(&name).await {
            Ok(Some(profile)) => {
                SafetyCheck::check(sql, &name, profile.is_dangerous(), Some(profile.kind()))
            }
            Ok(None) => {
                tracing::warn!(connection = %name, "Safety check without a saved profile");
                SafetyCheck::unchecked(&name, false)
            }
            Err(error) => {
                tracing::warn!(connection = %name, %error, "Safety check could not load the profile");
                SafetyCheck::unchecked(&name, false)
            }
        }
    }

    // Transactions

    fn pinned(&self, session: &SessionId, connection: &str) -> Option<PinnedTransaction> {
        self.transactions
            .get(session)
            .filter(|pinned| pinned.connection() == connection)
    }

    /// Start a transaction on the session's connection
    ///
    /// Until it ends, every query and cell update of the session runs inside
    /// it, on one connection held out of the pool.
    pub async fn begin_transaction(&self, session: &SessionId) -> Result<()> {
        let connection = self.session_connection(session)?;
        if self.transactions.is_open(session) {
            return Err(Error::Transaction(format!(
                "session '{session}' already has an open transaction"
            )));
        }

        let transaction = connection.provider().begin().await?;
        self.transactions.pin(session, connection.name(), transaction)?;
        tracing::info!(session = %session, connection = %connection.name(), "Transaction started");
        Ok(())
    }

    pub async fn commit(&self, session: &SessionId) -> Result<()> {
        self.end_transaction(session, Outcome::Commit).await
    }

    pub async fn rollback(&self, session: &SessionId) -> Result<()> {
        self.end_transaction(session, Outcome::Rollback).await
    }

    async fn end_transaction(&self, session: &SessionId, outcome: Outcome) -> Result<()> {
        let pinned = self.transactions.take(session).ok_or_else(|| {
            Error::Transaction(format!("session '{session}' has no open transaction"))
        })?;
        let ended = pinned.end(outcome).await;
        tracing::info!(
            session = %session,
            connection = %pinned.connection(),
            ?outcome,
            ok = ended.is_ok(),
            "Transaction ended"
        );
        ended
    }

    pub fn in_transaction(&self, session: &SessionId) -> bool {
        self.transactions.is_open(session)
    }

    // Editing

    /// Whether the result of `sql` can be edited cell by cell
    ///
    /// Only a plain SELECT over one table with a primary key qualifies.
    /// A read-only result is not an error: the reason comes back in the
    /// answer.
    pub async fn check_editable(&self, session: &SessionId, sql: &str) -> Result<EditableInfo> {
        let connection = self.session_connection(session)?;
        let backend = connection.backend();

        let source = match Analysis::new(sql, Some(backend)).source_table() {
            Ok(source) => source,
            Err(reason) => return Ok(EditableInfo::read_only(reason)),
        };
        let schema = source
            .schema
            .unwrap_or_else(|| default_schema(backend).to_string());
        let structure = connection
            .provider()
            .describe_table(&schema, &source.table)
            .await?;

        let primary_key: Vec<String> = structure
            .primary_key()
            .into_iter()
            .map(str::to_string)
            .collect();
        let reason = if structure.is_view {
            Some("Result comes from a view".to_string())
        } else if primary_key.is_empty() {
            Some("Table has no primary key".to_string())
        } else {
            None
        };

        Ok(EditableInfo {
            editable: reason.is_none(),
            schema: Some(schema),
            table: Some(source.table),
            primary_key: if reason.is_none() { primary_key } else { Vec::new() },
            reason,
        })
    }

    /// Change one cell, inside the session's transaction when one is open
    ///
    /// # Returns
    ///
    /// 1, or [`Error::NotEditable`] when the key did not match exactly one
    /// row (nothing is changed then)
    pub async fn update_cell(&self, session: &SessionId, update: &CellUpdate) -> Result<u64> {
        let connection = self.session_connection(session)?;
        let provider = connection.provider();

        let affected = match self.pinned(session, connection.name()) {
            Some(pinned) => {
                let mut slot = pinned.lock().await;
                let transaction = slot.as_mut().ok_or_else(ended)?;
                provider.update_cell(update, Some(transaction)).await?
            }
            None => provider.update_cell(update, None).await?,
        };

        tracing::info!(
            session = %session,
            schema = %update.schema,
            table = %update.table,
            column = %update.column,
            "Cell updated"
        );
        Ok(affected)
    }

    // Completions

    /// Keywords, tables and columns starting with `prefix`
    ///
    /// An unbound session gets keywords only; introspection failures are
    /// logged and leave out what could not be listed.
    pub async fn completions(&self, session: &SessionId, prefix: &str) -> Vec<String> {
        if prefix.is_empty() {
            return Vec::new();
        }

        let mut completions = Completions::keywords();
        if let Ok(connection) = self.session_connection(session) {
            if let Err(error) = collect_names(connection.provider(), &mut completions).await {
                tracing::warn!(session = %session, %error, "Completions without schema names");
            }
        }
        completions.matching(prefix)
    }

    // Schema

    pub async fn list_schemas(&self, session: &SessionId) -> Result<Vec<String>> {
        self.session_connection(session)?.provider().list_schemas().await
    }

    pub async fn list_tables(&self, session: &SessionId, schema: &str) -> Result<Vec<TableInfo>> {
        self.session_connection(session)?
            .provider()
            .list_tables(schema)
            .await
    }

    pub async fn list_columns(
        &self,
        session: &SessionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        self.session_connection(session)?
            .provider()
            .list_columns(schema, table)
            .await
    }

    pub async fn describe_table(
        &self,
        session: &SessionId,
        schema: &str,
        table: &str,
    ) -> Result<TableSchema> {
        self.session_connection(session)?
            .provider()
            .describe_table(schema, table)
            .await
    }

    // Profiles

    pub async fn list_profiles(&self) -> Result<Vec<ProfileSummary>> {
        let mut profiles = self.profiles.list().await?;
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles.into_iter().map(ProfileSummary::from).collect())
    }

    pub async fn get_profile(&self, name: &str) -> Result<ProfileSummary> {
        self.profile(name).await.map(ProfileSummary::from)
    }

    /// Validate and store a profile
    ///
    /// An open connection keeps using the settings it was opened with until
    /// it is closed and reopened.
    pub async fn save_profile(
        &self,
        profile: ConnectionProfile,
        secrets: Option<ConnectionSecrets>,
    ) -> Result<()> {
        profile.validate()?;
        let name = profile.name.clone();
        self.profiles.save(profile, secrets).await?;
        tracing::info!(profile = %name, "Profile saved");
        Ok(())
    }

    /// Delete a profile, closing its live connection and detaching its sessions
    pub async fn delete_profile(&self, name: &str) -> Result<bool> {
        let detached = self.sessions.unbind_connection(name);
        discard_all(self.transactions.take_connection(name)).await;
        self.pools.force_close(name).await;
        let existed = self.profiles.delete(name).await?;
        tracing::info!(profile = %name, sessions = detached.len(), existed, "Profile deleted");
        Ok(existed)
    }

    // Settings

    pub async fn get_settings(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.settings.get(key).await
    }

    pub async fn save_settings(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.settings.save(key, value).await
    }
}

fn ended() -> Error {
    Error::Transaction("the transaction has already ended".to_string())
}

fn default_schema(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::Postgres => "public",
        BackendKind::Sqlite => "main",
    }
}

async fn discard_all(transactions: Vec<PinnedTransaction>) {
    for pinned in transactions {
        pinned.discard().await;
    }
}

/// Every table and column the connection can list
async fn collect_names(provider: &dyn DatabaseProvider, completions: &mut Completions) -> Result<()> {
    for schema in provider.list_schemas().await? {
        for table in provider.list_tables(&schema).await? {
            let columns = match provider.list_columns(&schema, &table.name).await {
                Ok(columns) => columns,
                Err(error) => {
                    tracing::debug!(%schema, table = %table.name, %error, "Skipping columns");
                    Vec::new()
                }
            };
            completions.add_table(
                &schema,
                &table.name,
                columns.iter().map(|column| column.name.as_str()),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_unknown_profile() {
        let engine = Engine::in_memory(EngineConfig::default());
        assert!(matches!(
            engine.open("missing").await,
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_requires_open_connection() {
        let engine = Engine::in_memory(EngineConfig::default());
        let session = SessionId::new("tab-1");
        assert!(matches!(
            engine.bind_session(&session, Some("local")).await,
            Err(Error::NotConnected(_))
        ));

        // Detaching always works
        engine.bind_session(&session, None).await.unwrap();
        assert!(matches!(
            engine.execute(&session, "SELECT 1", None).await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_safety_check_falls_back_when_unbound() {
        let engine = Engine::in_memory(EngineConfig::default());
        let check = engine
            .check_safety(&SessionId::new("tab-1"), "DROP TABLE users")
            .await;
        assert!(!check.requires_confirmation);
        assert!(check.warning_message.is_none());
    }

    #[tokio::test]
    async fn test_save_profile_validates() {
        let engine = Engine::in_memory(EngineConfig::default());
        let result = engine
            .save_profile(ConnectionProfile::sqlite("", "/tmp/a.db"), None)
            .await;
        assert!(matches!(result, Err(Error::InvalidProfile(_))));
        assert!(engine.list_profiles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_needs_a_bound_session() {
        let engine = Engine::in_memory(EngineConfig::default());
        let session = SessionId::new("tab-1");
        assert!(matches!(
            engine.begin_transaction(&session).await,
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(engine.commit(&session).await, Err(Error::Transaction(_))));
        assert!(matches!(engine.rollback(&session).await, Err(Error::Transaction(_))));
        assert!(!engine.in_transaction(&session));
    }

    #[tokio::test]
    async fn test_unbound_completions_are_keywords() {
        let engine = Engine::in_memory(EngineConfig::default());
        let session = SessionId::new("tab-1");
        assert_eq!(engine.completions(&session, "wh").await, vec!["WHEN", "WHERE"]);
        assert!(engine.completions(&session, "").await.is_empty());
    }

    #[test]
    fn test_default_schema() {
        assert_eq!(default_schema(BackendKind::Postgres), "public");
        assert_eq!(default_schema(BackendKind::Sqlite), "main");
    }
}
