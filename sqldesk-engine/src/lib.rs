//! # sqldesk-engine
//!
//! The core engine of a desktop SQL client: connects to PostgreSQL servers
//! (optionally through an SSH tunnel) and to SQLite database files, runs
//! user-supplied SQL with bounded, paged and cancellable result sets, and
//! introspects schemas for a tree view.
//!
//! ## Features
//!
//! - One connection pool per opened profile, shared by any number of sessions
//! - SSH tunnels with agent or key authentication
//! - Result pages capped at [`DEFAULT_ROW_LIMIT`] rows, with a truncation flag
//! - Per-session cancellation guarded by a generation counter
//! - Uniform display rendering of every wire type, with an explicit NULL
//! - Destructive statement detection ahead of execution
//! - Explicit transactions pinned to a session, in-place cell edits and
//!   schema-driven completions
//! - Schema, table, column, index and foreign key introspection
//! - An optional axum JSON adapter ([`EngineLayer`])
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use sqldesk_engine::{ConnectionProfile, Engine, EngineConfig, SessionId};
//!
//! # async fn example() -> sqldesk_engine::Result<()> {
//! let engine = Engine::in_memory(EngineConfig::default());
//! engine
//!     .save_profile(ConnectionProfile::sqlite("local", "app.db"), None)
//!     .await?;
//!
//! engine.open("local").await?;
//! let session = SessionId::new("tab-1");
//! engine.bind_session(&session, Some("local")).await?;
//!
//! let page = engine.execute(&session, "SELECT * FROM users", None).await?;
//! println!("{} rows, truncated: {}", page.row_count, page.truncated);
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod api;
pub mod classify;
pub mod completion;
pub mod config;
pub mod database;
pub mod decode;
pub mod engine;
pub mod executor;
pub mod layer;
pub mod pool;
pub mod profile;
pub mod schema;
pub mod session;
pub mod ssh;
pub mod transaction;

// Public exports
pub use classify::{
    classify, split_statements, Analysis, Classification, Confirmation, SafetyCheck, SourceTable,
    StatementKind,
};
pub use config::{EngineConfig, HostKeyPolicy, DEFAULT_ROW_LIMIT};
pub use decode::{Cell, TypeRegistry};
pub use engine::Engine;
pub use executor::PageRequest;
pub use layer::EngineLayer;
pub use pool::{LiveConnection, PoolManager};
pub use profile::{
    BackendKind, BackendTarget, ConnectionProfile, ConnectionSecrets, Environment,
    InMemoryProfileStore, InMemorySettingsStore, ProfileStore, SettingsStore, SshAuthMode,
    SshTunnelConfig,
};
pub use schema::{
    CellUpdate, ColumnInfo, EditableInfo, ForeignKey, IndexInfo, KeyValue, OpenConnection,
    ProfileSummary, QueryResult, TableInfo, TableSchema,
};
pub use session::{QueryTicket, SessionId, SessionRegistry};
pub use ssh::SshTunnel;

// Re-export database providers
pub use database::traits::DatabaseProvider;
pub use database::OpenTransaction;

#[cfg(feature = "sqlite")]
pub use database::sqlite::SqliteProvider;

#[cfg(feature = "postgres")]
pub use database::postgres::PostgresProvider;

// Error type
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not connect to '{profile}' ({target}): {cause}")]
    ConnectFailed {
        profile: String,
        target: String,
        cause: String,
    },

    #[error("SSH authentication to {host} failed: {cause}")]
    TunnelAuthFailed { host: String, cause: String },

    #[error("SSH host {host} is unreachable: {cause}")]
    TunnelUnreachable { host: String, cause: String },

    #[error("Could not decrypt private key {key_path}: {cause}")]
    KeyDecryptFailed { key_path: String, cause: String },

    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Backend diagnostic, passed through verbatim
    #[error("{message}")]
    SyntaxOrRuntimeError { message: String },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Schema introspection failed: {cause}")]
    IntrospectionFailed { cause: String },

    #[error("Connection profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid connection profile: {0}")]
    InvalidProfile(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Not editable: {0}")]
    NotEditable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Cancellation is a normal outcome, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Stable tag for the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConnectFailed { .. } => "connect_failed",
            Error::TunnelAuthFailed { .. } => "tunnel_auth_failed",
            Error::TunnelUnreachable { .. } => "tunnel_unreachable",
            Error::KeyDecryptFailed { .. } => "key_decrypt_failed",
            Error::NotConnected(_) => "not_connected",
            Error::SyntaxOrRuntimeError { .. } => "syntax_or_runtime_error",
            Error::Cancelled => "cancelled",
            Error::IntrospectionFailed { .. } => "introspection_failed",
            Error::ProfileNotFound(_) => "profile_not_found",
            Error::InvalidIdentifier(_) => "invalid_identifier",
            Error::InvalidProfile(_) => "invalid_profile",
            Error::Transaction(_) => "transaction",
            Error::NotEditable(_) => "not_editable",
            Error::Serialization(_) => "serialization",
        }
    }

    pub(crate) fn introspection(error: impl std::fmt::Display) -> Self {
        Error::IntrospectionFailed {
            cause: error.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        let message = match &error {
            sqlx::Error::Database(database_error) => database_error.message().to_string(),
            other => other.to_string(),
        };
        Error::SyntaxOrRuntimeError { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
