//! PostgreSQL database provider implementation

use crate::config::EngineConfig;
use crate::database::traits::{DatabaseProvider, FetchRequest, Fetched};
use crate::database::{
    acquire_cancellable, cell_update_statement, check_update_columns, column_names_and_types,
    single_row, validate_identifier, ConnectionLabel, OpenTransaction, PooledConn, RowCollector,
    Step,
};
use crate::decode::{unsupported, Cell, TypeRegistry, WireValue};
use crate::profile::{BackendKind, BackendTarget, ConnectionProfile};
use crate::schema::{CellUpdate, ColumnInfo, ForeignKey, IndexInfo, TableInfo, TableSchema};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Column, Connection, Either, Executor, PgConnection, PgPool, Row, TypeInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

const APPLICATION_NAME: &str = "sqldesk";

/// Upper bound on the out-of-band cancel request
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

const TYPE_LOOKUP_QUERY: &str = r#"
    SELECT t.typname::text, t.typtype::text, bt.typname::text
    FROM pg_type t
    LEFT JOIN pg_type bt ON bt.oid = t.typbasetype
    WHERE t.typname = ANY($1)
"#;

/// PostgreSQL database provider
pub struct PostgresProvider {
    pool: PgPool,
    label: ConnectionLabel,
    /// Built-ins plus the enums and domains met on this connection so far
    types: RwLock<TypeRegistry>,
}

impl PostgresProvider {
    /// Create a new PostgreSQL provider
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    /// * `label` - Profile name and target used in connect errors
    pub fn new(pool: PgPool, label: ConnectionLabel) -> Self {
        Self {
            pool,
            label,
            types: RwLock::new(TypeRegistry::default()),
        }
    }

    /// Open the pool for a profile
    ///
    /// # Arguments
    ///
    /// * `profile` - A Postgres profile
    /// * `password` - Stored password, if any
    /// * `tunnel` - Local end of an SSH tunnel; replaces the profile's host and port
    /// * `config` - Pool size and timeouts
    pub async fn connect(
        profile: &ConnectionProfile,
        password: Option<&str>,
        tunnel: Option<SocketAddr>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let label = ConnectionLabel::new(profile);
        let options = connect_options(profile, password, tunnel)?;

        let connecting = PgPoolOptions::new()
            .max_connections(config.max_connections_per_profile)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options);

        let pool = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| label.connect_failed("timed out"))?
            .map_err(|error| label.connect_failed(error))?;

        tracing::debug!(profile = %label.profile, tunneled = tunnel.is_some(), "Postgres pool ready");
        Ok(Self::new(pool, label))
    }

    fn types(&self) -> RwLockReadGuard<'_, TypeRegistry> {
        self.types.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn stream(
        &self,
        conn: &mut PgConnection,
        request: &FetchRequest<'_>,
        backend_pid: &mut Option<i32>,
    ) -> Result<Fetched> {
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await?;
        *backend_pid = Some(pid);

        let mut collector = RowCollector::new(request);
        {
            // A lone statement goes through the extended protocol (binary
            // values); scripts need the simple protocol (text values)
            let mut results = if request.single_statement {
                (&mut *conn).fetch_many(sqlx::query(request.sql).persistent(false))
            } else {
                (&mut *conn).fetch_many(request.sql)
            };

            while let Some(step) = results.try_next().await? {
                if request.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                match step {
                    Either::Left(done) => collector.push_done(done.rows_affected()),
                    Either::Right(row) => {
                        if collector.push_row(row) == Step::Stop {
                            break;
                        }
                    }
                }
            }
        }

        let (rows, rows_affected) = collector.finish();
        let (columns, column_types) = match rows.first() {
            Some(row) => column_names_and_types(row.columns()),
            None if request.single_statement => (&mut *conn)
                .describe(request.sql)
                .await
                .map(|described| column_names_and_types(described.columns()))
                .unwrap_or_default(),
            None => Default::default(),
        };

        let unknown = unresolved_type_names(&self.types(), &column_types);
        if !unknown.is_empty() {
            self.resolve_types(conn, &unknown).await;
        }

        let rows = {
            let types = self.types();
            rows.iter().map(|row| decode_row(&types, row)).collect()
        };

        Ok(Fetched {
            columns,
            column_types,
            rows,
            rows_affected,
        })
    }

    /// Look up enums and domains by name and remember them
    ///
    /// Names the catalog has no enum or domain for are remembered too, so
    /// they are not looked up again. A failed lookup remembers nothing.
    async fn resolve_types(&self, conn: &mut PgConnection, names: &[String]) {
        let found = sqlx::query_as::<_, (String, String, Option<String>)>(TYPE_LOOKUP_QUERY)
            .bind(names)
            .fetch_all(&mut *conn)
            .await;

        match found {
            Ok(found) => {
                let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
                for (name, type_kind, base) in found {
                    match (type_kind.as_str(), base) {
                        ("e", _) => types.register_enum(&name),
                        ("d", Some(base)) => types.register_domain(&name, &base),
                        _ => {}
                    }
                }
                for name in names {
                    if !types.knows(name) {
                        types.mark_unresolvable(name);
                    }
                }
            }
            Err(error) => tracing::warn!(?names, %error, "Could not resolve column types"),
        }
    }

    /// Declared types of a table's columns, as `format_type` spells them
    /// Ask the server to stop the statement running on `pid`
    async fn cancel_backend(&self, pid: i32) {
        tracing::debug!(pid, "Sending backend cancel");
        let cancelling = sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(pid)
            .execute(&self.pool);

        match tokio::time::timeout(CANCEL_TIMEOUT, cancelling).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => tracing::warn!(pid, %error, "Backend cancel failed"),
            Err(_) => tracing::warn!(pid, "Backend cancel timed out"),
        }
    }

    async fn relation_is_view(&self, schema: &str, table: &str) -> Result<bool> {
        let is_view: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT c.relkind IN ('v', 'm')
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
              AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::introspection)?;

        is_view.ok_or_else(|| Error::introspection(format!("no such table: {schema}.{table}")))
    }

    async fn indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexInfo>> {
        // Expression columns have attnum 0 and are rendered by pg_get_indexdef
        let rows = sqlx::query(
            r#"
            SELECT
                ic.relname::text AS name,
                i.indisunique AS is_unique,
                i.indisprimary AS is_primary,
                ARRAY(
                    SELECT COALESCE(a.attname::text, pg_get_indexdef(i.indexrelid, k.ordinality::int, true))
                    FROM unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ordinality)
                    LEFT JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
                    ORDER BY k.ordinality
                ) AS columns
            FROM pg_index i
            JOIN pg_class ic ON ic.oid = i.indexrelid
            JOIN pg_class c ON c.oid = i.indrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
            ORDER BY i.indisprimary DESC, ic.relname
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::introspection)?;

        rows.iter()
            .map(|row| {
                Ok(IndexInfo {
                    name: row.try_get("name")?,
                    columns: row.try_get("columns")?,
                    unique: row.try_get("is_unique")?,
                    is_primary: row.try_get("is_primary")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(Error::introspection)
    }

    async fn foreign_keys(&self, schema: &str, table: &str) -> Result<Vec<ForeignKey>> {
        // conkey and confkey are parallel arrays, one entry per key column
        let rows = sqlx::query(
            r#"
            SELECT
                con.conname::text AS name,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ordinality)
                    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                    ORDER BY k.ordinality
                ) AS columns,
                rn.nspname::text AS references_schema,
                rc.relname::text AS references_table,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ordinality)
                    JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                    ORDER BY k.ordinality
                ) AS references_columns
            FROM pg_constraint con
            JOIN pg_class c ON c.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_class rc ON rc.oid = con.confrelid
            JOIN pg_namespace rn ON rn.oid = rc.relnamespace
            WHERE con.contype = 'f' AND n.nspname = $1 AND c.relname = $2
            ORDER BY con.conname
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::introspection)?;

        rows.iter()
            .map(|row| {
                Ok(ForeignKey {
                    name: row.try_get("name")?,
                    columns: row.try_get("columns")?,
                    references_schema: row.try_get("references_schema")?,
                    references_table: row.try_get("references_table")?,
                    references_columns: row.try_get("references_columns")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(Error::introspection)
    }
}

#[async_trait]
impl DatabaseProvider for PostgresProvider {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn acquire(&self) -> Result<PooledConn> {
        self.pool
            .acquire()
            .await
            .map(PooledConn::Postgres)
            .map_err(|error| self.label.connect_failed(error))
    }

    async fn begin(&self) -> Result<OpenTransaction> {
        let transaction = self
            .pool
            .begin()
            .await
            .map_err(|error| self.label.connect_failed(error))?;
        Ok(OpenTransaction::Postgres(transaction))
    }

    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        transaction: Option<&mut OpenTransaction>,
    ) -> Result<Fetched> {
        let mut pooled;
        let conn: &mut PgConnection = match transaction {
            Some(transaction) => transaction.postgres()?,
            None => {
                pooled = acquire_cancellable(&self.pool, &self.label, request.cancel).await?;
                &mut *pooled
            }
        };
        let mut backend_pid = None;

        let outcome = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(Error::Cancelled),
            result = self.stream(conn, &request, &mut backend_pid) => result,
        };

        // Dropping the stream only stops reading; the server keeps going
        // until told otherwise
        if outcome.as_ref().is_err_and(Error::is_cancelled) {
            if let Some(pid) = backend_pid {
                self.cancel_backend(pid).await;
            }
        }

        outcome
    }

    async fn prepare(&self, sql: &str) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| self.label.connect_failed(error))?;
        (&mut *conn).describe(sql).await?;
        Ok(())
    }

    async fn update_cell(
        &self,
        update: &CellUpdate,
        transaction: Option<&mut OpenTransaction>,
    ) -> Result<u64> {
        let mut pooled;
        let conn: &mut PgConnection = match transaction {
            Some(transaction) => transaction.postgres()?,
            None => {
                pooled = self
                    .pool
                    .acquire()
                    .await
                    .map_err(|error| self.label.connect_failed(error))?;
                &mut *pooled
            }
        };

        // Looked up on the same connection, which may be the only one
        let types = column_types(&mut *conn, &update.schema, &update.table).await?;
        check_update_columns(update, |column| types.contains_key(column))?;

        // Values arrive as display text; the server casts them to the column type
        let statement = cell_update_statement(update, |position, column| {
            let declared = types.get(column).map_or("text", String::as_str);
            format!("CAST(${position} AS {declared})")
        })?;

        // A savepoint when a transaction is already open
        let mut scope = conn.begin().await?;
        let mut query = sqlx::query(&statement).bind(update.value.as_deref());
        for key in &update.primary_key {
            query = query.bind(key.value.as_str());
        }
        let affected = query.execute(&mut *scope).await?.rows_affected();

        if affected == 1 {
            scope.commit().await?;
        } else {
            scope.rollback().await?;
        }
        single_row(affected)
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT nspname::text
            FROM pg_namespace
            WHERE nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
              AND nspname NOT LIKE 'pg\_temp\_%'
              AND nspname NOT LIKE 'pg\_toast\_temp\_%'
            ORDER BY nspname
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::introspection)
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableInfo>> {
        validate_identifier(schema)?;

        let rows: Vec<(String, bool)> = sqlx::query_as(
            r#"
            SELECT c.relname::text, c.relkind IN ('v', 'm')
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
            ORDER BY c.relname
            "#,
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::introspection)?;

        Ok(rows
            .into_iter()
            .map(|(name, is_view)| TableInfo {
                schema: schema.to_string(),
                name,
                is_view,
            })
            .collect())
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        validate_identifier(schema)?;
        validate_identifier(table)?;

        let rows = sqlx::query(
            r#"
            SELECT
                a.attname::text AS name,
                format_type(a.atttypid, a.atttypmod) AS data_type,
                NOT a.attnotnull AS nullable,
                pg_get_expr(d.adbin, d.adrelid) AS default_value,
                EXISTS (
                    SELECT 1 FROM pg_index i
                    WHERE i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)
                ) AS is_primary_key
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
            WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
            ORDER BY a.attnum
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::introspection)?;

        if rows.is_empty() {
            return Err(Error::introspection(format!("no such table: {schema}.{table}")));
        }

        rows.iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    data_type: row.try_get("data_type")?,
                    nullable: row.try_get("nullable")?,
                    default_value: row.try_get("default_value")?,
                    is_primary_key: row.try_get("is_primary_key")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(Error::introspection)
    }

    async fn describe_table(&self, schema: &str, table: &str) -> Result<TableSchema> {
        validate_identifier(schema)?;
        validate_identifier(table)?;

        let is_view = self.relation_is_view(schema, table).await?;
        let columns = self.list_columns(schema, table).await?;

        let indexes = self.indexes(schema, table).await.unwrap_or_else(|error| {
            tracing::warn!(%schema, %table, %error, "Could not list indexes");
            Vec::new()
        });
        let foreign_keys = self.foreign_keys(schema, table).await.unwrap_or_else(|error| {
            tracing::warn!(%schema, %table, %error, "Could not list foreign keys");
            Vec::new()
        });

        Ok(TableSchema {
            schema: schema.to_string(),
            name: table.to_string(),
            is_view,
            columns,
            indexes,
            foreign_keys,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Connect options for a profile, pointed at the tunnel when there is one
fn connect_options(
    profile: &ConnectionProfile,
    password: Option<&str>,
    tunnel: Option<SocketAddr>,
) -> Result<PgConnectOptions> {
    let BackendTarget::Postgres {
        host,
        port,
        database,
        username,
    } = &profile.target
    else {
        return Err(Error::InvalidProfile(format!(
            "'{}' is not a Postgres profile",
            profile.name
        )));
    };

    let (host, port) = match tunnel {
        Some(local) => (local.ip().to_string(), local.port()),
        None => (host.clone(), *port),
    };

    let mut options = PgConnectOptions::new()
        .host(&host)
        .port(port)
        .username(username)
        .database(database)
        .application_name(APPLICATION_NAME);
    if let Some(password) = password {
        options = options.password(password);
    }
    Ok(options)
}

/// Declared type of every column of a table, by column name
async fn column_types(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
        FROM pg_attribute a
        JOIN pg_class c ON c.oid = a.attrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::introspection)?;
    Ok(rows.into_iter().collect())
}

/// Element type names the registry cannot resolve and has not looked up
/// before, spelled exactly as the server reported them
fn unresolved_type_names(types: &TypeRegistry, column_types: &[String]) -> Vec<String> {
    let mut unknown: Vec<String> = column_types
        .iter()
        .filter(|type_name| !types.knows(type_name))
        .map(|type_name| type_name.trim_end_matches("[]").to_string())
        .filter(|type_name| !types.is_unresolvable(type_name))
        .collect();
    unknown.sort();
    unknown.dedup();
    unknown
}

fn decode_row(types: &TypeRegistry, row: &PgRow) -> Vec<Cell> {
    row.columns()
        .iter()
        .map(|column| {
            let declared = column.type_info().name();
            match row.try_get_raw(column.ordinal()) {
                Ok(value) => types.decode(declared, WireValue::Postgres(value)),
                Err(_) => Cell::Text(unsupported(declared)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{SshAuthMode, SshTunnelConfig};

    fn profile() -> ConnectionProfile {
        ConnectionProfile::postgres("reports", "db.internal", 6432, "analytics", "bob")
    }

    #[test]
    fn test_connect_options_use_profile_target() {
        let options = connect_options(&profile(), Some("secret"), None).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_username(), "bob");
        assert_eq!(options.get_database(), Some("analytics"));
    }

    #[test]
    fn test_connect_options_follow_tunnel() {
        let tunneled = profile().with_ssh(SshTunnelConfig {
            host: "bastion".into(),
            port: 22,
            username: "ops".into(),
            auth: SshAuthMode::Agent,
        });
        let local: SocketAddr = "127.0.0.1:40123".parse().unwrap();

        let options = connect_options(&tunneled, None, Some(local)).unwrap();
        assert_eq!(options.get_host(), "127.0.0.1");
        assert_eq!(options.get_port(), 40123);
        assert_eq!(options.get_database(), Some("analytics"));
    }

    #[test]
    fn test_connect_options_reject_sqlite_profile() {
        let sqlite = ConnectionProfile::sqlite("local", "/tmp/a.db");
        assert!(matches!(
            connect_options(&sqlite, None, None),
            Err(Error::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_unresolved_type_names() {
        let mut types = TypeRegistry::default();
        let columns: Vec<String> = ["INT4", "mood", "mood[]", "TEXT[]", "ltree"]
            .iter()
            .map(|name| name.to_string())
            .collect();

        assert_eq!(unresolved_type_names(&types, &columns), vec!["ltree", "mood"]);

        types.register_enum("mood");
        assert_eq!(unresolved_type_names(&types, &columns), vec!["ltree"]);
    }

    #[test]
    fn test_unresolved_type_names_keep_case_and_skip_misses() {
        let mut types = TypeRegistry::default();
        let columns: Vec<String> = ["MyEnum", "myenum", "ltree"]
            .iter()
            .map(|name| name.to_string())
            .collect();

        assert_eq!(
            unresolved_type_names(&types, &columns),
            vec!["MyEnum", "ltree", "myenum"]
        );

        types.register_enum("MyEnum");
        types.mark_unresolvable("ltree");
        assert_eq!(unresolved_type_names(&types, &columns), vec!["myenum"]);
    }
}
