//! SQLite database provider implementation

use crate::config::EngineConfig;
use crate::database::traits::{DatabaseProvider, FetchRequest, Fetched};
use crate::database::{
    acquire_cancellable, cell_update_statement, check_update_columns, column_names_and_types,
    quote_identifier, single_row, validate_identifier, ConnectionLabel, OpenTransaction, PooledConn, RowCollector,
    Step,
};
use crate::decode::{Cell, SqliteWire, TypeRegistry, WireValue};
use crate::profile::{BackendKind, BackendTarget, ConnectionProfile};
use crate::schema::{CellUpdate, ColumnInfo, ForeignKey, IndexInfo, TableInfo, TableSchema};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow, SqliteValueRef};
use sqlx::{
    Column, Connection, Decode, Either, Executor, Row, Sqlite, SqliteConnection, SqlitePool,
    TypeInfo, ValueRef,
};
use std::collections::BTreeMap;

/// SQLite database provider
pub struct SqliteProvider {
    pool: SqlitePool,
    label: ConnectionLabel,
    types: TypeRegistry,
}

impl SqliteProvider {
    /// Create a new SQLite provider
    ///
    /// # Arguments
    ///
    /// * `pool` - SQLite connection pool
    /// * `label` - Profile name and target used in connect errors
    pub fn new(pool: SqlitePool, label: ConnectionLabel) -> Self {
        Self {
            pool,
            label,
            types: TypeRegistry::default(),
        }
    }

    /// Open the pool for a profile's database file
    ///
    /// The file must already exist and hold a database; nothing is created.
    pub async fn connect(profile: &ConnectionProfile, config: &EngineConfig) -> Result<Self> {
        let label = ConnectionLabel::new(profile);
        let BackendTarget::Sqlite { path } = &profile.target else {
            return Err(Error::InvalidProfile(format!(
                "'{}' is not an SQLite profile",
                profile.name
            )));
        };

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|error| label.connect_failed(error))?;
        if !metadata.is_file() {
            return Err(label.connect_failed("not a regular file"));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false);

        let connecting = SqlitePoolOptions::new()
            .max_connections(config.max_connections_per_profile)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options);

        let pool = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| label.connect_failed("timed out"))?
            .map_err(|error| label.connect_failed(error))?;

        // Opening never reads the header; make an unreadable file fail here
        if let Err(error) = sqlx::query("SELECT 1 FROM sqlite_master LIMIT 1")
            .fetch_optional(&pool)
            .await
        {
            pool.close().await;
            return Err(label.connect_failed(error));
        }

        Ok(Self::new(pool, label))
    }

    async fn stream(
        &self,
        conn: &mut SqliteConnection,
        request: &FetchRequest<'_>,
    ) -> Result<Fetched> {
        let mut collector = RowCollector::new(request);
        {
            let mut results = (&mut *conn).fetch_many(request.sql);
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

        let rows = rows.iter().map(|row| self.decode_row(row)).collect();

        Ok(Fetched {
            columns,
            column_types,
            rows,
            rows_affected,
        })
    }

    fn decode_row(&self, row: &SqliteRow) -> Vec<Cell> {
        row.columns()
            .iter()
            .map(|column| {
                let declared = column.type_info().name();
                match row.try_get_raw(column.ordinal()).ok().and_then(wire) {
                    Some(wire) => self.types.decode(declared, WireValue::Sqlite(wire)),
                    None => Cell::Text(crate::decode::unsupported(declared)),
                }
            })
            .collect()
    }

    async fn object_type(&self, schema: &str, table: &str) -> Result<String> {
        let query = format!(
            "SELECT type FROM {}.sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
            quote_identifier(schema)
        );
        let object_type: Option<String> = sqlx::query_scalar(&query)
            .bind(table)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::introspection)?;

        object_type.ok_or_else(|| Error::introspection(format!("no such table: {schema}.{table}")))
    }

    async fn indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexInfo>> {
        // pragma_index_list returns: seq, name, unique, origin, partial
        let index_rows = sqlx::query(
            "SELECT name, \"unique\", origin FROM pragma_index_list(?1, ?2) ORDER BY seq",
        )
        .bind(table)
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::introspection)?;

        let mut indexes = Vec::new();
        for row in index_rows {
            let name: String = row.try_get("name").map_err(Error::introspection)?;
            let unique: i64 = row.try_get("unique").map_err(Error::introspection)?;
            let origin: String = row.try_get("origin").map_err(Error::introspection)?;

            // pragma_index_info returns: seqno, cid, name (NULL for expressions)
            let columns = sqlx::query_scalar::<_, Option<String>>(
                "SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno",
            )
            .bind(&name)
            .bind(schema)
            .fetch_all(&self.pool)
            .await;

            let columns = match columns {
                Ok(columns) => columns
                    .into_iter()
                    .map(|column| column.unwrap_or_else(|| "<expression>".to_string()))
                    .collect(),
                Err(error) => {
                    tracing::warn!(index = %name, %error, "Skipping columns of unreadable index");
                    Vec::new()
                }
            };

            indexes.push(IndexInfo {
                name,
                columns,
                unique: unique != 0,
                is_primary: origin == "pk",
            });
        }

        Ok(indexes)
    }

    async fn foreign_keys(&self, schema: &str, table: &str) -> Result<Vec<ForeignKey>> {
        // pragma_foreign_key_list returns: id, seq, table, from, to, on_update, on_delete, match
        let rows = sqlx::query(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1, ?2) ORDER BY id, seq",
        )
        .bind(table)
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::introspection)?;

        let mut grouped: BTreeMap<i64, ForeignKey> = BTreeMap::new();
        for row in rows {
            let id: i64 = row.try_get("id").map_err(Error::introspection)?;
            let references_table: String = row.try_get("table").map_err(Error::introspection)?;
            let column: String = row.try_get("from").map_err(Error::introspection)?;
            let references_column: Option<String> =
                row.try_get("to").map_err(Error::introspection)?;

            let foreign_key = grouped.entry(id).or_insert_with(|| ForeignKey {
                name: format!("fk_{table}_{id}"),
                columns: Vec::new(),
                references_schema: Some(schema.to_string()),
                references_table,
                references_columns: Vec::new(),
            });
            foreign_key.columns.push(column);
            if let Some(references_column) = references_column {
                foreign_key.references_columns.push(references_column);
            }
        }

        // `REFERENCES parent` without a column list points at the parent's key
        let mut foreign_keys: Vec<ForeignKey> = grouped.into_values().collect();
        for foreign_key in &mut foreign_keys {
            if foreign_key.references_columns.is_empty() {
                foreign_key.references_columns = self
                    .list_columns(schema, &foreign_key.references_table)
                    .await
                    .map(|columns| {
                        columns
                            .into_iter()
                            .filter(|column| column.is_primary_key)
                            .map(|column| column.name)
                            .collect()
                    })
                    .unwrap_or_default();
            }
        }

        Ok(foreign_keys)
    }
}

#[async_trait]
impl DatabaseProvider for SqliteProvider {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn acquire(&self) -> Result<PooledConn> {
        self.pool
            .acquire()
            .await
            .map(PooledConn::Sqlite)
            .map_err(|error| self.label.connect_failed(error))
    }

    async fn begin(&self) -> Result<OpenTransaction> {
        let transaction = self
            .pool
            .begin()
            .await
            .map_err(|error| self.label.connect_failed(error))?;
        Ok(OpenTransaction::Sqlite(transaction))
    }

    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        transaction: Option<&mut OpenTransaction>,
    ) -> Result<Fetched> {
        let mut pooled;
        let conn: &mut SqliteConnection = match transaction {
            Some(transaction) => transaction.sqlite()?,
            None => {
                pooled = acquire_cancellable(&self.pool, &self.label, request.cancel).await?;
                &mut *pooled
            }
        };

        // Dropping the statement stream on cancel resets the statement
        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(Error::Cancelled),
            result = self.stream(conn, &request) => result,
        }
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
        let conn: &mut SqliteConnection = match transaction {
            Some(transaction) => transaction.sqlite()?,
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
        let known: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?1, ?2)")
            .bind(&update.table)
            .bind(&update.schema)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::introspection)?;
        check_update_columns(update, |column| known.iter().any(|name| name == column))?;

        // Column affinity converts the bound text on the way in
        let statement = cell_update_statement(update, |position, _| format!("?{position}"))?;

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
        sqlx::query_scalar("SELECT name FROM pragma_database_list WHERE name <> 'temp' ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::introspection)
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableInfo>> {
        validate_identifier(schema)?;

        let query = format!(
            "SELECT name, type FROM {}.sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
            quote_identifier(schema)
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::introspection)?;

        let mut tables = Vec::new();
        for row in rows {
            let name: String = row.try_get("name").map_err(Error::introspection)?;
            let object_type: String = row.try_get("type").map_err(Error::introspection)?;
            tables.push(TableInfo {
                schema: schema.to_string(),
                name,
                is_view: object_type == "view",
            });
        }
        Ok(tables)
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        validate_identifier(schema)?;
        validate_identifier(table)?;

        // pragma_table_info returns: cid, name, type, notnull, dflt_value, pk
        let rows = sqlx::query(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
        )
        .bind(table)
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::introspection)?;

        if rows.is_empty() {
            return Err(Error::introspection(format!("no such table: {schema}.{table}")));
        }

        let mut columns = Vec::new();
        for row in rows {
            let not_null: i64 = row.try_get("notnull").map_err(Error::introspection)?;
            let primary_key: i64 = row.try_get("pk").map_err(Error::introspection)?;
            columns.push(ColumnInfo {
                name: row.try_get("name").map_err(Error::introspection)?,
                data_type: row.try_get("type").map_err(Error::introspection)?,
                nullable: not_null == 0,
                default_value: row.try_get("dflt_value").map_err(Error::introspection)?,
                is_primary_key: primary_key > 0,
            });
        }
        Ok(columns)
    }

    async fn describe_table(&self, schema: &str, table: &str) -> Result<TableSchema> {
        validate_identifier(schema)?;
        validate_identifier(table)?;

        let is_view = self.object_type(schema, table).await? == "view";
        let columns = self.list_columns(schema, table).await?;

        let mut indexes = self.indexes(schema, table).await.unwrap_or_else(|error| {
            tracing::warn!(%table, %error, "Could not list indexes");
            Vec::new()
        });

        // INTEGER PRIMARY KEY aliases the rowid and has no index of its own
        let primary_key: Vec<String> = columns
            .iter()
            .filter(|column| column.is_primary_key)
            .map(|column| column.name.clone())
            .collect();
        if !primary_key.is_empty() && !indexes.iter().any(|index| index.is_primary) {
            indexes.insert(
                0,
                IndexInfo {
                    name: format!("{table}_pkey"),
                    columns: primary_key,
                    unique: true,
                    is_primary: true,
                },
            );
        }

        let foreign_keys = self.foreign_keys(schema, table).await.unwrap_or_else(|error| {
            tracing::warn!(%table, %error, "Could not list foreign keys");
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

/// Storage class of a value, read before the value is consumed by a decoder
///
/// Only a real NULL becomes [`SqliteWire::Null`]. TEXT that is not valid UTF-8
/// is shown as its bytes; anything else that fails to decode is `None` and
/// renders as the unsupported placeholder.
fn wire(value: SqliteValueRef<'_>) -> Option<SqliteWire<'_>> {
    if value.is_null() {
        return Some(SqliteWire::Null);
    }

    let storage_class = value.type_info().name().to_string();
    match storage_class.as_str() {
        "INTEGER" => <i64 as Decode<Sqlite>>::decode(value)
            .map(SqliteWire::Integer)
            .ok(),
        "REAL" => <f64 as Decode<Sqlite>>::decode(value)
            .map(SqliteWire::Real)
            .ok(),
        "BLOB" => <&[u8] as Decode<Sqlite>>::decode(value)
            .map(SqliteWire::Blob)
            .ok(),
        _ => <&[u8] as Decode<Sqlite>>::decode(value)
            .map(|bytes| match std::str::from_utf8(bytes) {
                Ok(text) => SqliteWire::Text(text),
                Err(_) => SqliteWire::Blob(bytes),
            })
            .ok(),
    }
}
