use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;

/// Create the demo database file with a small shop schema
///
/// Idempotent: tables are only created and filled once.
pub async fn seed(path: &Path) -> Result<(), sqlx::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true),
    )
    .await?;

    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS customers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT UNIQUE NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            price REAL NOT NULL,
            stock INTEGER DEFAULT 0,
            thumbnail BLOB
        );

        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_id INTEGER NOT NULL REFERENCES customers (id),
            product_id INTEGER NOT NULL REFERENCES products (id),
            quantity INTEGER NOT NULL,
            status TEXT DEFAULT 'pending'
        );

        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status);

        CREATE VIEW IF NOT EXISTS open_orders AS
            SELECT o.id, c.name AS customer, p.name AS product, o.quantity
            FROM orders o
            JOIN customers c ON c.id = o.customer_id
            JOIN products p ON p.id = o.product_id
            WHERE o.status = 'pending';

        -- Enough rows to page through
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT
        );
        "#,
    )
    .execute(&pool)
    .await?;

    let seeded: i64 = sqlx::query_scalar("SELECT count(*) FROM customers")
        .fetch_one(&pool)
        .await?;
    if seeded == 0 {
        sqlx::raw_sql(
            r#"
            INSERT INTO customers (name, email) VALUES
                ('Alice Johnson', 'alice@example.com'),
                ('Bob Smith', 'bob@example.com'),
                ('Charlie Brown', 'charlie@example.com');

            INSERT INTO products (name, price, stock, thumbnail) VALUES
                ('Laptop', 999.99, 50, NULL),
                ('Mouse', 29.99, 200, x'89504e47'),
                ('Keyboard', 79.99, 150, NULL);

            INSERT INTO orders (customer_id, product_id, quantity, status) VALUES
                (1, 1, 1, 'shipped'),
                (1, 2, 2, 'pending'),
                (2, 3, 1, 'pending'),
                (3, 2, 5, 'cancelled');

            INSERT INTO events (id, kind, payload)
                WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 2500)
                SELECT x,
                       CASE x % 3 WHEN 0 THEN 'login' WHEN 1 THEN 'view' ELSE 'purchase' END,
                       CASE WHEN x % 10 = 0 THEN NULL ELSE json_object('seq', x) END
                FROM n;
            "#,
        )
        .execute(&pool)
        .await?;
    }

    pool.close().await;
    Ok(())
}
