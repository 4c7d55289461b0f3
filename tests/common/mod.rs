#![allow(dead_code)]

use pg_change_notifier::config::{Config, DatabaseConfig};
use pg_change_notifier::filter::TableFilter;
use std::env;
use tokio_postgres::{Client, NoTls};

/// Get database settings from environment variables
pub fn get_test_database() -> DatabaseConfig {
    // Use TEST_ prefix for test environment variables
    let mut database = DatabaseConfig::new(
        env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
    );
    database.port = env::var("TEST_PG_PORT")
        .unwrap_or_else(|_| "5432".to_string())
        .parse()
        .unwrap_or(5432);
    database.connect_timeout_secs = 5;
    database
}

/// Config watching only `table`; deliveries are added per test
pub fn get_test_config(table: &str) -> Config {
    Config::new(get_test_database()).with_tables(TableFilter::default().include([table]))
}

/// Unique per test process so parallel runs do not collide
pub fn test_table_name(suffix: &str) -> String {
    format!("notifier_{}_{}", suffix, std::process::id())
}

pub async fn connect() -> Client {
    let (client, connection) = get_test_database()
        .pg_config()
        .connect(NoTls)
        .await
        .expect("connect to test database");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Test connection error: {}", e);
        }
    });
    client
}

pub async fn create_table(client: &Client, table: &str) {
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS public.{table};
             CREATE TABLE public.{table} (id SERIAL PRIMARY KEY, name TEXT NOT NULL, balance INT NOT NULL);"
        ))
        .await
        .expect("create test table");
}

pub async fn drop_table(client: &Client, table: &str) {
    client
        .batch_execute(&format!("DROP TABLE IF EXISTS public.{table}"))
        .await
        .ok();
}

pub async fn trigger_count(client: &Client, table: &str) -> i64 {
    client
        .query_one(
            "SELECT count(*) FROM pg_catalog.pg_trigger t
             JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid
             WHERE c.relname = $1 AND NOT t.tgisinternal",
            &[&table],
        )
        .await
        .expect("count triggers")
        .get(0)
}
