#[path = "../src/db/dialect.rs"]
mod dialect;
#[path = "../src/db/pool.rs"]
mod pool;

use dialect::{exec_insert_ignore, exec_upsert, SqlArg};
use pool::{check_pool_health, Database, PoolConfig};
use sqlx::Row;

fn test_database_url() -> Option<String> {
    let url = std::env::var("LIAO_TEST_DATABASE_URL").ok();
    if url.is_none() {
        eprintln!("skipping db integration test: set LIAO_TEST_DATABASE_URL to run it");
    }
    url
}

async fn connect(url: &str) -> Database {
    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };
    Database::connect(url, config).await.expect("pool should connect to test database")
}

#[tokio::test]
async fn pool_connects_and_passes_health_check() {
    let Some(database_url) = test_database_url() else {
        return;
    };

    let database = connect(&database_url).await;
    check_pool_health(database.pool()).await.expect("health check query should succeed");
    database.close().await;
}

#[tokio::test]
async fn insert_ignore_and_upsert_round_trip() {
    let Some(database_url) = test_database_url() else {
        return;
    };

    let database = connect(&database_url).await;
    let dialect = database.dialect();
    let table = "liao_dialect_check";

    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(database.pool())
        .await
        .expect("scratch table should drop");
    sqlx::query(&format!(
        "CREATE TABLE {table} (id VARCHAR(64) PRIMARY KEY, name VARCHAR(64), bio VARCHAR(64))"
    ))
    .execute(database.pool())
    .await
    .expect("scratch table should be created");

    let cols = ["id", "name", "bio"];
    exec_insert_ignore(
        database.pool(),
        dialect,
        table,
        &cols,
        &["id"],
        &[SqlArg::from("u1"), SqlArg::from("first"), SqlArg::from("hello")],
    )
    .await
    .expect("first insert should succeed");

    let ignored = exec_insert_ignore(
        database.pool(),
        dialect,
        table,
        &cols,
        &["id"],
        &[SqlArg::from("u1"), SqlArg::from("second"), SqlArg::Null],
    )
    .await
    .expect("duplicate insert should be ignored");
    assert_eq!(ignored.rows_affected(), 0);

    exec_upsert(
        database.pool(),
        dialect,
        table,
        &cols,
        &["id"],
        &["name"],
        &["bio"],
        &[SqlArg::from("u1"), SqlArg::from("renamed"), SqlArg::Null],
    )
    .await
    .expect("upsert should succeed");

    let row = sqlx::query(&dialect.rebind(&format!("SELECT name, bio FROM {table} WHERE id = ?")))
        .bind("u1".to_string())
        .fetch_one(database.pool())
        .await
        .expect("scratch row should exist");
    assert_eq!(row.get::<String, usize>(0), "renamed");
    assert_eq!(row.get::<String, usize>(1), "hello");

    let duplicate = sqlx::query(&dialect.rebind(&format!("INSERT INTO {table} (id) VALUES (?)")))
        .bind("u1".to_string())
        .execute(database.pool())
        .await
        .expect_err("plain duplicate insert should fail");
    assert!(dialect.is_duplicate_key(&duplicate));

    sqlx::query(&format!("DROP TABLE {table}"))
        .execute(database.pool())
        .await
        .expect("scratch table should drop");
    database.close().await;
}
