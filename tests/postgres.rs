use std::fs;

use driftless::{ApplyOptions, Config, DownTarget, Engine, FixtureLoader, UpTarget};
use tempfile::TempDir;

fn test_config(migrations_dir: &std::path::Path) -> Config {
    Config::from_test_env()
        .unwrap()
        .with_migrations_dirs(vec![migrations_dir.to_path_buf()])
        .with_migration_table(unique_table_name())
}

fn unique_table_name() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("_driftless_test_{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

async fn pool_for(config: &Config) -> deadpool_postgres::Pool {
    let mut pool_config = deadpool_postgres::Config::new();
    let url = url::Url::parse(config.dsn()).unwrap();
    pool_config.host = url.host_str().map(str::to_string);
    pool_config.port = url.port();
    pool_config.user = Some(url.username().to_string());
    pool_config.password = url.password().map(str::to_string);
    pool_config.dbname = Some(url.path().trim_start_matches('/').to_string());
    pool_config
        .create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
        .unwrap()
}

fn write_migration(dir: &std::path::Path, version: i64, name: &str, up: &str, down: &str) {
    fs::write(dir.join(format!("{version}_{name}_up.sql")), up).unwrap();
    fs::write(dir.join(format!("{version}_{name}_down.sql")), down).unwrap();
}

async fn drop_tracking_table(pool: &deadpool_postgres::Pool, table: &str) {
    if let Ok(client) = pool.get().await {
        let _ = client
            .batch_execute(&format!("DROP TABLE IF EXISTS \"{table}\""))
            .await;
    }
}

#[tokio::test]
async fn applies_and_tracks_a_linear_chain() {
    let tmp = TempDir::new().unwrap();
    write_migration(
        tmp.path(),
        100,
        "create_people",
        "CREATE TABLE people (id SERIAL PRIMARY KEY, name TEXT NOT NULL);",
        "DROP TABLE people;",
    );
    write_migration(
        tmp.path(),
        200,
        "add_city",
        "-- depends_on: 100\nALTER TABLE people ADD COLUMN city TEXT;",
        "ALTER TABLE people DROP COLUMN city;",
    );

    let config = test_config(tmp.path());
    let pool = pool_for(&config).await;
    let table = config.migration_table().to_string();

    let engine = Engine::new(pool.clone(), config);
    let applied = engine
        .up(UpTarget::Latest, ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(applied, vec![100, 200]);

    let status = engine.status().await.unwrap();
    assert_eq!(status.current_version, 200);
    assert!(status.pending.is_empty());

    let client = pool.get().await.unwrap();
    client
        .execute(
            "INSERT INTO people (name, city) VALUES ($1, $2)",
            &[&"Ada Lovelace", &"London"],
        )
        .await
        .unwrap();
    let rows = client
        .query("SELECT name, city FROM people", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let name: String = rows[0].get(0);
    assert_eq!(name, "Ada Lovelace");

    drop_tracking_table(&pool, &table).await;
}

#[tokio::test]
async fn rolls_back_one_step() {
    let tmp = TempDir::new().unwrap();
    write_migration(
        tmp.path(),
        100,
        "create_widgets",
        "CREATE TABLE widgets (id SERIAL PRIMARY KEY);",
        "DROP TABLE widgets;",
    );
    write_migration(
        tmp.path(),
        200,
        "add_widget_price",
        "-- depends_on: 100\nALTER TABLE widgets ADD COLUMN price INTEGER;",
        "ALTER TABLE widgets DROP COLUMN price;",
    );

    let config = test_config(tmp.path());
    let pool = pool_for(&config).await;
    let table = config.migration_table().to_string();

    let engine = Engine::new(pool.clone(), config);
    engine
        .up(UpTarget::Latest, ApplyOptions::default())
        .await
        .unwrap();

    let rolled_back = engine
        .down(DownTarget::Steps(1), ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(rolled_back, vec![200]);

    let status = engine.status().await.unwrap();
    assert_eq!(status.current_version, 100);

    drop_tracking_table(&pool, &table).await;
}

#[tokio::test]
async fn detects_a_tampered_migration_file() {
    let tmp = TempDir::new().unwrap();
    write_migration(
        tmp.path(),
        100,
        "create_accounts",
        "CREATE TABLE accounts (id SERIAL PRIMARY KEY);",
        "DROP TABLE accounts;",
    );

    let config = test_config(tmp.path());
    let pool = pool_for(&config).await;
    let table = config.migration_table().to_string();

    let engine = Engine::new(pool.clone(), config);
    engine
        .up(UpTarget::Latest, ApplyOptions::default())
        .await
        .unwrap();

    fs::write(
        tmp.path().join("100_create_accounts_up.sql"),
        "CREATE TABLE accounts (id SERIAL PRIMARY KEY, tampered BOOLEAN);",
    )
    .unwrap();

    let report = engine.verify_checksums().await.unwrap();
    assert_eq!(report.invalid, vec![100]);
    assert!(report.valid.is_empty());

    let err = engine
        .up(UpTarget::Latest, ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), driftless::Kind::Checksum(_)));

    drop_tracking_table(&pool, &table).await;
}

#[tokio::test]
async fn dry_run_reports_without_applying() {
    let tmp = TempDir::new().unwrap();
    write_migration(
        tmp.path(),
        100,
        "create_orders",
        "CREATE TABLE orders (id SERIAL PRIMARY KEY);",
        "DROP TABLE orders;",
    );

    let config = test_config(tmp.path());
    let pool = pool_for(&config).await;
    let table = config.migration_table().to_string();

    let engine = Engine::new(pool.clone(), config);
    let options = ApplyOptions {
        dry_run: true,
        ..Default::default()
    };
    let would_apply = engine.up(UpTarget::Latest, options).await.unwrap();
    assert_eq!(would_apply, vec![100]);

    let status = engine.status().await.unwrap();
    assert_eq!(status.current_version, 0);
    assert_eq!(status.pending.len(), 1);

    drop_tracking_table(&pool, &table).await;
}

#[tokio::test]
async fn loads_fixtures_after_migrating() {
    let tmp = TempDir::new().unwrap();
    write_migration(
        tmp.path(),
        100,
        "create_tags",
        "CREATE TABLE tags (id SERIAL PRIMARY KEY, label TEXT NOT NULL);",
        "DROP TABLE tags;",
    );
    fs::write(
        tmp.path().join("100_tags_fixture.sql"),
        "INSERT INTO tags (label) VALUES ('seeded');",
    )
    .unwrap();

    let config = test_config(tmp.path()).with_fixtures_dirs(vec![tmp.path().to_path_buf()]);
    let pool = pool_for(&config).await;
    let table = config.migration_table().to_string();

    let engine = Engine::new(pool.clone(), config.clone());
    engine
        .up(UpTarget::Latest, ApplyOptions::default())
        .await
        .unwrap();

    let loader = FixtureLoader::new(pool.clone(), config);
    let loaded = loader.load_all().await.unwrap();
    assert_eq!(loaded, vec![100]);

    let client = pool.get().await.unwrap();
    let rows = client.query("SELECT label FROM tags", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    let label: String = rows[0].get(0);
    assert_eq!(label, "seeded");

    drop_tracking_table(&pool, &table).await;
}
