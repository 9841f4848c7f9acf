use std::collections::HashMap;
use std::sync::Mutex;

use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use once_cell::sync::Lazy;
use rand::Rng;
use tokio_postgres::NoTls;
use url::Url;

use crate::config::Config;
use crate::engine::{ApplyOptions, Engine, UpTarget};
use crate::error::{Error, WrapConnectionError};

/// Process-local map from a pool's identity (its address, since `Pool` has no
/// stable id) to the database name it was opened against. Only consulted by
/// [`cleanup_pool`]; new call sites should prefer [`TestDatabase`], which
/// carries its own name and never needs this map.
static POOL_NAMES: Lazy<Mutex<HashMap<usize, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn pool_identity(pool: &Pool) -> usize {
    pool as *const Pool as usize
}

fn register_pool_name(pool: &Pool, name: &str) {
    POOL_NAMES
        .lock()
        .unwrap()
        .insert(pool_identity(pool), name.to_string());
}

fn take_pool_name(pool: &Pool) -> Option<String> {
    POOL_NAMES.lock().unwrap().remove(&pool_identity(pool))
}

/// An owned pool-and-name pair for a single test database clone. Dropping
/// this value does not tear the database down: call [`TestDatabase::close`]
/// (or let the owning [`TestDatabaseManager`] session end and call
/// [`TestDatabaseManager::teardown_all`]).
pub struct TestDatabase {
    name: String,
    pool: Pool,
}

impl TestDatabase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Builds a migrated template database once per session and clones
/// disposable per-test databases from it using `CREATE DATABASE ... TEMPLATE`.
pub struct TestDatabaseManager {
    config: Config,
    template_name: Mutex<Option<String>>,
    created: Mutex<Vec<String>>,
}

impl TestDatabaseManager {
    pub fn new(config: Config) -> TestDatabaseManager {
        TestDatabaseManager {
            config,
            template_name: Mutex::new(None),
            created: Mutex::new(Vec::new()),
        }
    }

    async fn admin_pool(&self) -> Result<Pool, Error> {
        open_pool(&self.config.admin_dsn()?)
    }

    /// Build the session-scoped template database once: create it, run every
    /// migration against it, then flip `datistemplate`.
    pub async fn create_template(&self) -> Result<String, Error> {
        let name = format!("pgfast_template_{}", random_hex(8));
        let admin = self.admin_pool().await?;
        create_database(&admin, &name).await?;
        self.remember(&name);

        let template_dsn = self.config.dsn_for_database(&name)?;
        let template_pool = open_pool(&template_dsn)?;
        let engine = Engine::new(template_pool, self.config.clone());
        if let Err(err) = engine.up(UpTarget::Latest, ApplyOptions::default()).await {
            let _ = drop_database(&admin, &name, false).await;
            return Err(err);
        }

        let client = admin
            .get()
            .await
            .connection_err("failed to acquire admin connection")?;
        client
            .execute(
                "UPDATE pg_database SET datistemplate = true WHERE datname = $1",
                &[&name],
            )
            .await
            .connection_err("failed to flag template database")?;

        *self.template_name.lock().unwrap() = Some(name.clone());
        log::info!("created template database {name}");
        Ok(name)
    }

    /// Clone a fresh database from the session template and return a handle
    /// owning both its pool and name.
    pub async fn clone_test_database(&self) -> Result<TestDatabase, Error> {
        let template = self
            .template_name
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::test_database("create_template must be called before cloning"))?;

        let name = format!("pgfast_test_{}", random_hex(8));
        let admin = self.admin_pool().await?;

        let client = admin
            .get()
            .await
            .connection_err("failed to acquire admin connection")?;
        let ddl: String = client
            .query_one(
                "SELECT format('CREATE DATABASE %I TEMPLATE %I', $1, $2)",
                &[&name, &template],
            )
            .await
            .connection_err("failed to build CREATE DATABASE statement")?
            .get(0);
        client
            .batch_execute(&ddl)
            .await
            .map_err(|err| Error::test_database(format!("failed to clone test database: {err}")))?;
        self.remember(&name);

        let dsn = self.config.dsn_for_database(&name)?;
        let pool = open_pool(&dsn)?;
        register_pool_name(&pool, &name);

        log::info!("cloned test database {name} from template {template}");
        Ok(TestDatabase { name, pool })
    }

    /// Tear down one clone by its owning handle.
    pub async fn teardown(&self, database: TestDatabase) -> Result<(), Error> {
        let TestDatabase { name, pool } = database;
        drop(pool);
        let admin = self.admin_pool().await?;
        drop_database(&admin, &name, false).await?;
        self.forget(&name);
        Ok(())
    }

    /// Tear down a pool obtained elsewhere, looking its database name up in
    /// the process-local registry. Prefer [`TestDatabaseManager::teardown`]
    /// with an owned [`TestDatabase`] for new call sites.
    pub async fn cleanup_pool(&self, pool: Pool) -> Result<(), Error> {
        let name = take_pool_name(&pool)
            .ok_or_else(|| Error::test_database("no registered database name for this pool"))?;
        drop(pool);
        let admin = self.admin_pool().await?;
        drop_database(&admin, &name, false).await?;
        self.forget(&name);
        Ok(())
    }

    /// Drop the template and every clone created by this manager that hasn't
    /// already been torn down. Intended for end-of-session cleanup.
    pub async fn teardown_all(&self) -> Result<(), Error> {
        let admin = self.admin_pool().await?;
        let remaining: Vec<String> = self.created.lock().unwrap().drain(..).collect();
        let template = self.template_name.lock().unwrap().take();

        for name in &remaining {
            let is_template = template.as_deref() == Some(name.as_str());
            drop_database(&admin, name, is_template).await?;
        }
        Ok(())
    }

    fn remember(&self, name: &str) {
        self.created.lock().unwrap().push(name.to_string());
    }

    fn forget(&self, name: &str) {
        self.created.lock().unwrap().retain(|n| n != name);
    }
}

async fn create_database(admin: &Pool, name: &str) -> Result<(), Error> {
    let client = admin
        .get()
        .await
        .connection_err("failed to acquire admin connection")?;
    let ddl: String = client
        .query_one("SELECT format('CREATE DATABASE %I', $1)", &[&name])
        .await
        .connection_err("failed to build CREATE DATABASE statement")?
        .get(0);
    client
        .batch_execute(&ddl)
        .await
        .map_err(|err| Error::test_database(format!("failed to create database {name}: {err}")))?;
    Ok(())
}

/// Terminate lingering backends, optionally clear `datistemplate`, then drop.
async fn drop_database(admin: &Pool, name: &str, clear_template_flag: bool) -> Result<(), Error> {
    let client = admin
        .get()
        .await
        .connection_err("failed to acquire admin connection")?;

    client
        .execute(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
            &[&name],
        )
        .await
        .connection_err("failed to terminate lingering backends")?;

    if clear_template_flag {
        client
            .execute(
                "UPDATE pg_database SET datistemplate = false WHERE datname = $1",
                &[&name],
            )
            .await
            .connection_err("failed to clear template flag")?;
    }

    let ddl: String = client
        .query_one("SELECT format('DROP DATABASE IF EXISTS %I', $1)", &[&name])
        .await
        .connection_err("failed to build DROP DATABASE statement")?
        .get(0);
    client
        .batch_execute(&ddl)
        .await
        .map_err(|err| Error::test_database(format!("failed to drop database {name}: {err}")))?;

    log::info!("dropped database {name}");
    Ok(())
}

fn random_hex(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

fn open_pool(dsn: &str) -> Result<Pool, Error> {
    let parsed = Url::parse(dsn).map_err(|e| Error::configuration(format!("invalid database url: {e}")))?;

    let mut pool_config = PoolConfig::new();
    pool_config.host = parsed.host_str().map(str::to_string);
    pool_config.port = parsed.port();
    pool_config.user = Some(parsed.username().to_string());
    pool_config.password = parsed.password().map(str::to_string);
    pool_config.dbname = Some(parsed.path().trim_start_matches('/').to_string());

    pool_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|err| Error::configuration(format!("failed to build connection pool: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_has_requested_length_and_alphabet() {
        let hex = random_hex(8);
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn random_hex_is_not_constant() {
        let samples: std::collections::HashSet<String> = (0..20).map(|_| random_hex(8)).collect();
        assert!(samples.len() > 1);
    }
}
