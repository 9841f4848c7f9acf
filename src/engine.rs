use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use deadpool_postgres::Pool;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;

use crate::config::Config;
use crate::discovery::discover_migrations;
use crate::error::{Error, WrapConnectionError, WrapMigrationError};
use crate::graph::DependencyGraph;
use crate::migration::{MigrationKind, MigrationRecord};
use crate::registry::PluginRegistry;

const ASSERT_TABLE_QUERY: &str = r#"
CREATE TABLE IF NOT EXISTS "%TABLE%" (
    version BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    checksum CHAR(64),
    applied_at TIMESTAMP DEFAULT NOW()
)
"#;

/// One row of `_pgfast_migrations`.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub checksum: Option<String>,
}

/// Returned by [`Engine::status`].
#[derive(Clone, Debug)]
pub struct Status {
    pub current_version: i64,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<MigrationRecord>,
}

/// Returned by [`Engine::verify_checksums`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VerifyReport {
    pub valid: Vec<i64>,
    pub invalid: Vec<i64>,
}

/// Returned by [`Engine::preview`].
#[derive(Clone, Debug)]
pub struct Preview {
    pub version: i64,
    pub name: String,
    pub dependencies: BTreeSet<i64>,
    pub checksum: String,
    pub sql_preview: String,
    pub total_lines: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// The stage of progress reported via [`Engine::up`]'s/[`Engine::down`]'s
/// progress callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStatus {
    Started,
    Completed,
    WouldApply,
}

/// Stop condition for [`Engine::up`].
#[derive(Clone, Copy, Debug, Default)]
pub enum UpTarget {
    #[default]
    Latest,
    Version(i64),
}

/// Stop condition for [`Engine::down`].
#[derive(Clone, Copy, Debug)]
pub enum DownTarget {
    Version(i64),
    Steps(usize),
}

/// Options threaded through [`Engine::up`]/[`Engine::down`].
#[derive(Default)]
pub struct ApplyOptions<'a> {
    pub force: bool,
    pub dry_run: bool,
    pub timeout: Option<Duration>,
    pub on_progress: Option<&'a (dyn Fn(&MigrationRecord, usize, usize, ProgressStatus, f64) + Sync)>,
}

/// Orchestrates forward/reverse migration application, status, checksum
/// verification, and dependency inspection against a live pool.
pub struct Engine {
    pool: Pool,
    config: Config,
    registry: PluginRegistry,
    table_guard: Mutex<()>,
}

impl Engine {
    pub fn new(pool: Pool, config: Config) -> Engine {
        Engine {
            pool,
            config,
            registry: PluginRegistry::new(),
            table_guard: Mutex::new(()),
        }
    }

    /// Register the up/down closures for a plugin-kind migration version.
    /// Must be called before the first `up`/`down` touching that version.
    pub fn register_plugin(
        &mut self,
        version: i64,
        up: crate::registry::PluginFn,
        down: crate::registry::PluginFn,
    ) {
        self.registry.register(version, up, down);
    }

    fn table_name(&self) -> &str {
        self.config.migration_table()
    }

    fn assert_table_query(&self) -> String {
        ASSERT_TABLE_QUERY.replace("%TABLE%", self.table_name())
    }

    async fn ensure_table(&self) -> Result<(), Error> {
        let _guard = self.table_guard.lock().await;
        let client = self
            .pool
            .get()
            .await
            .connection_err("failed to acquire a connection")?;
        client
            .batch_execute(&self.assert_table_query())
            .await
            .connection_err("failed to create migrations table")?;
        log::debug!("asserted migrations table {}", self.table_name());
        Ok(())
    }

    async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, Error> {
        let client = self
            .pool
            .get()
            .await
            .connection_err("failed to acquire a connection")?;
        let query = format!(
            "SELECT version, name, checksum FROM \"{}\" ORDER BY version",
            self.table_name()
        );
        let rows = client
            .query(query.as_str(), &[])
            .await
            .connection_err("failed to read applied migrations")?;
        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration {
                version: row.get(0),
                name: row.get(1),
                checksum: row.get(2),
            })
            .collect())
    }

    async fn advisory_lock(&self) -> Result<deadpool_postgres::Object, Error> {
        let client = self
            .pool
            .get()
            .await
            .connection_err("failed to acquire a connection")?;
        let key = lock_key(self.table_name());
        client
            .execute("SELECT pg_advisory_lock($1)", &[&key])
            .await
            .connection_err("failed to acquire advisory lock")?;
        Ok(client)
    }

    async fn advisory_unlock(&self, client: &deadpool_postgres::Object) -> Result<(), Error> {
        let key = lock_key(self.table_name());
        client
            .execute("SELECT pg_advisory_unlock($1)", &[&key])
            .await
            .connection_err("failed to release advisory lock")?;
        Ok(())
    }

    fn discover(&self) -> Result<Vec<MigrationRecord>, Error> {
        discover_migrations(self.config.migrations_dirs())
    }

    /// Read-only snapshot: current version, applied rows, and pending records.
    pub async fn status(&self) -> Result<Status, Error> {
        self.ensure_table().await?;
        let applied = self.applied_migrations().await?;
        let applied_versions: BTreeSet<i64> = applied.iter().map(|a| a.version).collect();
        let migrations = self.discover()?;
        let graph = DependencyGraph::build(&migrations)?;
        let by_version: HashMap<i64, &MigrationRecord> =
            migrations.iter().map(|m| (m.version(), m)).collect();

        let pending: Vec<MigrationRecord> = graph
            .apply_order()
            .iter()
            .filter(|v| !applied_versions.contains(v))
            .map(|v| by_version[v].clone())
            .collect();

        let current_version = applied_versions.iter().copied().max().unwrap_or(0);
        Ok(Status {
            current_version,
            applied,
            pending,
        })
    }

    /// Recompute every applied migration's checksum (where the file still
    /// exists) and compare it against the stored value.
    pub async fn verify_checksums(&self) -> Result<VerifyReport, Error> {
        self.ensure_table().await?;
        let applied = self.applied_migrations().await?;
        let migrations = self.discover()?;
        let by_version: HashMap<i64, &MigrationRecord> =
            migrations.iter().map(|m| (m.version(), m)).collect();

        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for row in &applied {
            match by_version.get(&row.version) {
                Some(migration) => match migration.checksum() {
                    Ok(checksum) if Some(&checksum) == row.checksum.as_ref() => {
                        valid.push(row.version)
                    }
                    _ => invalid.push(row.version),
                },
                None => invalid.push(row.version),
            }
        }
        Ok(VerifyReport { valid, invalid })
    }

    /// The dependency graph, as `version -> declared dependencies`.
    pub fn get_dependency_graph(&self) -> Result<HashMap<i64, BTreeSet<i64>>, Error> {
        let migrations = self.discover()?;
        let mut out = HashMap::new();
        for migration in &migrations {
            let deps = migration.declared_dependencies().map_err(|err| {
                Error::dependency(format!(
                    "failed to read dependency header for migration {}: {err}",
                    migration.version()
                ))
            })?;
            out.insert(migration.version(), deps);
        }
        Ok(out)
    }

    /// Read-only inspection of one migration's artifact without applying it.
    pub fn preview(&self, migration: &MigrationRecord, direction: Direction) -> Result<Preview, Error> {
        let path = match direction {
            Direction::Up => migration.up_artifact(),
            Direction::Down => migration.down_artifact(),
        };
        let body = std::fs::read_to_string(path)
            .map_err(|err| Error::invalid_migration_path(&path.to_path_buf(), err))?;
        let dependencies = migration.declared_dependencies().map_err(|err| {
            Error::dependency(format!(
                "failed to read dependency header for migration {}: {err}",
                migration.version()
            ))
        })?;
        let checksum = migration
            .checksum()
            .map_err(|err| Error::invalid_migration_path(&path.to_path_buf(), err))?;
        let total_lines = body.lines().count();
        let sql_preview: String = body.lines().take(20).collect::<Vec<_>>().join("\n");
        Ok(Preview {
            version: migration.version(),
            name: migration.name().to_string(),
            dependencies,
            checksum,
            sql_preview,
            total_lines,
        })
    }

    /// Forward-apply pending migrations.
    pub async fn up(&self, target: UpTarget, options: ApplyOptions<'_>) -> Result<Vec<i64>, Error> {
        let lock = self.advisory_lock().await?;
        let result = self.up_locked(target, options).await;
        self.advisory_unlock(&lock).await?;
        result
    }

    async fn up_locked(&self, target: UpTarget, options: ApplyOptions<'_>) -> Result<Vec<i64>, Error> {
        self.ensure_table().await?;
        let applied = self.applied_migrations().await?;
        let applied_versions: BTreeSet<i64> = applied.iter().map(|a| a.version).collect();
        let applied_checksums: HashMap<i64, Option<String>> = applied
            .into_iter()
            .map(|a| (a.version, a.checksum))
            .collect();

        let migrations = self.discover()?;
        let by_version: HashMap<i64, MigrationRecord> = migrations
            .iter()
            .map(|m| (m.version(), m.clone()))
            .collect();

        if !options.force {
            let mut mismatched = Vec::new();
            for version in &applied_versions {
                if let Some(migration) = by_version.get(version) {
                    if !migration.is_complete() {
                        continue;
                    }
                    let current = migration
                        .checksum()
                        .map_err(|err| Error::invalid_migration_path(&migration.up_artifact().to_path_buf(), err))?;
                    if Some(&current) != applied_checksums[version].as_ref() {
                        mismatched.push(*version);
                    }
                }
            }
            if !mismatched.is_empty() {
                return Err(Error::checksum(mismatched));
            }
        }

        let graph = DependencyGraph::build(&migrations)?;
        let mut ordered = graph.apply_order().to_vec();
        if let UpTarget::Version(target_version) = target {
            ordered.retain(|v| *v <= target_version);
        }

        let pending: Vec<MigrationRecord> = ordered
            .into_iter()
            .filter(|v| !applied_versions.contains(v))
            .map(|v| by_version[&v].clone())
            .collect();

        if pending.is_empty() {
            log::info!("no migrations to apply");
            return Ok(Vec::new());
        }

        let total = pending.len();
        let mut applied_now = Vec::with_capacity(total);
        for (i, migration) in pending.iter().enumerate() {
            if options.dry_run {
                if let Some(cb) = options.on_progress {
                    cb(migration, i + 1, total, ProgressStatus::WouldApply, 0.0);
                }
                continue;
            }
            if let Some(cb) = options.on_progress {
                cb(migration, i + 1, total, ProgressStatus::Started, 0.0);
            }

            let started = Instant::now();
            self.apply_one(migration, Direction::Up, options.timeout).await?;
            applied_now.push(migration.version());

            if let Some(cb) = options.on_progress {
                cb(
                    migration,
                    i + 1,
                    total,
                    ProgressStatus::Completed,
                    started.elapsed().as_secs_f64(),
                );
            }
        }

        if options.dry_run {
            return Ok(pending.iter().map(|m| m.version()).collect());
        }
        Ok(applied_now)
    }

    /// Reverse-apply applied migrations.
    pub async fn down(&self, target: DownTarget, options: ApplyOptions<'_>) -> Result<Vec<i64>, Error> {
        let lock = self.advisory_lock().await?;
        let result = self.down_locked(target, options).await;
        self.advisory_unlock(&lock).await?;
        result
    }

    async fn down_locked(
        &self,
        target: DownTarget,
        options: ApplyOptions<'_>,
    ) -> Result<Vec<i64>, Error> {
        self.ensure_table().await?;
        let applied = self.applied_migrations().await?;
        let applied_versions: Vec<i64> = {
            let mut v: Vec<i64> = applied.iter().map(|a| a.version).collect();
            v.sort_unstable();
            v
        };

        let to_roll_back: BTreeSet<i64> = match target {
            DownTarget::Version(target_version) => applied_versions
                .iter()
                .copied()
                .filter(|v| *v > target_version)
                .collect(),
            DownTarget::Steps(steps) => applied_versions
                .iter()
                .rev()
                .take(steps)
                .copied()
                .collect(),
        };

        if to_roll_back.is_empty() {
            return Ok(Vec::new());
        }

        let migrations = self.discover()?;
        let by_version: HashMap<i64, MigrationRecord> = migrations
            .iter()
            .map(|m| (m.version(), m.clone()))
            .collect();
        let graph = DependencyGraph::build(&migrations)?;

        let ordered: Vec<i64> = graph
            .rollback_order()
            .into_iter()
            .filter(|v| to_roll_back.contains(v))
            .collect();

        let total = ordered.len();
        let mut rolled_back = Vec::with_capacity(total);
        for (i, version) in ordered.iter().enumerate() {
            let migration = by_version.get(version).ok_or_else(|| {
                Error::schema(format!(
                    "applied migration {version} no longer has a matching file on disk"
                ))
            })?;

            if options.dry_run {
                if let Some(cb) = options.on_progress {
                    cb(migration, i + 1, total, ProgressStatus::WouldApply, 0.0);
                }
                continue;
            }
            if let Some(cb) = options.on_progress {
                cb(migration, i + 1, total, ProgressStatus::Started, 0.0);
            }

            let started = Instant::now();
            self.apply_one(migration, Direction::Down, options.timeout).await?;
            rolled_back.push(*version);

            if let Some(cb) = options.on_progress {
                cb(
                    migration,
                    i + 1,
                    total,
                    ProgressStatus::Completed,
                    started.elapsed().as_secs_f64(),
                );
            }
        }

        if options.dry_run {
            return Ok(ordered);
        }
        Ok(rolled_back)
    }

    async fn apply_one(
        &self,
        migration: &MigrationRecord,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let body = async {
            let mut client = self
                .pool
                .get()
                .await
                .connection_err("failed to acquire a connection")?;
            let tx = client
                .transaction()
                .await
                .migration_err(migration.version(), "failed to begin transaction")?;

            match direction {
                Direction::Up => self.apply_up_body(migration, &tx).await?,
                Direction::Down => self.apply_down_body(migration, &tx).await?,
            }

            match direction {
                Direction::Up => {
                    let checksum = migration.checksum().map_err(|err| {
                        Error::invalid_migration_path(&migration.up_artifact().to_path_buf(), err)
                    })?;
                    let query = format!(
                        "INSERT INTO \"{}\" (version, name, checksum) VALUES ($1, $2, $3)",
                        self.table_name()
                    );
                    let params: [&(dyn ToSql + Sync); 3] =
                        [&migration.version(), &migration.name(), &checksum];
                    tx.execute(query.as_str(), &params)
                        .await
                        .migration_err(migration.version(), "failed to record applied migration")?;
                }
                Direction::Down => {
                    let query = format!("DELETE FROM \"{}\" WHERE version = $1", self.table_name());
                    tx.execute(query.as_str(), &[&migration.version()])
                        .await
                        .migration_err(migration.version(), "failed to clear tracking row")?;
                }
            }

            tx.commit()
                .await
                .migration_err(migration.version(), "failed to commit transaction")?;
            Ok(())
        };

        match timeout {
            Some(duration) => tokio::time::timeout(duration, body)
                .await
                .map_err(|_| Error::migration(migration.version(), "migration timed out"))?,
            None => body.await,
        }
    }

    async fn apply_up_body(
        &self,
        migration: &MigrationRecord,
        tx: &tokio_postgres::Transaction<'_>,
    ) -> Result<(), Error> {
        match migration.kind() {
            MigrationKind::Sql => {
                let sql = std::fs::read_to_string(migration.up_artifact())
                    .map_err(|err| Error::invalid_migration_path(&migration.up_artifact().to_path_buf(), err))?;
                tx.batch_execute(&sql)
                    .await
                    .migration_err(migration.version(), "up migration failed")?;
            }
            MigrationKind::Plugin => {
                let plugin = self.registry.up_for(migration.version()).ok_or_else(|| {
                    Error::migration(
                        migration.version(),
                        "no plugin registered for this version's up direction",
                    )
                })?;
                plugin(tx).await?;
            }
        }
        Ok(())
    }

    async fn apply_down_body(
        &self,
        migration: &MigrationRecord,
        tx: &tokio_postgres::Transaction<'_>,
    ) -> Result<(), Error> {
        match migration.kind() {
            MigrationKind::Sql => {
                let sql = std::fs::read_to_string(migration.down_artifact())
                    .map_err(|err| Error::invalid_migration_path(&migration.down_artifact().to_path_buf(), err))?;
                tx.batch_execute(&sql)
                    .await
                    .migration_err(migration.version(), "down migration failed")?;
            }
            MigrationKind::Plugin => {
                let plugin = self.registry.down_for(migration.version()).ok_or_else(|| {
                    Error::migration(
                        migration.version(),
                        "no plugin registered for this version's down direction",
                    )
                })?;
                plugin(tx).await?;
            }
        }
        Ok(())
    }

    /// Write a new up/down stub pair under `dir`. The version is the current
    /// wall-clock time as `YYYYMMDDHHMMSS`, bumped by a process-local counter
    /// when two calls land in the same second so versions stay strictly
    /// increasing within one process.
    pub fn create_migration(
        &self,
        name: &str,
        dir: &Path,
        auto_depend: bool,
        plugin: bool,
    ) -> Result<(PathBuf, PathBuf), Error> {
        write_migration_stub(name, dir, next_version(), auto_depend, plugin)
    }
}

fn write_migration_stub(
    name: &str,
    dir: &Path,
    version: i64,
    auto_depend: bool,
    plugin: bool,
) -> Result<(PathBuf, PathBuf), Error> {
    let sanitized = sanitize_name(name);
    let ext = if plugin { "py" } else { "sql" };
    let up_path = dir.join(format!("{version}_{sanitized}_up.{ext}"));
    let down_path = dir.join(format!("{version}_{sanitized}_down.{ext}"));

    let latest_existing = discover_migrations(&[dir.to_path_buf()])
        .ok()
        .and_then(|existing| existing.iter().map(|m| m.version()).max());

    let marker = if plugin { "#" } else { "--" };
    let mut up_body = String::new();
    if auto_depend {
        if let Some(latest) = latest_existing {
            up_body.push_str(&format!("{marker} depends_on: {latest}\n"));
        }
    }
    if plugin {
        up_body.push_str(&format!(
            "{marker} register this version's up closure via Engine::register_plugin({version}, ..)\n"
        ));
    } else {
        up_body.push_str("-- write the forward migration here\n");
    }

    let down_body = if plugin {
        format!("{marker} register this version's down closure via Engine::register_plugin({version}, ..)\n")
    } else {
        "-- write the reverse migration here\n".to_string()
    };

    std::fs::write(&up_path, up_body).map_err(|err| Error::invalid_migration_path(&up_path, err))?;
    std::fs::write(&down_path, down_body)
        .map_err(|err| Error::invalid_migration_path(&down_path, err))?;

    Ok((up_path, down_path))
}

static LAST_ISSUED_VERSION: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(0);

/// `YYYYMMDDHHMMSS` from the current wall-clock time, bumped by one when a
/// prior call already issued a version at or after this tick.
fn next_version() -> i64 {
    use std::sync::atomic::Ordering;
    use time::OffsetDateTime;

    let now = OffsetDateTime::now_utc();
    let candidate: i64 = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
    .parse()
    .expect("formatted timestamp always parses as an integer");

    loop {
        let last = LAST_ISSUED_VERSION.load(Ordering::SeqCst);
        let next = if candidate > last { candidate } else { last + 1 };
        if LAST_ISSUED_VERSION
            .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return next;
        }
    }
}

fn sanitize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else if c == ' ' || c == '-' { '_' } else { ' ' })
        .filter(|c| *c != ' ')
        .collect()
}

/// Hash the migration table name into an `i64` advisory lock key, so distinct
/// `migration_table` configurations (multi-schema setups) don't contend.
fn lock_key(table_name: &str) -> i64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    table_name.hash(&mut hasher);
    hasher.finish() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_lowercases_and_replaces_separators() {
        assert_eq!(sanitize_name("Create Users Table"), "create_users_table");
        assert_eq!(sanitize_name("add-index!"), "add_index");
    }

    #[test]
    fn lock_key_is_deterministic_per_table_name() {
        assert_eq!(lock_key("_pgfast_migrations"), lock_key("_pgfast_migrations"));
        assert_ne!(lock_key("_pgfast_migrations"), lock_key("other_table"));
    }

    #[test]
    fn next_version_is_strictly_increasing() {
        let mut last = next_version();
        for _ in 0..50 {
            let current = next_version();
            assert!(current > last);
            last = current;
        }
    }

    #[test]
    fn write_migration_stub_writes_sql_pair() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (up, down) = write_migration_stub("Create Users", tmp.path(), 100, false, false).unwrap();
        assert!(up.ends_with("100_create_users_up.sql"));
        assert!(down.ends_with("100_create_users_down.sql"));
        assert!(std::fs::read_to_string(up).unwrap().contains("forward migration"));
    }

    #[test]
    fn write_migration_stub_auto_depend_references_latest_version() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_migration_stub("first", tmp.path(), 100, false, false).unwrap();
        let (up, _) = write_migration_stub("second", tmp.path(), 200, true, false).unwrap();
        let body = std::fs::read_to_string(up).unwrap();
        assert!(body.contains("depends_on: 100"));
    }

    #[test]
    fn write_migration_stub_plugin_uses_py_suffix() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (up, down) = write_migration_stub("seed", tmp.path(), 300, false, true).unwrap();
        assert!(up.ends_with("300_seed_up.py"));
        assert!(down.ends_with("300_seed_down.py"));
    }
}
