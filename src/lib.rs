pub mod checksum;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod fixtures;
pub mod graph;
pub mod migration;
pub mod registry;
pub mod testdb;

pub use crate::config::Config;
pub use crate::discovery::{discover_fixtures, discover_migrations};
pub use crate::engine::{
    AppliedMigration, ApplyOptions, Direction, DownTarget, Engine, Preview, ProgressStatus,
    Status, UpTarget, VerifyReport,
};
pub use crate::error::{Error, Kind};
pub use crate::fixtures::FixtureLoader;
pub use crate::graph::DependencyGraph;
pub use crate::migration::{FixtureRecord, MigrationKind, MigrationRecord};
pub use crate::registry::{PluginFn, PluginRegistry};
pub use crate::testdb::{TestDatabase, TestDatabaseManager};

pub use tokio_postgres;
