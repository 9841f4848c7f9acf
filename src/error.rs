use std::fmt;
use std::path::PathBuf;
use thiserror::Error as TError;

/// The single error type returned by every fallible operation in this crate.
///
/// Matches against [`Kind`] via [`Error::kind`] to make exit-code or retry
/// decisions; `source()` chains back to the underlying driver error where one
/// exists.
#[derive(Debug)]
pub struct Error {
    kind: Box<Kind>,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            kind: Box::new(kind),
        }
    }

    /// Return the kind of error that occurred.
    pub fn kind(&self) -> &Kind {
        &self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

/// The flat union of error kinds this crate can raise.
#[derive(Debug, TError)]
pub enum Kind {
    /// The DSN or pool sizing is invalid; raised at [`crate::config::Config`] construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The driver refused or lost a connection.
    #[error("connection error: {0}")]
    Connection(String, #[source] Box<dyn std::error::Error + Sync + Send>),

    /// A migrations (or fixtures) directory is missing or empty where content is required.
    #[error("schema error: {0}")]
    Schema(String),

    /// A migration's SQL or plugin body failed to apply or roll back.
    #[error("migration {version} failed: {message}")]
    Migration {
        version: i64,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Sync + Send>>,
    },

    /// An unknown dependency or a cycle was found before any DDL ran.
    #[error("dependency error: {0}")]
    Dependency(String),

    /// A stored checksum no longer matches the migration's file contents.
    #[error("checksum mismatch for migration(s): {0:?}")]
    Checksum(Vec<i64>),

    /// Clone creation, template flagging, or drop of a test database failed.
    #[error("test database error: {0}")]
    TestDatabase(String),
}

/// Thin names over [`Kind`] constructors (`configuration`, `schema`, `dependency`, ...)
/// without exposing a public constructor per variant.
impl Error {
    pub(crate) fn configuration(msg: impl Into<String>) -> Error {
        Error::new(Kind::Configuration(msg.into()))
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Error {
        Error::new(Kind::Schema(msg.into()))
    }

    pub(crate) fn dependency(msg: impl Into<String>) -> Error {
        Error::new(Kind::Dependency(msg.into()))
    }

    pub(crate) fn checksum(versions: Vec<i64>) -> Error {
        Error::new(Kind::Checksum(versions))
    }

    pub(crate) fn migration(version: i64, message: impl Into<String>) -> Error {
        Error::new(Kind::Migration {
            version,
            message: message.into(),
            source: None,
        })
    }

    pub(crate) fn test_database(msg: impl Into<String>) -> Error {
        Error::new(Kind::TestDatabase(msg.into()))
    }

    pub(crate) fn invalid_migration_path(path: &PathBuf, err: std::io::Error) -> Error {
        Error::schema(format!("invalid migrations path {}: {err}", path.display()))
    }
}

/// Helper trait for attaching migration context to a driver error.
pub(crate) trait WrapMigrationError<T> {
    fn migration_err(self, version: i64, msg: &str) -> Result<T, Error>;
}

impl<T, E> WrapMigrationError<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn migration_err(self, version: i64, msg: &str) -> Result<T, Error> {
        self.map_err(|err| {
            Error::new(Kind::Migration {
                version,
                message: msg.to_string(),
                source: Some(Box::new(err)),
            })
        })
    }
}

/// Helper trait for wrapping a driver error that has no associated migration.
pub(crate) trait WrapConnectionError<T> {
    fn connection_err(self, msg: &str) -> Result<T, Error>;
}

impl<T, E> WrapConnectionError<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn connection_err(self, msg: &str) -> Result<T, Error> {
        self.map_err(|err| Error::new(Kind::Connection(msg.to_string(), Box::new(err))))
    }
}
