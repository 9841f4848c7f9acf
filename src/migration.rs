use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::checksum::checksum_hex;

/// The kind of artifact a migration's up/down pair is written in.
///
/// `Sql` files are executed as a statement batch. `Plugin` artifacts (anything
/// not suffixed `.sql`) are resolved through the host-provided
/// [`crate::registry::PluginRegistry`] instead of being read and executed as
/// SQL, since this crate has no way to load arbitrary code by path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationKind {
    Sql,
    Plugin,
}

impl MigrationKind {
    fn from_extension(ext: &str) -> Option<MigrationKind> {
        match ext {
            "sql" => Some(MigrationKind::Sql),
            "py" => Some(MigrationKind::Plugin),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationKind::Sql => write!(f, "sql"),
            MigrationKind::Plugin => write!(f, "plugin"),
        }
    }
}

/// An immutable descriptor of one discovered migration: its version, name,
/// the paths to its up/down artifacts, the directory they live in, and its
/// declared dependencies.
#[derive(Clone, Debug)]
pub struct MigrationRecord {
    version: i64,
    name: String,
    up_artifact: PathBuf,
    down_artifact: PathBuf,
    source_dir: PathBuf,
    kind: MigrationKind,
}

impl MigrationRecord {
    pub(crate) fn new(
        version: i64,
        name: String,
        up_artifact: PathBuf,
        down_artifact: PathBuf,
        source_dir: PathBuf,
        kind: MigrationKind,
    ) -> MigrationRecord {
        MigrationRecord {
            version,
            name,
            up_artifact,
            down_artifact,
            source_dir,
            kind,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn up_artifact(&self) -> &Path {
        &self.up_artifact
    }

    pub fn down_artifact(&self) -> &Path {
        &self.down_artifact
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    /// Both artifacts exist on disk right now.
    pub fn is_complete(&self) -> bool {
        self.up_artifact.exists() && self.down_artifact.exists()
    }

    /// Parse `-- depends_on: v1, v2` (or `#` for plugin-kind artifacts) headers
    /// out of both artifacts. Computed lazily — discovery never reads artifact
    /// bodies just to build the record.
    pub fn declared_dependencies(&self) -> std::io::Result<BTreeSet<i64>> {
        let mut deps = BTreeSet::new();
        for path in [&self.up_artifact, &self.down_artifact] {
            let body = std::fs::read_to_string(path)?;
            deps.extend(parse_depends_on(&body));
        }
        Ok(deps)
    }

    /// SHA-256 over `up_bytes || 0x00 || down_bytes`.
    pub fn checksum(&self) -> std::io::Result<String> {
        let up = std::fs::read(&self.up_artifact)?;
        let down = std::fs::read(&self.down_artifact)?;
        Ok(checksum_hex(&up, &down))
    }
}

impl fmt::Display for MigrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.version, self.name)
    }
}

impl Eq for MigrationRecord {}

impl PartialEq for MigrationRecord {
    fn eq(&self, other: &MigrationRecord) -> bool {
        self.version == other.version
    }
}

impl Ord for MigrationRecord {
    fn cmp(&self, other: &MigrationRecord) -> Ordering {
        self.version.cmp(&other.version)
    }
}

impl PartialOrd for MigrationRecord {
    fn partial_cmp(&self, other: &MigrationRecord) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A version-stamped SQL file that seeds data once migrations have run.
#[derive(Clone, Debug)]
pub struct FixtureRecord {
    version: i64,
    name: String,
    path: PathBuf,
}

impl FixtureRecord {
    pub(crate) fn new(version: i64, name: String, path: PathBuf) -> FixtureRecord {
        FixtureRecord {
            version,
            name,
            path,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse the filename stem of a migration artifact: `<version>_<name>_<up|down>.<ext>`.
pub(crate) struct ParsedArtifactName {
    pub version: i64,
    pub name: String,
    pub direction: Direction,
    pub kind: MigrationKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Up,
    Down,
}

/// Matches the filename grammar: `<version>_<name>_<up|down>.<ext>`.
fn artifact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<version>\d+)_(?P<name>[A-Za-z0-9_]+)_(?P<direction>up|down)\.(?P<ext>sql|py)$").unwrap())
}

/// Matches `<version>_<name>_fixture.sql`.
fn fixture_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<version>\d+)_(?P<name>[A-Za-z0-9_]+)_fixture\.sql$").unwrap())
}

pub(crate) fn parse_artifact_name(file_name: &str) -> Option<ParsedArtifactName> {
    let captures = artifact_re().captures(file_name)?;

    let version: i64 = captures["version"].parse().ok()?;
    let name = captures["name"].to_string();
    let direction = match &captures["direction"] {
        "up" => Direction::Up,
        "down" => Direction::Down,
        _ => unreachable!("regex only matches up|down"),
    };
    let kind = MigrationKind::from_extension(&captures["ext"])?;

    Some(ParsedArtifactName {
        version,
        name,
        direction,
        kind,
    })
}

/// Parse `<version>_<name>_fixture.sql`.
pub(crate) fn parse_fixture_name(file_name: &str) -> Option<(i64, String)> {
    let captures = fixture_re().captures(file_name)?;
    let version: i64 = captures["version"].parse().ok()?;
    let name = captures["name"].to_string();
    Some((version, name))
}

/// Extract every `depends_on: v1, v2, ..` value out of a `--`/`#`-commented
/// header line, case-insensitive on the keyword, deduplicated, silently
/// dropping non-numeric tokens.
fn parse_depends_on(body: &str) -> BTreeSet<i64> {
    let mut deps = BTreeSet::new();
    for line in body.lines() {
        let trimmed = line.trim_start();
        let comment_body = trimmed
            .strip_prefix("--")
            .or_else(|| trimmed.strip_prefix('#'));
        let Some(comment_body) = comment_body else {
            continue;
        };
        let comment_body = comment_body.trim_start();
        let lower = comment_body.to_ascii_lowercase();
        let Some(rest) = lower.strip_prefix("depends_on:") else {
            continue;
        };
        // Recover original-case slice isn't needed: versions are numeric.
        let start = comment_body.len() - rest.len();
        let values = &comment_body[start..];
        for token in values.split(',') {
            if let Ok(version) = token.trim().parse::<i64>() {
                deps.insert(version);
            }
        }
    }
    deps
}
