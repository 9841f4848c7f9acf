use std::collections::HashMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::Error;
use crate::migration::{
    parse_artifact_name, parse_fixture_name, Direction, FixtureRecord, MigrationRecord,
};

/// Recursively walk one or more migration roots and return every complete
/// migration, sorted by version.
///
/// A version that appears more than once — whether under distinct roots, in
/// distinct subdirectories of one root, or paired with a different name — is
/// a hard error, as is a version with only one half of its up/down pair:
/// migrations never partially exist.
pub fn discover_migrations(roots: &[PathBuf]) -> Result<Vec<MigrationRecord>, Error> {
    let mut groups: HashMap<i64, PartialMigration> = HashMap::new();
    let mut first_root_for_version: HashMap<i64, PathBuf> = HashMap::new();

    for root in roots {
        if !root.is_dir() {
            return Err(Error::schema(format!(
                "migrations directory not found: {}",
                root.display()
            )));
        }

        for entry in WalkDir::new(root).min_depth(1) {
            let entry = entry.map_err(|err| {
                Error::schema(format!("failed to read {}: {err}", root.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            let Some(parsed) = parse_artifact_name(file_name) else {
                continue;
            };

            if let Some(existing_root) = first_root_for_version.get(&parsed.version) {
                if existing_root != root {
                    return Err(Error::schema(format!(
                        "duplicate version {}: found under both {} and {}",
                        parsed.version,
                        existing_root.display(),
                        root.display()
                    )));
                }
            } else {
                first_root_for_version.insert(parsed.version, root.clone());
            }

            let source_dir = entry
                .path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.clone());

            let slot = groups.entry(parsed.version).or_insert_with(|| PartialMigration {
                name: parsed.name.clone(),
                source_dir: source_dir.clone(),
                kind: parsed.kind,
                up: None,
                down: None,
            });

            if slot.name != parsed.name {
                return Err(Error::schema(format!(
                    "duplicate version {}: found as both {}_{} and {}_{}",
                    parsed.version, parsed.version, slot.name, parsed.version, parsed.name
                )));
            }
            if slot.kind != parsed.kind {
                return Err(Error::schema(format!(
                    "migration {}_{} has mismatched up/down artifact kinds",
                    parsed.version, parsed.name
                )));
            }

            match parsed.direction {
                Direction::Up => slot.up = Some(entry.path().to_path_buf()),
                Direction::Down => slot.down = Some(entry.path().to_path_buf()),
            }
        }
    }

    let mut records = Vec::with_capacity(groups.len());
    for (version, partial) in groups {
        let name = partial.name;
        let up = partial.up.ok_or_else(|| {
            Error::schema(format!("migration {version}_{name} is missing its up file"))
        })?;
        let down = partial.down.ok_or_else(|| {
            Error::schema(format!(
                "migration {version}_{name} is missing its down file"
            ))
        })?;
        records.push(MigrationRecord::new(
            version,
            name,
            up,
            down,
            partial.source_dir,
            partial.kind,
        ));
    }
    records.sort();
    Ok(records)
}

struct PartialMigration {
    name: String,
    source_dir: PathBuf,
    kind: crate::migration::MigrationKind,
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

/// Walk one or more fixture roots and return every fixture, sorted by
/// version.
pub fn discover_fixtures(roots: &[PathBuf]) -> Result<Vec<FixtureRecord>, Error> {
    let mut fixtures = Vec::new();
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(root).min_depth(1) {
            let entry = entry.map_err(|err| {
                Error::schema(format!("failed to read {}: {err}", root.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            let Some((version, name)) = parse_fixture_name(file_name) else {
                continue;
            };
            fixtures.push(FixtureRecord::new(version, name, entry.path().to_path_buf()));
        }
    }
    fixtures.sort_by_key(|f| f.version());
    Ok(fixtures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn discovers_paired_migrations_sorted_by_version() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "200_second_up.sql");
        touch(tmp.path(), "200_second_down.sql");
        touch(tmp.path(), "100_first_up.sql");
        touch(tmp.path(), "100_first_down.sql");

        let migrations = discover_migrations(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version(), 100);
        assert_eq!(migrations[1].version(), 200);
    }

    #[test]
    fn rejects_missing_down_file() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "100_first_up.sql");

        let err = discover_migrations(&[tmp.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::Schema(_)));
    }

    #[test]
    fn rejects_duplicate_version_with_different_name_in_one_root() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "100_first_up.sql");
        touch(tmp.path(), "100_first_down.sql");
        touch(tmp.path(), "100_second_up.sql");
        touch(tmp.path(), "100_second_down.sql");

        let err = discover_migrations(&[tmp.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::Schema(_)));
    }

    #[test]
    fn discovers_migrations_in_nested_subdirectories() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("nested");
        fs::create_dir(&nested).unwrap();
        touch(&nested, "100_first_up.sql");
        touch(&nested, "100_first_down.sql");

        let migrations = discover_migrations(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].source_dir(), nested.as_path());
    }

    #[test]
    fn rejects_duplicate_version_across_roots() {
        let tmp_a = TempDir::new().unwrap();
        let tmp_b = TempDir::new().unwrap();
        touch(tmp_a.path(), "100_first_up.sql");
        touch(tmp_a.path(), "100_first_down.sql");
        touch(tmp_b.path(), "100_first_up.sql");
        touch(tmp_b.path(), "100_first_down.sql");

        let err = discover_migrations(&[tmp_a.path().to_path_buf(), tmp_b.path().to_path_buf()])
            .unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::Schema(_)));
    }

    #[test]
    fn rejects_missing_root() {
        let err = discover_migrations(&[PathBuf::from("/nonexistent/does/not/exist")]).unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::Schema(_)));
    }

    #[test]
    fn ignores_unrelated_files() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "README.md");
        touch(tmp.path(), "100_first_up.sql");
        touch(tmp.path(), "100_first_down.sql");

        let migrations = discover_migrations(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(migrations.len(), 1);
    }

    #[test]
    fn discovers_fixtures_sorted_by_version() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "200_accounts_fixture.sql");
        touch(tmp.path(), "100_users_fixture.sql");

        let fixtures = discover_fixtures(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(fixtures.len(), 2);
        assert_eq!(fixtures[0].version(), 100);
        assert_eq!(fixtures[1].version(), 200);
    }
}
