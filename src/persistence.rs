//! Route file persistence
//! Loads and saves the route table as a JSON array of `{domain, port}` records, replacing
//! the file atomically on every save.

use crate::routes::{Route, RouteRecord, RouteTable};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while reading or writing a route file.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no such file: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PersistError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PersistError::NotFound(_))
    }
}

/// Result of loading a route file
#[derive(Debug, Default)]
pub struct LoadedRoutes {
    pub table: RouteTable,
    /// Records dropped because their domain or port was invalid.
    pub skipped: usize,
}

/// Load a route file.
///
/// Invalid or mistyped records are skipped and counted; a missing file is
/// `PersistError::NotFound` and a document that is not an array is `PersistError::Decode`.
pub fn load<P: AsRef<Path>>(path: P) -> Result<LoadedRoutes, PersistError> {
    let path = path.as_ref();

    let file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            PersistError::NotFound(path.to_path_buf())
        } else {
            PersistError::Read {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    // A `null` document holds no routes. Each record is decoded on its own.
    let values: Option<Vec<serde_json::Value>> = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| PersistError::Decode {
            path: path.to_path_buf(),
            source: e,
        })?;

    let mut loaded = LoadedRoutes::default();
    for value in values.unwrap_or_default() {
        let record: RouteRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping malformed route in {}: {}", path.display(), e);
                loaded.skipped += 1;
                continue;
            }
        };

        match Route::new(&record.domain, &record.port) {
            Ok(route) => {
                debug!("route found: {} -> {}", route.domain, route.port);
                loaded.table.insert(route.domain.clone(), route);
            }
            Err(e) => {
                warn!(
                    "Skipping route {:?} -> {:?} in {}: {}",
                    record.domain,
                    record.port,
                    path.display(),
                    e
                );
                loaded.skipped += 1;
            }
        }
    }

    if loaded.skipped > 0 {
        warn!(
            "{} route(s) in {} failed to load",
            loaded.skipped,
            path.display()
        );
    }

    Ok(loaded)
}

/// Save route records, atomically replacing `path`.
pub fn save<P: AsRef<Path>>(path: P, records: &[RouteRecord]) -> Result<(), PersistError> {
    let path = path.as_ref();
    write_atomically(path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, records)?;
        writer.write_all(b"\n")
    })
    .map_err(|e| PersistError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Replace `path` with whatever `write` produces.
///
/// Content goes to a temporary file in the same directory, which is flushed and synced
/// before being renamed over `path`. If anything fails before the rename, `path` keeps
/// its old content and the temporary file is removed.
pub fn write_atomically<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::RouteStore;
    use std::fs;
    use tempfile::tempdir;

    fn record(domain: &str, port: &str) -> RouteRecord {
        RouteRecord {
            domain: domain.to_string(),
            port: port.to_string(),
        }
    }

    fn pairs(table: &RouteTable) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = table
            .values()
            .map(|r| (r.domain.clone(), r.port.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let err = load(dir.path().join("routes.json")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");

        let store = RouteStore::new();
        store.put("a.com", "9000").unwrap();
        store.put("www.B.com", "9001").unwrap();
        store.put("api.c.org", "65535").unwrap();

        save(&path, &store.records()).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.skipped, 0);
        assert_eq!(pairs(&loaded.table), store.list());
    }

    #[test]
    fn test_file_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");

        save(&path, &[record("a.com", "9000")]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value, serde_json::json!([{"domain": "a.com", "port": "9000"}]));
    }

    #[test]
    fn test_empty_table_saves_empty_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");

        save(&path, &[]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value, serde_json::json!([]));
    }

    #[test]
    fn test_load_skips_invalid_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(
            &path,
            r#"[
                {"domain": "good.com", "port": "9000"},
                {"domain": "bad.com", "port": "not-a-port"},
                {"domain": "www.", "port": "9001"},
                {"domain": "WWW.Other.com", "port": "9002"}
            ]"#,
        )
        .unwrap();

        let loaded = load(&path).unwrap();

        assert_eq!(loaded.skipped, 2);
        assert_eq!(
            pairs(&loaded.table),
            vec![
                ("good.com".to_string(), "9000".to_string()),
                ("other.com".to_string(), "9002".to_string()),
            ]
        );
    }

    #[test]
    fn test_load_skips_mistyped_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(
            &path,
            r#"[
                {"domain": "good.com", "port": "9000"},
                {"domain": "bad.com", "port": null},
                {"domain": "worse.com"},
                {"domain": "numeric.com", "port": 9001},
                "not-a-record",
                {"domain": "fine.com", "port": "9002"}
            ]"#,
        )
        .unwrap();

        let loaded = load(&path).unwrap();

        assert_eq!(loaded.skipped, 4);
        assert_eq!(
            pairs(&loaded.table),
            vec![
                ("fine.com".to_string(), "9002".to_string()),
                ("good.com".to_string(), "9000".to_string()),
            ]
        );
    }

    #[test]
    fn test_load_non_array_document_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(&path, r#"{"domain": "a.com", "port": "9000"}"#).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, PersistError::Decode { .. }));
    }

    #[test]
    fn test_load_later_duplicate_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(
            &path,
            r#"[{"domain": "a.com", "port": "1"}, {"domain": "www.a.com", "port": "2"}]"#,
        )
        .unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(pairs(&loaded.table), vec![("a.com".to_string(), "2".to_string())]);
    }

    #[test]
    fn test_load_null_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(&path, "null\n").unwrap();

        let loaded = load(&path).unwrap();
        assert!(loaded.table.is_empty());
        assert_eq!(loaded.skipped, 0);
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");
        fs::write(&path, r#"{"domain": "a.com"#).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, PersistError::Decode { .. }));
    }

    #[test]
    fn test_interrupted_save_leaves_destination_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routes.json");
        save(&path, &[record("a.com", "9000")]).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let result = write_atomically(&path, |writer| {
            writer.write_all(b"[{\"domain\": \"half")?;
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("routes.json")]);
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("routes.json");

        let err = save(&path, &[record("a.com", "9000")]).unwrap_err();
        assert!(matches!(err, PersistError::Write { .. }));
        assert!(!path.exists());
    }
}
