//! Persistence back ends for the credential collection.

use crate::types::Credential;
use anyhow::{Context, Result};
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Trait for credential storage backends.
///
/// The registry calls `load` once at startup and `save` after every mutation
/// while holding its write lock, so implementations never see concurrent
/// `save` calls from the same registry.
pub trait CredentialStore: Send + Sync {
    /// Load the last saved snapshot.
    ///
    /// Absent or unreadable data yields an empty collection instead of an error.
    fn load(&self) -> Vec<Credential>;

    /// Replace the stored snapshot with `credentials`.
    fn save(&self, credentials: &[Credential]) -> Result<()>;

    /// Short label used in startup logs.
    fn kind(&self) -> &'static str;
}

/// Which back end the node should run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" | "volatile" => Ok(StoreKind::Memory),
            "file" | "json" | "durable" => Ok(StoreKind::File),
            other => anyhow::bail!("unknown storage backend '{other}' (expected memory or file)"),
        }
    }
}

/// Volatile store: nothing survives a restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryCredentialStore;

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Vec<Credential> {
        Vec::new()
    }

    fn save(&self, _credentials: &[Credential]) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// Durable store keeping the whole collection in one JSON array file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Open the store at `path`, creating the parent directory and an empty
    /// `[]` data file when none exists yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory {}", parent.display()))?;
        }

        let store = Self { path };
        if !store.path.exists() {
            store.save(&[])?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling of the data file with `.tmp` appended to the full file name.
    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Flush the directory entry so the rename itself survives a crash.
    #[cfg(unix)]
    fn sync_parent(&self) -> Result<()> {
        let dir = self.parent_dir();
        File::open(dir)
            .and_then(|handle| handle.sync_all())
            .with_context(|| format!("failed to sync directory {}", dir.display()))
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> Result<()> {
        Ok(())
    }

    fn encode(credentials: &[Credential]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        credentials
            .serialize(&mut ser)
            .context("failed to serialize credentials")?;
        Ok(buf)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Vec<Credential> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("No credential file at {}, starting empty", self.path.display());
                return Vec::new();
            }
            Err(err) => {
                warn!(
                    "Failed to read credential file {}: {}; starting empty",
                    self.path.display(),
                    err
                );
                return Vec::new();
            }
        };

        if data.trim().is_empty() {
            return Vec::new();
        }

        match serde_json::from_str::<Vec<Credential>>(&data) {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(
                    "Credential file {} is malformed ({}); starting empty",
                    self.path.display(),
                    err
                );
                Vec::new()
            }
        }
    }

    fn save(&self, credentials: &[Credential]) -> Result<()> {
        let data = Self::encode(credentials)?;

        // Write to temporary file first, then rename for atomicity
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(&data)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", temp_path.display()))?;
        drop(file);

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "failed to move {} over {}",
                temp_path.display(),
                self.path.display()
            )
        })?;
        self.sync_parent()
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessKey;
    use tempfile::tempdir;

    fn sample() -> Vec<Credential> {
        vec![
            Credential::new(AccessKey::new("k1"), None),
            Credential::new(AccessKey::new("k2"), Some("10.0.0.2".into())),
        ]
    }

    #[test]
    fn test_memory_store_forgets_everything() {
        let store = MemoryCredentialStore::new();
        store.save(&sample()).unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_open_initializes_empty_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");
        let store = FileCredentialStore::open(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "[]");
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_open_keeps_existing_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        FileCredentialStore::open(&path).unwrap().save(&sample()).unwrap();

        let reopened = FileCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.load(), sample());
    }

    #[test]
    fn test_file_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = FileCredentialStore::open(&path).unwrap();
        store.save(&sample()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!([
                {"key": "k1", "ip": null},
                {"key": "k2", "ip": "10.0.0.2"}
            ])
        );
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_malformed_file_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, "{not json").unwrap();
        let store = FileCredentialStore::open(&path).unwrap();
        assert!(store.load().is_empty());

        fs::write(&path, r#"{"key": "k1"}"#).unwrap();
        assert!(store.load().is_empty());

        fs::write(&path, "").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_temp_file_never_aliases_data_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.tmp");
        let store = FileCredentialStore::open(&path).unwrap();
        assert_ne!(store.temp_path(), store.path());
        assert_eq!(store.temp_path(), dir.path().join("keys.tmp.tmp"));

        store.save(&sample()).unwrap();
        assert_eq!(store.load(), sample());
        assert!(!store.temp_path().exists());

        // Same stem, different extension
        let json = FileCredentialStore::open(dir.path().join("data.json")).unwrap();
        let yaml = FileCredentialStore::open(dir.path().join("data.yaml")).unwrap();
        assert_ne!(json.temp_path(), yaml.temp_path());
    }

    #[test]
    fn test_parent_dir_of_bare_file_name() {
        let store = FileCredentialStore {
            path: PathBuf::from("data.json"),
        };
        assert_eq!(store.parent_dir(), Path::new("."));
        assert_eq!(store.temp_path(), PathBuf::from("data.json.tmp"));

        let dir = tempdir().unwrap();
        let nested = FileCredentialStore::open(dir.path().join("data.json")).unwrap();
        assert_eq!(nested.parent_dir(), dir.path());
        nested.sync_parent().unwrap();
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = FileCredentialStore::open(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = FileCredentialStore::open(&path).unwrap();
        drop(dir);

        assert!(store.save(&sample()).is_err());
    }

    #[test]
    fn test_store_kind_parsing() {
        assert_eq!("memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert_eq!(" FILE ".parse::<StoreKind>().unwrap(), StoreKind::File);
        assert!("sled".parse::<StoreKind>().is_err());
    }
}
