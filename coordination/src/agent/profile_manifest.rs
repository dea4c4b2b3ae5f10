//! Target-side profile manifest (spec §4.10, §4.9).
//!
//! Each target keeps its own record of which packages are active in which
//! container, independent of the coordinator's manifest, so the agent can
//! answer `--query-all-states` without the coordinator in the loop. Entries
//! are serialized one per line as `package;container;type`, matching the
//! on-disk profile format the coordinator writes in `profile.rs`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileManifestError {
    #[error("I/O error reading profile manifest at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error writing profile manifest at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed profile manifest line: {0:?}")]
    MalformedLine(String),
}

/// One active `package;container;type` entry. Ordered by `container` first
/// so `active_entries()` yields a stable, container-grouped iteration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProfileEntry {
    pub container: String,
    pub package: String,
    pub service_type: String,
}

impl ProfileEntry {
    fn render(&self) -> String {
        format!("{};{};{}", self.package, self.container, self.service_type)
    }

    fn parse(line: &str) -> Result<Self, ProfileManifestError> {
        let mut parts = line.splitn(3, ';');
        let package = parts.next();
        let container = parts.next();
        let service_type = parts.next();
        match (package, container, service_type) {
            (Some(package), Some(container), Some(service_type)) => Ok(Self {
                container: container.to_string(),
                package: package.to_string(),
                service_type: service_type.to_string(),
            }),
            _ => Err(ProfileManifestError::MalformedLine(line.to_string())),
        }
    }
}

/// The set of packages currently active on this target, keyed by container
/// (one active package per container at a time).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileManifest {
    entries: BTreeSet<ProfileEntry>,
}

impl ProfileManifest {
    pub fn load(path: &Path) -> Result<Self, ProfileManifestError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let entries = contents
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(ProfileEntry::parse)
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(Self { entries })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ProfileManifestError::Read { path: path.to_path_buf(), source }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ProfileManifestError> {
        let contents = self.entries.iter().map(ProfileEntry::render).collect::<Vec<_>>().join("\n");
        std::fs::write(path, contents).map_err(|source| ProfileManifestError::Write { path: path.to_path_buf(), source })
    }

    pub fn mark_active(&mut self, package: &str, container: &str, service_type: &str) {
        self.entries.retain(|e| e.container != container);
        self.entries.insert(ProfileEntry {
            container: container.to_string(),
            package: package.to_string(),
            service_type: service_type.to_string(),
        });
    }

    pub fn mark_inactive(&mut self, container: &str) {
        self.entries.retain(|e| e.container != container);
    }

    pub fn is_active(&self, container: &str) -> bool {
        self.entries.iter().any(|e| e.container == container)
    }

    pub fn active_entries(&self) -> impl Iterator<Item = &ProfileEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile-manifest");
        let mut manifest = ProfileManifest::default();
        manifest.mark_active("webapp-1.0", "process", "process");
        manifest.save(&path).unwrap();

        let loaded = ProfileManifest::load(&path).unwrap();
        assert!(loaded.is_active("process"));
        let entry = loaded.active_entries().next().unwrap();
        assert_eq!(entry.package, "webapp-1.0");
        assert_eq!(entry.service_type, "process");
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let manifest = ProfileManifest::load(&path).unwrap();
        assert_eq!(manifest.active_entries().count(), 0);
    }

    #[test]
    fn mark_inactive_removes_entry() {
        let mut manifest = ProfileManifest::default();
        manifest.mark_active("webapp-1.0", "process", "process");
        manifest.mark_inactive("process");
        assert!(!manifest.is_active("process"));
    }

    #[test]
    fn mark_active_replaces_existing_package_in_same_container() {
        let mut manifest = ProfileManifest::default();
        manifest.mark_active("webapp-1.0", "process", "process");
        manifest.mark_active("webapp-2.0", "process", "process");
        assert_eq!(manifest.active_entries().count(), 1);
        assert_eq!(manifest.active_entries().next().unwrap().package, "webapp-2.0");
    }
}
