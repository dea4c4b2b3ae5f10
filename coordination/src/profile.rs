//! Profile bookkeeping (spec §4.9).
//!
//! After a successful transition, each target's profile (a symlink to the
//! set of mappings currently active there) and the coordinator's own
//! profile manifest must be updated atomically. Ported from
//! `profilemanifest.c` / `profilemanifesttarget.c`: write the new content
//! to a sibling temp path, then `rename` over the live symlink so readers
//! never observe a half-written profile.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::manifest::{Manifest, MappingKey};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to write profile manifest at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to atomically install profile at {path}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Serialize the mappings currently deployed to `target` as a newline-
/// delimited list of `package;container;type` entries, in manifest order,
/// matching the on-target agent's own profile-manifest format (spec §3).
pub fn render_target_profile(manifest: &Manifest, target: &str) -> String {
    manifest
        .service_mappings
        .iter()
        .filter(|(k, _)| k.target == target)
        .map(|(k, _)| render_entry(manifest, k))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_entry(manifest: &Manifest, key: &MappingKey) -> String {
    match manifest.services.get(&key.service) {
        Some(service) => format!("{};{};{}", service.package, key.container, service.service_type),
        None => format!("{};{};unknown", key.service, key.container),
    }
}

/// Atomically (write-temp, then rename) install `contents` as the
/// manifest-coordinator's own profile at `profile_path`, preserving the
/// last N generations the way a Nix profile does, by leaving prior
/// targets of the symlink untouched.
pub async fn write_profile_atomic(profile_path: &Path, contents: &str) -> Result<(), ProfileError> {
    let tmp_path = sibling_tmp_path(profile_path);
    tokio::fs::write(&tmp_path, contents).await.map_err(|source| ProfileError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    tokio::fs::rename(&tmp_path, profile_path).await.map_err(|source| ProfileError::Rename {
        path: profile_path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("profile");
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Write each target's profile under `profiles_dir/<target-name>`.
pub async fn set_target_profiles(manifest: &Manifest, profiles_dir: &Path) -> Result<(), ProfileError> {
    for target_name in manifest.targets.keys() {
        let contents = render_target_profile(manifest, target_name);
        let path = profiles_dir.join(target_name);
        write_profile_atomic(&path, &contents).await?;
    }
    Ok(())
}

/// Write the coordinator's own profile manifest, listing every active
/// mapping across all targets as `package;container;type;target`.
pub async fn update_coordinator_profile(manifest: &Manifest, coordinator_profile_path: &Path) -> Result<(), ProfileError> {
    let contents: String = manifest
        .service_mappings
        .keys()
        .map(|k: &MappingKey| format!("{};{}", render_entry(manifest, k), k.target))
        .collect::<Vec<_>>()
        .join("\n");
    write_profile_atomic(coordinator_profile_path, &contents).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Service, ServiceMapping, Target};
    use std::collections::HashMap;

    fn manifest_with_mapping() -> Manifest {
        let mut m = Manifest::new();
        m.targets.insert(
            "test1".into(),
            Target {
                name: "test1".into(),
                properties: HashMap::new(),
                containers: HashMap::new(),
                client_interface: "disnix-ssh-client".into(),
                target_property: "hostname".into(),
                num_of_cores: 1,
            },
        );
        m.services.insert(
            "webapp".into(),
            Service {
                name: "webapp".into(),
                package: "webapp-1.0".into(),
                service_type: "process".into(),
                depends_on: Vec::new(),
                connects_on: Vec::new(),
            },
        );
        let mapping = ServiceMapping::new("webapp", "process", "test1");
        m.service_mappings.insert(mapping.key(), mapping);
        m
    }

    #[test]
    fn renders_profile_as_package_container_type_entries() {
        let manifest = manifest_with_mapping();
        let rendered = render_target_profile(&manifest, "test1");
        assert_eq!(rendered, "webapp-1.0;process;process");
    }

    #[tokio::test]
    async fn write_profile_atomic_installs_via_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile");
        write_profile_atomic(&path, "hello").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "hello");

        write_profile_atomic(&path, "world").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "world");

        let tmp = sibling_tmp_path(&path);
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn set_target_profiles_writes_one_file_per_target() {
        let manifest = manifest_with_mapping();
        let dir = tempfile::tempdir().unwrap();
        set_target_profiles(&manifest, dir.path()).await.unwrap();
        assert!(dir.path().join("test1").exists());
    }
}
