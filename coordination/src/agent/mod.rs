//! On-target agent (spec §4.10).
//!
//! The process that actually runs on each target: receives verbs over
//! the `crates/disnix-agent` stdio transport, serializes access to each
//! container with a lock file, delegates the actual activation work to a
//! Dysnomia plugin binary per service type, and keeps its own profile
//! manifest and job log directory up to date. Grounded on
//! `dbus-service/dbus-service.c` (the real on-target daemon) and the
//! teacher's `run_slurm_cmd` subprocess-wrapping pattern.

pub mod jobs;
pub mod lock_file;
pub mod profile_manifest;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

use jobs::{JobId, JobRegistry};
use lock_file::{LockFileError, LockFileGuard};
use profile_manifest::{ProfileEntry, ProfileManifest};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("container {0} is locked by another operation")]
    Locked(String),

    #[error("profile {0} is locked by another operation")]
    ProfileLocked(String),

    #[error(transparent)]
    LockFile(#[from] LockFileError),

    #[error("dysnomia plugin exited with status {0}")]
    PluginFailed(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One verb per row of the client-interface argument table (spec §4.4),
/// plus `query_installed`/`set` for coordinator- and target-profile
/// bookkeeping.
#[async_trait]
pub trait AgentOperations: Send + Sync {
    async fn activate(&self, service: &str, container: &str, service_type: &str, package: &str) -> Result<JobId, AgentError>;
    async fn deactivate(&self, service: &str, container: &str, service_type: &str, package: &str) -> Result<JobId, AgentError>;
    async fn snapshot(&self, container: &str, service_type: &str, package: &str) -> Result<JobId, AgentError>;
    async fn restore(&self, container: &str, service_type: &str, package: &str, snapshot_id: &str) -> Result<JobId, AgentError>;
    async fn delete_state(&self, container: &str, service_type: &str, package: &str) -> Result<JobId, AgentError>;

    async fn lock_profile(&self, profile: &str) -> Result<(), AgentError>;
    async fn unlock_profile(&self, profile: &str) -> Result<(), AgentError>;

    /// Install `contents` as this target's own profile under `profile`.
    async fn set(&self, profile: &str, contents: &str) -> Result<(), AgentError>;
    /// `query-all-states` equivalent: every currently active entry.
    async fn query_installed(&self) -> Vec<ProfileEntry>;

    async fn query_requisites(&self, container: &str, component: &str) -> Result<Vec<String>, AgentError>;
    async fn query_all_snapshots(&self, container: &str, component: &str) -> Result<Vec<String>, AgentError>;
    async fn query_latest_snapshot(&self, container: &str, component: &str) -> Result<Option<String>, AgentError>;
    async fn print_missing_snapshots(&self, ids: &[String]) -> Result<Vec<String>, AgentError>;
    async fn resolve_snapshots(&self, ids: &[String]) -> Result<(), AgentError>;
    async fn import_snapshots(&self, container: &str, component: &str, paths: &[String]) -> Result<(), AgentError>;
    async fn export_snapshots(&self, container: &str, component: &str, ids: &[String]) -> Result<Vec<String>, AgentError>;
    async fn clean_snapshots(&self, keep: Option<u32>) -> Result<(), AgentError>;
}

/// Drives Dysnomia container plugins, one process invocation per verb,
/// exactly as the real `dysnomia` CLI expects: `dysnomia --type <type>
/// --operation <activate|deactivate|snapshot|restore|...> --component
/// <package>`. Snapshot-store verbs (`query-all-snapshots`,
/// `import-snapshots`, ...) shell out to the sibling `dysnomia-snapshots`
/// tool instead.
pub struct DysnomiaAgent {
    dysnomia_binary: String,
    dysnomia_snapshots_binary: String,
    jobs: JobRegistry,
    profile_path: PathBuf,
    profile: Mutex<ProfileManifest>,
    locks_dir: PathBuf,
    profiles_dir: PathBuf,
}

impl DysnomiaAgent {
    pub fn new(
        dysnomia_binary: impl Into<String>,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self, profile_manifest::ProfileManifestError> {
        let state_dir = state_dir.into();
        let dysnomia_binary = dysnomia_binary.into();
        let dysnomia_snapshots_binary = format!("{dysnomia_binary}-snapshots");
        let profile_path = state_dir.join("profile-manifest");
        let profile = ProfileManifest::load(&profile_path)?;
        Ok(Self {
            dysnomia_binary,
            dysnomia_snapshots_binary,
            jobs: JobRegistry::new(state_dir.join("jobs")),
            profile_path,
            profile: Mutex::new(profile),
            locks_dir: state_dir.join("locks"),
            profiles_dir: state_dir.join("profiles"),
        })
    }

    fn container_lock_path(&self, container: &str) -> PathBuf {
        self.locks_dir.join(format!("{container}.lock"))
    }

    fn profile_lock_path(&self, profile: &str) -> PathBuf {
        self.locks_dir.join(format!("disnix-{profile}.lock"))
    }

    async fn run_plugin(&self, operation: &str, service_type: &str, package: &str, job: JobId) -> Result<std::process::Output, AgentError> {
        self.jobs.append_log(job, &format!("{operation} {service_type} {package}")).await?;
        let output = Command::new(&self.dysnomia_binary)
            .arg("--operation")
            .arg(operation)
            .arg("--type")
            .arg(service_type)
            .arg("--component")
            .arg(package)
            .output()
            .await?;
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            self.jobs.append_log(job, &format!("failed with status {code}")).await?;
            return Err(AgentError::PluginFailed(code));
        }
        self.jobs.append_log(job, "ok").await?;
        Ok(output)
    }

    async fn run_snapshots_tool(&self, args: &[&str], job: JobId) -> Result<std::process::Output, AgentError> {
        self.jobs.append_log(job, &args.join(" ")).await?;
        let output = Command::new(&self.dysnomia_snapshots_binary).args(args).output().await?;
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            self.jobs.append_log(job, &format!("failed with status {code}")).await?;
            return Err(AgentError::PluginFailed(code));
        }
        self.jobs.append_log(job, "ok").await?;
        Ok(output)
    }

    async fn run_snapshots_query(&self, args: &[&str]) -> Result<Vec<String>, AgentError> {
        let job = self.jobs.next_job_id();
        let output = self.run_snapshots_tool(args, job).await?;
        Ok(lines_of(&output))
    }
}

fn lines_of(output: &std::process::Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .filter(|l| !l.is_empty())
        .collect()
}

#[async_trait]
impl AgentOperations for DysnomiaAgent {
    async fn activate(&self, service: &str, container: &str, service_type: &str, package: &str) -> Result<JobId, AgentError> {
        tokio::fs::create_dir_all(&self.locks_dir).await?;
        let _guard = LockFileGuard::acquire(self.container_lock_path(container)).map_err(|err| match err {
            LockFileError::AlreadyLocked(_) => AgentError::Locked(container.to_string()),
            other => AgentError::LockFile(other),
        })?;

        let job = self.jobs.next_job_id();
        self.run_plugin("activate", service_type, package, job).await?;

        let mut profile = self.profile.lock().await;
        profile.mark_active(package, container, service_type);
        profile.save(&self.profile_path).map_err(|err| AgentError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;
        let _ = service;
        Ok(job)
    }

    async fn deactivate(&self, service: &str, container: &str, service_type: &str, package: &str) -> Result<JobId, AgentError> {
        tokio::fs::create_dir_all(&self.locks_dir).await?;
        let _guard = LockFileGuard::acquire(self.container_lock_path(container)).map_err(|err| match err {
            LockFileError::AlreadyLocked(_) => AgentError::Locked(container.to_string()),
            other => AgentError::LockFile(other),
        })?;

        let job = self.jobs.next_job_id();
        self.run_plugin("deactivate", service_type, package, job).await?;

        let mut profile = self.profile.lock().await;
        profile.mark_inactive(container);
        profile.save(&self.profile_path).map_err(|err| AgentError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;
        let _ = service;
        Ok(job)
    }

    async fn snapshot(&self, container: &str, service_type: &str, package: &str) -> Result<JobId, AgentError> {
        let job = self.jobs.next_job_id();
        self.run_plugin("snapshot", service_type, package, job).await?;
        Ok(job)
    }

    async fn restore(&self, container: &str, service_type: &str, package: &str, snapshot_id: &str) -> Result<JobId, AgentError> {
        let job = self.jobs.next_job_id();
        self.jobs.append_log(job, &format!("restore {service_type} {package} {snapshot_id}")).await?;
        let output = Command::new(&self.dysnomia_binary)
            .arg("--operation")
            .arg("restore")
            .arg("--type")
            .arg(service_type)
            .arg("--component")
            .arg(package)
            .arg("--resolve-snapshot")
            .arg(snapshot_id)
            .output()
            .await?;
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            self.jobs.append_log(job, &format!("failed with status {code}")).await?;
            return Err(AgentError::PluginFailed(code));
        }
        self.jobs.append_log(job, "ok").await?;
        let _ = container;
        Ok(job)
    }

    async fn delete_state(&self, container: &str, service_type: &str, package: &str) -> Result<JobId, AgentError> {
        let job = self.jobs.next_job_id();
        self.run_plugin("delete-state", service_type, package, job).await?;
        let _ = container;
        Ok(job)
    }

    /// Lock every service currently recorded in this target's profile
    /// manifest through Dysnomia, then take the profile-wide lock file.
    /// Unwinds and unlocks everything already locked on first failure.
    async fn lock_profile(&self, profile: &str) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.locks_dir).await?;
        let entries: Vec<ProfileEntry> = self.profile.lock().await.active_entries().cloned().collect();

        let mut locked: Vec<&ProfileEntry> = Vec::new();
        for entry in &entries {
            let job = self.jobs.next_job_id();
            match self.run_plugin("lock", &entry.service_type, &entry.package, job).await {
                Ok(_) => locked.push(entry),
                Err(err) => {
                    for done in locked.iter().rev() {
                        let job = self.jobs.next_job_id();
                        let _ = self.run_plugin("unlock", &done.service_type, &done.package, job).await;
                    }
                    return Err(err);
                }
            }
        }

        LockFileGuard::acquire(self.profile_lock_path(profile))
            .map(std::mem::forget)
            .map_err(|err| match err {
                LockFileError::AlreadyLocked(_) => AgentError::ProfileLocked(profile.to_string()),
                other => AgentError::LockFile(other),
            })
    }

    async fn unlock_profile(&self, profile: &str) -> Result<(), AgentError> {
        let entries: Vec<ProfileEntry> = self.profile.lock().await.active_entries().cloned().collect();
        for entry in &entries {
            let job = self.jobs.next_job_id();
            if let Err(err) = self.run_plugin("unlock", &entry.service_type, &entry.package, job).await {
                tracing::warn!(container = %entry.container, error = ?err, "unlock failed, continuing");
            }
        }

        let path = self.profile_lock_path(profile);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn set(&self, profile: &str, contents: &str) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.profiles_dir).await?;
        let path = self.profiles_dir.join(profile);
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }

    async fn query_installed(&self) -> Vec<ProfileEntry> {
        let profile = self.profile.lock().await;
        profile.active_entries().cloned().collect()
    }

    async fn query_requisites(&self, container: &str, component: &str) -> Result<Vec<String>, AgentError> {
        self.run_snapshots_query(&["--query-requisites", "--container", container, "--component", component]).await
    }

    async fn query_all_snapshots(&self, container: &str, component: &str) -> Result<Vec<String>, AgentError> {
        self.run_snapshots_query(&["--query-all-snapshots", "--container", container, "--component", component]).await
    }

    async fn query_latest_snapshot(&self, container: &str, component: &str) -> Result<Option<String>, AgentError> {
        let lines = self.run_snapshots_query(&["--query-latest-snapshot", "--container", container, "--component", component]).await?;
        Ok(lines.into_iter().next())
    }

    async fn print_missing_snapshots(&self, ids: &[String]) -> Result<Vec<String>, AgentError> {
        let mut args = vec!["--print-missing"];
        args.extend(ids.iter().map(String::as_str));
        self.run_snapshots_query(&args).await
    }

    async fn resolve_snapshots(&self, ids: &[String]) -> Result<(), AgentError> {
        let job = self.jobs.next_job_id();
        let mut args = vec!["--resolve"];
        args.extend(ids.iter().map(String::as_str));
        self.run_snapshots_tool(&args, job).await?;
        Ok(())
    }

    async fn import_snapshots(&self, container: &str, component: &str, paths: &[String]) -> Result<(), AgentError> {
        let job = self.jobs.next_job_id();
        let mut args = vec!["--import", "--container", container, "--component", component];
        args.extend(paths.iter().map(String::as_str));
        self.run_snapshots_tool(&args, job).await?;
        Ok(())
    }

    async fn export_snapshots(&self, container: &str, component: &str, ids: &[String]) -> Result<Vec<String>, AgentError> {
        let mut args = vec!["--export", "--container", container, "--component", component];
        args.extend(ids.iter().map(String::as_str));
        self.run_snapshots_query(&args).await
    }

    async fn clean_snapshots(&self, keep: Option<u32>) -> Result<(), AgentError> {
        let job = self.jobs.next_job_id();
        let keep_str = keep.map(|k| k.to_string());
        let mut args = vec!["--clean"];
        if let Some(keep_str) = &keep_str {
            args.push("--keep");
            args.push(keep_str);
        }
        self.run_snapshots_tool(&args, job).await?;
        Ok(())
    }
}

pub type SharedAgent = Arc<dyn AgentOperations>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_then_unlock_releases_profile() {
        let dir = tempfile::tempdir().unwrap();
        let agent = DysnomiaAgent::new("dysnomia", dir.path()).unwrap();
        agent.lock_profile("default").await.unwrap();
        assert!(agent.profile_lock_path("default").exists());
        agent.unlock_profile("default").await.unwrap();
        assert!(!agent.profile_lock_path("default").exists());
    }
}
