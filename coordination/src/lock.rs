//! Distributed locking (spec §4.8).
//!
//! Ported from `libdeploy/locking.c`: lock every target's profile in turn,
//! tracking which locks actually succeeded, and unlock all of them again
//! the moment any single lock fails or the operation is interrupted —
//! never leave a partial lock set held. Locking is per `(target, profile)`,
//! not per mapping: the on-target agent's `lock` verb locks every
//! currently-deployed service on that target through Dysnomia and then
//! creates one profile-wide lock file (spec §4.4, §4.10).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::interface::{ClientInterface, ClientInterfaceVerb, RemoteCall};
use crate::manifest::Manifest;
use crate::process::{spawn_bounded, Concurrency, ProcessError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to lock target {0}")]
    LockFailed(String),

    #[error("locking interrupted")]
    Interrupted,
}

/// Acquire the profile lock on every target in `manifest`, concurrently
/// (locking one target never depends on another). On the first failure
/// (or if `interrupt` is set before locking starts), unlock everything
/// acquired so far and return the error.
pub async fn lock(
    interface: Arc<dyn ClientInterface>,
    manifest: &Manifest,
    profile: &str,
    interrupt: Arc<AtomicBool>,
) -> Result<(), LockError> {
    if interrupt.load(Ordering::SeqCst) {
        return Err(LockError::Interrupted);
    }

    let target_names: Vec<String> = manifest.targets.keys().cloned().collect();
    let jobs: Vec<_> = target_names
        .iter()
        .map(|name| {
            let interface = interface.clone();
            let manifest = manifest.clone();
            let name = name.clone();
            let profile = profile.to_string();
            async move {
                lock_one(interface.as_ref(), &manifest, &name, &profile).await.map(|_| name).map_err(|_| ProcessError::NonZeroExit(1))
            }
        })
        .collect();

    let results = spawn_bounded(jobs, Concurrency::Unbounded, interrupt.clone()).await;

    let mut acquired: Vec<String> = Vec::new();
    let mut first_failure: Option<String> = None;
    for (name, result) in target_names.iter().zip(results.into_iter()) {
        match result {
            Ok(_) => acquired.push(name.clone()),
            Err(_) => {
                if first_failure.is_none() {
                    first_failure = Some(name.clone());
                }
            }
        }
    }

    if let Some(failed) = first_failure {
        unlock_all(interface.as_ref(), manifest, &acquired, profile).await;
        return Err(LockError::LockFailed(failed));
    }

    if interrupt.load(Ordering::SeqCst) {
        unlock_all(interface.as_ref(), manifest, &acquired, profile).await;
        return Err(LockError::Interrupted);
    }

    Ok(())
}

/// Release the profile lock on every target in `manifest`. Unlike `lock`,
/// this does not short-circuit on individual failures — every target gets
/// an unlock attempt, matching `unlock()` in the original source.
pub async fn unlock(interface: Arc<dyn ClientInterface>, manifest: &Manifest, profile: &str) {
    let target_names: Vec<String> = manifest.targets.keys().cloned().collect();
    unlock_all(interface.as_ref(), manifest, &target_names, profile).await;
}

async fn unlock_all(interface: &dyn ClientInterface, manifest: &Manifest, target_names: &[String], profile: &str) {
    for name in target_names.iter().rev() {
        if let Err(err) = unlock_one(interface, manifest, name, profile).await {
            tracing::warn!(target = %name, error = ?err, "unlock failed during rollback");
        }
    }
}

async fn lock_one(interface: &dyn ClientInterface, manifest: &Manifest, target_name: &str, profile: &str) -> Result<(), ()> {
    let Some(target) = manifest.targets.get(target_name) else {
        return Err(());
    };
    let call = RemoteCall::new(ClientInterfaceVerb::Lock, target).with_profile(profile.to_string());
    interface.invoke(call).await.map(|_| ()).map_err(|_| ())
}

async fn unlock_one(interface: &dyn ClientInterface, manifest: &Manifest, target_name: &str, profile: &str) -> Result<(), ()> {
    let Some(target) = manifest.targets.get(target_name) else {
        return Err(());
    };
    let call = RemoteCall::new(ClientInterfaceVerb::Unlock, target).with_profile(profile.to_string());
    interface.invoke(call).await.map(|_| ()).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::SimulatedClientInterface;
    use crate::manifest::Target;
    use std::collections::HashMap;

    fn manifest_with_two_targets() -> Manifest {
        let mut m = Manifest::new();
        for name in ["test1", "test2"] {
            m.targets.insert(
                name.to_string(),
                Target {
                    name: name.to_string(),
                    properties: HashMap::new(),
                    containers: HashMap::new(),
                    client_interface: "disnix-ssh-client".into(),
                    target_property: "hostname".into(),
                    num_of_cores: 1,
                },
            );
        }
        m
    }

    #[tokio::test]
    async fn locks_all_targets_when_none_fail() {
        let manifest = manifest_with_two_targets();
        let interface: Arc<dyn ClientInterface> = Arc::new(SimulatedClientInterface::new());
        let result = lock(interface, &manifest, "default", Arc::new(AtomicBool::new(false))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unlocks_already_acquired_locks_on_failure() {
        let manifest = manifest_with_two_targets();
        let sim = SimulatedClientInterface::new();
        sim.fail_on(ClientInterfaceVerb::Lock, "test2", Some("default".to_string()));
        let interface: Arc<dyn ClientInterface> = Arc::new(sim);
        let result = lock(interface, &manifest, "default", Arc::new(AtomicBool::new(false))).await;
        assert!(matches!(result, Err(LockError::LockFailed(_))));
    }

    #[tokio::test]
    async fn pre_set_interrupt_flag_aborts_before_first_lock() {
        let manifest = manifest_with_two_targets();
        let interface: Arc<dyn ClientInterface> = Arc::new(SimulatedClientInterface::new());
        let result = lock(interface, &manifest, "default", Arc::new(AtomicBool::new(true))).await;
        assert!(matches!(result, Err(LockError::Interrupted)));
    }

    #[tokio::test]
    async fn unlock_is_attempted_for_every_target() {
        let manifest = manifest_with_two_targets();
        let interface: Arc<dyn ClientInterface> = Arc::new(SimulatedClientInterface::new());
        unlock(interface, &manifest, "default").await;
    }
}
