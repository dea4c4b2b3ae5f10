//! Distributed locking integration tests mirroring `locking.c` semantics.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use coordination::interface::{ClientInterface, ClientInterfaceVerb, SimulatedClientInterface};
use coordination::lock::{lock, unlock, LockError};
use coordination::manifest::{Manifest, Target};

fn target(name: &str) -> Target {
    Target {
        name: name.into(),
        properties: HashMap::new(),
        containers: HashMap::new(),
        client_interface: "disnix-ssh-client".into(),
        target_property: "hostname".into(),
        num_of_cores: 1,
    }
}

fn manifest_with_three_targets() -> Manifest {
    let mut m = Manifest::new();
    for name in ["test1", "test2", "test3"] {
        m.targets.insert(name.to_string(), target(name));
    }
    m
}

#[tokio::test]
async fn locks_all_three_targets() {
    let manifest = manifest_with_three_targets();
    let interface: Arc<dyn ClientInterface> = Arc::new(SimulatedClientInterface::new());
    let result = lock(interface, &manifest, "default", Arc::new(AtomicBool::new(false))).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn failure_on_one_target_unlocks_the_others() {
    let manifest = manifest_with_three_targets();
    let sim = SimulatedClientInterface::new();
    sim.fail_on(ClientInterfaceVerb::Lock, "test3", Some("default".to_string()));
    let interface: Arc<dyn ClientInterface> = Arc::new(sim);
    let result = lock(interface, &manifest, "default", Arc::new(AtomicBool::new(false))).await;
    assert!(matches!(result, Err(LockError::LockFailed(_))));
}

#[tokio::test]
async fn pre_set_interrupt_flag_aborts_before_first_lock() {
    let manifest = manifest_with_three_targets();
    let interface: Arc<dyn ClientInterface> = Arc::new(SimulatedClientInterface::new());
    let result = lock(interface, &manifest, "default", Arc::new(AtomicBool::new(true))).await;
    assert!(matches!(result, Err(LockError::Interrupted)));
}

#[tokio::test]
async fn unlock_is_attempted_for_every_target_even_if_not_locked() {
    let manifest = manifest_with_three_targets();
    let interface: Arc<dyn ClientInterface> = Arc::new(SimulatedClientInterface::new());
    // Should not panic even though nothing was locked first.
    unlock(interface, &manifest, "default").await;
}
