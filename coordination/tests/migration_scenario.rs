//! State migration pipeline integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use coordination::interface::{ClientInterface, ClientInterfaceVerb, InterfaceError};
use coordination::manifest::{Manifest, SnapshotMapping, Target};
use coordination::migration::{migrate, plan_transfers, MigrationError, MigrationMode};
use coordination::process::ProcessOutcome;

/// Returns a fixed latest snapshot id for `query-latest-snapshot`, reports
/// nothing missing for `print-missing-snapshots` (so transfer goes through
/// the remote-import fast path), and records `--restore` calls.
struct FakeSnapshotInterface {
    latest_snapshot_id: String,
    restored: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl ClientInterface for FakeSnapshotInterface {
    async fn invoke(&self, call: coordination::interface::RemoteCall) -> Result<ProcessOutcome, InterfaceError> {
        match call.verb() {
            ClientInterfaceVerb::Snapshot => Ok(ProcessOutcome::Status(true)),
            ClientInterfaceVerb::QueryLatestSnapshot => Ok(ProcessOutcome::Lines(vec![self.latest_snapshot_id.clone()])),
            ClientInterfaceVerb::PrintMissingSnapshots => Ok(ProcessOutcome::Lines(Vec::new())),
            ClientInterfaceVerb::Restore => {
                let id = call.arguments.first().cloned().unwrap_or_default();
                self.restored.lock().unwrap().push((call.target_address.clone(), id));
                Ok(ProcessOutcome::Status(true))
            }
            _ => Ok(ProcessOutcome::Status(true)),
        }
    }
}

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

fn manifest_with_two_targets() -> Manifest {
    let mut m = Manifest::new();
    m.targets.insert("test1".into(), target("test1"));
    m.targets.insert("test2".into(), target("test2"));
    m
}

#[test]
fn plan_transfers_is_empty_when_target_is_unchanged() {
    let mut old = manifest_with_two_targets();
    old.snapshot_mappings.push(SnapshotMapping {
        service: "database".into(),
        container: "mysql-database".into(),
        target: "test1".into(),
        component: "mysql-state".into(),
        transferred: false,
    });
    let new = old.clone();
    assert!(plan_transfers(&old, &new).is_empty());
}

#[tokio::test]
async fn migrate_restores_the_most_recent_snapshot() {
    let manifest = manifest_with_two_targets();
    let transfer = coordination::migration::Transfer {
        mapping: SnapshotMapping {
            service: "database".into(),
            container: "mysql-database".into(),
            target: "test2".into(),
            component: "mysql-state".into(),
            transferred: false,
        },
        source: "test1".into(),
        destination: "test2".into(),
    };
    let interface = Arc::new(FakeSnapshotInterface {
        latest_snapshot_id: "mysql-state-20240601".to_string(),
        restored: std::sync::Mutex::new(Vec::new()),
    });
    let dyn_interface: Arc<dyn ClientInterface> = interface.clone();
    migrate(dyn_interface, &manifest, &[transfer], MigrationMode::DepthFirst).await.unwrap();

    let restored = interface.restored.lock().unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0], ("test2".to_string(), "mysql-state-20240601".to_string()));
}

#[tokio::test]
async fn migrate_reports_unknown_target() {
    let manifest = manifest_with_two_targets();
    let transfer = coordination::migration::Transfer {
        mapping: SnapshotMapping {
            service: "database".into(),
            container: "mysql-database".into(),
            target: "ghost".into(),
            component: "mysql-state".into(),
            transferred: false,
        },
        source: "test1".into(),
        destination: "ghost".into(),
    };
    let interface: Arc<dyn ClientInterface> = Arc::new(FakeSnapshotInterface {
        latest_snapshot_id: "mysql-state-1".to_string(),
        restored: std::sync::Mutex::new(Vec::new()),
    });
    let result = migrate(interface, &manifest, &[transfer], MigrationMode::DepthFirst).await;
    assert!(matches!(result, Err(MigrationError::UnknownTarget(_))));
}
