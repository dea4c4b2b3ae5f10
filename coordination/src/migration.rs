//! State-migration pipeline (spec §4.7).
//!
//! When a stateful service mapping (one with a `SnapshotMapping`) moves
//! from one target to another, its state must follow: snapshot on the
//! source, transfer at most one generation of missing snapshots, restore
//! on the destination. Ported from `libstatemgmt/{snapshot-management,
//! remote-snapshot-management,copy-snapshots}.c`.

use std::sync::Arc;

use thiserror::Error;

use crate::interface::{ClientInterface, ClientInterfaceVerb, InterfaceError, Locality, RemoteCall};
use crate::manifest::{Manifest, SnapshotMapping};
use crate::process::{spawn_bounded, Concurrency, ProcessError};
use crate::process::ProcessOutcome;

/// A content-addressed snapshot identifier. Ordered lexicographically,
/// which is also chronological order for the component-hash-timestamp
/// naming scheme the on-target agent produces (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(pub String);

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    /// Snapshot every mapping on its source target before transferring or
    /// restoring any of them.
    BreadthFirst,
    /// Snapshot, transfer and restore one mapping fully before the next.
    DepthFirst,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("snapshot of {service} on {source} failed: {source_error}")]
    SnapshotFailed { service: String, source: String, source_error: InterfaceError },

    #[error("restore of {service} on {destination} failed: {source_error}")]
    RestoreFailed { service: String, destination: String, source_error: InterfaceError },

    #[error("transfer of {service}'s state from {source} to {destination} failed: {source_error}")]
    TransferFailed { service: String, source: String, destination: String, source_error: InterfaceError },

    #[error("no snapshot found for {service} on {source}")]
    NoSnapshotFound { service: String, source: String },

    #[error("mapping references unknown target {0}")]
    UnknownTarget(String),

    #[error("state deletion on {source} failed for {service}: {source_error}")]
    DeleteStateFailed { service: String, source: String, source_error: InterfaceError },
}

/// One state-bearing mapping's move from `source` to `destination`.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub mapping: SnapshotMapping,
    pub source: String,
    pub destination: String,
}

/// Compute the transfers implied by moving from `old` to `new`: every
/// snapshot mapping present in both manifests whose target changed.
pub fn plan_transfers(old: &Manifest, new: &Manifest) -> Vec<Transfer> {
    let mut transfers = Vec::new();
    for old_mapping in &old.snapshot_mappings {
        if let Some(new_mapping) =
            new.snapshot_mappings.iter().find(|m| m.service == old_mapping.service && m.container == old_mapping.container)
        {
            if new_mapping.target != old_mapping.target {
                transfers.push(Transfer {
                    mapping: new_mapping.clone(),
                    source: old_mapping.target.clone(),
                    destination: new_mapping.target.clone(),
                });
            }
        }
    }
    transfers
}

/// Options controlling how far the pipeline goes past restoring state on
/// the destination (spec §4.7 steps 5-6).
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationOptions {
    /// Skip the restore step; leave the transferred snapshots in the
    /// destination's snapshot store without unpacking them.
    pub transfer_only: bool,
    /// Remove the component's state from the source target once its
    /// snapshot has been transferred and restored.
    pub delete_state: bool,
    /// Keep only the `keep` most recent snapshot generations on both sides
    /// after a transfer; `None` skips the cleanup step entirely.
    pub keep_generations: Option<u32>,
}

/// Run the migration pipeline for `transfers` against `manifest`
/// (consulted for target lookups), in `mode` order.
pub async fn migrate(
    interface: Arc<dyn ClientInterface>,
    manifest: &Manifest,
    transfers: &[Transfer],
    mode: MigrationMode,
) -> Result<(), MigrationError> {
    migrate_with_options(interface, manifest, transfers, mode, MigrationOptions::default()).await
}

pub async fn migrate_with_options(
    interface: Arc<dyn ClientInterface>,
    manifest: &Manifest,
    transfers: &[Transfer],
    mode: MigrationMode,
    options: MigrationOptions,
) -> Result<(), MigrationError> {
    match mode {
        MigrationMode::DepthFirst => {
            for transfer in transfers {
                run_one(interface.as_ref(), manifest, transfer, &options).await?;
            }
        }
        MigrationMode::BreadthFirst => {
            let jobs: Vec<_> = transfers
                .iter()
                .map(|transfer| {
                    let interface = interface.clone();
                    let manifest = manifest.clone();
                    let transfer = transfer.clone();
                    async move {
                        snapshot_one(interface.as_ref(), &manifest, &transfer)
                            .await
                            .map(|id| (transfer, id))
                            .map_err(|_| ProcessError::NonZeroExit(1))
                    }
                })
                .collect();
            let snapshot_results = spawn_bounded(jobs, Concurrency::Unbounded, Arc::new(std::sync::atomic::AtomicBool::new(false))).await;
            let mut snapshotted = Vec::with_capacity(snapshot_results.len());
            for (result, transfer) in snapshot_results.into_iter().zip(transfers.iter()) {
                let (_, id) = result.map_err(|_| MigrationError::NoSnapshotFound {
                    service: transfer.mapping.service.clone(),
                    source: transfer.source.clone(),
                })?;
                snapshotted.push((transfer, id));
            }
            for (transfer, id) in &snapshotted {
                transfer_one(interface.as_ref(), manifest, transfer, id).await?;
                if !options.transfer_only {
                    restore_one(interface.as_ref(), manifest, transfer, id).await?;
                }
                if options.delete_state {
                    delete_state_one(interface.as_ref(), manifest, transfer).await?;
                }
                if let Some(keep) = options.keep_generations {
                    clean_one(interface.as_ref(), manifest, transfer, keep).await?;
                }
            }
        }
    }
    Ok(())
}

async fn run_one(
    interface: &dyn ClientInterface,
    manifest: &Manifest,
    transfer: &Transfer,
    options: &MigrationOptions,
) -> Result<(), MigrationError> {
    let id = snapshot_one(interface, manifest, transfer).await?;
    transfer_one(interface, manifest, transfer, &id).await?;
    if !options.transfer_only {
        restore_one(interface, manifest, transfer, &id).await?;
    }
    if options.delete_state {
        delete_state_one(interface, manifest, transfer).await?;
    }
    if let Some(keep) = options.keep_generations {
        clean_one(interface, manifest, transfer, keep).await?;
    }
    Ok(())
}

fn target_of<'a>(manifest: &'a Manifest, name: &str) -> Result<&'a crate::manifest::Target, MigrationError> {
    manifest.targets.get(name).ok_or_else(|| MigrationError::UnknownTarget(name.to_string()))
}

/// Snapshot `transfer.mapping`'s component on its source, then read back
/// the newest snapshot id via `query-latest-snapshot` (spec §4.7 steps 1-2;
/// `snapshot` itself only reports success/failure, it never returns an id).
async fn snapshot_one(interface: &dyn ClientInterface, manifest: &Manifest, transfer: &Transfer) -> Result<SnapshotId, MigrationError> {
    let source = target_of(manifest, &transfer.source)?;

    let snapshot_call = RemoteCall::new(ClientInterfaceVerb::Snapshot, source)
        .with_container(transfer.mapping.container.clone())
        .with_component(transfer.mapping.component.clone());
    interface.invoke(snapshot_call).await.map_err(|source_error| MigrationError::SnapshotFailed {
        service: transfer.mapping.service.clone(),
        source: transfer.source.clone(),
        source_error,
    })?;

    let query_call = RemoteCall::new(ClientInterfaceVerb::QueryLatestSnapshot, source)
        .with_container(transfer.mapping.container.clone())
        .with_component(transfer.mapping.component.clone());
    let outcome = interface.invoke(query_call).await.map_err(|source_error| MigrationError::SnapshotFailed {
        service: transfer.mapping.service.clone(),
        source: transfer.source.clone(),
        source_error,
    })?;
    let ProcessOutcome::Lines(lines) = outcome else {
        return Err(MigrationError::NoSnapshotFound { service: transfer.mapping.service.clone(), source: transfer.source.clone() });
    };
    lines
        .into_iter()
        .next()
        .map(SnapshotId)
        .ok_or_else(|| MigrationError::NoSnapshotFound { service: transfer.mapping.service.clone(), source: transfer.source.clone() })
}

/// Transfer `id` from source to destination, per the incremental protocol
/// in spec §4.7 step 3: ask the destination which of the source's
/// generations up to and including `id` it's already missing. If nothing
/// is missing the destination can pull directly (`--remote`); otherwise
/// resolve dependencies between the two snapshot stores and push the
/// missing ones locally, exporting/importing in chronological order.
async fn transfer_one(
    interface: &dyn ClientInterface,
    manifest: &Manifest,
    transfer: &Transfer,
    id: &SnapshotId,
) -> Result<(), MigrationError> {
    let source = target_of(manifest, &transfer.source)?;
    let destination = target_of(manifest, &transfer.destination)?;

    let print_missing = RemoteCall::new(ClientInterfaceVerb::PrintMissingSnapshots, destination)
        .with_container(transfer.mapping.container.clone())
        .with_component(transfer.mapping.component.clone())
        .with_ids(vec![id.0.clone()]);
    let outcome = interface.invoke(print_missing).await.map_err(|source_error| MigrationError::TransferFailed {
        service: transfer.mapping.service.clone(),
        source: transfer.source.clone(),
        destination: transfer.destination.clone(),
        source_error,
    })?;
    let ProcessOutcome::Lines(missing) = outcome else {
        return Err(MigrationError::TransferFailed {
            service: transfer.mapping.service.clone(),
            source: transfer.source.clone(),
            destination: transfer.destination.clone(),
            source_error: InterfaceError::InvalidOutput,
        });
    };

    if missing.is_empty() {
        let import_call = RemoteCall::new(ClientInterfaceVerb::ImportSnapshots, destination)
            .with_container(transfer.mapping.container.clone())
            .with_component(transfer.mapping.component.clone())
            .with_locality(Locality::Remote)
            .with_paths(vec![transfer.source.clone()]);
        interface.invoke(import_call).await.map_err(|source_error| MigrationError::TransferFailed {
            service: transfer.mapping.service.clone(),
            source: transfer.source.clone(),
            destination: transfer.destination.clone(),
            source_error,
        })?;
        return Ok(());
    }

    let resolve_call = RemoteCall::new(ClientInterfaceVerb::ResolveSnapshots, source)
        .with_container(transfer.mapping.container.clone())
        .with_component(transfer.mapping.component.clone())
        .with_ids(missing.clone());
    interface.invoke(resolve_call).await.map_err(|source_error| MigrationError::TransferFailed {
        service: transfer.mapping.service.clone(),
        source: transfer.source.clone(),
        destination: transfer.destination.clone(),
        source_error,
    })?;

    let export_call = RemoteCall::new(ClientInterfaceVerb::ExportSnapshots, source).with_paths(missing.clone());
    let exported = interface.invoke(export_call).await.map_err(|source_error| MigrationError::TransferFailed {
        service: transfer.mapping.service.clone(),
        source: transfer.source.clone(),
        destination: transfer.destination.clone(),
        source_error,
    })?;
    let ProcessOutcome::Lines(paths) = exported else {
        return Err(MigrationError::TransferFailed {
            service: transfer.mapping.service.clone(),
            source: transfer.source.clone(),
            destination: transfer.destination.clone(),
            source_error: InterfaceError::InvalidOutput,
        });
    };

    let import_call = RemoteCall::new(ClientInterfaceVerb::ImportSnapshots, destination)
        .with_container(transfer.mapping.container.clone())
        .with_component(transfer.mapping.component.clone())
        .with_locality(Locality::Local)
        .with_paths(paths);
    interface.invoke(import_call).await.map_err(|source_error| MigrationError::TransferFailed {
        service: transfer.mapping.service.clone(),
        source: transfer.source.clone(),
        destination: transfer.destination.clone(),
        source_error,
    })?;

    Ok(())
}

async fn restore_one(interface: &dyn ClientInterface, manifest: &Manifest, transfer: &Transfer, id: &SnapshotId) -> Result<(), MigrationError> {
    let destination = target_of(manifest, &transfer.destination)?;
    let call = RemoteCall::new(ClientInterfaceVerb::Restore, destination)
        .with_container(transfer.mapping.container.clone())
        .with_arguments(vec![id.0.clone()]);
    interface.invoke(call).await.map_err(|source_error| MigrationError::RestoreFailed {
        service: transfer.mapping.service.clone(),
        destination: transfer.destination.clone(),
        source_error,
    })?;
    Ok(())
}

async fn delete_state_one(interface: &dyn ClientInterface, manifest: &Manifest, transfer: &Transfer) -> Result<(), MigrationError> {
    let source = target_of(manifest, &transfer.source)?;
    let call = RemoteCall::new(ClientInterfaceVerb::DeleteState, source).with_container(transfer.mapping.container.clone());
    interface.invoke(call).await.map_err(|source_error| MigrationError::DeleteStateFailed {
        service: transfer.mapping.service.clone(),
        source: transfer.source.clone(),
        source_error,
    })?;
    Ok(())
}

async fn clean_one(interface: &dyn ClientInterface, manifest: &Manifest, transfer: &Transfer, keep: u32) -> Result<(), MigrationError> {
    let source = target_of(manifest, &transfer.source)?;
    let call = RemoteCall::new(ClientInterfaceVerb::CleanSnapshots, source)
        .with_container(transfer.mapping.container.clone())
        .with_component(transfer.mapping.component.clone())
        .with_keep(keep);
    // best-effort: a cleanup failure shouldn't fail the migration as a whole.
    if let Err(err) = interface.invoke(call).await {
        tracing::warn!(target = %transfer.source, error = %err, "snapshot cleanup failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::SimulatedClientInterface;
    use crate::manifest::Target;
    use std::collections::HashMap;

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

    fn manifest_with(targets: &[&str]) -> Manifest {
        let mut m = Manifest::new();
        for t in targets {
            m.targets.insert(t.to_string(), target(t));
        }
        m
    }

    #[test]
    fn snapshot_id_orders_lexicographically() {
        let mut ids = vec![SnapshotId("b-2".into()), SnapshotId("a-1".into())];
        ids.sort();
        assert_eq!(ids, vec![SnapshotId("a-1".into()), SnapshotId("b-2".into())]);
    }

    #[test]
    fn plan_transfers_detects_target_change_only() {
        let mut old = manifest_with(&["test1", "test2"]);
        old.snapshot_mappings.push(SnapshotMapping {
            service: "database".into(),
            container: "mysql-database".into(),
            target: "test1".into(),
            component: "mysql-state".into(),
            transferred: false,
        });
        let mut new = manifest_with(&["test1", "test2"]);
        new.snapshot_mappings.push(SnapshotMapping {
            service: "database".into(),
            container: "mysql-database".into(),
            target: "test2".into(),
            component: "mysql-state".into(),
            transferred: false,
        });
        let transfers = plan_transfers(&old, &new);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].source, "test1");
        assert_eq!(transfers[0].destination, "test2");
    }

    #[tokio::test]
    async fn migrate_fails_when_no_snapshot_id_is_reported() {
        let manifest = manifest_with(&["test1", "test2"]);
        let transfer = Transfer {
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
        // SimulatedClientInterface returns an empty Lines() for query-latest-snapshot.
        let interface: Arc<dyn ClientInterface> = Arc::new(SimulatedClientInterface::new());
        let result = migrate(interface, &manifest, &[transfer], MigrationMode::DepthFirst).await;
        assert!(matches!(result, Err(MigrationError::NoSnapshotFound { .. })));
    }
}
