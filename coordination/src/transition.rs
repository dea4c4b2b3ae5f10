//! Transition engine (spec §4.6).
//!
//! Ported from `libdeploy/transition.c`'s `transition()`:
//! `deactivate_obsolete_mappings(...) && activate_new_mappings(...)` — the
//! deactivation phase fully completes, with state migration run in between,
//! before the activation phase begins (spec §5's ordering guarantee).

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::dependency::{self, TraversalOrder};
use crate::interface::{ClientInterface, DryRunClientInterface};
use crate::manifest::{find_dependents, intersect, subtract, unify, Manifest, MappingKey};
use crate::migration::{self, MigrationMode};
use crate::target::TargetPool;

#[derive(Debug, Clone, Copy)]
pub struct TransitionFlags {
    /// Skip re-activating mappings already active under the old manifest.
    pub no_upgrade: bool,
    /// Do not roll back on failure; leave the system in its failed state.
    pub no_rollback: bool,
    /// Build the activation/deactivation plan and log it without invoking anything.
    pub dry_run: bool,
    /// Order in which state-bearing mappings that changed target are migrated.
    pub migration_mode: MigrationMode,
}

impl Default for TransitionFlags {
    fn default() -> Self {
        Self { no_upgrade: false, no_rollback: false, dry_run: false, migration_mode: MigrationMode::BreadthFirst }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Success,
    Failed,
    NewMappingsRollbackFailed,
    ObsoleteMappingsRollbackFailed,
}

/// Run a transition from `old` (or an empty manifest, if `None`) to `new`.
pub async fn transition(
    interface: Arc<dyn ClientInterface>,
    new: &Manifest,
    old: Option<&Manifest>,
    flags: TransitionFlags,
) -> TransitionOutcome {
    transition_with_interrupt(interface, new, old, flags, Arc::new(AtomicBool::new(false))).await
}

pub async fn transition_with_interrupt(
    interface: Arc<dyn ClientInterface>,
    new: &Manifest,
    old: Option<&Manifest>,
    flags: TransitionFlags,
    interrupt: Arc<AtomicBool>,
) -> TransitionOutcome {
    let empty = Manifest::new();
    let old = old.unwrap_or(&empty);
    let unified = unify(old, new);
    let targets = Arc::new(TargetPool::from_targets(unified.targets.values()));

    let interface: Arc<dyn ClientInterface> = if flags.dry_run { Arc::new(DryRunClientInterface) } else { interface };

    let new_mappings: Vec<MappingKey> = subtract(new, old).into_iter().map(|m| m.key()).collect();
    let obsolete_mappings: Vec<MappingKey> = subtract(old, new).into_iter().map(|m| m.key()).collect();
    let common_mappings: Vec<MappingKey> = intersect(new, old).into_iter().map(|m| m.key()).collect();

    let activation_set: Vec<MappingKey> =
        if flags.no_upgrade { new_mappings } else { unify_keys(&new_mappings, &common_mappings) };

    // Phase 1: deactivate everything obsolete in `old`, fully, before any activation begins.
    let deactivation_result = dependency::execute(
        interface.clone(),
        Arc::new(old.clone()),
        &obsolete_mappings,
        TraversalOrder::DeactivationOrder,
        targets.clone(),
        interrupt.clone(),
    )
    .await;

    if let Some(failed_key) = &deactivation_result.failed {
        tracing::error!(failed = ?failed_key, "deactivation of obsolete mappings failed, rolling back");
        if flags.no_rollback {
            return TransitionOutcome::Failed;
        }
        return reactivate_or_fail(&interface, &unified, &targets, &interrupt, &deactivation_result.completed).await;
    }

    // Phase 2: migrate state for mappings whose target changed, now that the source side
    // has been fully deactivated and before the destination side activates.
    let transfers = migration::plan_transfers(old, new);
    if !transfers.is_empty() {
        if let Err(err) = migration::migrate(interface.clone(), &unified, &transfers, flags.migration_mode).await {
            tracing::error!(error = %err, "state migration failed, rolling back");
            if flags.no_rollback {
                return TransitionOutcome::Failed;
            }
            return reactivate_or_fail(&interface, &unified, &targets, &interrupt, &deactivation_result.completed).await;
        }
    }

    // Phase 3: activate the new and upgraded mappings.
    let activation_result = dependency::execute(
        interface.clone(),
        Arc::new(new.clone()),
        &activation_set,
        TraversalOrder::ActivationOrder,
        targets.clone(),
        interrupt.clone(),
    )
    .await;

    if let Some(failed_key) = &activation_result.failed {
        tracing::error!(failed = ?failed_key, "activation of new mappings failed, rolling back");
        if flags.no_rollback {
            return TransitionOutcome::Failed;
        }

        let dependents = find_dependents(new, failed_key);
        let to_rollback: Vec<MappingKey> =
            activation_result.completed.iter().rev().filter(|k| !dependents.contains(k)).cloned().collect();

        let new_rollback = dependency::execute(
            interface.clone(),
            Arc::new(new.clone()),
            &to_rollback,
            TraversalOrder::DeactivationOrder,
            targets.clone(),
            interrupt.clone(),
        )
        .await;
        if new_rollback.failed.is_some() {
            return TransitionOutcome::NewMappingsRollbackFailed;
        }

        if !common_mappings.is_empty() {
            let restore = dependency::execute(
                interface.clone(),
                Arc::new(unified.clone()),
                &common_mappings,
                TraversalOrder::ActivationOrder,
                targets,
                interrupt,
            )
            .await;
            if restore.failed.is_some() {
                return TransitionOutcome::ObsoleteMappingsRollbackFailed;
            }
        }
        return TransitionOutcome::Failed;
    }

    TransitionOutcome::Success
}

/// Re-activate `mappings` (successfully deactivated obsolete mappings)
/// against the unified manifest, for rollback after a deactivation or
/// migration failure (spec §4.6 step 4).
async fn reactivate_or_fail(
    interface: &Arc<dyn ClientInterface>,
    unified: &Manifest,
    targets: &Arc<TargetPool>,
    interrupt: &Arc<AtomicBool>,
    mappings: &[MappingKey],
) -> TransitionOutcome {
    let rollback = dependency::execute(
        interface.clone(),
        Arc::new(unified.clone()),
        mappings,
        TraversalOrder::ActivationOrder,
        targets.clone(),
        interrupt.clone(),
    )
    .await;
    if rollback.failed.is_some() {
        TransitionOutcome::ObsoleteMappingsRollbackFailed
    } else {
        TransitionOutcome::Failed
    }
}

fn unify_keys(a: &[MappingKey], b: &[MappingKey]) -> Vec<MappingKey> {
    let mut out = a.to_vec();
    for key in b {
        if !out.contains(key) {
            out.push(key.clone());
        }
    }
    out
}
