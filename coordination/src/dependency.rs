//! Dependency-ordered execution (spec §4.5).
//!
//! Activation must happen in dependency order (dependencies before
//! dependents); deactivation in the reverse, and both must exploit whatever
//! concurrency the per-target core budget (`target::TargetPool`) allows
//! rather than running one mapping at a time. This is the ready-scan loop:
//! repeatedly scan for mappings whose prerequisites have reached the
//! target status, acquire a core on their target, dispatch, and reap one
//! completion at a time — closer to `libprocreact`'s iterator-of-futures
//! shape than a single up-front topological sort.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::interface::{ClientInterface, ClientInterfaceVerb, RemoteCall};
use crate::manifest::{Manifest, MappingKey, MappingStatus};
use crate::target::TargetPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    /// Dependencies activate before their dependents.
    ActivationOrder,
    /// Dependents deactivate before their dependencies.
    DeactivationOrder,
}

impl TraversalOrder {
    fn verb(self) -> ClientInterfaceVerb {
        match self {
            TraversalOrder::ActivationOrder => ClientInterfaceVerb::Activate,
            TraversalOrder::DeactivationOrder => ClientInterfaceVerb::Deactivate,
        }
    }

    fn target_status(self) -> MappingStatus {
        match self {
            TraversalOrder::ActivationOrder => MappingStatus::Activated,
            TraversalOrder::DeactivationOrder => MappingStatus::Deactivated,
        }
    }
}

/// What the ready-scan loop produced: which mappings finished, which one
/// (if any) broke the run, and the final status of every mapping touched.
#[derive(Debug, Default)]
pub struct TraversalResult {
    pub completed: Vec<MappingKey>,
    pub failed: Option<MappingKey>,
    pub statuses: HashMap<MappingKey, MappingStatus>,
}

/// The mappings (within `mappings`) that must already be at `order`'s
/// target status before `key` may run.
fn prerequisites_of(manifest: &Manifest, mappings: &[MappingKey], key: &MappingKey, order: TraversalOrder) -> Vec<MappingKey> {
    match order {
        TraversalOrder::ActivationOrder => {
            let Some(mapping) = manifest.service_mappings.get(key) else {
                return Vec::new();
            };
            let Some(service) = manifest.services.get(&mapping.service) else {
                return Vec::new();
            };
            service
                .depends_on
                .iter()
                .filter_map(|dep| {
                    let dep_target = dep.resolved_target(&mapping.target);
                    mappings.iter().find(|k| k.service == dep.service && k.target == dep_target).cloned()
                })
                .collect()
        }
        TraversalOrder::DeactivationOrder => mappings
            .iter()
            .filter(|candidate| {
                if *candidate == key {
                    return false;
                }
                let Some(mapping) = manifest.service_mappings.get(candidate) else {
                    return false;
                };
                let Some(service) = manifest.services.get(&mapping.service) else {
                    return false;
                };
                service.depends_on.iter().any(|dep| {
                    let dep_target = dep.resolved_target(&mapping.target);
                    dep.service == key.service && dep_target == key.target
                })
            })
            .cloned()
            .collect(),
    }
}

/// Run `mappings` to completion against `manifest` in `order`, honoring
/// each target's core budget (spec §4.2) and the tie-break rule that ready
/// mappings dispatch in `mappings`' own (manifest distribution) order
/// (spec §9 Design Notes). Stops dispatching new work on the first failure
/// or once `interrupt` is set, but always drains whatever is already
/// in flight before returning.
pub async fn execute(
    interface: Arc<dyn ClientInterface>,
    manifest: Arc<Manifest>,
    mappings: &[MappingKey],
    order: TraversalOrder,
    targets: Arc<TargetPool>,
    interrupt: Arc<AtomicBool>,
) -> TraversalResult {
    let verb = order.verb();
    let done_status = order.target_status();

    let mut statuses: HashMap<MappingKey, MappingStatus> =
        mappings.iter().map(|k| (k.clone(), MappingStatus::Unknown)).collect();
    let mut dispatched: HashSet<MappingKey> = HashSet::new();
    let mut completed: Vec<MappingKey> = Vec::new();
    let mut failed: Option<MappingKey> = None;

    type JobResult = (MappingKey, String, Result<(), ()>);
    let mut in_flight: FuturesUnordered<tokio::task::JoinHandle<JobResult>> = FuturesUnordered::new();

    loop {
        if failed.is_none() && !interrupt.load(Ordering::SeqCst) {
            for key in mappings {
                if dispatched.contains(key) {
                    continue;
                }
                let prereqs = prerequisites_of(&manifest, mappings, key, order);
                let ready = prereqs.iter().all(|p| statuses.get(p).copied() == Some(done_status));
                if !ready {
                    continue;
                }
                let Some(mapping) = manifest.service_mappings.get(key) else {
                    dispatched.insert(key.clone());
                    statuses.insert(key.clone(), MappingStatus::InError);
                    failed = Some(key.clone());
                    break;
                };
                let Some(target_handle) = targets.get(&mapping.target) else {
                    dispatched.insert(key.clone());
                    statuses.insert(key.clone(), MappingStatus::InError);
                    failed = Some(key.clone());
                    break;
                };
                if !target_handle.try_acquire() {
                    continue;
                }

                dispatched.insert(key.clone());
                let interface = interface.clone();
                let manifest_for_job = manifest.clone();
                let key_owned = key.clone();
                let target_name = mapping.target.clone();
                in_flight.push(tokio::spawn(async move {
                    let result = dispatch_one(interface.as_ref(), &manifest_for_job, &key_owned, verb).await;
                    (key_owned, target_name, result)
                }));
            }
        }

        if in_flight.is_empty() {
            break;
        }

        match in_flight.next().await {
            Some(Ok((key, target_name, result))) => {
                if let Some(handle) = targets.get(&target_name) {
                    handle.release();
                }
                match result {
                    Ok(()) => {
                        let current = statuses.get(&key).copied().unwrap_or(MappingStatus::Unknown);
                        let next = current.transition_to(done_status).unwrap_or(done_status);
                        statuses.insert(key.clone(), next);
                        completed.push(key);
                    }
                    Err(()) => {
                        statuses.insert(key.clone(), MappingStatus::InError);
                        if failed.is_none() {
                            failed = Some(key);
                        }
                    }
                }
            }
            Some(Err(join_err)) => {
                tracing::warn!(error = %join_err, "mapping execution task panicked");
            }
            None => break,
        }
    }

    TraversalResult { completed, failed, statuses }
}

async fn dispatch_one(
    interface: &dyn ClientInterface,
    manifest: &Manifest,
    key: &MappingKey,
    verb: ClientInterfaceVerb,
) -> Result<(), ()> {
    let Some(target) = manifest.targets.get(&key.target) else {
        tracing::error!(target = %key.target, "mapping references unknown target");
        return Err(());
    };
    let Some(mapping) = manifest.service_mappings.get(key) else {
        return Err(());
    };
    let service = manifest.services.get(&mapping.service);
    let arguments = target.container_arguments(&mapping.container);

    let mut call = RemoteCall::new(verb, target).with_container(mapping.container.clone()).with_arguments(arguments);
    if let Some(service) = service {
        call = call.with_service_type(service.service_type.clone()).with_package(service.package.clone());
    }

    match interface.invoke(call).await {
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::error!(?key, ?verb, error = %err, "mapping execution failed");
            Err(())
        }
    }
}
