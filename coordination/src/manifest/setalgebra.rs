//! Set algebra over service mappings (spec §4.1, §4.6).
//!
//! The transition engine is defined entirely in terms of intersections,
//! subtractions and unions of mapping sets, keyed by `(service, container,
//! target)` and blind to `status`. Ported from `manifest-set.c` in the
//! original source.

use super::types::{Manifest, MappingKey, ServiceMapping};

/// Mappings present in both `a` and `b`, keyed by triple. The returned
/// mapping is `a`'s copy (its `status` is preserved).
pub fn intersect(a: &Manifest, b: &Manifest) -> Vec<ServiceMapping> {
    a.service_mappings
        .iter()
        .filter(|(k, _)| b.service_mappings.contains_key(k))
        .map(|(_, m)| m.clone())
        .collect()
}

/// Mappings present in `a` but not in `b`.
pub fn subtract(a: &Manifest, b: &Manifest) -> Vec<ServiceMapping> {
    a.service_mappings
        .iter()
        .filter(|(k, _)| !b.service_mappings.contains_key(k))
        .map(|(_, m)| m.clone())
        .collect()
}

/// Produces the unified manifest consulted during rollback (spec §4.1,
/// §4.6): the union of `old` and `new`'s mappings/services/targets, with
/// `new`'s definitions winning on a name collision. This is the manifest
/// `dependency::execute` looks up service/target definitions against when
/// re-activating `old` mappings mid-rollback, so a service whose definition
/// changed between `old` and `new` still resolves.
pub fn unify(old: &Manifest, new: &Manifest) -> Manifest {
    let mut services = new.services.clone();
    for (name, service) in old.services.iter() {
        if !services.contains_key(name) {
            services.insert(name.clone(), service.clone());
        }
    }

    let mut targets = new.targets.clone();
    for (name, target) in old.targets.iter() {
        if !targets.contains_key(name) {
            targets.insert(name.clone(), target.clone());
        }
    }

    let mut service_mappings = new.service_mappings.clone();
    for (key, mapping) in old.service_mappings.iter() {
        if !service_mappings.contains_key(key) {
            service_mappings.insert(key.clone(), mapping.clone());
        }
    }

    Manifest {
        services,
        service_mappings,
        snapshot_mappings: new.snapshot_mappings.clone(),
        targets,
        profile_mappings: new.profile_mappings.clone(),
    }
}

/// Mappings (anywhere in `manifest`) whose service depends on the service
/// named by `key`, directly or transitively, used when marking erroneous
/// mappings and their dependents during rollback (spec §4.6).
pub fn find_dependents(manifest: &Manifest, key: &MappingKey) -> Vec<MappingKey> {
    let mut dependents = Vec::new();
    let mut frontier = vec![key.clone()];
    let mut seen = std::collections::HashSet::new();
    seen.insert(key.clone());

    while let Some(current) = frontier.pop() {
        for (candidate_key, mapping) in manifest.service_mappings.iter() {
            if seen.contains(candidate_key) {
                continue;
            }
            let Some(service) = manifest.services.get(&mapping.service) else {
                continue;
            };
            let depends_on_current = service.depends_on.iter().any(|dep| {
                let target = dep.resolved_target(&mapping.target);
                dep.service == current.service && target == current.target
            });
            if depends_on_current {
                seen.insert(candidate_key.clone());
                dependents.push(candidate_key.clone());
                frontier.push(candidate_key.clone());
            }
        }
    }
    dependents
}
