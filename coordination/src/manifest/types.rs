//! Core manifest entities (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ordered::OrderedMap;

/// A reference to another mapping's service: `(service, container, target?)`.
/// Absent `target` means "same target as the referrer" (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub service: String,
    pub container: String,
    pub target: Option<String>,
}

impl DependencyRef {
    /// Resolve the implicit-target rule against the referrer's own target.
    pub fn resolved_target<'a>(&'a self, referrer_target: &'a str) -> &'a str {
        self.target.as_deref().unwrap_or(referrer_target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub package: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
    /// Weaker coupling; carried for configuration purposes but never
    /// consulted by the dependency traversal (spec §9 Design Notes).
    #[serde(default)]
    pub connects_on: Vec<DependencyRef>,
}

/// A machine reachable via a client interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub containers: HashMap<String, HashMap<String, String>>,
    pub client_interface: String,
    /// Key within `properties` whose value is the machine's address.
    #[serde(default = "default_target_property")]
    pub target_property: String,
    pub num_of_cores: u32,
}

fn default_target_property() -> String {
    "hostname".to_string()
}

impl Target {
    /// Resolve this target's address via `target_property`.
    pub fn key(&self) -> Option<&str> {
        self.properties.get(&self.target_property).map(|s| s.as_str())
    }

    /// Flatten a container's property map into `k=v` pairs for `--arguments`
    /// (spec §4.4), sorted for a deterministic argv.
    pub fn container_arguments(&self, container: &str) -> Vec<String> {
        let Some(props) = self.containers.get(container) else {
            return Vec::new();
        };
        let mut pairs: Vec<String> = props.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }
}

/// Runtime status of a `ServiceMapping` during a transition. Not part of
/// the persisted manifest (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingStatus {
    Unknown,
    Activated,
    Deactivated,
    InError,
}

/// Error returned when an illegal `MappingStatus` transition is attempted.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("illegal mapping status transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: MappingStatus,
    pub to: MappingStatus,
}

impl MappingStatus {
    /// Enforce the transition table in spec §3:
    /// `Unknown -> {Activated, InError}`, `Activated <-> Deactivated`,
    /// `InError -> {Activated, Deactivated}` (rollback normalization).
    pub fn transition_to(self, to: MappingStatus) -> Result<MappingStatus, IllegalTransition> {
        use MappingStatus::*;
        let allowed = matches!(
            (self, to),
            (Unknown, Activated)
                | (Unknown, InError)
                | (Activated, Deactivated)
                | (Deactivated, Activated)
                | (InError, Activated)
                | (InError, Deactivated)
        );
        if allowed {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self, to })
        }
    }
}

/// `(service, container, target)` — the unit of deployment. Equality and
/// hashing are on the key triple only; `status` is excluded so set algebra
/// over mappings ignores the transient runtime state (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMapping {
    pub service: String,
    pub container: String,
    pub target: String,
    #[serde(skip, default = "default_status")]
    pub status: MappingStatus,
}

fn default_status() -> MappingStatus {
    MappingStatus::Unknown
}

impl ServiceMapping {
    pub fn new(service: impl Into<String>, container: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            container: container.into(),
            target: target.into(),
            status: MappingStatus::Unknown,
        }
    }

    pub fn key(&self) -> MappingKey {
        MappingKey {
            service: self.service.clone(),
            container: self.container.clone(),
            target: self.target.clone(),
        }
    }
}

impl PartialEq for ServiceMapping {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service && self.container == other.container && self.target == other.target
    }
}
impl Eq for ServiceMapping {}

impl std::hash::Hash for ServiceMapping {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.service.hash(state);
        self.container.hash(state);
        self.target.hash(state);
    }
}

/// The key triple used to identify a `ServiceMapping`, independent of its
/// transient status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingKey {
    pub service: String,
    pub container: String,
    pub target: String,
}

/// Identifies mutable state that must follow a service between targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMapping {
    pub service: String,
    pub container: String,
    pub target: String,
    pub component: String,
    #[serde(skip)]
    pub transferred: bool,
}

impl SnapshotMapping {
    pub fn mapping_key(&self) -> MappingKey {
        MappingKey {
            service: self.service.clone(),
            container: self.container.clone(),
            target: self.target.clone(),
        }
    }
}

/// `(targetAddress, clientInterface)` pair used by the distributed-build
/// variant; parallel to `Target` but simpler (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub target_address: String,
    pub client_interface: String,
}

/// `{derivation, interface}` entry of a distributed derivation document
/// (spec §6). The build step itself is out of scope; only the shape is
/// modeled so it can be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationMapping {
    pub derivation: String,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedDerivation {
    pub derivation_mappings: Vec<DerivationMapping>,
    pub interfaces: HashMap<String, Interface>,
}

/// The full declarative deployment model (spec §3).
#[derive(Debug, Clone)]
pub struct Manifest {
    pub services: OrderedMap<String, Service>,
    pub service_mappings: OrderedMap<MappingKey, ServiceMapping>,
    pub snapshot_mappings: Vec<SnapshotMapping>,
    pub targets: OrderedMap<String, Target>,
    /// target-name -> profile-path.
    pub profile_mappings: OrderedMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            services: OrderedMap::new(),
            service_mappings: OrderedMap::new(),
            snapshot_mappings: Vec::new(),
            targets: OrderedMap::new(),
            profile_mappings: OrderedMap::new(),
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}
