//! The deployment manifest: declarative model, ordered-map storage, XML
//! loading and set algebra over mappings (spec §3, §4.1).

pub mod ordered;
pub mod setalgebra;
pub mod types;
pub mod xml;

pub use ordered::OrderedMap;
pub use setalgebra::{find_dependents, intersect, subtract, unify};
pub use types::{
    DependencyRef, DerivationMapping, DistributedDerivation, IllegalTransition, Interface,
    Manifest, MappingKey, MappingStatus, Service, ServiceMapping, SnapshotMapping, Target,
};
pub use xml::ManifestError;
