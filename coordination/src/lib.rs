//! Coordination engine for distributed service deployment: manifest
//! model, per-target concurrency, remote invocation, dependency-ordered
//! transitions, state migration, distributed locking, profile bookkeeping
//! and the on-target agent.

pub mod agent;
pub mod dependency;
pub mod error;
pub mod interface;
pub mod lock;
pub mod manifest;
pub mod migration;
pub mod process;
pub mod profile;
pub mod target;
pub mod transition;

pub use error::DisnixError;
pub use manifest::Manifest;
pub use transition::{transition, TransitionFlags, TransitionOutcome};
