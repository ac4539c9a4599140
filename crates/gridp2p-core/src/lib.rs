//! gridp2p-core — shared types for peer-to-peer code deployment.
//!
//! Holds the vocabulary every other gridp2p crate speaks: where deployed
//! code came from ([`OriginIdentity`]), how aggressively it is shared
//! ([`DeploymentMode`]), the cache key a deployment maps to
//! ([`policy::cache_key_for`]), node configuration, and the resolution
//! error surfaced to task submitters.

pub mod config;
pub mod error;
pub mod mode;
pub mod policy;
pub mod types;

pub use config::{LeaveKind, NodeConfig};
pub use error::{ClassResolutionError, ResolutionFailure};
pub use mode::DeploymentMode;
pub use policy::{CacheKey, cache_key_for};
pub use types::*;
