//! Typed access to the cloud compute API used by L4 load balancers.
//!
//! This crate wraps the parts of the compute API the forwarding rule
//! reconciler needs, keeping version and scope dispatch out of its callers.
//!
//! # Architecture
//!
//! - [`types`]: API versions, scopes, resource keys and resource IDs
//! - [`error`]: Error types and HTTP status handling
//! - [`filter`]: Structural list filters
//! - [`api`]: Versioned API surfaces and their strategy tables
//! - `fake`: In-memory backend for tests (feature `fake`)
//!
//! # Example
//!
//! ```ignore
//! use lb_compute::{ApiVersion, KeyScope, ResourceKey};
//!
//! let api = surfaces.select(ApiVersion::Ga, KeyScope::Regional)?;
//! let rule = api.get(&ResourceKey::regional("my-rule", "us-central1")).await?;
//! ```

pub mod api;
pub mod error;
pub mod filter;
pub mod types;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use api::{ForwardingRuleApi, ForwardingRuleSurfaces};
pub use error::{ignore_not_found, ComputeError, ComputeResult, HttpStatus};
pub use filter::{Filter, BACKEND_SERVICE_FIELD, NAME_FIELD};
pub use types::{
    equal_resource_ids, equal_resource_paths, ApiVersion, KeyScope, Location, ResourceId,
    ResourceKey,
};
