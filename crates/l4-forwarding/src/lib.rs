//! L4 load balancer forwarding rule reconciliation.
//!
//! Drives the forwarding rules of a Kubernetes Service of type
//! `LoadBalancer` to the state its ports, annotations and backend service
//! ask for, with as few compute API mutations as possible.
//!
//! # Architecture
//!
//! - [`rule`]: Rule model, equality classifier and the versioned rule store
//! - [`ports`]: Discrete port allocation and the step pipeline
//! - [`migration`]: Temporary L3 rule bracketing a range to discrete switch
//! - [`naming`]: Deterministic rule names and protocol resolution
//! - [`address`], [`events`]: Address manager and event recorder seams
//! - [`ensure`]: The [`ForwardingRuleOrch`] state machine
//! - [`plan`]: Offline planning used by the `fr-plan` binary
//! - [`config`], [`sync`]: Configuration and sync result types
//!
//! # Example
//!
//! ```ignore
//! use l4_forwarding::{ForwardingConfig, ForwardingRuleOrch, InternalRuleParams};
//!
//! let config = ForwardingConfig::load("/etc/l4-forwarding.toml")?;
//! let mut orch = ForwardingRuleOrch::from_config(&config, &surfaces)?;
//! let sync = orch.ensure_internal(&service, &params).await?;
//! ```

pub mod address;
pub mod config;
pub mod ensure;
pub mod events;
pub mod migration;
pub mod naming;
pub mod plan;
pub mod ports;
pub mod rule;
pub mod service;
pub mod sync;

pub use address::{AddressError, AddressHold, AddressManager, AddressRequest, HeldAddress};
pub use config::{ConfigError, ForwardingConfig};
pub use ensure::{
    ExternalRuleParams, ForwardingRuleOrch, ForwardingRuleOrchConfig, ForwardingRuleOrchStats,
    InternalRuleParams, RuleSetSync, RuleSync,
};
pub use events::{EventRecorder, EventType, TracingEventRecorder};
pub use migration::{L3MigrationStrategy, L3Release};
pub use naming::{L4Namer, Namer, RuleNames};
pub use plan::{plan, Plan, PlanInput};
pub use rule::{ForwardingRule, RuleStore, StoreError};
pub use service::{Service, ServicePort};
pub use sync::{EnsureError, SyncError, SyncResult, SyncResultExt, SyncStatus};
