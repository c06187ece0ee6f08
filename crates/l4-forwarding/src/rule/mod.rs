//! Forwarding rule model, comparison and storage.
//!
//! # Modules
//!
//! - [`types`]: The normalized forwarding rule and its wire enums
//! - [`equal`]: Operational equality and patch classification
//! - [`store`]: CRUD against the selected compute API surface

pub mod equal;
pub mod store;
pub mod types;

pub use equal::{
    classify, equal, equal_ipv6, equal_ports, filter_patchable_fields, EqualityError, RuleDiff,
    RuleSide,
};
pub use store::{is_address_already_in_use, RuleStore, StoreError, StoreResult};
pub use types::{
    ForwardingRule, IpProtocol, IpVersion, LoadBalancingScheme, NetworkTier, PortSelection,
    MAX_DISCRETE_PORTS,
};
