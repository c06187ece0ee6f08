//! Compute API surfaces.
//!
//! Each resource kind exposes one trait implemented once per
//! `(ApiVersion, KeyScope)` pair. The surfaces exchange the raw JSON
//! representation of the resource since every API version has its own
//! schema; normalization into a common shape happens in the caller.
//!
//! # Available API Modules
//!
//! - [`forwarding_rule`]: Forwarding rule CRUD and listing

pub mod forwarding_rule;

pub use forwarding_rule::{ForwardingRuleApi, ForwardingRuleSurfaces};
