//! Operational equality and patch classification of forwarding rules.
//!
//! The first argument of every comparison is the rule that exists in the
//! cloud, the second the rule the reconciler wants. With discrete port
//! forwarding enabled, an existing range rule is compared against the range
//! spanned by the wanted ports, so flipping the flag alone never recreates a
//! rule.

use super::types::{ForwardingRule, IpVersion};
use crate::ports::min_max_port_range;
use lb_compute::{equal_resource_paths, ComputeError, ResourceId};
use std::collections::BTreeSet;
use thiserror::Error;

/// Which side of a comparison failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSide {
    Existing,
    New,
}

impl std::fmt::Display for RuleSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleSide::Existing => write!(f, "existing"),
            RuleSide::New => write!(f, "new"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EqualityError {
    #[error("failed to parse backend service URL of {side} forwarding rule {rule:?}: {source}")]
    BackendUrl {
        side: RuleSide,
        rule: String,
        #[source]
        source: ComputeError,
    },
}

/// Outcome of comparing an existing rule with the wanted one.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleDiff {
    /// Nothing to do.
    Equal,
    /// Only patchable fields differ; carries the patch payload.
    Patchable(ForwardingRule),
    /// An immutable field differs.
    Recreate,
}

fn backend_id(rule: &ForwardingRule, side: RuleSide) -> Result<ResourceId, EqualityError> {
    ResourceId::parse(&rule.backend_service).map_err(|source| EqualityError::BackendUrl {
        side,
        rule: rule.name.clone(),
        source,
    })
}

fn backends_equal(existing: &ForwardingRule, new: &ForwardingRule) -> Result<bool, EqualityError> {
    let existing_id = backend_id(existing, RuleSide::Existing)?;
    let new_id = backend_id(new, RuleSide::New)?;
    Ok(existing_id == new_id)
}

/// Compares port selection of two rules.
pub fn equal_ports(existing: &ForwardingRule, new: &ForwardingRule, discrete_ports: bool) -> bool {
    if !discrete_ports || !existing.ports.is_empty() {
        let a: BTreeSet<&str> = existing.ports.iter().map(String::as_str).collect();
        let b: BTreeSet<&str> = new.ports.iter().map(String::as_str).collect();
        return a == b && existing.port_range == new.port_range;
    }

    // Existing rule uses a range; keep it a range if the ports still fit it.
    if new.ports.is_empty() {
        existing.port_range == new.port_range
    } else {
        existing.port_range == min_max_port_range(&new.ports)
    }
}

/// Operational equality of IPv4 rules.
pub fn equal(
    existing: &ForwardingRule,
    new: &ForwardingRule,
    discrete_ports: bool,
) -> Result<bool, EqualityError> {
    let backends = backends_equal(existing, new)?;
    Ok(existing.ip_address == new.ip_address
        && existing.ip_protocol == new.ip_protocol
        && existing.load_balancing_scheme == new.load_balancing_scheme
        && equal_ports(existing, new, discrete_ports)
        && backends
        && existing.allow_global_access == new.allow_global_access
        && existing.all_ports == new.all_ports
        && equal_resource_paths(&existing.subnetwork, &new.subnetwork)
        && equal_resource_paths(&existing.network, &new.network)
        && existing.network_tier == new.network_tier)
}

/// Operational equality of IPv6 rules.
///
/// The address is assigned by the provider and the network follows the
/// subnetwork, so neither is compared. The subnetwork is compared verbatim.
pub fn equal_ipv6(
    existing: &ForwardingRule,
    new: &ForwardingRule,
    discrete_ports: bool,
) -> Result<bool, EqualityError> {
    let backends = backends_equal(existing, new)?;
    Ok(existing.ip_protocol == new.ip_protocol
        && existing.load_balancing_scheme == new.load_balancing_scheme
        && equal_ports(existing, new, discrete_ports)
        && backends
        && existing.allow_global_access == new.allow_global_access
        && existing.all_ports == new.all_ports
        && existing.subnetwork == new.subnetwork
        && existing.network_tier == new.network_tier)
}

/// Patch payload for `existing` if it differs from `new` only in global
/// access or network tier.
///
/// The payload always carries `allow_global_access`; the network tier is
/// only sent when it changed. Rules that cannot be compared are never
/// patchable.
pub fn filter_patchable_fields(
    existing: &ForwardingRule,
    new: &ForwardingRule,
    discrete_ports: bool,
) -> Option<ForwardingRule> {
    let mut aligned = existing.clone();
    aligned.allow_global_access = new.allow_global_access;
    aligned.network_tier = new.network_tier.clone();

    if !matches!(equal_for_version(&aligned, new, discrete_ports), Ok(true)) {
        return None;
    }

    let mut patch = ForwardingRule {
        id: existing.id,
        name: existing.name.clone(),
        allow_global_access: new.allow_global_access,
        version: existing.version,
        scope: existing.scope,
        ..Default::default()
    };
    if existing.network_tier != new.network_tier {
        patch.network_tier = new.network_tier.clone();
    }
    Some(patch)
}

fn equal_for_version(
    existing: &ForwardingRule,
    new: &ForwardingRule,
    discrete_ports: bool,
) -> Result<bool, EqualityError> {
    match new.ip_version {
        IpVersion::Ipv6 => equal_ipv6(existing, new, discrete_ports),
        _ => equal(existing, new, discrete_ports),
    }
}

/// Classifies the change needed to turn `existing` into `new`, comparing
/// by the IP version of `new`.
pub fn classify(
    existing: &ForwardingRule,
    new: &ForwardingRule,
    discrete_ports: bool,
) -> Result<RuleDiff, EqualityError> {
    if equal_for_version(existing, new, discrete_ports)? {
        return Ok(RuleDiff::Equal);
    }
    Ok(match filter_patchable_fields(existing, new, discrete_ports) {
        Some(patch) => RuleDiff::Patchable(patch),
        None => RuleDiff::Recreate,
    })
}
