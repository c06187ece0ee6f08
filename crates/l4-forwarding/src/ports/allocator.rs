//! Discrete port allocation.
//!
//! Ports missing from the current rules are packed into rules that still have
//! room, emptiest first, so that the fewest rules are modified. Whatever does
//! not fit goes into new rules of at most [`MAX_DISCRETE_PORTS`] ports that
//! carry only their protocol and ports; naming and the remaining fields are
//! filled in by later stages.

use super::DesiredPorts;
use crate::rule::{ForwardingRule, IpProtocol, PortSelection, MAX_DISCRETE_PORTS};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Ports already assigned to rules, per protocol.
fn assigned_ports(rules: &[ForwardingRule]) -> BTreeMap<IpProtocol, BTreeSet<u16>> {
    let mut have: BTreeMap<IpProtocol, BTreeSet<u16>> = BTreeMap::new();
    for rule in rules {
        have.entry(rule.protocol())
            .or_default()
            .extend(rule.ports.iter().filter_map(|p| p.parse::<u16>().ok()));
    }
    have
}

/// Rules able to take discrete ports.
fn accepts_discrete(rule: &ForwardingRule) -> bool {
    matches!(
        rule.port_selection(),
        PortSelection::None | PortSelection::Discrete
    )
}

/// Drops every port a rule carries that is not desired for its protocol.
pub fn clean_ports(desired: &DesiredPorts, rules: Vec<ForwardingRule>) -> Vec<ForwardingRule> {
    rules
        .into_iter()
        .map(|mut rule| {
            let wanted = desired.get(&rule.protocol());
            rule.ports.retain(|p| {
                p.parse::<u16>()
                    .is_ok_and(|port| wanted.is_some_and(|w| w.contains(&port)))
            });
            rule
        })
        .collect()
}

/// Adds every desired port that no rule carries yet.
///
/// Existing rules keep their order; new rules are appended per protocol.
/// No rule ends up with more than [`MAX_DISCRETE_PORTS`] ports.
pub fn add_ports(desired: &DesiredPorts, mut rules: Vec<ForwardingRule>) -> Vec<ForwardingRule> {
    let have = assigned_ports(&rules);
    let mut created = Vec::new();

    for (protocol, wanted) in desired {
        let mut to_add: BTreeSet<u16> = match have.get(protocol) {
            Some(have) => wanted.difference(have).copied().collect(),
            None => wanted.clone(),
        };
        if to_add.is_empty() {
            continue;
        }

        // Most free slots first keeps the number of modified rules minimal.
        let mut candidates: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.protocol() == *protocol && accepts_discrete(r))
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| rules[i].ports.len());

        for i in candidates {
            let rule = &mut rules[i];
            if to_add.is_empty() || rule.ports.len() >= MAX_DISCRETE_PORTS {
                break;
            }
            while rule.ports.len() < MAX_DISCRETE_PORTS {
                match to_add.pop_first() {
                    Some(port) => rule.ports.push(port.to_string()),
                    None => break,
                }
            }
            debug!(rule = %rule.name, protocol = %protocol, ports = ?rule.ports, "Filled existing forwarding rule");
        }

        created.extend(new_rules_for_ports(protocol, to_add));
    }

    rules.extend(created);
    rules
}

/// Creates `ceil(n / MAX_DISCRETE_PORTS)` rules holding the given ports.
pub fn new_rules_for_ports(
    protocol: &IpProtocol,
    ports: impl IntoIterator<Item = u16>,
) -> Vec<ForwardingRule> {
    let ports: Vec<u16> = ports.into_iter().collect();
    ports
        .chunks(MAX_DISCRETE_PORTS)
        .map(|chunk| ForwardingRule {
            ip_protocol: protocol.clone(),
            ports: chunk.iter().map(u16::to_string).collect(),
            ..Default::default()
        })
        .collect()
}
