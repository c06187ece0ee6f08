//! Offline rule-set planning.
//!
//! Computes the rule shapes a Service needs from the rules that exist today,
//! without talking to the compute API. The rule-set ensure uses the same
//! computation before it applies anything.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::migration::L3MigrationStrategy;
use crate::naming::{service_protocol, Namer, RuleNames};
use crate::ports::{service_port_range, Pipeline, StepError};
use crate::rule::{ForwardingRule, IpVersion, PortSelection};
use crate::service::Service;

/// Rule shapes for a Service: name, protocol and port selection only.
///
/// In discrete mode existing rules go through the port pipeline; all-ports
/// rules cannot take discrete ports and are left out, so they end up
/// replaced. Otherwise a single range rule under the base name is wanted.
pub fn desired_rule_shapes(
    service: &Service,
    names: &RuleNames,
    existing: &[ForwardingRule],
    discrete: bool,
) -> Result<Vec<ForwardingRule>, StepError> {
    if !discrete {
        let protocol = service_protocol(&service.ports);
        return Ok(vec![ForwardingRule {
            name: names.base(&protocol, &IpVersion::Ipv4),
            ip_protocol: protocol,
            port_range: service_port_range(&service.ports),
            ..Default::default()
        }]);
    }

    let candidates: Vec<ForwardingRule> = existing
        .iter()
        .filter(|r| r.port_selection() != PortSelection::AllPorts)
        .map(|r| ForwardingRule {
            name: r.name.clone(),
            ip_protocol: r.protocol(),
            ip_version: r.ip_version.clone(),
            ports: r.ports.clone(),
            port_range: r.port_range.clone(),
            ..Default::default()
        })
        .collect();
    Pipeline::discrete_ports(names.clone()).run(&service.ports, candidates)
}

/// Input document of the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInput {
    pub service: Service,
    /// Backend service the rules point at.
    #[serde(default)]
    pub backend_service: String,
    /// Rules that exist today.
    #[serde(default)]
    pub rules: Vec<ForwardingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub discrete_port_forwarding: bool,
    /// Whether a temporary L3 rule would bracket the change.
    pub l3_migration: bool,
    pub rules: Vec<ForwardingRule>,
}

pub fn plan(input: &PlanInput, namer: Arc<dyn Namer>, discrete: bool) -> Result<Plan, StepError> {
    let names = RuleNames::new(namer, &input.service);
    let existing: Vec<ForwardingRule> = input
        .rules
        .iter()
        .filter(|r| r.name != names.l3_temporary())
        .cloned()
        .collect();

    let rules: Vec<ForwardingRule> = desired_rule_shapes(&input.service, &names, &existing, discrete)?
        .into_iter()
        .map(|shape| ForwardingRule {
            backend_service: input.backend_service.clone(),
            ..shape
        })
        .collect();
    let l3_migration = discrete
        && L3MigrationStrategy::new(&input.backend_service, &input.service, &existing)
            .matches(&rules);
    Ok(Plan {
        discrete_port_forwarding: discrete,
        l3_migration,
        rules,
    })
}
