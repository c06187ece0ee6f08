//! Rule set transformation steps.
//!
//! Every step is a pure function from the Service ports and the current rule
//! list to a new rule list. A [`Pipeline`] applies steps in order, handing
//! each step's output to the next.

use super::{allocator, desired_ports};
use crate::naming::{NameError, RuleNames};
use crate::rule::{ForwardingRule, IpProtocol, IpVersion};
use crate::service::ServicePort;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("forwarding rule {rule:?} has invalid port {port:?}")]
    InvalidPort { rule: String, port: String },
    #[error("failed to number forwarding rule names: {0}")]
    Name(#[from] NameError),
}

/// Signature shared by all steps.
pub type StepFn =
    dyn Fn(&[ServicePort], Vec<ForwardingRule>) -> Result<Vec<ForwardingRule>, StepError>
        + Send
        + Sync;

/// A named transformation.
pub struct Step {
    name: &'static str,
    apply: Box<StepFn>,
}

impl Step {
    pub fn new<F>(name: &'static str, apply: F) -> Self
    where
        F: Fn(&[ServicePort], Vec<ForwardingRule>) -> Result<Vec<ForwardingRule>, StepError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            apply: Box::new(apply),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Step").field(&self.name).finish()
    }
}

/// Ordered composition of steps.
#[derive(Debug, Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Standard discrete-port pipeline: drop ranges, drop unused ports, add
    /// missing ports, drop empty rules, then name new rules.
    pub fn discrete_ports(names: RuleNames) -> Self {
        Self::new()
            .then(Step::new("remove_port_ranges", remove_port_ranges))
            .then(Step::new(
                "remove_unused_discrete_ports",
                remove_unused_discrete_ports,
            ))
            .then(Step::new("add_ports", add_ports))
            .then(Step::new("remove_empty_rules", remove_empty_rules))
            .then(Step::new("fill_names", move |ports, rules| {
                fill_names(&names, ports, rules)
            }))
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(Step::name).collect()
    }

    pub fn run(
        &self,
        ports: &[ServicePort],
        mut rules: Vec<ForwardingRule>,
    ) -> Result<Vec<ForwardingRule>, StepError> {
        for step in &self.steps {
            rules = (step.apply)(ports, rules)?;
            debug!(step = step.name, rules = rules.len(), "Applied forwarding rule step");
        }
        Ok(rules)
    }
}

/// Clears the port range of every rule.
pub fn remove_port_ranges(
    _ports: &[ServicePort],
    rules: Vec<ForwardingRule>,
) -> Result<Vec<ForwardingRule>, StepError> {
    Ok(rules
        .into_iter()
        .map(|mut rule| {
            rule.port_range.clear();
            rule
        })
        .collect())
}

/// Keeps only ports desired for each rule's protocol. A port that is not a
/// number means the rule cannot be reasoned about and fails the step.
pub fn remove_unused_discrete_ports(
    ports: &[ServicePort],
    rules: Vec<ForwardingRule>,
) -> Result<Vec<ForwardingRule>, StepError> {
    for rule in &rules {
        if let Some(bad) = rule.ports.iter().find(|p| p.parse::<u16>().is_err()) {
            return Err(StepError::InvalidPort {
                rule: rule.name.clone(),
                port: bad.clone(),
            });
        }
    }
    Ok(allocator::clean_ports(&desired_ports(ports), rules))
}

/// Adds missing desired ports, creating rules for the overflow.
pub fn add_ports(
    ports: &[ServicePort],
    rules: Vec<ForwardingRule>,
) -> Result<Vec<ForwardingRule>, StepError> {
    Ok(allocator::add_ports(&desired_ports(ports), rules))
}

/// Drops rules that select no ports at all.
pub fn remove_empty_rules(
    _ports: &[ServicePort],
    rules: Vec<ForwardingRule>,
) -> Result<Vec<ForwardingRule>, StepError> {
    Ok(rules
        .into_iter()
        .filter(|rule| rule.has_port_range() || rule.all_ports || !rule.ports.is_empty())
        .collect())
}

/// Gives every unnamed rule the lowest number not yet used by a rule of the
/// same protocol and IP version.
pub fn fill_names(
    names: &RuleNames,
    _ports: &[ServicePort],
    mut rules: Vec<ForwardingRule>,
) -> Result<Vec<ForwardingRule>, StepError> {
    type Family = (IpProtocol, IpVersion);

    let mut used: BTreeMap<Family, BTreeSet<u32>> = BTreeMap::new();
    for rule in rules.iter().filter(|r| !r.name.is_empty()) {
        if let Some(n) = names.number(&rule.name)? {
            used.entry((rule.protocol(), rule.ip_version.or_ipv4()))
                .or_default()
                .insert(n);
        }
    }

    let mut next: BTreeMap<Family, u32> = BTreeMap::new();
    for rule in rules.iter_mut().filter(|r| r.name.is_empty()) {
        let family = (rule.protocol(), rule.ip_version.or_ipv4());
        let taken = used.entry(family.clone()).or_default();
        let n = next.entry(family).or_insert(0);
        while taken.contains(n) {
            *n += 1;
        }
        rule.name = names.numbered(&rule.protocol(), &rule.ip_version, *n);
        taken.insert(*n);
        debug!(rule = %rule.name, "Named new forwarding rule");
    }

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::L4Namer;
    use crate::rule::MAX_DISCRETE_PORTS;
    use crate::service::Service;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn rule(ports: &[&str]) -> ForwardingRule {
        ForwardingRule {
            ports: ports.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    fn names() -> RuleNames {
        RuleNames::new(Arc::new(L4Namer::new("uid")), &Service::new("ns", "svc"))
    }

    #[test]
    fn test_remove_port_ranges() {
        let mut ranged = rule(&[]);
        ranged.port_range = "80-85".to_string();
        let out = remove_port_ranges(&[], vec![ranged]).unwrap();
        assert_eq!(out[0].port_range, "");
    }

    #[test]
    fn test_remove_unused_ports_multiprotocol() {
        let ports = vec![ServicePort::tcp(53), ServicePort::udp(53)];
        let mut udp = rule(&["53"]);
        udp.ip_protocol = IpProtocol::Udp;
        let out = remove_unused_discrete_ports(&ports, vec![rule(&["8080", "53"]), udp]).unwrap();
        assert_eq!(out[0].ports, vec!["53"]);
        assert_eq!(out[1].ports, vec!["53"]);
    }

    #[test]
    fn test_remove_unused_ports_leaves_empty_rules() {
        let ports = vec![ServicePort::tcp(11), ServicePort::tcp(21)];
        let out = remove_unused_discrete_ports(
            &ports,
            vec![
                rule(&["11", "12", "13", "14", "15"]),
                rule(&["21", "22", "23", "24", "25"]),
                rule(&["31", "32", "33", "34", "35"]),
            ],
        )
        .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].ports, vec!["11"]);
        assert_eq!(out[1].ports, vec!["21"]);
        assert!(out[2].ports.is_empty());
    }

    #[test]
    fn test_remove_unused_ports_invalid_port() {
        let err = remove_unused_discrete_ports(&[ServicePort::tcp(80)], vec![rule(&["invalid"])])
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidPort { .. }));
    }

    #[test]
    fn test_remove_empty_rules() {
        let mut ranged = rule(&[]);
        ranged.port_range = "1-2".to_string();
        let mut all = rule(&[]);
        all.all_ports = true;
        let out = remove_empty_rules(&[], vec![rule(&[]), ranged, all, rule(&["80"])]).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_fill_names_skips_used_numbers() {
        let names = names();
        let mut existing0 = rule(&["1"]);
        existing0.name = names.numbered(&IpProtocol::Tcp, &IpVersion::Ipv4, 0);
        let mut existing2 = rule(&["2"]);
        existing2.name = names.numbered(&IpProtocol::Tcp, &IpVersion::Ipv4, 2);
        let mut udp = rule(&["53"]);
        udp.ip_protocol = IpProtocol::Udp;

        let out = fill_names(
            &names,
            &[],
            vec![existing0, existing2, rule(&["3"]), rule(&["4"]), udp],
        )
        .unwrap();
        assert_eq!(out[2].name, names.numbered(&IpProtocol::Tcp, &IpVersion::Ipv4, 1));
        assert_eq!(out[3].name, names.numbered(&IpProtocol::Tcp, &IpVersion::Ipv4, 3));
        assert_eq!(out[4].name, names.numbered(&IpProtocol::Udp, &IpVersion::Ipv4, 0));
    }

    #[test]
    fn test_fill_names_legacy_and_invalid() {
        let names = names();
        let mut legacy = rule(&["1"]);
        legacy.name = "a1234567890abcdef".to_string();
        let out = fill_names(&names, &[], vec![legacy, rule(&["2"])]).unwrap();
        assert_eq!(out[1].name, names.numbered(&IpProtocol::Tcp, &IpVersion::Ipv4, 0));

        let mut broken = rule(&["1"]);
        broken.name = "broken-name-!".to_string();
        assert!(matches!(
            fill_names(&names, &[], vec![broken, rule(&["2"])]),
            Err(StepError::Name(_))
        ));
    }

    #[test]
    fn test_pipeline_from_range_to_discrete() {
        let ports: Vec<ServicePort> = (80..=85).map(ServicePort::tcp).collect();
        let names = names();
        let mut ranged = ForwardingRule {
            name: names.base(&IpProtocol::Tcp, &IpVersion::Ipv4),
            ip_protocol: IpProtocol::Tcp,
            port_range: "80-85".to_string(),
            ..Default::default()
        };
        ranged.id = 7;

        let pipeline = Pipeline::discrete_ports(names.clone());
        assert_eq!(
            pipeline.step_names(),
            vec![
                "remove_port_ranges",
                "remove_unused_discrete_ports",
                "add_ports",
                "remove_empty_rules",
                "fill_names"
            ]
        );
        let out = pipeline.run(&ports, vec![ranged]).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, 7);
        assert_eq!(out[0].name, names.base(&IpProtocol::Tcp, &IpVersion::Ipv4));
        assert_eq!(out[0].ports.len(), MAX_DISCRETE_PORTS);
        assert_eq!(out[0].port_range, "");
        assert_eq!(out[1].ports, vec!["85"]);
        assert_eq!(out[1].name, names.numbered(&IpProtocol::Tcp, &IpVersion::Ipv4, 1));
    }

    #[test]
    fn test_pipeline_drops_rules_left_empty() {
        let ports = vec![ServicePort::tcp(80)];
        let names = names();
        let mut first = rule(&["80"]);
        first.name = names.numbered(&IpProtocol::Tcp, &IpVersion::Ipv4, 0);
        let mut second = rule(&["90"]);
        second.name = names.numbered(&IpProtocol::Tcp, &IpVersion::Ipv4, 1);

        let out = Pipeline::discrete_ports(names)
            .run(&ports, vec![first.clone(), second])
            .unwrap();
        assert_eq!(out, vec![first]);
    }
}
