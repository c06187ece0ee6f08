//! Port bookkeeping and the discrete port allocation pipeline.
//!
//! # Modules
//!
//! - [`allocator`]: Bin-packing of desired ports into rules
//! - [`steps`]: Pure transformation steps and their composition

pub mod allocator;
pub mod steps;

pub use allocator::{add_ports, clean_ports, new_rules_for_ports};
pub use steps::{
    fill_names, remove_empty_rules, remove_port_ranges, remove_unused_discrete_ports, Pipeline,
    Step, StepError,
};

use crate::rule::IpProtocol;
use crate::service::ServicePort;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};

/// Desired ports per protocol, derived from the Service ports.
pub type DesiredPorts = BTreeMap<IpProtocol, BTreeSet<u16>>;

/// Groups Service ports by protocol, unset protocol counting as TCP.
pub fn desired_ports(ports: &[ServicePort]) -> DesiredPorts {
    let mut desired = DesiredPorts::new();
    for port in ports {
        desired
            .entry(port.protocol.or_tcp())
            .or_default()
            .insert(port.port);
    }
    desired
}

/// Number of Service port entries per protocol, unset protocol counting as
/// TCP.
pub fn port_counts(ports: &[ServicePort]) -> BTreeMap<IpProtocol, usize> {
    ports.iter().counts_by(|p| p.protocol.or_tcp()).into_iter().collect()
}

/// Port numbers of the Service as strings, in declaration order without
/// duplicates.
pub fn service_port_strings(ports: &[ServicePort]) -> Vec<String> {
    ports
        .iter()
        .map(|p| p.port)
        .unique()
        .map(|p| p.to_string())
        .collect()
}

/// `lo-hi` range covering every port that parses, or empty if none does.
pub fn min_max_port_range(ports: &[String]) -> String {
    let parsed = ports.iter().filter_map(|p| p.parse::<u16>().ok());
    match parsed.minmax().into_option() {
        Some((lo, hi)) => format!("{}-{}", lo, hi),
        None => String::new(),
    }
}

/// `lo-hi` range covering every Service port.
pub fn service_port_range(ports: &[ServicePort]) -> String {
    match ports.iter().map(|p| p.port).minmax().into_option() {
        Some((lo, hi)) => format!("{}-{}", lo, hi),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_desired_ports_defaults_to_tcp() {
        let ports = vec![
            ServicePort::new(IpProtocol::Unspecified, 80),
            ServicePort::tcp(443),
            ServicePort::udp(53),
        ];
        let desired = desired_ports(&ports);
        assert_eq!(desired[&IpProtocol::Tcp], BTreeSet::from([80, 443]));
        assert_eq!(desired[&IpProtocol::Udp], BTreeSet::from([53]));

        let counts = port_counts(&ports);
        assert_eq!(counts[&IpProtocol::Tcp], 2);
        assert_eq!(counts[&IpProtocol::Udp], 1);
    }

    #[test]
    fn test_service_port_strings_dedupes() {
        let ports = vec![ServicePort::tcp(53), ServicePort::udp(53), ServicePort::tcp(80)];
        assert_eq!(service_port_strings(&ports), vec!["53", "80"]);
    }

    #[test]
    fn test_min_max_port_range() {
        let ports: Vec<String> = ["8080", "53", "443"].iter().map(|s| s.to_string()).collect();
        assert_eq!(min_max_port_range(&ports), "53-8080");
        assert_eq!(min_max_port_range(&["7".to_string()]), "7-7");
        assert_eq!(min_max_port_range(&[]), "");
        assert_eq!(
            service_port_range(&[ServicePort::tcp(90), ServicePort::udp(10)]),
            "10-90"
        );
    }
}
