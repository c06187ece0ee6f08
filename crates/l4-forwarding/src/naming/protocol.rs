//! Protocol resolution for Services and backend services.

use crate::rule::IpProtocol;
use crate::service::ServicePort;
use std::collections::BTreeSet;

/// Protocol a single forwarding rule for the Service must use.
///
/// A Service mixing TCP and UDP ports needs an `L3_DEFAULT` rule. Ports
/// without a protocol count as TCP, and so does a Service with no ports.
pub fn service_protocol(ports: &[ServicePort]) -> IpProtocol {
    let protocols: BTreeSet<IpProtocol> = ports.iter().map(|p| p.protocol.or_tcp()).collect();
    let mut iter = protocols.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => IpProtocol::Tcp,
        (Some(only), None) => only,
        (Some(_), Some(_)) => IpProtocol::L3Default,
    }
}

/// Forwarding rule protocol matching a backend service protocol.
///
/// Backend services report `UNSPECIFIED` (or `L3_DEFAULT`) when they serve
/// mixed protocols.
pub fn rule_protocol_for_backend(backend_protocol: &str) -> IpProtocol {
    match backend_protocol.to_ascii_uppercase().as_str() {
        "" | "TCP" => IpProtocol::Tcp,
        "UDP" => IpProtocol::Udp,
        "UNSPECIFIED" | "L3_DEFAULT" => IpProtocol::L3Default,
        other => IpProtocol::Other(other.to_string()),
    }
}
