//! Service model consumed by the reconciler.
//!
//! Only the parts of a Kubernetes Service that influence forwarding rules are
//! modelled: identity, ports, annotations and the legacy load balancer IP.

use crate::rule::{IpProtocol, IpVersion, NetworkTier};
use lb_compute::ApiVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Static addresses reserved for the Service, comma separated.
pub const IP_ADDRESSES_ANNOTATION: &str = "networking.gke.io/load-balancer-ip-addresses";
/// Requested network tier (`Standard` or `Premium`).
pub const NETWORK_TIER_ANNOTATION: &str = "cloud.google.com/network-tier";

pub const TCP_FORWARDING_RULE_KEY: &str = "service.kubernetes.io/tcp-forwarding-rule";
pub const UDP_FORWARDING_RULE_KEY: &str = "service.kubernetes.io/udp-forwarding-rule";
pub const L3_FORWARDING_RULE_KEY: &str = "service.kubernetes.io/l3-forwarding-rule";
pub const TCP_FORWARDING_RULE_IPV6_KEY: &str = "service.kubernetes.io/tcp-forwarding-rule-ipv6";
pub const UDP_FORWARDING_RULE_IPV6_KEY: &str = "service.kubernetes.io/udp-forwarding-rule-ipv6";
pub const L3_FORWARDING_RULE_IPV6_KEY: &str = "service.kubernetes.io/l3-forwarding-rule-ipv6";

/// A single port of a Service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "IpProtocol::is_unspecified")]
    pub protocol: IpProtocol,
    pub port: u16,
}

impl ServicePort {
    pub fn new(protocol: IpProtocol, port: u16) -> Self {
        Self {
            name: String::new(),
            protocol,
            port,
        }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(IpProtocol::Tcp, port)
    }

    pub fn udp(port: u16) -> Self {
        Self::new(IpProtocol::Udp, port)
    }
}

/// The Service whose load balancer frontends are reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "loadBalancerIP", default)]
    pub load_balancer_ip: String,
}

impl Service {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_ports(mut self, ports: Vec<ServicePort>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// First IPv4 literal in the static addresses annotation.
    pub fn ipv4_address_annotation(&self) -> Option<String> {
        self.annotation(IP_ADDRESSES_ANNOTATION)?
            .split(',')
            .map(str::trim)
            .find(|addr| addr.parse::<Ipv4Addr>().is_ok())
            .map(str::to_string)
    }

    /// Network tier requested by the Service and whether it came from the
    /// annotation.
    pub fn network_tier(&self) -> (NetworkTier, bool) {
        match self.annotation(NETWORK_TIER_ANNOTATION) {
            Some(v) if v.eq_ignore_ascii_case("standard") => (NetworkTier::Standard, true),
            Some(v) if v.eq_ignore_ascii_case("premium") => (NetworkTier::Premium, true),
            _ => (NetworkTier::default_tier(), false),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Annotation that records the rule name for a version/protocol pair.
/// Unset version means IPv4 and unset protocol means UDP.
pub fn annotation_key(version: &IpVersion, protocol: &IpProtocol) -> Option<&'static str> {
    let ipv6 = match version {
        IpVersion::Unspecified | IpVersion::Ipv4 => false,
        IpVersion::Ipv6 => true,
        IpVersion::Other(_) => return None,
    };
    let key = match (ipv6, protocol) {
        (false, IpProtocol::Tcp) => TCP_FORWARDING_RULE_KEY,
        (false, IpProtocol::Udp | IpProtocol::Unspecified) => UDP_FORWARDING_RULE_KEY,
        (false, IpProtocol::L3Default) => L3_FORWARDING_RULE_KEY,
        (true, IpProtocol::Tcp) => TCP_FORWARDING_RULE_IPV6_KEY,
        (true, IpProtocol::Udp | IpProtocol::Unspecified) => UDP_FORWARDING_RULE_IPV6_KEY,
        (true, IpProtocol::L3Default) => L3_FORWARDING_RULE_IPV6_KEY,
        (_, IpProtocol::Other(_)) => return None,
    };
    Some(key)
}

/// Description blob stored on rules, linking them back to the Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    #[serde(rename = "networking.gke.io/service-name")]
    pub service_name: String,
    #[serde(
        rename = "networking.gke.io/service-ip",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub service_ip: String,
    #[serde(rename = "networking.gke.io/api-version")]
    pub api_version: ApiVersion,
}

impl ServiceDescription {
    pub fn new(service: &Service, ip: &str, version: ApiVersion) -> Self {
        Self {
            service_name: service.key(),
            service_ip: ip.to_string(),
            api_version: version,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_annotation_key() {
        assert_eq!(
            annotation_key(&IpVersion::Unspecified, &IpProtocol::Tcp),
            Some(TCP_FORWARDING_RULE_KEY)
        );
        assert_eq!(
            annotation_key(&IpVersion::Ipv4, &IpProtocol::Unspecified),
            Some(UDP_FORWARDING_RULE_KEY)
        );
        assert_eq!(
            annotation_key(&IpVersion::Ipv6, &IpProtocol::L3Default),
            Some(L3_FORWARDING_RULE_IPV6_KEY)
        );
        assert_eq!(
            annotation_key(&IpVersion::Ipv6, &IpProtocol::Udp),
            Some(UDP_FORWARDING_RULE_IPV6_KEY)
        );
        assert_eq!(
            annotation_key(&IpVersion::Ipv4, &IpProtocol::Other("ESP".into())),
            None
        );
    }

    #[test]
    fn test_ipv4_address_annotation() {
        let svc = Service::new("ns", "svc")
            .with_annotation(IP_ADDRESSES_ANNOTATION, "2001:db8::1, 10.1.2.3");
        assert_eq!(svc.ipv4_address_annotation().as_deref(), Some("10.1.2.3"));
        assert_eq!(Service::new("ns", "svc").ipv4_address_annotation(), None);
    }

    #[test]
    fn test_network_tier() {
        let svc = Service::new("ns", "svc");
        assert_eq!(svc.network_tier(), (NetworkTier::Premium, false));
        let svc = svc.with_annotation(NETWORK_TIER_ANNOTATION, "Standard");
        assert_eq!(svc.network_tier(), (NetworkTier::Standard, true));
    }

    #[test]
    fn test_description_json() {
        let svc = Service::new("default", "web");
        let desc = ServiceDescription::new(&svc, "1.2.3.4", ApiVersion::Ga);
        let encoded = desc.to_json().unwrap();
        assert!(encoded.contains(r#""networking.gke.io/service-name":"default/web""#));
        assert!(encoded.contains(r#""networking.gke.io/service-ip":"1.2.3.4""#));
        assert!(encoded.contains(r#""networking.gke.io/api-version":"ga""#));
        assert_eq!(ServiceDescription::from_json(&encoded).unwrap(), desc);
    }

    #[test]
    fn test_deserialize_service() {
        let svc: Service = serde_json::from_str(
            r#"{"namespace": "ns", "name": "svc", "ports": [{"port": 80}, {"port": 53, "protocol": "UDP"}]}"#,
        )
        .unwrap();
        assert_eq!(svc.ports[0], ServicePort::new(IpProtocol::Unspecified, 80));
        assert_eq!(svc.ports[1], ServicePort::udp(53));
    }
}
