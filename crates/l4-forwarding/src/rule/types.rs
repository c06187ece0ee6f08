//! Forwarding rule data model.

use lb_compute::{ApiVersion, KeyScope, ResourceKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of discrete ports a single forwarding rule can carry.
pub const MAX_DISCRETE_PORTS: usize = 5;

/// Declares a string-valued API enum. The empty string maps to
/// `Unspecified` and unknown values are preserved in `Other`.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            #[default]
            Unspecified,
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $name::Unspecified => "",
                    $($name::$variant => $wire,)+
                    $name::Other(s) => s,
                }
            }

            pub fn is_unspecified(&self) -> bool {
                matches!(self, $name::Unspecified)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                match s.as_str() {
                    "" => $name::Unspecified,
                    $($wire => $name::$variant,)+
                    _ => $name::Other(s),
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name::from(s.to_string())
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// Protocol of a forwarding rule or a Service port.
    IpProtocol {
        Tcp => "TCP",
        Udp => "UDP",
        L3Default => "L3_DEFAULT",
    }
);

impl IpProtocol {
    /// Protocol with the unset value defaulted to TCP.
    pub fn or_tcp(&self) -> IpProtocol {
        match self {
            IpProtocol::Unspecified => IpProtocol::Tcp,
            other => other.clone(),
        }
    }
}

wire_enum!(
    IpVersion {
        Ipv4 => "IPV4",
        Ipv6 => "IPV6",
    }
);

impl IpVersion {
    /// Version with the unset value defaulted to IPv4.
    pub fn or_ipv4(&self) -> IpVersion {
        match self {
            IpVersion::Unspecified => IpVersion::Ipv4,
            other => other.clone(),
        }
    }
}

wire_enum!(
    LoadBalancingScheme {
        Internal => "INTERNAL",
        External => "EXTERNAL",
    }
);

wire_enum!(
    NetworkTier {
        Premium => "PREMIUM",
        Standard => "STANDARD",
    }
);

impl NetworkTier {
    /// Tier used when nothing requests one explicitly.
    pub fn default_tier() -> NetworkTier {
        NetworkTier::Premium
    }
}

/// One provider-side load-balancer frontend rule, normalized across API
/// versions. Field names on the wire follow the compute API schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    #[serde(default, with = "id_string", skip_serializing_if = "is_zero")]
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "IPAddress", default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    #[serde(rename = "IPProtocol", default, skip_serializing_if = "IpProtocol::is_unspecified")]
    pub ip_protocol: IpProtocol,
    #[serde(default, skip_serializing_if = "IpVersion::is_unspecified")]
    pub ip_version: IpVersion,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port_range: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub all_ports: bool,
    #[serde(default, skip_serializing_if = "LoadBalancingScheme::is_unspecified")]
    pub load_balancing_scheme: LoadBalancingScheme,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend_service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnetwork: String,
    #[serde(default, skip_serializing_if = "NetworkTier::is_unspecified")]
    pub network_tier: NetworkTier,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_global_access: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    /// API version the rule was read with or is written with.
    #[serde(skip)]
    pub version: ApiVersion,
    #[serde(skip)]
    pub scope: KeyScope,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(id: &u64) -> bool {
    *id == 0
}

/// The API encodes 64-bit ids as decimal strings.
mod id_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) if s.is_empty() => Ok(0),
            Raw::Str(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

/// How a rule selects ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSelection {
    None,
    Discrete,
    Range,
    AllPorts,
    /// More than one selector is set; only valid transiently.
    Mixed,
}

impl ForwardingRule {
    /// Effective protocol, unset defaulting to TCP.
    pub fn protocol(&self) -> IpProtocol {
        self.ip_protocol.or_tcp()
    }

    pub fn has_port_range(&self) -> bool {
        !self.port_range.is_empty()
    }

    pub fn port_selection(&self) -> PortSelection {
        let set = [!self.ports.is_empty(), self.has_port_range(), self.all_ports];
        match set {
            [false, false, false] => PortSelection::None,
            [true, false, false] => PortSelection::Discrete,
            [false, true, false] => PortSelection::Range,
            [false, false, true] => PortSelection::AllPorts,
            _ => PortSelection::Mixed,
        }
    }

    /// Key addressing this rule on a surface of its scope.
    pub fn key(&self, region: &str) -> ResourceKey {
        match self.scope {
            KeyScope::Regional => ResourceKey::regional(&self.name, region),
            KeyScope::Global => ResourceKey::global(&self.name),
        }
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.name, self.protocol())?;
        match self.port_selection() {
            PortSelection::Discrete => write!(f, " ports={}", self.ports.join(","))?,
            PortSelection::Range => write!(f, " range={}", self.port_range)?,
            PortSelection::AllPorts => write!(f, " all-ports")?,
            PortSelection::Mixed => write!(
                f,
                " ports={} range={} all-ports={}",
                self.ports.join(","),
                self.port_range,
                self.all_ports
            )?,
            PortSelection::None => {}
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_wire_enum_roundtrip_values() {
        assert_eq!(IpProtocol::from("TCP"), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from(""), IpProtocol::Unspecified);
        assert_eq!(IpProtocol::from("SCTP"), IpProtocol::Other("SCTP".to_string()));
        assert_eq!(IpProtocol::L3Default.as_str(), "L3_DEFAULT");
        assert_eq!(IpProtocol::Unspecified.or_tcp(), IpProtocol::Tcp);
        assert_eq!(IpVersion::Unspecified.or_ipv4(), IpVersion::Ipv4);
    }

    #[test]
    fn test_deserialize_api_object() {
        let rule: ForwardingRule = serde_json::from_value(json!({
            "id": "8401298743",
            "name": "fr-1",
            "IPAddress": "10.0.0.1",
            "IPProtocol": "TCP",
            "ports": ["80", "443"],
            "loadBalancingScheme": "INTERNAL",
            "networkTier": "PREMIUM",
            "allowGlobalAccess": true,
            "kind": "compute#forwardingRule",
        }))
        .unwrap();

        assert_eq!(rule.id, 8401298743);
        assert_eq!(rule.ip_protocol, IpProtocol::Tcp);
        assert_eq!(rule.ports, vec!["80".to_string(), "443".to_string()]);
        assert_eq!(rule.load_balancing_scheme, LoadBalancingScheme::Internal);
        assert!(rule.allow_global_access);
        assert_eq!(rule.port_selection(), PortSelection::Discrete);
    }

    #[test]
    fn test_serialize_skips_empty_fields() {
        let rule = ForwardingRule {
            name: "fr-1".to_string(),
            ip_protocol: IpProtocol::Udp,
            port_range: "53-53".to_string(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&rule).unwrap(),
            json!({"name": "fr-1", "IPProtocol": "UDP", "portRange": "53-53"})
        );
    }

    #[test]
    fn test_port_selection() {
        let mut rule = ForwardingRule::default();
        assert_eq!(rule.port_selection(), PortSelection::None);
        rule.all_ports = true;
        assert_eq!(rule.port_selection(), PortSelection::AllPorts);
        rule.port_range = "1-2".to_string();
        assert_eq!(rule.port_selection(), PortSelection::Mixed);
    }

    #[test]
    fn test_key_follows_scope() {
        let mut rule = ForwardingRule {
            name: "fr".to_string(),
            ..Default::default()
        };
        assert_eq!(rule.key("r1"), ResourceKey::regional("fr", "r1"));
        rule.scope = KeyScope::Global;
        assert_eq!(rule.key("r1"), ResourceKey::global("fr"));
    }

    #[test]
    fn test_display() {
        let rule = ForwardingRule {
            name: "fr".to_string(),
            ports: vec!["80".to_string(), "81".to_string()],
            ..Default::default()
        };
        assert_eq!(rule.to_string(), "fr(TCP ports=80,81)");
    }
}
