//! Deterministic forwarding rule names.

use crate::rule::{IpProtocol, IpVersion};
use crate::service::Service;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Provider limit on resource name length.
pub const MAX_NAME_LENGTH: usize = 63;
/// Protocol segment of the temporary L3 migration rule.
pub const L3_TEMPORARY_PROTOCOL: &str = "l3tmp";

const IPV6_SUFFIX: &str = "-ipv6";
/// Room kept free for a `-<base36>` number suffix.
const NUMBER_SUFFIX_RESERVE: usize = 5;
const HASH_LENGTH: usize = 8;
const UID_LENGTH: usize = 8;
const BASE36_DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Names forwarding rules of a Service.
///
/// Names must be deterministic, fit [`MAX_NAME_LENGTH`] and differ per
/// protocol so that a protocol switch never collides with the old rule.
pub trait Namer: Send + Sync {
    fn l4_forwarding_rule(&self, namespace: &str, name: &str, protocol: &str) -> String;

    fn l4_ipv6_forwarding_rule(&self, namespace: &str, name: &str, protocol: &str) -> String;
}

/// `k8s2-<protocol>-<cluster uid>-<namespace>-<name>-<hash>` namer.
#[derive(Debug, Clone)]
pub struct L4Namer {
    cluster_uid: String,
}

impl L4Namer {
    pub fn new(cluster_uid: impl Into<String>) -> Self {
        Self {
            cluster_uid: cluster_uid.into().to_ascii_lowercase(),
        }
    }

    fn hash(&self, namespace: &str, name: &str) -> String {
        let digest = Sha256::digest(format!("{};{};{}", self.cluster_uid, namespace, name));
        let mut encoded = hex::encode(digest);
        encoded.truncate(HASH_LENGTH);
        encoded
    }
}

impl Namer for L4Namer {
    fn l4_forwarding_rule(&self, namespace: &str, name: &str, protocol: &str) -> String {
        let uid: String = self.cluster_uid.chars().take(UID_LENGTH).collect();
        let prefix = format!("k8s2-{}-{}", protocol.to_ascii_lowercase(), uid);
        let hash = self.hash(namespace, name);

        // Three dashes join prefix, namespace, name and hash.
        let fixed = prefix.len() + hash.len() + 3;
        let budget = MAX_NAME_LENGTH
            .saturating_sub(NUMBER_SUFFIX_RESERVE + IPV6_SUFFIX.len())
            .saturating_sub(fixed);
        let (namespace, name) = trim_fields_evenly(budget, namespace, name);

        format!("{}-{}-{}-{}", prefix, namespace, name, hash)
    }

    fn l4_ipv6_forwarding_rule(&self, namespace: &str, name: &str, protocol: &str) -> String {
        format!(
            "{}{}",
            self.l4_forwarding_rule(namespace, name, protocol),
            IPV6_SUFFIX
        )
    }
}

/// Shortens two fields so their combined length fits `max`, taking from the
/// longer one first.
fn trim_fields_evenly(max: usize, a: &str, b: &str) -> (String, String) {
    let (la, lb) = (a.chars().count(), b.chars().count());
    if la + lb <= max {
        return (a.to_string(), b.to_string());
    }
    let half = max / 2;
    let (keep_a, keep_b) = if la <= half {
        (la, max - la)
    } else if lb <= max - half {
        (max - lb, lb)
    } else {
        (half, max - half)
    };
    (
        a.chars().take(keep_a).collect(),
        b.chars().take(keep_b).collect(),
    )
}

/// Name segment used for a rule protocol.
pub fn protocol_segment(protocol: &IpProtocol) -> String {
    match protocol.or_tcp() {
        IpProtocol::Tcp => "tcp".to_string(),
        IpProtocol::Udp => "udp".to_string(),
        IpProtocol::L3Default => "l3".to_string(),
        other => other.as_str().to_ascii_lowercase(),
    }
}

fn to_base36(mut n: u32) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36_DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("forwarding rule name is empty")]
    Empty,
    #[error("failed to parse number {segment:?} from name {name:?}")]
    InvalidNumber { name: String, segment: String },
}

/// Numbered rule names of one Service.
///
/// Number 0 is the plain protocol name, so the first rule of a set is the
/// same rule the single-rule reconciler manages. Higher numbers append
/// `-<base36>`, placed before `-ipv6` for IPv6 rules. Names starting with
/// `a` are legacy names that carry no number.
#[derive(Clone)]
pub struct RuleNames {
    namer: Arc<dyn Namer>,
    namespace: String,
    name: String,
}

impl RuleNames {
    pub fn new(namer: Arc<dyn Namer>, service: &Service) -> Self {
        Self {
            namer,
            namespace: service.namespace.clone(),
            name: service.name.clone(),
        }
    }

    /// Plain rule name for the protocol and version.
    pub fn base(&self, protocol: &IpProtocol, version: &IpVersion) -> String {
        let segment = protocol_segment(protocol);
        match version.or_ipv4() {
            IpVersion::Ipv6 => {
                self.namer
                    .l4_ipv6_forwarding_rule(&self.namespace, &self.name, &segment)
            }
            _ => self
                .namer
                .l4_forwarding_rule(&self.namespace, &self.name, &segment),
        }
    }

    /// Name of the temporary L3 catch-all rule.
    pub fn l3_temporary(&self) -> String {
        self.namer
            .l4_forwarding_rule(&self.namespace, &self.name, L3_TEMPORARY_PROTOCOL)
    }

    pub fn numbered(&self, protocol: &IpProtocol, version: &IpVersion, number: u32) -> String {
        let base = self.base(protocol, version);
        if number == 0 {
            return base;
        }
        match base.strip_suffix(IPV6_SUFFIX) {
            Some(stem) => format!("{}-{}{}", stem, to_base36(number), IPV6_SUFFIX),
            None => format!("{}-{}", base, to_base36(number)),
        }
    }

    /// Number encoded in an existing rule name, `None` for legacy names.
    pub fn number(&self, rule_name: &str) -> Result<Option<u32>, NameError> {
        if rule_name.is_empty() {
            return Err(NameError::Empty);
        }
        if rule_name.starts_with('a') {
            return Ok(None);
        }

        let (stem, version) = match rule_name.strip_suffix(IPV6_SUFFIX) {
            Some(stem) => (stem, IpVersion::Ipv6),
            None => (rule_name, IpVersion::Ipv4),
        };
        for protocol in [IpProtocol::Tcp, IpProtocol::Udp, IpProtocol::L3Default] {
            let base = self.base(&protocol, &version);
            let base_stem = base.strip_suffix(IPV6_SUFFIX).unwrap_or(&base);
            if stem == base_stem {
                return Ok(Some(0));
            }
            if let Some(suffix) = stem
                .strip_prefix(base_stem)
                .and_then(|rest| rest.strip_prefix('-'))
            {
                return parse_base36(rule_name, suffix).map(Some);
            }
        }

        // Foreign name: the number is the last segment.
        let segment = stem.rsplit('-').next().unwrap_or(stem);
        parse_base36(rule_name, segment).map(Some)
    }
}

impl fmt::Debug for RuleNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleNames")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish()
    }
}

fn parse_base36(name: &str, segment: &str) -> Result<u32, NameError> {
    if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(NameError::InvalidNumber {
            name: name.to_string(),
            segment: segment.to_string(),
        });
    }
    u32::from_str_radix(segment, 36).map_err(|_| NameError::InvalidNumber {
        name: name.to_string(),
        segment: segment.to_string(),
    })
}
