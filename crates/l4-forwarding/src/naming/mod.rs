//! Naming and protocol resolution.

pub mod namer;
pub mod protocol;

pub use namer::{
    protocol_segment, L4Namer, NameError, Namer, RuleNames, L3_TEMPORARY_PROTOCOL,
    MAX_NAME_LENGTH,
};
pub use protocol::{rule_protocol_for_backend, service_protocol};
