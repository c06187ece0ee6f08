//! Structural list filters.
//!
//! A [`Filter`] is a conjunction of `field eq regex` / `field ne regex`
//! predicates. It can be rendered into the API filter expression and can also
//! be evaluated locally against a JSON object, which is how list results are
//! narrowed when the underlying surface ignores server-side filtering.

use crate::error::{ComputeError, ComputeResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt;

/// Field holding the resource name.
pub const NAME_FIELD: &str = "name";
/// Field holding the backend service link of a forwarding rule.
pub const BACKEND_SERVICE_FIELD: &str = "backendService";

static FIELD_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)*$").expect("Invalid regex pattern")
});

#[derive(Debug, Clone)]
struct Predicate {
    field: String,
    source: String,
    pattern: Regex,
    negate: bool,
}

impl Predicate {
    fn new(field: &str, pattern: &str, negate: bool) -> ComputeResult<Self> {
        if !FIELD_NAME.is_match(field) {
            return Err(ComputeError::invalid_key(format!(
                "invalid filter field {:?}",
                field
            )));
        }
        // The API matches the whole field value.
        let anchored = format!("^(?:{})$", pattern);
        let compiled = Regex::new(&anchored).map_err(|e| {
            ComputeError::invalid_key(format!("invalid filter pattern {:?}: {}", pattern, e))
        })?;
        Ok(Self {
            field: field.to_string(),
            source: pattern.to_string(),
            pattern: compiled,
            negate,
        })
    }

    fn matches(&self, obj: &Value) -> bool {
        let value = lookup(obj, &self.field);
        self.pattern.is_match(&value) != self.negate
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.negate { "ne" } else { "eq" };
        let escaped = self.source.replace('\\', "\\\\").replace('"', "\\\"");
        write!(f, "({} {} \"{}\")", self.field, op, escaped)
    }
}

/// Renders a JSON field as the string the filter sees. Missing fields and
/// nulls are the empty string.
fn lookup(obj: &Value, field: &str) -> String {
    let mut current = obj;
    for part in field.split('.') {
        match current.get(part) {
            Some(v) => current = v,
            None => return String::new(),
        }
    }
    match current {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Conjunction of field predicates. The empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    /// Filter that matches every object.
    pub fn none() -> Self {
        Self::default()
    }

    /// `field` must fully match `pattern`.
    pub fn regexp(field: &str, pattern: &str) -> ComputeResult<Self> {
        Ok(Self {
            predicates: vec![Predicate::new(field, pattern, false)?],
        })
    }

    /// `field` must not fully match `pattern`.
    pub fn not_regexp(field: &str, pattern: &str) -> ComputeResult<Self> {
        Ok(Self {
            predicates: vec![Predicate::new(field, pattern, true)?],
        })
    }

    /// `field` must equal `value` literally.
    pub fn equals(field: &str, value: &str) -> ComputeResult<Self> {
        Self::regexp(field, &regex::escape(value))
    }

    /// `field` must end with `suffix`. Resource references are matched this
    /// way so absolute URLs and project relative paths both match.
    pub fn suffix(field: &str, suffix: &str) -> ComputeResult<Self> {
        Self::regexp(field, &format!(".*{}", regex::escape(suffix)))
    }

    /// Conjunction of both filters.
    pub fn and(mut self, other: Filter) -> Self {
        self.predicates.extend(other.predicates);
        self
    }

    pub fn and_regexp(self, field: &str, pattern: &str) -> ComputeResult<Self> {
        Ok(self.and(Self::regexp(field, pattern)?))
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluates the filter against a JSON object.
    pub fn matches(&self, obj: &Value) -> bool {
        self.predicates.iter().all(|p| p.matches(obj))
    }

    /// Expression accepted by the API `filter` query parameter.
    pub fn to_api_string(&self) -> String {
        self.predicates
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_api_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::none().matches(&json!({"name": "a"})));
        assert!(Filter::none().is_empty());
        assert_eq!(Filter::none().to_api_string(), "");
    }

    #[test]
    fn test_regexp_is_anchored() {
        let f = Filter::regexp(NAME_FIELD, "fr-.*").unwrap();
        assert!(f.matches(&json!({"name": "fr-1"})));
        assert!(!f.matches(&json!({"name": "xfr-1"})));
    }

    #[test]
    fn test_conjunction() {
        let f = Filter::regexp(NAME_FIELD, "fr-.*")
            .unwrap()
            .and(Filter::equals(BACKEND_SERVICE_FIELD, "projects/p/regions/r/backendServices/bs").unwrap());
        assert!(f.matches(&json!({
            "name": "fr-1",
            "backendService": "projects/p/regions/r/backendServices/bs",
        })));
        assert!(!f.matches(&json!({
            "name": "fr-1",
            "backendService": "projects/p/regions/r/backendServices/other",
        })));
    }

    #[test]
    fn test_suffix() {
        let f = Filter::suffix(BACKEND_SERVICE_FIELD, "projects/p/regions/r/backendServices/bs.1").unwrap();
        assert!(f.matches(&json!({
            "backendService": "https://www.googleapis.com/compute/v1/projects/p/regions/r/backendServices/bs.1",
        })));
        assert!(f.matches(&json!({"backendService": "projects/p/regions/r/backendServices/bs.1"})));
        assert!(!f.matches(&json!({"backendService": "projects/p/regions/r/backendServices/bsx1"})));
    }

    #[test]
    fn test_negation_and_non_string_fields() {
        let f = Filter::not_regexp("allPorts", "true").unwrap();
        assert!(f.matches(&json!({"allPorts": false})));
        assert!(f.matches(&json!({})));
        assert!(!f.matches(&json!({"allPorts": true})));
    }

    #[test]
    fn test_nested_field() {
        let f = Filter::equals("labels.owner", "me").unwrap();
        assert!(f.matches(&json!({"labels": {"owner": "me"}})));
        assert!(!f.matches(&json!({"labels": {}})));
    }

    #[test]
    fn test_render() {
        let f = Filter::regexp(NAME_FIELD, "a\"b")
            .unwrap()
            .and(Filter::not_regexp("IPProtocol", "TCP").unwrap());
        assert_eq!(f.to_api_string(), r#"(name eq "a\"b") (IPProtocol ne "TCP")"#);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(Filter::regexp("bad field", "x").is_err());
        assert!(Filter::regexp(NAME_FIELD, "(").is_err());
    }
}
