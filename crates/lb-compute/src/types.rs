//! Core compute types: API versions, scopes, resource keys and resource IDs.
//!
//! Resource references travel through the API as URLs. The same resource can
//! be referenced through different base paths (`www.googleapis.com` vs
//! `compute.googleapis.com`, `v1` vs `beta`, absolute vs project-relative),
//! so identity comparison goes through [`ResourceId`] instead of the string.

use crate::error::{ComputeError, ComputeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maturity level of the compute API surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    Alpha,
    Beta,
    #[default]
    Ga,
}

impl ApiVersion {
    pub const ALL: [ApiVersion; 3] = [ApiVersion::Alpha, ApiVersion::Beta, ApiVersion::Ga];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::Alpha => "alpha",
            ApiVersion::Beta => "beta",
            ApiVersion::Ga => "ga",
        }
    }

    /// Path segment used in resource URLs.
    pub fn path_segment(&self) -> &'static str {
        match self {
            ApiVersion::Alpha => "alpha",
            ApiVersion::Beta => "beta",
            ApiVersion::Ga => "v1",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiVersion {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "alpha" => Ok(ApiVersion::Alpha),
            "beta" => Ok(ApiVersion::Beta),
            "ga" | "v1" => Ok(ApiVersion::Ga),
            other => Err(ComputeError::invalid_key(format!(
                "unknown API version {:?}",
                other
            ))),
        }
    }
}

/// Placement of a resource in the provider hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    #[default]
    Regional,
    Global,
}

impl KeyScope {
    pub const ALL: [KeyScope; 2] = [KeyScope::Regional, KeyScope::Global];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Regional => "regional",
            KeyScope::Global => "global",
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyScope {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "regional" => Ok(KeyScope::Regional),
            "global" => Ok(KeyScope::Global),
            other => Err(ComputeError::invalid_key(format!(
                "unknown key scope {:?}",
                other
            ))),
        }
    }
}

/// Name of a resource plus the region it lives in, if regional.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub name: String,
    pub region: Option<String>,
}

impl ResourceKey {
    pub fn regional(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: Some(region.into()),
        }
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: None,
        }
    }

    pub fn scope(&self) -> KeyScope {
        if self.region.is_some() {
            KeyScope::Regional
        } else {
            KeyScope::Global
        }
    }

    /// Checks the key is usable against a surface of the given scope.
    pub fn validate(&self, scope: KeyScope) -> ComputeResult<()> {
        if self.name.is_empty() {
            return Err(ComputeError::invalid_key("empty resource name"));
        }
        match (scope, &self.region) {
            (KeyScope::Regional, Some(region)) if !region.is_empty() => Ok(()),
            (KeyScope::Regional, _) => Err(ComputeError::invalid_key(format!(
                "regional key {:?} has no region",
                self.name
            ))),
            (KeyScope::Global, None) => Ok(()),
            (KeyScope::Global, Some(_)) => Err(ComputeError::invalid_key(format!(
                "global key {:?} carries a region",
                self.name
            ))),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "Key{{{:?}, region: {:?}}}", self.name, region),
            None => write!(f, "Key{{{:?}}}", self.name),
        }
    }
}

/// Where a parsed resource lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Global,
    Region(String),
    Zone(String),
}

/// A resource reference parsed out of a URL or relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub project: String,
    /// Collection name as it appears in the URL, e.g. `backendServices`.
    pub resource: String,
    pub location: Location,
    pub name: String,
}

impl ResourceId {
    /// Parses a resource URL.
    ///
    /// Accepts absolute URLs with any host and API version prefix as well as
    /// paths starting at `projects/`.
    pub fn parse(url: &str) -> ComputeResult<Self> {
        let invalid = |message: &str| ComputeError::invalid_resource_url(url, message);

        let start = url
            .find("projects/")
            .ok_or_else(|| invalid("missing projects/ segment"))?;
        if start > 0 && !url[..start].ends_with('/') {
            return Err(invalid("malformed prefix before projects/"));
        }

        let segments: Vec<&str> = url[start..].trim_end_matches('/').split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment"));
        }

        match segments.as_slice() {
            ["projects", project, "global", resource, name] => Ok(Self {
                project: project.to_string(),
                resource: resource.to_string(),
                location: Location::Global,
                name: name.to_string(),
            }),
            ["projects", project, "regions", region, resource, name] => Ok(Self {
                project: project.to_string(),
                resource: resource.to_string(),
                location: Location::Region(region.to_string()),
                name: name.to_string(),
            }),
            ["projects", project, "zones", zone, resource, name] => Ok(Self {
                project: project.to_string(),
                resource: resource.to_string(),
                location: Location::Zone(zone.to_string()),
                name: name.to_string(),
            }),
            _ => Err(invalid("unrecognised resource path")),
        }
    }

    /// Path relative to the API root, e.g. `projects/p/global/networks/n`.
    pub fn relative_path(&self) -> String {
        match &self.location {
            Location::Global => format!(
                "projects/{}/global/{}/{}",
                self.project, self.resource, self.name
            ),
            Location::Region(region) => format!(
                "projects/{}/regions/{}/{}/{}",
                self.project, region, self.resource, self.name
            ),
            Location::Zone(zone) => format!(
                "projects/{}/zones/{}/{}/{}",
                self.project, zone, self.resource, self.name
            ),
        }
    }

    /// Absolute URL for the given API version.
    pub fn self_link(&self, version: ApiVersion) -> String {
        format!(
            "https://www.googleapis.com/compute/{}/{}",
            version.path_segment(),
            self.relative_path()
        )
    }
}

impl FromStr for ResourceId {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceId::parse(s)
    }
}

/// Returns true if both URLs parse and reference the same resource.
pub fn equal_resource_ids(a: &str, b: &str) -> bool {
    match (ResourceId::parse(a), ResourceId::parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Returns true if both paths are identical strings or reference the same
/// resource.
pub fn equal_resource_paths(a: &str, b: &str) -> bool {
    a == b || equal_resource_ids(a, b)
}
