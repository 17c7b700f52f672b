//! # Testing Instance
//!
//! The shared parameter bag for one configured server session. Sequences read
//! their declared inputs from it and write their declared outputs back.
//!
//! A context distinguishes a parameter it does not expose at all from one it
//! exposes without a value: [`InstanceContext::exposes`] answers the first,
//! [`InstanceContext::get`] returns `None` for both.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Placeholder recorded in parameter snapshots for a blank or missing value.
pub const NONE_PLACEHOLDER: &str = "none";

/// FHIR protocol versions a test may apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FhirVersion {
    Dstu2,
    Stu3,
    R4,
}

impl FhirVersion {
    pub const ALL: [FhirVersion; 3] = [FhirVersion::Dstu2, FhirVersion::Stu3, FhirVersion::R4];

    pub fn as_str(self) -> &'static str {
        match self {
            FhirVersion::Dstu2 => "dstu2",
            FhirVersion::Stu3 => "stu3",
            FhirVersion::R4 => "r4",
        }
    }
}

impl Display for FhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FhirVersion {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        FhirVersion::ALL
            .into_iter()
            .find(|version| version.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| format!("Unknown FHIR version `{raw}`"))
    }
}

/// A resource id discovered by a test, for later tests to read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReference {
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub profile: Option<String>,
}

pub trait InstanceContext {
    fn id(&self) -> &str;

    /// Whether the context has a parameter of this name at all.
    fn exposes(&self, name: &str) -> bool;

    fn get(&self, name: &str) -> Option<&str>;

    /// Sets or clears a parameter, exposing it if it was not.
    fn set(&mut self, name: &str, value: Option<String>);

    fn resource_references(&self) -> &[ResourceReference];

    fn add_resource_reference(&mut self, reference: ResourceReference);

    fn fhir_version(&self) -> Option<FhirVersion> {
        self.get("fhir_version").and_then(|raw| raw.parse().ok())
    }

    /// Bearer token, if a non-blank one is set.
    fn token(&self) -> Option<&str> {
        self.get("token").filter(|token| !token.trim().is_empty())
    }
}

/// Snapshot form of a parameter: its value, or [`NONE_PLACEHOLDER`] when
/// blank or unset.
pub fn snapshot_value(instance: &dyn InstanceContext, name: &str) -> String {
    match instance.get(name) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => NONE_PLACEHOLDER.to_string(),
    }
}

/// In-memory instance context, also the shape loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestingInstance {
    #[serde(default = "new_instance_id")]
    pub id: String,
    /// Exposed parameters; `null` means exposed without a value.
    #[serde(default)]
    pub params: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub resource_references: Vec<ResourceReference>,
}

fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl TestingInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), Some(value.into()));
        self
    }

    /// Exposes `name` without giving it a value.
    pub fn expose(mut self, name: &str) -> Self {
        self.params.entry(name.to_string()).or_insert(None);
        self
    }
}

impl InstanceContext for TestingInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn exposes(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|value| value.as_deref())
    }

    fn set(&mut self, name: &str, value: Option<String>) {
        self.params.insert(name.to_string(), value);
    }

    fn resource_references(&self) -> &[ResourceReference] {
        &self.resource_references
    }

    fn add_resource_reference(&mut self, reference: ResourceReference) {
        if !self.resource_references.contains(&reference) {
            self.resource_references.push(reference);
        }
    }
}
