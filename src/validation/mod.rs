//! # Validator Collaborator
//!
//! Structural and profile conformance checking is done elsewhere; tests reach
//! it through these traits.

use serde_json::Value;

use crate::instance::FhirVersion;

/// A conformance profile a resource may claim to satisfy.
pub trait ProfileHandle {
    fn url(&self) -> &str;

    /// Violations of the profile; empty when the resource conforms.
    fn validate(&self, resource: &Value) -> Vec<String>;

    /// Non-fatal findings accumulated by previous `validate` calls.
    fn warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

pub trait Validator {
    /// Base-schema violations.
    fn validate(&self, resource: &Value) -> Vec<String>;

    fn guess_profile(&self, resource: &Value, version: FhirVersion) -> Option<Box<dyn ProfileHandle>>;
}

/// Accepts everything and knows no profiles. Used when no validator is
/// configured.
#[derive(Debug, Default)]
pub struct NullValidator;

impl Validator for NullValidator {
    fn validate(&self, _resource: &Value) -> Vec<String> {
        Vec::new()
    }

    fn guess_profile(&self, _resource: &Value, _version: FhirVersion) -> Option<Box<dyn ProfileHandle>> {
        None
    }
}
