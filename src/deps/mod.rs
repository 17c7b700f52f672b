//! # Dependency Resolver
//!
//! Pre-flight diagnostics: which inputs of a sequence are missing on an
//! instance, and which registered sequences produce them.

use std::collections::{BTreeMap, BTreeSet};

use crate::instance::InstanceContext;
use crate::registry::{Registry, SequenceDefinition};

/// One unsatisfied input and the sequences that can supply it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRequirement {
    pub input: String,
    /// Names of sequences declaring `input` as an output, in registration
    /// order.
    pub providers: Vec<String>,
}

/// An input is missing when the instance exposes it without a value.
/// Inputs the instance does not expose at all cannot be supplied by running
/// another sequence and are not reported.
pub fn is_missing(instance: &dyn InstanceContext, input: &str) -> bool {
    instance.exposes(input) && instance.get(input).is_none()
}

/// Missing inputs of `sequence`. With `recurse`, inputs missing for the
/// providers themselves are added too, each provider set visited once.
pub fn missing_requirements(
    registry: &Registry,
    sequence: &SequenceDefinition,
    instance: &dyn InstanceContext,
    recurse: bool,
) -> Vec<MissingRequirement> {
    let mut found = BTreeMap::new();
    let mut visited = BTreeSet::new();
    collect(registry, sequence, instance, recurse, &mut visited, &mut found);

    found
        .into_iter()
        .map(|(input, providers)| MissingRequirement { input, providers })
        .collect()
}

fn collect(
    registry: &Registry,
    sequence: &SequenceDefinition,
    instance: &dyn InstanceContext,
    recurse: bool,
    visited: &mut BTreeSet<Vec<String>>,
    found: &mut BTreeMap<String, Vec<String>>,
) {
    for input in &sequence.required_inputs {
        if !is_missing(instance, input) || found.contains_key(input) {
            continue;
        }
        let providers: Vec<String> = registry
            .sequences()
            .filter(|candidate| candidate.name != sequence.name)
            .filter(|candidate| candidate.produced_outputs.contains(input))
            .map(|candidate| candidate.name.clone())
            .collect();
        found.insert(input.clone(), providers.clone());

        if !recurse || !visited.insert(providers.clone()) {
            continue;
        }
        for name in &providers {
            if let Some(provider) = registry.sequence(name) {
                collect(registry, provider, instance, recurse, visited, found);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::TestingInstance;
    use crate::registry::SequenceBuilder;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        for builder in [
            SequenceBuilder::new("Discovery").requires(&["url"]).defines(&["oauth_authorize_endpoint"]),
            SequenceBuilder::new("Registration").requires(&["url"]).defines(&["client_id"]),
            SequenceBuilder::new("Launch")
                .requires(&["client_id", "oauth_authorize_endpoint"])
                .defines(&["token", "patient_id"]),
            SequenceBuilder::new("Refresh").requires(&["token"]).defines(&["token"]),
            SequenceBuilder::new("PatientRead").requires(&["token", "patient_id", "url"]),
        ] {
            registry.register(builder).unwrap();
        }
        registry
    }

    fn requirement(input: &str, providers: &[&str]) -> MissingRequirement {
        MissingRequirement {
            input: input.into(),
            providers: providers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn reports_only_exposed_blank_inputs() {
        let registry = registry();
        let instance = TestingInstance::new("i1")
            .with("url", "https://fhir.example")
            .expose("token");
        let missing = missing_requirements(
            &registry,
            registry.sequence("PatientRead").unwrap(),
            &instance,
            false,
        );
        assert_eq!(missing, vec![requirement("token", &["Launch", "Refresh"])]);
    }

    #[test]
    fn recursion_follows_providers() {
        let registry = registry();
        let instance = TestingInstance::new("i1")
            .with("url", "https://fhir.example")
            .expose("token")
            .expose("patient_id")
            .expose("client_id")
            .expose("oauth_authorize_endpoint");
        let missing = missing_requirements(
            &registry,
            registry.sequence("PatientRead").unwrap(),
            &instance,
            true,
        );
        assert_eq!(
            missing,
            vec![
                requirement("client_id", &["Registration"]),
                requirement("oauth_authorize_endpoint", &["Discovery"]),
                requirement("patient_id", &["Launch"]),
                requirement("token", &["Launch", "Refresh"]),
            ]
        );
    }

    #[test]
    fn sequence_never_provides_for_itself() {
        let registry = registry();
        let instance = TestingInstance::new("i1").expose("token");
        let missing = missing_requirements(&registry, registry.sequence("Refresh").unwrap(), &instance, true);
        assert_eq!(missing, vec![requirement("token", &["Launch"])]);
    }
}
