//! # Test Case Registry
//!
//! Sequences are declared once at startup with a [`SequenceBuilder`] and
//! registered into a [`Registry`] that the engine then borrows.
//!
//! Registering a test runs its body once in metadata-extraction mode. The body
//! starts with a metadata block:
//!
//! ```
//! use fhir_harness::registry::{Registry, SequenceBuilder};
//!
//! let mut registry = Registry::new();
//! registry
//!     .register(
//!         SequenceBuilder::new("ExampleSequence")
//!             .test_id_prefix("EX")
//!             .test("Server answers", |t| {
//!                 t.metadata(|m| {
//!                     m.id("01").desc("The server returns its capability statement");
//!                 })?;
//!                 let reply = t.client.capability_statement()?;
//!                 t.assert_response_ok(&reply)
//!             }),
//!     )
//!     .unwrap();
//!
//! let tests = registry.list_tests("ExampleSequence");
//! assert_eq!(tests[0].identifier.as_deref(), Some("EX-01"));
//! ```
//!
//! In metadata mode the block records its declarations and the body returns
//! immediately, so nothing after it (network calls included) runs.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::RegistrationError;
use crate::http::{DetachedClient, LoggedRestClient};
use crate::instance::{FhirVersion, InstanceContext, TestingInstance};
use crate::runner::{Scratch, TestContext, panic_message};
use crate::status::{Signal, TestOutcome};
use crate::validation::NullValidator;

pub type TestBody = Arc<dyn Fn(&mut TestContext<'_>) -> TestOutcome + Send + Sync>;

pub type PreconditionCheck = Arc<dyn Fn(&dyn InstanceContext) -> bool + Send + Sync>;

/// Declarations made inside a test's metadata block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestMetadata {
    pub id: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub reference: Option<String>,
    pub optional: bool,
    pub versions: Option<Vec<FhirVersion>>,
}

impl TestMetadata {
    /// Two-digit sub-identifier; the sequence prefix is added on registration.
    pub fn id(&mut self, id: &str) -> &mut Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn desc(&mut self, description: &str) -> &mut Self {
        self.description = Some(unindent(description));
        self
    }

    pub fn link(&mut self, link: &str) -> &mut Self {
        self.link = Some(link.to_string());
        self
    }

    /// Requirement reference the test covers.
    pub fn reference(&mut self, reference: &str) -> &mut Self {
        self.reference = Some(reference.to_string());
        self
    }

    pub fn optional(&mut self) -> &mut Self {
        self.optional = true;
        self
    }

    pub fn versions(&mut self, versions: &[FhirVersion]) -> &mut Self {
        self.versions = Some(versions.to_vec());
        self
    }
}

fn unindent(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[derive(Clone)]
pub struct TestCaseDefinition {
    pub name: String,
    /// Global registration order across every sequence.
    pub index: usize,
    pub identifier: Option<String>,
    pub required: bool,
    pub applicable_versions: Vec<FhirVersion>,
    pub description: Option<String>,
    pub external_link: Option<String>,
    pub reference: Option<String>,
    pub body: TestBody,
}

impl fmt::Debug for TestCaseDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCaseDefinition")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("identifier", &self.identifier)
            .field("required", &self.required)
            .field("applicable_versions", &self.applicable_versions)
            .finish_non_exhaustive()
    }
}

impl TestCaseDefinition {
    pub fn applies_to(&self, version: FhirVersion) -> bool {
        self.applicable_versions.contains(&version)
    }
}

#[derive(Clone)]
pub struct Precondition {
    pub description: String,
    pub check: PreconditionCheck,
}

#[derive(Clone)]
pub struct SequenceDefinition {
    pub name: String,
    pub title: String,
    pub description: Option<String>,
    pub details: Option<String>,
    pub group: Option<String>,
    pub test_id_prefix: Option<String>,
    pub required_inputs: Vec<String>,
    pub produced_outputs: Vec<String>,
    pub supported_resource_types: Vec<String>,
    pub versions: Vec<FhirVersion>,
    pub is_optional: bool,
    pub show_uris: bool,
    pub preconditions: Option<Precondition>,
    /// In registration order. Inherited tests share their parent's `Arc`s.
    pub test_cases: Vec<Arc<TestCaseDefinition>>,
}

impl fmt::Debug for SequenceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceDefinition")
            .field("name", &self.name)
            .field("title", &self.title)
            .field("required_inputs", &self.required_inputs)
            .field("produced_outputs", &self.produced_outputs)
            .field("test_cases", &self.test_cases)
            .finish_non_exhaustive()
    }
}

impl SequenceDefinition {
    /// True when no preconditions are declared.
    pub fn preconditions_met_for(&self, instance: &dyn InstanceContext) -> bool {
        self.preconditions
            .as_ref()
            .is_none_or(|precondition| (precondition.check)(instance))
    }

    pub fn preconditions_description(&self) -> Option<&str> {
        self.preconditions.as_ref().map(|p| p.description.as_str())
    }

    pub fn test_count(&self) -> usize {
        self.test_cases.len()
    }
}

/// Declarative description of a sequence, consumed by [`Registry::register`].
pub struct SequenceBuilder {
    name: String,
    title: Option<String>,
    description: Option<String>,
    details: Option<String>,
    group: Option<String>,
    test_id_prefix: Option<String>,
    requires: Vec<String>,
    defines: Vec<String>,
    conformance_supports: Vec<String>,
    versions: Vec<FhirVersion>,
    optional: bool,
    show_uris: bool,
    preconditions: Option<Precondition>,
    extends: Option<String>,
    tests: Vec<(String, TestBody)>,
}

impl SequenceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            details: None,
            group: None,
            test_id_prefix: None,
            requires: Vec::new(),
            defines: Vec::new(),
            conformance_supports: Vec::new(),
            versions: FhirVersion::ALL.to_vec(),
            optional: false,
            show_uris: false,
            preconditions: None,
            extends: None,
            tests: Vec::new(),
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(unindent(description));
        self
    }

    pub fn details(mut self, details: &str) -> Self {
        self.details = Some(unindent(details));
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn test_id_prefix(mut self, prefix: &str) -> Self {
        self.test_id_prefix = Some(prefix.to_string());
        self
    }

    pub fn requires(mut self, inputs: &[&str]) -> Self {
        self.requires = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn defines(mut self, outputs: &[&str]) -> Self {
        self.defines = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn conformance_supports(mut self, resource_types: &[&str]) -> Self {
        self.conformance_supports = resource_types.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Versions the sequence targets; also the default for each of its tests.
    pub fn versions(mut self, versions: &[FhirVersion]) -> Self {
        self.versions = versions.to_vec();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn show_uris(mut self) -> Self {
        self.show_uris = true;
        self
    }

    pub fn preconditions(
        mut self,
        description: &str,
        check: impl Fn(&dyn InstanceContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.preconditions = Some(Precondition {
            description: description.to_string(),
            check: Arc::new(check),
        });
        self
    }

    /// Starts from the tests of an already registered sequence.
    pub fn extends(mut self, parent: &str) -> Self {
        self.extends = Some(parent.to_string());
        self
    }

    pub fn test(
        mut self,
        name: &str,
        body: impl Fn(&mut TestContext<'_>) -> TestOutcome + Send + Sync + 'static,
    ) -> Self {
        self.tests.push((name.to_string(), Arc::new(body)));
        self
    }
}

/// Every registered sequence, in registration order.
///
/// Build one at startup and share it by reference; registering while runs are
/// in flight is not supported.
#[derive(Default)]
pub struct Registry {
    sequences: Vec<SequenceDefinition>,
    by_name: BTreeMap<String, usize>,
    next_index: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, builder: SequenceBuilder) -> Result<&SequenceDefinition, RegistrationError> {
        if self.by_name.contains_key(&builder.name) {
            return Err(RegistrationError::DuplicateSequence(builder.name));
        }

        let inherited = match &builder.extends {
            Some(parent) => self
                .sequence(parent)
                .map(|parent| parent.test_cases.clone())
                .ok_or_else(|| RegistrationError::UnknownParent {
                    sequence: builder.name.clone(),
                    parent: parent.clone(),
                })?,
            None => Vec::new(),
        };

        let mut definition = SequenceDefinition {
            title: builder.title.unwrap_or_else(|| builder.name.clone()),
            name: builder.name,
            description: builder.description,
            details: builder.details,
            group: builder.group,
            test_id_prefix: builder.test_id_prefix,
            required_inputs: builder.requires,
            produced_outputs: builder.defines,
            supported_resource_types: builder.conformance_supports,
            versions: builder.versions,
            is_optional: builder.optional,
            show_uris: builder.show_uris,
            preconditions: builder.preconditions,
            test_cases: inherited,
        };

        for (name, body) in builder.tests {
            self.register_test(&mut definition, &name, body)?;
        }

        tracing::debug!(
            sequence = %definition.name,
            tests = definition.test_cases.len(),
            "registered sequence"
        );

        let position = self.sequences.len();
        self.by_name.insert(definition.name.clone(), position);
        self.sequences.push(definition);
        Ok(&self.sequences[position])
    }

    /// Assigns the next global index, extracts metadata, and appends the test.
    pub fn register_test(
        &mut self,
        sequence: &mut SequenceDefinition,
        name: &str,
        body: TestBody,
    ) -> Result<(), RegistrationError> {
        self.next_index += 1;
        let index = self.next_index;

        let metadata = extract_metadata(&sequence.name, name, &body)?;
        let identifier = metadata.id.as_ref().map(|id| match &sequence.test_id_prefix {
            Some(prefix) => format!("{prefix}-{id}"),
            None => id.clone(),
        });

        if let Some(identifier) = &identifier {
            let taken: HashSet<&str> = sequence
                .test_cases
                .iter()
                .filter_map(|test| test.identifier.as_deref())
                .collect();
            if taken.contains(identifier.as_str()) {
                return Err(RegistrationError::DuplicateIdentifier {
                    sequence: sequence.name.clone(),
                    test: name.to_string(),
                    identifier: identifier.clone(),
                });
            }
        }

        sequence.test_cases.push(Arc::new(TestCaseDefinition {
            name: name.to_string(),
            index,
            identifier,
            required: !metadata.optional,
            applicable_versions: metadata.versions.unwrap_or_else(|| sequence.versions.clone()),
            description: metadata.description,
            external_link: metadata.link,
            reference: metadata.reference,
            body,
        }));
        Ok(())
    }

    pub fn sequence(&self, name: &str) -> Option<&SequenceDefinition> {
        self.by_name.get(name).map(|&position| &self.sequences[position])
    }

    pub fn sequences(&self) -> impl Iterator<Item = &SequenceDefinition> {
        self.sequences.iter()
    }

    /// Tests of `sequence_name` in order; empty for an unknown name.
    pub fn list_tests(&self, sequence_name: &str) -> &[Arc<TestCaseDefinition>] {
        self.sequence(sequence_name)
            .map(|sequence| sequence.test_cases.as_slice())
            .unwrap_or_default()
    }

    pub fn test_count(&self, sequence_name: &str) -> usize {
        self.list_tests(sequence_name).len()
    }
}

/// Runs `body` against detached collaborators until its metadata block
/// returns [`Signal::Metadata`]. Anything else is a malformed test.
fn extract_metadata(sequence: &str, test: &str, body: &TestBody) -> Result<TestMetadata, RegistrationError> {
    let mut instance = TestingInstance::new("metadata");
    let mut client = DetachedClient;
    let mut rest = LoggedRestClient::detached();
    let validator = NullValidator;
    let mut scratch = Scratch::default();
    let params = BTreeMap::new();

    let mut context = TestContext::new(
        &mut instance,
        &mut client,
        &mut rest,
        &validator,
        &mut scratch,
        &params,
    )
    .extracting_metadata();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut context)));

    let malformed = |cause: String| RegistrationError::MetadataPass {
        sequence: sequence.to_string(),
        test: test.to_string(),
        cause,
    };

    match outcome {
        Ok(Err(Signal::Metadata)) => context
            .take_metadata()
            .ok_or_else(|| malformed("metadata block produced no metadata".to_string())),
        Ok(Ok(())) => Err(RegistrationError::MissingMetadata {
            sequence: sequence.to_string(),
            test: test.to_string(),
        }),
        Ok(Err(signal)) => Err(malformed(format!("{signal:?}"))),
        Err(payload) => Err(malformed(panic_message(payload.as_ref()))),
    }
}
