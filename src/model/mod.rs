//! # Run Records
//!
//! The dynamic side of the engine: one [`SequenceRun`] per execution attempt,
//! owning the [`TestResult`]s it produced in execution order. Both are plain
//! data so that a suspended run can be persisted, dropped, and picked up by a
//! later process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::http::CapturedExchange;
use crate::instance::FhirVersion;
use crate::registry::{SequenceDefinition, TestCaseDefinition};
use crate::status::{self, Signal, Status};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub external_link: Option<String>,
    pub reference: Option<String>,
    pub required: bool,
    pub applicable_versions: Vec<FhirVersion>,
    pub result: Status,
    pub message: Option<String>,
    pub details: Option<String>,
    /// Global registration index of the test.
    pub test_index: usize,
    pub wait_at_endpoint: Option<String>,
    pub redirect_to_url: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub request_responses: Vec<CapturedExchange>,
}

impl TestResult {
    pub fn from_definition(definition: &TestCaseDefinition) -> Self {
        Self {
            test_id: definition.identifier.clone(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            external_link: definition.external_link.clone(),
            reference: definition.reference.clone(),
            required: definition.required,
            applicable_versions: definition.applicable_versions.clone(),
            result: Status::Pass,
            message: None,
            details: None,
            test_index: definition.index,
            wait_at_endpoint: None,
            redirect_to_url: None,
            warnings: Vec::new(),
            request_responses: Vec::new(),
        }
    }

    /// Records the signal that ended the body.
    pub(crate) fn apply(&mut self, signal: Signal) {
        match signal {
            Signal::Pass(message) => self.settle(Status::Pass, non_empty(message), None),
            Signal::Skip { message, details } => self.settle(Status::Skip, non_empty(message), details),
            Signal::Todo(message) => self.settle(Status::Todo, non_empty(message), None),
            Signal::Assertion { message, details } => {
                self.settle(Status::Fail, non_empty(message), details)
            }
            Signal::Transport(err) => self.settle(Status::Fail, Some(err.to_string()), None),
            Signal::Wait { endpoint } => {
                self.settle(Status::Wait, None, None);
                self.wait_at_endpoint = Some(endpoint);
            }
            Signal::Redirect { url, endpoint } => {
                self.settle(Status::Wait, None, None);
                self.wait_at_endpoint = Some(endpoint);
                self.redirect_to_url = Some(url);
            }
            Signal::Unexpected(cause) => {
                self.settle(Status::Error, Some(format!("Fatal Error: {cause}")), None)
            }
            Signal::Metadata => {}
        }
    }

    /// Overrides the outcome after the fact: automation, or a resume.
    pub(crate) fn settle(&mut self, result: Status, message: Option<String>, details: Option<String>) {
        self.result = result;
        self.message = message;
        self.details = details;
    }

    /// Ends a wait with `result`, dropping the endpoint and redirect.
    pub(crate) fn resolve_wait(&mut self, result: Status, message: Option<String>) {
        self.settle(result, message, None);
        self.wait_at_endpoint = None;
        self.redirect_to_url = None;
    }

    pub fn is_wait(&self) -> bool {
        self.result == Status::Wait
    }
}

fn non_empty(message: String) -> Option<String> {
    if message.is_empty() { None } else { Some(message) }
}

/// Value of an output parameter before and after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    pub original: String,
    pub updated: Option<String>,
}

/// Tallies recomputed from the test results after every start or resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub required_total: usize,
    pub required_passed: usize,
    pub optional_total: usize,
    pub optional_passed: usize,
    pub todo_count: usize,
    pub error_count: usize,
    pub skip_count: usize,
}

impl RunCounts {
    pub fn tally(results: &[TestResult]) -> Self {
        let mut counts = RunCounts::default();
        for result in results {
            if result.required {
                counts.required_total += 1;
            } else {
                counts.optional_total += 1;
            }
            match (result.result, result.required) {
                (Status::Pass, true) => counts.required_passed += 1,
                (Status::Pass, false) => counts.optional_passed += 1,
                (Status::Todo, _) => counts.todo_count += 1,
                (Status::Error, true) => counts.error_count += 1,
                (Status::Skip, true) => counts.skip_count += 1,
                _ => {}
            }
        }
        counts
    }
}

/// Optional identifiers tying a run to a larger test plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunGrouping {
    pub test_set_id: Option<String>,
    pub test_case_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRun {
    pub id: String,
    pub sequence_name: String,
    pub instance_id: String,
    pub result: Status,
    pub required: bool,
    #[serde(default)]
    pub grouping: RunGrouping,
    pub app_version: String,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    /// Required inputs at start, `"none"` when blank.
    #[serde(default)]
    pub input_params: BTreeMap<String, String>,
    #[serde(default)]
    pub output_results: BTreeMap<String, OutputSnapshot>,
    pub wait_at_endpoint: Option<String>,
    pub redirect_to_url: Option<String>,
    #[serde(default)]
    pub counts: RunCounts,
}

impl SequenceRun {
    pub fn new(
        sequence: &SequenceDefinition,
        instance_id: &str,
        grouping: RunGrouping,
        app_version: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence_name: sequence.name.clone(),
            instance_id: instance_id.to_string(),
            result: Status::Pass,
            required: !sequence.is_optional,
            grouping,
            app_version: app_version.to_string(),
            test_results: Vec::new(),
            input_params: BTreeMap::new(),
            output_results: BTreeMap::new(),
            wait_at_endpoint: None,
            redirect_to_url: None,
            counts: RunCounts::default(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.wait_at_endpoint.is_some()
    }

    /// Recomputes counts and, unless suspended, the aggregate result.
    pub fn refresh(&mut self) {
        self.counts = RunCounts::tally(&self.test_results);
        self.result = if self.is_suspended() {
            Status::Wait
        } else {
            status::aggregate(
                self.test_results
                    .iter()
                    .map(|result| (result.result, result.required)),
            )
        };
    }
}
