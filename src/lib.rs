//! # fhir-harness
//!
//! A sequence engine for FHIR server conformance testing. Tests are grouped
//! into sequences, registered once at startup, and run in order against a
//! server. A run can suspend while it waits for an out-of-band interaction
//! such as an OAuth redirect, be persisted, and resume later.
//!
//! The pieces, bottom up:
//! - [`status`]: the six outcome states and how a run aggregates them.
//! - [`registry`]: sequence and test declarations with their metadata.
//! - [`runner`]: executes one test body and captures its traffic.
//! - [`engine`]: the start/resume state machine over a whole sequence.
//! - [`deps`]: which sequences can supply a sequence's missing inputs.

pub mod automation;
pub mod cli;
pub mod config;
pub mod deps;
pub mod engine;
pub mod error;
pub mod http;
pub mod instance;
pub mod model;
pub mod path;
pub mod registry;
pub mod runner;
pub mod sequences;
pub mod status;
pub mod store;
pub mod validation;

pub use engine::{ResumeRequest, SequenceEngine};
pub use instance::{FhirVersion, InstanceContext, TestingInstance};
pub use model::{RunCounts, RunGrouping, SequenceRun, TestResult};
pub use registry::{Registry, SequenceBuilder, SequenceDefinition, TestCaseDefinition};
pub use runner::TestContext;
pub use status::{Signal, Status, TestOutcome};
