//! # Test Runner
//!
//! Executes one registered test body and turns whatever ended it into a
//! [`TestResult`] with the traffic it produced.

pub mod context;
pub mod fhir;

pub use context::{Scratch, TestContext};
pub use fhir::conforms_to_datetime_format;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info};

use crate::error::error_chain;
use crate::http::{CapturedExchange, Direction};
use crate::model::TestResult;
use crate::registry::TestCaseDefinition;
use crate::status::Signal;

/// Skip message for a test that does not apply to the instance's FHIR version.
pub const VERSION_SKIP_MESSAGE: &str = "This test does not run with this FHIR version";

/// Runs `definition` in `context` and captures the exchanges logged by both
/// clients. The caller clears the logs beforehand.
pub fn run_test(definition: &TestCaseDefinition, mut context: TestContext<'_>) -> TestResult {
    let mut result = TestResult::from_definition(definition);
    let label = definition.identifier.as_deref().unwrap_or(&definition.name);
    info!("Starting Test: {label} [{}]", definition.name);

    let outcome = match context.instance.fhir_version() {
        Some(version) if !definition.applies_to(version) => Err(Signal::skip(VERSION_SKIP_MESSAGE)),
        _ => panic::catch_unwind(AssertUnwindSafe(|| (definition.body)(&mut context)))
            .unwrap_or_else(|payload| Err(Signal::unexpected(panic_message(payload.as_ref())))),
    };

    if let Err(signal) = outcome {
        log_signal(label, &signal);
        result.apply(signal);
    }

    result.warnings = context.take_warnings();

    let instance_id = context.instance.id().to_string();
    result.request_responses = context
        .client
        .requests()
        .iter()
        .map(|record| CapturedExchange::from_record(record, &instance_id, Some(Direction::Outbound)))
        .chain(
            context
                .rest
                .requests()
                .iter()
                .map(|record| CapturedExchange::from_record(record, &instance_id, None)),
        )
        .collect();

    info!("Finished Test: {label} [{}]", result.result);
    result
}

fn log_signal(label: &str, signal: &Signal) {
    match signal {
        Signal::Unexpected(cause) => error!(test = label, "Fatal Error: {}", error_chain(cause.as_ref())),
        Signal::Assertion { message, .. } => debug!(test = label, "assertion failed: {message}"),
        Signal::Transport(err) => debug!(test = label, "transport fault: {err}"),
        control => debug!(test = label, status = ?control.status(), "control signal"),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "test panicked".to_string()
    }
}
