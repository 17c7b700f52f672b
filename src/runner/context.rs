use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use serde_json::Value;

use crate::http::{FhirClient, LoggedRestClient};
use crate::instance::InstanceContext;
use crate::registry::TestMetadata;
use crate::status::{Signal, TestOutcome};
use crate::validation::Validator;

/// State shared by the consecutive tests of one engine invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scratch {
    pub values: BTreeMap<String, Value>,
    pub profiles_encountered: BTreeSet<String>,
    /// Profile url to the ids of resources that failed it.
    pub profiles_failed: BTreeMap<String, Vec<String>>,
}

impl Scratch {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }
}

/// Everything a test body can reach while it runs.
///
/// The collaborators are public so bodies can call them directly; outcome
/// helpers (`assert`, `skip_unless`, `pass`, ...) return a [`TestOutcome`] to
/// be propagated with `?` or returned.
pub struct TestContext<'a> {
    pub instance: &'a mut dyn InstanceContext,
    pub client: &'a mut dyn FhirClient,
    pub rest: &'a mut LoggedRestClient,
    pub validator: &'a dyn Validator,
    pub scratch: &'a mut Scratch,
    params: &'a BTreeMap<String, String>,
    warnings: Vec<String>,
    extracting: bool,
    metadata: Option<TestMetadata>,
}

impl<'a> TestContext<'a> {
    pub fn new(
        instance: &'a mut dyn InstanceContext,
        client: &'a mut dyn FhirClient,
        rest: &'a mut LoggedRestClient,
        validator: &'a dyn Validator,
        scratch: &'a mut Scratch,
        params: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            instance,
            client,
            rest,
            validator,
            scratch,
            params,
            warnings: Vec::new(),
            extracting: false,
            metadata: None,
        }
    }

    pub(crate) fn extracting_metadata(mut self) -> Self {
        self.extracting = true;
        self
    }

    pub(crate) fn take_metadata(&mut self) -> Option<TestMetadata> {
        self.metadata.take()
    }

    pub(crate) fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Declares the test's metadata. During registration this records the
    /// declarations and stops the body; at run time it does nothing.
    pub fn metadata(&mut self, declare: impl FnOnce(&mut TestMetadata)) -> TestOutcome {
        if !self.extracting {
            return Ok(());
        }
        let mut metadata = TestMetadata::default();
        declare(&mut metadata);
        self.metadata = Some(metadata);
        Err(Signal::Metadata)
    }

    /// External parameter handed to the engine, e.g. the query of an OAuth
    /// redirect.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        self.params
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn pass(&self, message: impl Into<String>) -> TestOutcome {
        Err(Signal::Pass(message.into()))
    }

    pub fn skip(&self, message: impl Into<String>) -> TestOutcome {
        Err(Signal::skip(message))
    }

    pub fn skip_with_details(&self, message: impl Into<String>, details: impl Into<String>) -> TestOutcome {
        Err(Signal::Skip {
            message: message.into(),
            details: Some(details.into()),
        })
    }

    pub fn skip_unless(&self, condition: bool, message: impl Into<String>) -> TestOutcome {
        if condition { Ok(()) } else { self.skip(message) }
    }

    pub fn skip_if(&self, condition: bool, message: impl Into<String>) -> TestOutcome {
        self.skip_unless(!condition, message)
    }

    pub fn todo(&self, message: impl Into<String>) -> TestOutcome {
        Err(Signal::Todo(message.into()))
    }

    /// Suspends the run until an external request reaches `endpoint`.
    pub fn wait_at_endpoint(&self, endpoint: impl Into<String>) -> TestOutcome {
        Err(Signal::Wait {
            endpoint: endpoint.into(),
        })
    }

    /// Suspends the run after sending the user to `url`.
    pub fn redirect(&self, url: impl Into<String>, endpoint: impl Into<String>) -> TestOutcome {
        Err(Signal::Redirect {
            url: url.into(),
            endpoint: endpoint.into(),
        })
    }

    pub fn fail(&self, message: impl Into<String>) -> TestOutcome {
        Err(Signal::assertion(message))
    }

    pub fn fail_with_details(&self, message: impl Into<String>, details: impl Into<String>) -> TestOutcome {
        Err(Signal::Assertion {
            message: message.into(),
            details: Some(details.into()),
        })
    }

    pub fn assert(&self, condition: bool, message: impl Into<String>) -> TestOutcome {
        if condition { Ok(()) } else { self.fail(message) }
    }

    pub fn assert_equal<T>(&self, expected: T, actual: T, message: &str) -> TestOutcome
    where
        T: PartialEq + Debug,
    {
        if expected == actual {
            return Ok(());
        }
        let mismatch = format!("Expected {expected:?}, but found {actual:?}");
        if message.is_empty() {
            self.fail(mismatch)
        } else {
            self.fail(format!("{message}. {mismatch}"))
        }
    }

    /// Runs `checks`, downgrading an assertion failure inside it to a
    /// warning. Any other signal ends the test as usual.
    pub fn warn(&mut self, checks: impl FnOnce(&mut Self) -> TestOutcome) -> TestOutcome {
        match checks(self) {
            Err(Signal::Assertion { message, .. }) => {
                self.warnings.push(message);
                Ok(())
            }
            other => other,
        }
    }
}
