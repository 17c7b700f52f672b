//! # Sequence Engine
//!
//! Runs the tests of one sequence in order against an instance, suspending
//! when a test waits for an external interaction and resuming from the
//! persisted run later, possibly in another process.
//!
//! ```text
//! not started --start--> running --> completed
//!                           |
//!                           +--> suspended --resume--> running
//! ```
//!
//! The run is written to the [`RunStore`] after every test.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::automation::{self, LaunchAutomation};
use crate::error::EngineError;
use crate::http::{CapturedExchange, FhirClient, InboundRequest, LoggedRestClient};
use crate::instance::{InstanceContext, NONE_PLACEHOLDER, snapshot_value};
use crate::model::{OutputSnapshot, RunGrouping, SequenceRun, TestResult};
use crate::registry::SequenceDefinition;
use crate::runner::{self, Scratch, TestContext};
use crate::status::Status;
use crate::store::RunStore;
use crate::validation::{NullValidator, Validator};

/// Version recorded on runs unless overridden.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What arrived from outside to end a suspension.
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    /// The callback request itself, captured on the suspended test.
    pub inbound: Option<InboundRequest>,
    pub headers: BTreeMap<String, String>,
    /// Parameters for the remaining tests, e.g. the redirect query.
    pub params: BTreeMap<String, String>,
    /// Fail the suspended test with this message instead of passing it.
    pub fail_message: Option<String>,
}

pub struct SequenceEngine<'a> {
    sequence: &'a SequenceDefinition,
    instance: &'a mut dyn InstanceContext,
    client: &'a mut dyn FhirClient,
    store: &'a mut dyn RunStore,
    rest: LoggedRestClient,
    validator: &'a dyn Validator,
    automation: Option<&'a dyn LaunchAutomation>,
    run: Option<SequenceRun>,
    params: BTreeMap<String, String>,
    scratch: Scratch,
    app_version: String,
}

impl<'a> SequenceEngine<'a> {
    pub fn new(
        sequence: &'a SequenceDefinition,
        instance: &'a mut dyn InstanceContext,
        client: &'a mut dyn FhirClient,
        store: &'a mut dyn RunStore,
    ) -> Self {
        if let Some(token) = instance.token() {
            client.set_bearer_token(token);
        }
        Self {
            sequence,
            instance,
            client,
            store,
            rest: LoggedRestClient::detached(),
            validator: &NullValidator,
            automation: None,
            run: None,
            params: BTreeMap::new(),
            scratch: Scratch::default(),
            app_version: APP_VERSION.to_string(),
        }
    }

    pub fn with_validator(mut self, validator: &'a dyn Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_automation(mut self, automation: &'a dyn LaunchAutomation) -> Self {
        self.automation = Some(automation);
        self
    }

    pub fn with_rest(mut self, rest: LoggedRestClient) -> Self {
        self.rest = rest;
        self
    }

    /// Continues an existing run instead of creating one on `start`.
    pub fn with_run(mut self, run: SequenceRun) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_app_version(mut self, version: &str) -> Self {
        self.app_version = version.to_string();
        self
    }

    pub fn run(&self) -> Option<&SequenceRun> {
        self.run.as_ref()
    }

    pub fn into_run(self) -> Option<SequenceRun> {
        self.run
    }

    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    /// Runs every test not yet recorded on the run, creating the run first if
    /// there is none. Stops at the first test left waiting. A suspended run is
    /// returned as is; only [`resume`](Self::resume) continues it.
    pub fn start(&mut self, grouping: RunGrouping) -> Result<&SequenceRun, EngineError> {
        let sequence = self.sequence;
        let mut run = match self.run.take() {
            Some(run) => run,
            None => {
                let run = SequenceRun::new(sequence, self.instance.id(), grouping, &self.app_version);
                self.store.create_run(&run)?;
                info!(sequence = %run.sequence_name, run_id = %run.id, "created sequence run");
                run
            }
        };

        if run.is_suspended() {
            info!(
                sequence = %run.sequence_name,
                run_id = %run.id,
                endpoint = run.wait_at_endpoint.as_deref().unwrap_or_default(),
                "sequence run is suspended; waiting for resume"
            );
            return Ok(self.run.insert(run));
        }

        self.snapshot_inputs(&mut run);
        let start_at = run.test_results.len();

        for definition in sequence.test_cases.iter().skip(start_at) {
            self.client.clear_requests();
            self.rest.clear_log();

            let context = TestContext::new(
                &mut *self.instance,
                &mut *self.client,
                &mut self.rest,
                self.validator,
                &mut self.scratch,
                &self.params,
            );
            let mut result = runner::run_test(definition, context);
            self.automate(&mut result);

            let waiting = result.is_wait();
            if waiting {
                run.wait_at_endpoint = result.wait_at_endpoint.clone();
                run.redirect_to_url = result.redirect_to_url.clone();
            }
            run.test_results.push(result);
            run.refresh();
            self.store.save_run(&run)?;

            if waiting {
                info!(
                    sequence = %run.sequence_name,
                    run_id = %run.id,
                    endpoint = run.wait_at_endpoint.as_deref().unwrap_or_default(),
                    redirect = run.redirect_to_url.as_deref().unwrap_or_default(),
                    "sequence run suspended"
                );
                break;
            }
        }

        self.snapshot_outputs(&mut run);
        run.refresh();
        self.store.save_run(&run)?;

        if !run.is_suspended() {
            info!(
                sequence = %run.sequence_name,
                run_id = %run.id,
                result = %run.result,
                required_passed = run.counts.required_passed,
                required_total = run.counts.required_total,
                "sequence run finished"
            );
        }

        Ok(self.run.insert(run))
    }

    /// Ends the suspension of the current run and continues with the next
    /// test.
    pub fn resume(&mut self, request: ResumeRequest) -> Result<&SequenceRun, EngineError> {
        let mut run = self.run.take().ok_or(EngineError::NothingToResume)?;
        if !run.is_suspended() {
            let id = run.id.clone();
            self.run = Some(run);
            return Err(EngineError::NotSuspended(id));
        }

        let instance_id = self.instance.id().to_string();
        if let Some(last) = run.test_results.last_mut() {
            match request.fail_message {
                Some(message) => last.resolve_wait(Status::Fail, Some(message)),
                None => last.resolve_wait(Status::Pass, None),
            }
            if let Some(inbound) = &request.inbound {
                last.request_responses
                    .push(CapturedExchange::inbound(inbound, &request.headers, &instance_id));
            }
        }

        info!(
            sequence = %run.sequence_name,
            run_id = %run.id,
            endpoint = run.wait_at_endpoint.as_deref().unwrap_or_default(),
            "resuming sequence run"
        );
        run.wait_at_endpoint = None;
        run.redirect_to_url = None;
        run.result = Status::Pass;
        self.store.save_run(&run)?;

        self.params.extend(request.params);
        self.run = Some(run);
        self.start(RunGrouping::default())
    }

    /// Lets headless automation answer a `redirect` or `launch` wait.
    fn automate(&mut self, result: &mut TestResult) {
        if !result.is_wait() {
            return;
        }
        let Some(endpoint) = result.wait_at_endpoint.clone() else {
            return;
        };
        let Some(script) = automation::configured_script(&*self.instance, &endpoint) else {
            return;
        };
        let Some(automation) = self.automation else {
            warn!(endpoint = %endpoint, "launch script configured but no browser automation available");
            return;
        };

        match automation.run_script(script, result.redirect_to_url.as_deref()) {
            Ok(params) => {
                info!(endpoint = %endpoint, "automated browser script completed");
                self.params.extend(params);
                result.resolve_wait(Status::Pass, None);
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "automated browser script failed");
                result.resolve_wait(
                    Status::Fail,
                    Some(format!("Automated browser script failed: {err}")),
                );
            }
        }
    }

    fn snapshot_inputs(&self, run: &mut SequenceRun) {
        for name in &self.sequence.required_inputs {
            if self.instance.exposes(name) {
                run.input_params
                    .entry(name.clone())
                    .or_insert_with(|| snapshot_value(&*self.instance, name));
            }
        }
        for name in &self.sequence.produced_outputs {
            let original = if self.instance.exposes(name) {
                snapshot_value(&*self.instance, name)
            } else {
                NONE_PLACEHOLDER.to_string()
            };
            run.output_results.entry(name.clone()).or_insert(OutputSnapshot {
                original,
                updated: None,
            });
        }
    }

    fn snapshot_outputs(&self, run: &mut SequenceRun) {
        for name in &self.sequence.produced_outputs {
            let updated = snapshot_value(&*self.instance, name);
            run.output_results
                .entry(name.clone())
                .or_insert_with(|| OutputSnapshot {
                    original: NONE_PLACEHOLDER.to_string(),
                    updated: None,
                })
                .updated = Some(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::error::AutomationError;
    use crate::http::{DetachedClient, HttpMethod};
    use crate::instance::TestingInstance;
    use crate::registry::{Registry, SequenceBuilder};
    use crate::store::MemoryStore;

    struct StubAutomation {
        outcome: Result<BTreeMap<String, String>, String>,
        calls: RefCell<Vec<(String, Option<String>)>>,
    }

    impl LaunchAutomation for StubAutomation {
        fn run_script(
            &self,
            script: &str,
            redirect_url: Option<&str>,
        ) -> Result<BTreeMap<String, String>, AutomationError> {
            self.calls
                .borrow_mut()
                .push((script.to_string(), redirect_url.map(str::to_string)));
            self.outcome.clone().map_err(|reason| AutomationError::Script {
                script: script.to_string(),
                reason,
            })
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                SequenceBuilder::new("Launch")
                    .test_id_prefix("L")
                    .requires(&["client_id", "url"])
                    .defines(&["token"])
                    .test("redirect", |t| {
                        t.metadata(|m| {
                            m.id("01");
                        })?;
                        t.redirect("https://auth.example/authorize", "redirect")
                    })
                    .test("exchange", |t| {
                        t.metadata(|m| {
                            m.id("02");
                        })?;
                        let code = t.param("code").unwrap_or_default().to_string();
                        t.assert(!code.is_empty(), "No code returned")?;
                        t.instance.set("token", Some(format!("token-for-{code}")));
                        Ok(())
                    }),
            )
            .unwrap();
        registry
    }

    #[test]
    fn suspends_and_resumes() {
        let registry = registry();
        let sequence = registry.sequence("Launch").unwrap();
        let mut instance = TestingInstance::new("i1").with("client_id", "").expose("token");
        let mut client = DetachedClient;
        let mut store = MemoryStore::new();

        let mut engine = SequenceEngine::new(sequence, &mut instance, &mut client, &mut store);
        let run = engine.start(RunGrouping::default()).unwrap();
        assert_eq!(run.result, Status::Wait);
        assert_eq!(run.test_results.len(), 1);
        assert_eq!(run.wait_at_endpoint.as_deref(), Some("redirect"));
        assert_eq!(run.redirect_to_url.as_deref(), Some("https://auth.example/authorize"));
        assert_eq!(run.input_params.get("client_id").map(String::as_str), Some("none"));
        assert!(!run.input_params.contains_key("url"));

        let run = engine
            .resume(ResumeRequest {
                inbound: Some(InboundRequest {
                    method: HttpMethod::Get,
                    url: "https://harness/redirect?code=42".into(),
                    body: String::new(),
                }),
                params: BTreeMap::from([("code".to_string(), "42".to_string())]),
                ..ResumeRequest::default()
            })
            .unwrap();

        assert_eq!(run.result, Status::Pass);
        assert_eq!(run.test_results.len(), 2);
        assert_eq!(run.wait_at_endpoint, None);
        assert_eq!(run.test_results[0].result, Status::Pass);
        assert_eq!(run.test_results[0].request_responses.len(), 1);
        assert_eq!(run.counts.required_passed, 2);
        let token = &run.output_results["token"];
        assert_eq!(token.original, "none");
        assert_eq!(token.updated.as_deref(), Some("token-for-42"));

        let run_id = run.id.clone();
        drop(engine);
        assert_eq!(store.load_run(&run_id).unwrap().test_results.len(), 2);
    }

    #[test]
    fn forced_failure_on_resume() {
        let registry = registry();
        let sequence = registry.sequence("Launch").unwrap();
        let mut instance = TestingInstance::new("i1");
        let mut client = DetachedClient;
        let mut store = MemoryStore::new();

        let mut engine = SequenceEngine::new(sequence, &mut instance, &mut client, &mut store);
        engine.start(RunGrouping::default()).unwrap();
        let run = engine
            .resume(ResumeRequest {
                fail_message: Some("State mismatch".into()),
                ..ResumeRequest::default()
            })
            .unwrap();

        assert_eq!(run.test_results[0].result, Status::Fail);
        assert_eq!(run.test_results[0].message.as_deref(), Some("State mismatch"));
        assert_eq!(run.test_results[1].result, Status::Fail);
        assert_eq!(run.result, Status::Fail);
    }

    #[test]
    fn resume_requires_suspension() {
        let registry = registry();
        let sequence = registry.sequence("Launch").unwrap();
        let mut instance = TestingInstance::new("i1");
        let mut client = DetachedClient;
        let mut store = MemoryStore::new();

        let mut engine = SequenceEngine::new(sequence, &mut instance, &mut client, &mut store);
        assert!(matches!(
            engine.resume(ResumeRequest::default()),
            Err(EngineError::NothingToResume)
        ));
        engine.start(RunGrouping::default()).unwrap();
        engine
            .resume(ResumeRequest {
                params: BTreeMap::from([("code".to_string(), "1".to_string())]),
                ..ResumeRequest::default()
            })
            .unwrap();
        assert!(matches!(
            engine.resume(ResumeRequest::default()),
            Err(EngineError::NotSuspended(_))
        ));
        assert!(engine.run().is_some());
    }

    #[test]
    fn automation_satisfies_redirect() {
        let registry = registry();
        let sequence = registry.sequence("Launch").unwrap();
        let mut instance = TestingInstance::new("i1").with(automation::STANDALONE_LAUNCH_SCRIPT, "login.json");
        let mut client = DetachedClient;
        let mut store = MemoryStore::new();
        let automation = StubAutomation {
            outcome: Ok(BTreeMap::from([("code".to_string(), "7".to_string())])),
            calls: RefCell::new(Vec::new()),
        };

        let mut engine =
            SequenceEngine::new(sequence, &mut instance, &mut client, &mut store).with_automation(&automation);
        let run = engine.start(RunGrouping::default()).unwrap();

        assert_eq!(run.result, Status::Pass);
        assert_eq!(run.test_results.len(), 2);
        assert_eq!(
            automation.calls.borrow().as_slice(),
            [("login.json".to_string(), Some("https://auth.example/authorize".to_string()))]
        );
    }

    #[test]
    fn automation_failure_fails_test() {
        let registry = registry();
        let sequence = registry.sequence("Launch").unwrap();
        let mut instance = TestingInstance::new("i1").with(automation::STANDALONE_LAUNCH_SCRIPT, "login.json");
        let mut client = DetachedClient;
        let mut store = MemoryStore::new();
        let automation = StubAutomation {
            outcome: Err("element #login not found".into()),
            calls: RefCell::new(Vec::new()),
        };

        let mut engine =
            SequenceEngine::new(sequence, &mut instance, &mut client, &mut store).with_automation(&automation);
        let run = engine.start(RunGrouping::default()).unwrap();

        assert_eq!(run.test_results[0].result, Status::Fail);
        assert_eq!(
            run.test_results[0].message.as_deref(),
            Some("Automated browser script failed: script `login.json` failed: element #login not found")
        );
        assert!(!run.is_suspended());
        assert_eq!(run.test_results.len(), 2);
    }

    #[test]
    fn script_without_automation_keeps_waiting() {
        let registry = registry();
        let sequence = registry.sequence("Launch").unwrap();
        let mut instance = TestingInstance::new("i1").with(automation::STANDALONE_LAUNCH_SCRIPT, "login.json");
        let mut client = DetachedClient;
        let mut store = MemoryStore::new();

        let mut engine = SequenceEngine::new(sequence, &mut instance, &mut client, &mut store);
        let run = engine.start(RunGrouping::default()).unwrap();
        assert_eq!(run.result, Status::Wait);
    }
}
