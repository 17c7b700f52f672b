#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;

use fhir_harness::error::{AutomationError, ClientError};
use fhir_harness::http::{FhirClient, HttpMethod, RecordedExchange, Reply, RequestRecord, ResponseRecord};
use fhir_harness::instance::FhirVersion;
use fhir_harness::validation::{ProfileHandle, Validator};
use fhir_harness::automation::LaunchAutomation;
use serde_json::{Value, json};

pub const BASE_URL: &str = "https://fhir.example/r4";

/// Answers from a table of `path -> resource` and logs every call like a
/// real client would. Unknown paths get a 404 OperationOutcome.
#[derive(Default)]
pub struct ScriptedClient {
    pub replies: BTreeMap<String, (u16, Value)>,
    pub require_auth: bool,
    pub token: Option<String>,
    log: Vec<RecordedExchange>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, path: &str, code: u16, body: Value) -> Self {
        self.replies.insert(path.to_string(), (code, body));
        self
    }

    pub fn requiring_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    fn get(&mut self, path: String) -> Result<Reply, ClientError> {
        let (code, body) = if self.require_auth && self.token.is_none() && path != "metadata" {
            (401, json!({"resourceType": "OperationOutcome"}))
        } else {
            self.replies
                .get(&path)
                .cloned()
                .unwrap_or((404, json!({"resourceType": "OperationOutcome"})))
        };
        let mut request = RequestRecord::new(HttpMethod::Get, format!("{BASE_URL}/{path}"));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = ResponseRecord {
            code,
            headers: BTreeMap::new(),
            body: body.to_string(),
        };
        self.log.push(RecordedExchange {
            direction: None,
            request,
            response: Some(response.clone()),
        });
        Ok(Reply::from(response))
    }
}

impl FhirClient for ScriptedClient {
    fn search(&mut self, resource_type: &str, params: &[(&str, &str)]) -> Result<Reply, ClientError> {
        let query = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        self.get(format!("{resource_type}?{query}"))
    }

    fn read(&mut self, resource_type: &str, id: &str) -> Result<Reply, ClientError> {
        self.get(format!("{resource_type}/{id}"))
    }

    fn vread(&mut self, resource_type: &str, id: &str, version_id: &str) -> Result<Reply, ClientError> {
        self.get(format!("{resource_type}/{id}/_history/{version_id}"))
    }

    fn history(&mut self, resource_type: &str, id: &str) -> Result<Reply, ClientError> {
        self.get(format!("{resource_type}/{id}/_history"))
    }

    fn capability_statement(&mut self) -> Result<Reply, ClientError> {
        self.get("metadata".to_string())
    }

    fn read_feed(&mut self, resource_type: &str) -> Result<Reply, ClientError> {
        self.get(resource_type.to_string())
    }

    fn next_page(&mut self, reply: &Reply) -> Result<Option<Reply>, ClientError> {
        match reply.next_link() {
            Some(url) => {
                let path = url.trim_start_matches(BASE_URL).trim_start_matches('/').to_string();
                self.get(path).map(Some)
            }
            None => Ok(None),
        }
    }

    fn set_bearer_token(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }

    fn set_no_auth(&mut self) {
        self.token = None;
    }

    fn requests(&self) -> &[RecordedExchange] {
        &self.log
    }

    fn clear_requests(&mut self) {
        self.log.clear();
    }
}

/// Reports the resources it has been asked about, failing any resource
/// carrying an `invalid` extension marker.
#[derive(Default)]
pub struct RecordingValidator {
    pub seen: RefCell<Vec<String>>,
}

struct MarkerProfile;

impl ProfileHandle for MarkerProfile {
    fn url(&self) -> &str {
        "http://hl7.org/fhir/us/core/StructureDefinition/us-core-patient"
    }

    fn validate(&self, resource: &Value) -> Vec<String> {
        if resource.get("invalid").is_some() {
            vec!["Patient.identifier: minimum required = 1, but only found 0".to_string()]
        } else {
            Vec::new()
        }
    }

    fn warnings(&self) -> Vec<String> {
        vec!["Patient.name: no family name".to_string()]
    }
}

impl Validator for RecordingValidator {
    fn validate(&self, resource: &Value) -> Vec<String> {
        let id = resource.get("id").and_then(Value::as_str).unwrap_or("?");
        self.seen.borrow_mut().push(id.to_string());
        Vec::new()
    }

    fn guess_profile(&self, resource: &Value, _version: FhirVersion) -> Option<Box<dyn ProfileHandle>> {
        (resource.get("resourceType").and_then(Value::as_str) == Some("Patient"))
            .then(|| Box::new(MarkerProfile) as Box<dyn ProfileHandle>)
    }
}

/// Browser automation returning fixed parameters, or failing.
pub struct StubAutomation {
    pub outcome: Result<BTreeMap<String, String>, String>,
    pub scripts: RefCell<Vec<String>>,
}

impl StubAutomation {
    pub fn succeeding(params: &[(&str, &str)]) -> Self {
        Self {
            outcome: Ok(params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()),
            scripts: RefCell::new(Vec::new()),
        }
    }
}

impl LaunchAutomation for StubAutomation {
    fn run_script(
        &self,
        script: &str,
        _redirect_url: Option<&str>,
    ) -> Result<BTreeMap<String, String>, AutomationError> {
        self.scripts.borrow_mut().push(script.to_string());
        self.outcome.clone().map_err(|reason| AutomationError::Script {
            script: script.to_string(),
            reason,
        })
    }
}

pub fn capability_statement() -> Value {
    json!({
        "resourceType": "CapabilityStatement",
        "status": "active",
        "date": "2019-11-01T12:00:00Z",
        "kind": "instance",
        "format": ["json", "xml"],
        "rest": [{
            "mode": "server",
            "resource": [{"type": "Patient"}, {"type": "Observation"}]
        }]
    })
}

pub fn patient(id: &str, version: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "meta": {"versionId": version, "lastUpdated": "2020-01-01T00:00:00Z"},
        "birthDate": "1980-04-02",
        "managingOrganization": {"reference": "Organization/org1"}
    })
}
