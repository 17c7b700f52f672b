//! FHIR-aware assertions and helpers available to test bodies.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::http::Reply;
use crate::instance::{FhirVersion, ResourceReference};
use crate::path::{resolve_str, walk_references};
use crate::status::{Signal, TestOutcome};

use super::context::TestContext;

/// Pages followed by [`TestContext::get_all_resources`] before giving up.
pub const MAX_PAGES: usize = 20;

static DATETIME: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"^-?[0-9]{4}(-(0[1-9]|1[0-2])(-(0[0-9]|[1-2][0-9]|3[0-1])(T([01][0-9]|2[0-3]):[0-5][0-9]:([0-5][0-9]|60)(\.[0-9]+)?(Z|(\+|-)((0[0-9]|1[0-3]):[0-5][0-9]|14:00)))?)?)?$",
    )
});

/// Whether `value` is a valid FHIR `dateTime`.
pub fn conforms_to_datetime_format(value: &str) -> bool {
    DATETIME
        .as_ref()
        .map(|pattern| pattern.is_match(value))
        .unwrap_or(false)
}

impl TestContext<'_> {
    fn assert_code(&self, reply: &Reply, accepted: &[u16]) -> TestOutcome {
        if accepted.contains(&reply.code) {
            return Ok(());
        }
        let expected = accepted
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        self.fail(format!(
            "Bad response code: expected {expected}, but found {}",
            reply.code
        ))
    }

    pub fn assert_response_ok(&self, reply: &Reply) -> TestOutcome {
        self.assert_code(reply, &[200])
    }

    pub fn assert_response_created(&self, reply: &Reply) -> TestOutcome {
        self.assert_code(reply, &[201])
    }

    pub fn assert_response_unauthorized(&self, reply: &Reply) -> TestOutcome {
        self.assert_code(reply, &[401, 403])
    }

    pub fn assert_response_not_found(&self, reply: &Reply) -> TestOutcome {
        self.assert_code(reply, &[404])
    }

    pub fn assert_bundle_response(&self, reply: &Reply) -> TestOutcome {
        self.assert(
            reply.is_bundle(),
            format!(
                "Expected FHIR Bundle but found: {}",
                reply.resource_type().unwrap_or("non-FHIR content")
            ),
        )
    }

    pub fn assert_resource_type(&self, reply: &Reply, resource_type: &str) -> TestOutcome {
        let found = reply.resource_type();
        self.assert(
            found == Some(resource_type),
            format!(
                "Bad resource type received: expected {resource_type}, but received {}",
                found.unwrap_or("none")
            ),
        )
    }

    /// Searches and asserts the reply is a 200 Bundle.
    pub fn get_resource_by_params(
        &mut self,
        resource_type: &str,
        params: &[(&str, &str)],
    ) -> Result<Reply, Signal> {
        self.assert(!params.is_empty(), "No params for search")?;
        let reply = self.client.search(resource_type, params)?;
        self.assert_response_ok(&reply)?;
        self.assert_bundle_response(&reply)?;
        Ok(reply)
    }

    /// Checks a search reply and returns the number of matching entries.
    ///
    /// Every returned resource of `resource_type` must pass base validation,
    /// and a `patient` parameter must match the resource's subject.
    pub fn validate_search_reply(
        &self,
        resource_type: &str,
        reply: &Reply,
        search_params: &[(&str, &str)],
    ) -> Result<usize, Signal> {
        self.assert_response_ok(reply)?;
        self.assert_bundle_response(reply)?;

        let resources = reply.entry_resources(resource_type);
        for resource in &resources {
            self.assert_valid(resource_type, resource)?;

            if let Some((_, patient)) = search_params.iter().find(|(name, _)| *name == "patient") {
                let subject = resolve_str(resource, "subject.reference")
                    .or_else(|| resolve_str(resource, "patient.reference"))
                    .unwrap_or_default();
                self.assert(
                    subject.ends_with(&format!("Patient/{patient}")) || subject == *patient,
                    format!("{resource_type} does not reference the searched patient {patient}"),
                )?;
            }
        }
        Ok(resources.len())
    }

    /// Checks a read reply and returns the resource.
    pub fn validate_read_reply(&self, reply: &Reply, resource_type: &str) -> Result<Value, Signal> {
        self.assert_response_ok(reply)?;
        self.assert_resource_type(reply, resource_type)?;
        let resource = reply
            .resource
            .clone()
            .ok_or_else(|| Signal::assertion(format!("No {resource_type} resource in reply")))?;
        self.assert(
            resolve_str(&resource, "id").is_some(),
            format!("{resource_type} has no id"),
        )?;
        self.assert_valid(resource_type, &resource)?;
        Ok(resource)
    }

    pub fn validate_vread_reply(&self, reply: &Reply, resource_type: &str) -> Result<Value, Signal> {
        let resource = self.validate_read_reply(reply, resource_type)?;
        self.assert(
            resolve_str(&resource, "meta.versionId").is_some(),
            format!("{resource_type} vread reply has no meta.versionId"),
        )?;
        Ok(resource)
    }

    pub fn validate_history_reply(&self, reply: &Reply, resource_type: &str) -> TestOutcome {
        self.assert_response_ok(reply)?;
        self.assert_bundle_response(reply)?;
        self.assert_equal(Some("history"), reply.bundle_type(), "Expected history Bundle")?;
        let entries = reply.entry_resources(resource_type);
        self.assert(!entries.is_empty(), format!("No {resource_type} entries in history"))?;
        self.check_sort_order(&entries)
    }

    /// History entries must be newest first: by `meta.versionId` when every
    /// entry has a numeric one, otherwise by `meta.lastUpdated`.
    pub fn check_sort_order(&self, entries: &[&Value]) -> TestOutcome {
        let versions: Option<Vec<u64>> = entries
            .iter()
            .map(|entry| resolve_str(entry, "meta.versionId").and_then(|v| v.parse().ok()))
            .collect();

        if let Some(versions) = versions {
            return self.assert(
                versions.windows(2).all(|pair| pair[0] >= pair[1]),
                "Entries are not sorted in descending order of versionId",
            );
        }

        let updated: Vec<&str> = entries
            .iter()
            .filter_map(|entry| resolve_str(entry, "meta.lastUpdated"))
            .collect();
        self.assert(
            updated.len() == entries.len(),
            "Entries have neither a numeric versionId nor lastUpdated",
        )?;
        self.assert(
            updated.windows(2).all(|pair| pair[0] >= pair[1]),
            "Entries are not sorted in descending order of lastUpdated",
        )
    }

    /// Records the id of every `resource_type` entry so later tests can read
    /// them back.
    pub fn save_resource_ids_in_bundle(&mut self, resource_type: &str, reply: &Reply, profile: Option<&str>) {
        let ids: Vec<String> = reply
            .entry_resources(resource_type)
            .into_iter()
            .filter_map(|resource| resolve_str(resource, "id"))
            .map(str::to_string)
            .collect();
        for id in ids {
            self.instance.add_resource_reference(ResourceReference {
                resource_type: resource_type.to_string(),
                resource_id: id,
                profile: profile.map(str::to_string),
            });
        }
    }

    /// Entry resources of `reply` and every following page.
    pub fn get_all_resources(&mut self, reply: Reply) -> Result<Vec<Value>, Signal> {
        let mut resources = Vec::new();
        let mut page = Some(reply);
        let mut pages = 0;
        while let Some(current) = page.take() {
            pages += 1;
            resources.extend(
                current
                    .entries()
                    .into_iter()
                    .filter_map(|entry| entry.get("resource"))
                    .cloned(),
            );
            if pages >= MAX_PAGES {
                tracing::warn!(pages, "stopped following bundle pages");
                break;
            }
            page = self.client.next_page(&current)?;
        }
        Ok(resources)
    }

    /// Bundle `total`, or the entry count when the server omits it.
    pub fn how_many(&self, reply: &Reply) -> usize {
        reply
            .total()
            .and_then(|total| usize::try_from(total).ok())
            .unwrap_or_else(|| reply.entries().len())
    }

    /// Reads back every recorded `resource_type` reference and checks it
    /// against its profile, or only those tagged with `specified_profile`.
    pub fn test_resources_against_profile(
        &mut self,
        resource_type: &str,
        specified_profile: Option<&str>,
    ) -> TestOutcome {
        let references: Vec<ResourceReference> = self
            .instance
            .resource_references()
            .iter()
            .filter(|reference| reference.resource_type == resource_type)
            .filter(|reference| specified_profile.is_none() || reference.profile.as_deref() == specified_profile)
            .cloned()
            .collect();
        self.skip_if(
            references.is_empty(),
            format!("No {resource_type} references found from prior searches"),
        )?;

        let version = self.instance.fhir_version().unwrap_or(FhirVersion::R4);
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for reference in references {
            let reply = self.client.read(resource_type, &reference.resource_id)?;
            let resource = self.validate_read_reply(&reply, resource_type)?;

            match self.validator.guess_profile(&resource, version) {
                Some(profile) => {
                    self.scratch.profiles_encountered.insert(profile.url().to_string());
                    let violations = profile.validate(&resource);
                    if !violations.is_empty() {
                        self.scratch
                            .profiles_failed
                            .entry(profile.url().to_string())
                            .or_default()
                            .push(reference.resource_id.clone());
                    }
                    errors.extend(violations);
                    warnings.extend(profile.warnings());
                }
                None => errors.extend(self.validator.validate(&resource)),
            }
        }

        for warning in warnings {
            self.add_warning(warning);
        }

        if errors.is_empty() {
            return Ok(());
        }
        self.fail_with_details(
            format!("{} {resource_type} validation errors", errors.len()),
            errors.join("\n"),
        )
    }

    /// Reads every relative reference in `resource` and fails listing the
    /// ones the server cannot resolve. Contained (`#`) and absolute references
    /// are left alone.
    pub fn validate_reference_resolutions(&mut self, resource: &Value) -> TestOutcome {
        let mut seen = BTreeSet::new();
        let mut unresolved = Vec::new();

        for (path, reference) in walk_references(resource) {
            if reference.starts_with('#') || reference.contains("://") || !seen.insert(reference.clone()) {
                continue;
            }
            let Some((resource_type, id)) = reference.split_once('/') else {
                unresolved.push(format!("{path}: {reference}"));
                continue;
            };
            let reply = self.client.read(resource_type, id)?;
            if reply.code != 200 || reply.resource_type() != Some(resource_type) {
                unresolved.push(format!("{path}: {reference}"));
            }
        }

        self.assert(
            unresolved.is_empty(),
            format!(
                "The following references failed to resolve: {}",
                unresolved.join(", ")
            ),
        )
    }

    fn assert_valid(&self, resource_type: &str, resource: &Value) -> TestOutcome {
        let errors = self.validator.validate(resource);
        if errors.is_empty() {
            return Ok(());
        }
        self.fail_with_details(
            format!("Invalid {resource_type}: {} errors", errors.len()),
            errors.join("\n"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::json;

    use crate::error::ClientError;
    use crate::http::{FhirClient, LoggedRestClient, RecordedExchange};
    use crate::instance::{InstanceContext, TestingInstance};
    use crate::runner::Scratch;
    use crate::validation::NullValidator;

    /// Serves a fixed set of resources by `Type/id` and chains pages by
    /// their `next` link.
    #[derive(Default)]
    struct FixtureClient {
        resources: BTreeMap<String, Value>,
        pages: BTreeMap<String, Value>,
        reads: Vec<String>,
    }

    impl FhirClient for FixtureClient {
        fn search(&mut self, _: &str, _: &[(&str, &str)]) -> Result<Reply, ClientError> {
            Ok(Reply::new(200, json!({"resourceType": "Bundle", "type": "searchset"})))
        }

        fn read(&mut self, resource_type: &str, id: &str) -> Result<Reply, ClientError> {
            let key = format!("{resource_type}/{id}");
            self.reads.push(key.clone());
            Ok(match self.resources.get(&key) {
                Some(resource) => Reply::new(200, resource.clone()),
                None => Reply::new(404, json!({"resourceType": "OperationOutcome"})),
            })
        }

        fn vread(&mut self, t: &str, id: &str, _: &str) -> Result<Reply, ClientError> {
            self.read(t, id)
        }

        fn history(&mut self, t: &str, id: &str) -> Result<Reply, ClientError> {
            self.read(t, id)
        }

        fn capability_statement(&mut self) -> Result<Reply, ClientError> {
            Err(ClientError::Detached)
        }

        fn read_feed(&mut self, _: &str) -> Result<Reply, ClientError> {
            Err(ClientError::Detached)
        }

        fn next_page(&mut self, reply: &Reply) -> Result<Option<Reply>, ClientError> {
            Ok(reply
                .next_link()
                .and_then(|url| self.pages.get(url))
                .map(|page| Reply::new(200, page.clone())))
        }

        fn set_bearer_token(&mut self, _: &str) {}

        fn set_no_auth(&mut self) {}

        fn requests(&self) -> &[RecordedExchange] {
            &[]
        }

        fn clear_requests(&mut self) {}
    }

    fn with_context<R>(
        client: &mut FixtureClient,
        instance: &mut TestingInstance,
        body: impl FnOnce(&mut TestContext<'_>) -> R,
    ) -> R {
        let mut rest = LoggedRestClient::detached();
        let mut scratch = Scratch::default();
        let params = BTreeMap::new();
        let mut t = TestContext::new(instance, client, &mut rest, &NullValidator, &mut scratch, &params);
        body(&mut t)
    }

    fn message(outcome: TestOutcome) -> String {
        match outcome {
            Err(Signal::Assertion { message, .. }) | Err(Signal::Skip { message, .. }) => message,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn datetime_format() {
        assert!(conforms_to_datetime_format("2019"));
        assert!(conforms_to_datetime_format("2019-03"));
        assert!(conforms_to_datetime_format("2019-03-01T10:00:00Z"));
        assert!(conforms_to_datetime_format("2019-03-01T10:00:00.123+05:30"));
        assert!(!conforms_to_datetime_format("2019-13-01"));
        assert!(!conforms_to_datetime_format("2019-03-01T10:00:00"));
        assert!(!conforms_to_datetime_format("yesterday"));
    }

    #[test]
    fn response_code_messages() {
        let mut client = FixtureClient::default();
        let mut instance = TestingInstance::new("i1");
        with_context(&mut client, &mut instance, |t| {
            let reply = Reply::new(200, json!({"resourceType": "Patient"}));
            assert!(t.assert_response_ok(&reply).is_ok());
            assert_eq!(
                message(t.assert_response_unauthorized(&reply)),
                "Bad response code: expected 401 or 403, but found 200"
            );
            assert_eq!(
                message(t.assert_bundle_response(&reply)),
                "Expected FHIR Bundle but found: Patient"
            );
            assert!(t.assert_resource_type(&reply, "Patient").is_ok());
        });
    }

    #[test]
    fn search_requires_params() {
        let mut client = FixtureClient::default();
        let mut instance = TestingInstance::new("i1");
        with_context(&mut client, &mut instance, |t| {
            let outcome = t.get_resource_by_params("Goal", &[]).map(|_| ());
            assert_eq!(message(outcome), "No params for search");
            assert!(t.get_resource_by_params("Goal", &[("patient", "1")]).is_ok());
        });
    }

    #[test]
    fn search_reply_must_match_patient() {
        let mut client = FixtureClient::default();
        let mut instance = TestingInstance::new("i1");
        let reply = Reply::new(
            200,
            json!({
                "resourceType": "Bundle",
                "type": "searchset",
                "entry": [
                    {"resource": {"resourceType": "Goal", "id": "g1", "subject": {"reference": "Patient/1"}}},
                    {"resource": {"resourceType": "Goal", "id": "g2", "subject": {"reference": "Patient/2"}}}
                ]
            }),
        );
        with_context(&mut client, &mut instance, |t| {
            let outcome = t.validate_search_reply("Goal", &reply, &[("patient", "1")]).map(|_| ());
            assert_eq!(message(outcome), "Goal does not reference the searched patient 1");
            assert_eq!(t.validate_search_reply("Goal", &reply, &[]).ok(), Some(2));
            t.save_resource_ids_in_bundle("Goal", &reply, None);
        });
        let ids: Vec<&str> = instance
            .resource_references()
            .iter()
            .map(|reference| reference.resource_id.as_str())
            .collect();
        assert_eq!(ids, vec!["g1", "g2"]);
    }

    #[test]
    fn sort_order_prefers_version_ids() {
        let mut client = FixtureClient::default();
        let mut instance = TestingInstance::new("i1");
        let newest_first = [json!({"meta": {"versionId": "3"}}), json!({"meta": {"versionId": "1"}})];
        let oldest_first = [
            json!({"meta": {"lastUpdated": "2019-01-01T00:00:00Z"}}),
            json!({"meta": {"lastUpdated": "2020-01-01T00:00:00Z"}}),
        ];
        with_context(&mut client, &mut instance, |t| {
            assert!(t.check_sort_order(&newest_first.iter().collect::<Vec<_>>()).is_ok());
            assert_eq!(
                message(t.check_sort_order(&oldest_first.iter().collect::<Vec<_>>())),
                "Entries are not sorted in descending order of lastUpdated"
            );
        });
    }

    #[test]
    fn follows_pages() {
        let mut client = FixtureClient::default();
        client.pages.insert(
            "https://fhir.example/Goal?page=2".into(),
            json!({"resourceType": "Bundle", "entry": [{"resource": {"id": "b"}}]}),
        );
        let first = Reply::new(
            200,
            json!({
                "resourceType": "Bundle",
                "total": 7,
                "entry": [{"resource": {"id": "a"}}],
                "link": [{"relation": "next", "url": "https://fhir.example/Goal?page=2"}]
            }),
        );
        let mut instance = TestingInstance::new("i1");
        with_context(&mut client, &mut instance, |t| {
            assert_eq!(t.how_many(&first), 7);
            let all = t.get_all_resources(first.clone()).unwrap();
            assert_eq!(all.len(), 2);
        });
    }

    #[test]
    fn reference_resolution_lists_failures() {
        let mut client = FixtureClient::default();
        client
            .resources
            .insert("Patient/1".into(), json!({"resourceType": "Patient", "id": "1"}));
        let goal = json!({
            "resourceType": "Goal",
            "subject": {"reference": "Patient/1"},
            "addresses": [{"reference": "Condition/missing"}],
            "note": [{"authorReference": {"reference": "#local"}}]
        });
        let mut instance = TestingInstance::new("i1");
        with_context(&mut client, &mut instance, |t| {
            assert_eq!(
                message(t.validate_reference_resolutions(&goal)),
                "The following references failed to resolve: addresses.0: Condition/missing"
            );
        });
        assert_eq!(client.reads, vec!["Condition/missing", "Patient/1"]);
    }

    #[test]
    fn profile_check_skips_without_references() {
        let mut client = FixtureClient::default();
        let mut instance = TestingInstance::new("i1");
        with_context(&mut client, &mut instance, |t| {
            assert_eq!(
                message(t.test_resources_against_profile("Patient", None)),
                "No Patient references found from prior searches"
            );
        });
    }
}
