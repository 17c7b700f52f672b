//! Server connection and capability statement checks.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::instance::FhirVersion;
use crate::path::resolve_str;
use crate::registry::SequenceBuilder;
use crate::runner::{TestContext, conforms_to_datetime_format};
use crate::status::Signal;

/// Scratch key holding the capability statement fetched by `CONN-02`.
pub const CAPABILITY_STATEMENT: &str = "capability_statement";

static SERVER_URL: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^https?://(www\.)?[-a-zA-Z0-9]{2,256}(\.[a-zA-Z]{2,256})*(:[0-9]{1,5})?(/[^/]+)*/?$")
});

fn is_server_url(url: &str) -> bool {
    SERVER_URL
        .as_ref()
        .map(|pattern| pattern.is_match(url))
        .unwrap_or(false)
}

fn capability_statement(t: &TestContext<'_>) -> Result<Value, Signal> {
    t.scratch
        .get(CAPABILITY_STATEMENT)
        .cloned()
        .ok_or_else(|| Signal::skip("No capability statement retrieved"))
}

pub fn connection_sequence() -> SequenceBuilder {
    SequenceBuilder::new("ConnectionSequence")
        .title("Server Connection")
        .description("Verify that the FHIR server is reachable and describes itself.")
        .group("Discovery")
        .test_id_prefix("CONN")
        .requires(&["url"])
        .defines(&["server_resources"])
        .test("Valid URL", |t| {
            t.metadata(|m| {
                m.id("01").desc(
                    "Tests that the provided URL is actually a url that could point to a
                     FHIR server.",
                );
            })?;
            let url = t.instance.get("url").unwrap_or_default();
            t.assert(
                is_server_url(url),
                "URL is not viable, check that you input it correctly",
            )
        })
        .test("Capability statement retrieved", |t| {
            t.metadata(|m| {
                m.id("02")
                    .link("https://www.hl7.org/fhir/http.html#capabilities")
                    .desc("The server returns its capability statement from `[base]/metadata`.");
            })?;
            let reply = t.client.capability_statement()?;
            t.assert_response_ok(&reply)?;
            let expected = match t.instance.fhir_version() {
                Some(FhirVersion::Dstu2) => "Conformance",
                _ => "CapabilityStatement",
            };
            t.assert_resource_type(&reply, expected)?;
            if let Some(resource) = reply.resource {
                t.scratch.insert(CAPABILITY_STATEMENT, resource);
            }
            Ok(())
        })
        .test("JSON format supported", |t| {
            t.metadata(|m| {
                m.id("03").optional().desc(
                    "The capability statement lists a JSON mime type among its formats.",
                );
            })?;
            let capability = capability_statement(t)?;
            let formats: Vec<&str> = capability
                .get("format")
                .and_then(Value::as_array)
                .map(|formats| formats.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            t.warn(|t| {
                t.assert(
                    formats.iter().any(|format| format.contains("json")),
                    "Capability statement does not declare a JSON format",
                )
            })
        })
        .test("Capability statement has valid date", |t| {
            t.metadata(|m| {
                m.id("04")
                    .link("https://www.hl7.org/fhir/datatypes.html#dateTime")
                    .desc("The capability statement has exactly one valid date.");
            })?;
            let capability = capability_statement(t)?;
            let date = resolve_str(&capability, "date");
            t.assert(date.is_some(), "Capability statement date is missing")?;
            let date = date.unwrap_or_default();
            t.assert(
                conforms_to_datetime_format(date),
                format!("Capability statement date is {date:?}, not a valid dateTime"),
            )
        })
        .test("Supported resources recorded", |t| {
            t.metadata(|m| {
                m.id("05").desc(
                    "Records the resource types the server declares in its REST
                     capabilities for later sequences.",
                );
            })?;
            let capability = capability_statement(t)?;
            let resources: Vec<String> = capability
                .get("rest")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|rest| rest.get("resource").and_then(Value::as_array))
                .flatten()
                .filter_map(|resource| resolve_str(resource, "type"))
                .map(str::to_string)
                .collect();
            t.assert(
                !resources.is_empty(),
                "Capability statement declares no supported resources",
            )?;
            t.instance.set("server_resources", Some(resources.join(",")));
            Ok(())
        })
}
