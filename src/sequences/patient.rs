//! Patient read, version and history checks against an authorized server.

use serde_json::Value;

use crate::instance::ResourceReference;
use crate::path::resolve_str;
use crate::registry::SequenceBuilder;
use crate::runner::{TestContext, conforms_to_datetime_format};
use crate::status::Signal;

const PATIENT: &str = "patient";

fn patient_id(t: &TestContext<'_>) -> Result<String, Signal> {
    t.instance
        .get("patient_id")
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| Signal::skip("No patient id provided"))
}

fn read_patient(t: &TestContext<'_>) -> Result<Value, Signal> {
    t.scratch
        .get(PATIENT)
        .cloned()
        .ok_or_else(|| Signal::skip("Patient was not read successfully"))
}

pub fn patient_read_sequence() -> SequenceBuilder {
    SequenceBuilder::new("PatientReadSequence")
        .title("Patient Read")
        .description("Verify that the server returns the authorized patient.")
        .group("Data Access")
        .test_id_prefix("PAT")
        .requires(&["token", "patient_id"])
        .conformance_supports(&["Patient"])
        .show_uris()
        .test("Server rejects Patient read without authorization", |t| {
            t.metadata(|m| {
                m.id("01")
                    .link("http://hl7.org/fhir/smart-app-launch/")
                    .desc("A Patient read without a bearer token is rejected.");
            })?;
            let id = patient_id(t)?;
            let token = t.instance.token().map(str::to_string);
            t.skip_if(token.is_none(), "No bearer token to withhold")?;

            t.client.set_no_auth();
            let reply = t.client.read("Patient", &id);
            if let Some(token) = &token {
                t.client.set_bearer_token(token);
            }
            t.assert_response_unauthorized(&reply?)
        })
        .test("Server returns expected results from Patient read", |t| {
            t.metadata(|m| {
                m.id("02")
                    .link("https://www.hl7.org/fhir/http.html#read")
                    .desc("The authorized patient can be read and is a valid Patient.");
            })?;
            let id = patient_id(t)?;
            let reply = t.client.read("Patient", &id)?;
            let patient = t.validate_read_reply(&reply, "Patient")?;
            t.assert_equal(Some(id.as_str()), resolve_str(&patient, "id"), "Server returned wrong Patient")?;
            t.instance.add_resource_reference(ResourceReference {
                resource_type: "Patient".to_string(),
                resource_id: id,
                profile: None,
            });
            t.scratch.insert(PATIENT, patient);
            Ok(())
        })
        .test("Server returns Patient version with vread", |t| {
            t.metadata(|m| {
                m.id("03")
                    .optional()
                    .link("https://www.hl7.org/fhir/http.html#vread")
                    .desc("The current version of the patient can be read back with vread.");
            })?;
            let patient = read_patient(t)?;
            let id = patient_id(t)?;
            let Some(version) = resolve_str(&patient, "meta.versionId") else {
                return t.skip("Patient has no meta.versionId");
            };
            let reply = t.client.vread("Patient", &id, version)?;
            t.validate_vread_reply(&reply, "Patient")?;
            Ok(())
        })
        .test("Server returns Patient history", |t| {
            t.metadata(|m| {
                m.id("04")
                    .optional()
                    .link("https://www.hl7.org/fhir/http.html#history")
                    .desc("The patient's history is a history Bundle, newest version first.");
            })?;
            let id = patient_id(t)?;
            let reply = t.client.history("Patient", &id)?;
            t.validate_history_reply(&reply, "Patient")
        })
        .test("Patient conforms to its profile", |t| {
            t.metadata(|m| {
                m.id("05")
                    .link("https://www.hl7.org/fhir/patient.html")
                    .desc("Every Patient read so far validates against the profile it claims.");
            })?;
            t.test_resources_against_profile("Patient", None)
        })
        .test("Patient references resolve", |t| {
            t.metadata(|m| {
                m.id("06")
                    .optional()
                    .desc("Every relative reference in the patient can be read from the server.");
            })?;
            let patient = read_patient(t)?;
            t.validate_reference_resolutions(&patient)
        })
        .test("Patient birth date is well formed", |t| {
            t.metadata(|m| {
                m.id("07")
                    .reference("https://www.hl7.org/fhir/datatypes.html#date")
                    .desc("A birthDate, when present, is a valid FHIR date.");
            })?;
            let patient = read_patient(t)?;
            let Some(birth_date) = resolve_str(&patient, "birthDate") else {
                return t.skip("Patient has no birthDate");
            };
            t.assert(
                !birth_date.contains('T') && conforms_to_datetime_format(birth_date),
                format!("Patient birthDate {birth_date:?} is not a valid date"),
            )
        })
}
