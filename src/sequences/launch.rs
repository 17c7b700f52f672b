//! SMART launches: the standalone and EHR-initiated authorization flows, the
//! redirect callback, and the token exchange.
//!
//! Both flows suspend at the `redirect` endpoint while the browser visits the
//! authorization server. The EHR flow first suspends at `launch` until the
//! EHR opens the app with its `iss` and `launch` parameters.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::http::logged::json_body;
use crate::instance::InstanceContext;
use crate::registry::SequenceBuilder;
use crate::runner::TestContext;
use crate::status::{Signal, TestOutcome};

/// Instance parameter holding the `state` sent with the authorization
/// request, kept on the instance so a resume in another process can check it.
pub const STATE: &str = "state";

const TOKEN_RESPONSE_HEADERS: &str = "token_response_headers";

const STANDALONE_INPUTS: [&str; 7] = [
    "client_id",
    "confidential_client",
    "client_secret",
    "oauth_authorize_endpoint",
    "oauth_token_endpoint",
    "scopes",
    "redirect_uri",
];

const EHR_INPUTS: [&str; 8] = [
    "client_id",
    "confidential_client",
    "client_secret",
    "oauth_authorize_endpoint",
    "oauth_token_endpoint",
    "scopes",
    "initiate_login_uri",
    "redirect_uri",
];

const LAUNCH_OUTPUTS: [&str; 4] = ["token", "id_token", "refresh_token", "patient_id"];

const SCOPES_LINK: &str =
    "http://www.hl7.org/fhir/smart-app-launch/scopes-and-launch-context/index.html#quick-start";

fn client_registered(instance: &dyn InstanceContext) -> bool {
    instance.get("client_id").is_some_and(|id| !id.trim().is_empty())
}

fn required_param<'t>(t: &'t TestContext<'_>, name: &str) -> Result<&'t str, Signal> {
    match t.instance.get(name).filter(|value| !value.trim().is_empty()) {
        Some(value) => Ok(value),
        None => Err(Signal::skip(format!("No {name} provided"))),
    }
}

/// Authorization request URL. `launch` is the EHR's launch context, echoed
/// back to the authorization server.
fn authorize_url(t: &TestContext<'_>, launch: Option<&str>) -> Result<String, Signal> {
    let endpoint = required_param(t, "oauth_authorize_endpoint")?;
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| Signal::assertion(format!("Invalid authorize endpoint `{endpoint}`: {e}")))?;
    let state = t.instance.get(STATE).unwrap_or_default();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", required_param(t, "client_id")?)
            .append_pair("redirect_uri", required_param(t, "redirect_uri")?)
            .append_pair("scope", t.instance.get("scopes").unwrap_or_default());
        if let Some(launch) = launch {
            query.append_pair("launch", launch);
        }
        query
            .append_pair("state", state)
            .append_pair("aud", t.instance.get("url").unwrap_or_default());
    }
    Ok(url.to_string())
}

/// `Authorization` value for a confidential client at the token endpoint.
fn basic_credentials(client_id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{client_id}:{secret}")))
}

/// Which access level a launch must request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeLevel {
    Patient,
    User,
}

impl ScopeLevel {
    fn as_str(self) -> &'static str {
        match self {
            ScopeLevel::Patient => "patient",
            ScopeLevel::User => "user",
        }
    }

    fn launch_scope(self) -> &'static str {
        match self {
            ScopeLevel::Patient => "launch/patient",
            ScopeLevel::User => "launch",
        }
    }
}

fn check_scopes(t: &TestContext<'_>, scopes: &str, level: ScopeLevel) -> TestOutcome {
    let mut remaining: Vec<&str> = scopes.split_whitespace().collect();
    for expected in ["openid", "fhirUser", level.launch_scope(), "offline_access"] {
        t.assert(
            remaining.contains(&expected),
            format!("Scope did not include \"{expected}\""),
        )?;
        remaining.retain(|scope| *scope != expected);
    }
    remaining.retain(|scope| *scope != "online_access");

    let prefix = level.as_str();
    let format = format!("does not follow the format: {prefix}/[ resource | * ].[ read | * ]");
    let mut level_scope_found = false;
    for scope in remaining {
        let Some((scope_level, access)) = scope.split_once('/') else {
            return t.fail(format!("Scope '{scope}' {format}"));
        };
        if scope_level != prefix {
            return t.fail(format!("Scope '{scope}' {format}"));
        }
        let Some((resource, permission)) = access.split_once('.') else {
            return t.fail(format!("Scope '{scope}' {format}"));
        };
        t.assert(
            resource == "*" || resource.chars().next().is_some_and(char::is_uppercase),
            format!("'{resource}' must be either a resource type or '*'"),
        )?;
        t.assert(
            permission == "*" || permission == "read",
            format!("Scope '{scope}' {format}"),
        )?;
        level_scope_found = true;
    }
    t.assert(
        level_scope_found,
        format!("Must contain a {prefix}-level scope in the format: {prefix}/[ resource | * ].[ read | * ]"),
    )
}

fn check_tls(t: &TestContext<'_>) -> TestOutcome {
    for name in ["oauth_authorize_endpoint", "oauth_token_endpoint"] {
        let endpoint = required_param(t, name)?;
        t.assert(
            endpoint.starts_with("https://"),
            format!("{name} `{endpoint}` is not secured by TLS"),
        )?;
    }
    Ok(())
}

fn check_launch_params(t: &TestContext<'_>) -> TestOutcome {
    let iss = t.param("iss").unwrap_or_default();
    t.assert(!iss.is_empty(), "Expected iss to be submitted in launch request")?;
    t.assert(
        t.param("launch").is_some_and(|launch| !launch.is_empty()),
        "Expected launch to be submitted in launch request",
    )?;
    if let Some(url) = t.instance.get("url") {
        t.assert_equal(
            url.trim_end_matches('/'),
            iss.trim_end_matches('/'),
            "iss does not match the FHIR server url",
        )?;
    }
    Ok(())
}

fn request_authorization(t: &mut TestContext<'_>, launch: Option<&str>) -> TestOutcome {
    t.instance.set(STATE, Some(uuid::Uuid::new_v4().to_string()));
    let url = authorize_url(t, launch)?;
    t.redirect(url, "redirect")
}

fn check_callback(t: &TestContext<'_>) -> TestOutcome {
    if let Some(error) = t.param("error") {
        let description = t.param("error_description").unwrap_or("none given");
        return t.fail(format!("Error returned from authorization server: {error} ({description})"));
    }
    t.assert_equal(t.instance.get(STATE), t.param("state"), "State provided in redirect does not match")?;
    t.assert(
        t.param("code").is_some_and(|code| !code.is_empty()),
        "Expected code to be submitted in request",
    )
}

fn exchange_code(t: &mut TestContext<'_>) -> TestOutcome {
    let code = t.param("code").unwrap_or_default().to_string();
    t.skip_if(code.is_empty(), "No authorization code received")?;

    let token_endpoint = required_param(t, "oauth_token_endpoint")?.to_string();
    let redirect_uri = required_param(t, "redirect_uri")?.to_string();
    let client_id = required_param(t, "client_id")?.to_string();
    let confidential = t.instance.get("confidential_client") == Some("true");

    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", redirect_uri.as_str()),
    ];
    let mut headers = BTreeMap::new();
    if confidential {
        let secret = t.instance.get("client_secret").unwrap_or_default();
        headers.insert("Authorization".to_string(), basic_credentials(&client_id, secret));
    } else {
        form.push(("client_id", client_id.as_str()));
    }

    let response = t.rest.post_form(&token_endpoint, &form, &headers)?;
    t.assert_equal(200, response.code, "Bad token response code")?;
    t.scratch.insert(
        TOKEN_RESPONSE_HEADERS,
        serde_json::to_value(&response.headers)?,
    );
    let body = json_body(&response)?;

    let access_token = body.get("access_token").and_then(Value::as_str);
    t.assert(access_token.is_some(), "Token response did not contain access_token")?;
    t.assert(
        body.get("token_type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.eq_ignore_ascii_case("bearer")),
        "Token type must be Bearer",
    )?;

    for (field, param) in [
        ("access_token", "token"),
        ("id_token", "id_token"),
        ("refresh_token", "refresh_token"),
        ("patient", "patient_id"),
    ] {
        if let Some(value) = body.get(field).and_then(Value::as_str) {
            t.instance.set(param, Some(value.to_string()));
        }
    }
    if let Some(token) = access_token {
        t.client.set_bearer_token(token);
    }
    t.scratch.insert("token_response", body);
    Ok(())
}

fn check_token_headers(t: &TestContext<'_>) -> TestOutcome {
    let Some(headers) = t.scratch.get(TOKEN_RESPONSE_HEADERS) else {
        return t.skip("No token response received");
    };
    let header = |name: &str| {
        headers
            .as_object()
            .and_then(|map| map.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)))
            .and_then(|(_, value)| value.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase()
    };
    t.assert(
        header("cache-control").contains("no-store"),
        "Token response must have `Cache-Control: no-store`",
    )?;
    t.assert(
        header("pragma").contains("no-cache"),
        "Token response must have `Pragma: no-cache`",
    )
}

pub fn standalone_launch_sequence() -> SequenceBuilder {
    SequenceBuilder::new("StandaloneLaunchSequence")
        .title("Standalone Launch")
        .description("Demonstrate the SMART standalone launch sequence.")
        .group("Authorization")
        .test_id_prefix("SLS")
        .requires(&STANDALONE_INPUTS)
        .defines(&LAUNCH_OUTPUTS)
        .preconditions("Client must be registered", client_registered)
        .test("OAuth endpoints secured by TLS", |t| {
            t.metadata(|m| {
                m.id("01")
                    .link("https://hl7.org/fhir/smart-app-launch/")
                    .desc("The authorization and token endpoints are only reachable over TLS.");
            })?;
            check_tls(t)
        })
        .test("OAuth server redirects client browser to app redirect URI", |t| {
            t.metadata(|m| {
                m.id("02")
                    .link("http://www.hl7.org/fhir/smart-app-launch/#step-1-app-asks-for-authorization")
                    .desc(
                        "Client browser redirected from the authorization endpoint to the
                         app redirect URI.",
                    );
            })?;
            request_authorization(t, None)
        })
        .test("Client app receives code parameter and correct state parameter", |t| {
            t.metadata(|m| {
                m.id("03")
                    .link("http://www.hl7.org/fhir/smart-app-launch/#step-2-ehr-evaluates-authorization-request-asks-for-end-user-input")
                    .desc("The redirect carries the code and the state sent with the request.");
            })?;
            check_callback(t)
        })
        .test("OAuth token exchange request succeeds when supplied correct information", |t| {
            t.metadata(|m| {
                m.id("04")
                    .link("http://www.hl7.org/fhir/smart-app-launch/#step-3-app-exchanges-authorization-code-for-access-token")
                    .desc("The authorization code is exchanged for an access token.");
            })?;
            exchange_code(t)
        })
        .test("Token response headers disable caching", |t| {
            t.metadata(|m| {
                m.id("05").optional().desc(
                    "The token response carries `Cache-Control: no-store` and
                     `Pragma: no-cache`.",
                );
            })?;
            check_token_headers(t)
        })
}

pub fn onc_standalone_launch_sequence() -> SequenceBuilder {
    SequenceBuilder::new("OncStandaloneLaunchSequence")
        .extends("StandaloneLaunchSequence")
        .title("ONC Standalone Launch")
        .description("Demonstrate the ONC SMART standalone launch sequence.")
        .group("Authorization")
        .test_id_prefix("OSLS")
        .requires(&STANDALONE_INPUTS)
        .defines(&LAUNCH_OUTPUTS)
        .test("Scopes enabling patient-level access with OpenID Connect and refresh token present", |t| {
            t.metadata(|m| {
                m.id("06")
                    .link(SCOPES_LINK)
                    .desc("The requested scopes follow the SMART app launch guidelines.");
            })?;
            let scopes = required_param(t, "scopes")?;
            check_scopes(t, scopes, ScopeLevel::Patient)
        })
}

pub fn ehr_launch_sequence() -> SequenceBuilder {
    SequenceBuilder::new("EhrLaunchSequence")
        .title("EHR Launch")
        .description("Demonstrate the SMART EHR launch sequence.")
        .group("Authorization")
        .test_id_prefix("ELS")
        .requires(&EHR_INPUTS)
        .defines(&LAUNCH_OUTPUTS)
        .preconditions("Client must be registered", client_registered)
        .test("OAuth endpoints secured by TLS", |t| {
            t.metadata(|m| {
                m.id("01")
                    .link("https://hl7.org/fhir/smart-app-launch/")
                    .desc("The authorization and token endpoints are only reachable over TLS.");
            })?;
            check_tls(t)
        })
        .test("EHR server redirects client browser to app launch URI", |t| {
            t.metadata(|m| {
                m.id("02")
                    .link("http://www.hl7.org/fhir/smart-app-launch/#ehr-launch-sequence")
                    .desc("The EHR opens the app's launch URI in the client browser.");
            })?;
            t.wait_at_endpoint("launch")
        })
        .test("EHR provides iss and launch parameter to the launch URI via the client browser querystring", |t| {
            t.metadata(|m| {
                m.id("03")
                    .link("http://www.hl7.org/fhir/smart-app-launch/#ehr-launch-sequence")
                    .desc("The launch request names the FHIR server in `iss` and carries a `launch` context.");
            })?;
            check_launch_params(t)
        })
        .test("OAuth server redirects client browser to app redirect URI", |t| {
            t.metadata(|m| {
                m.id("04")
                    .link("http://www.hl7.org/fhir/smart-app-launch/#step-1-app-asks-for-authorization")
                    .desc(
                        "Client browser redirected from the authorization endpoint to the
                         app redirect URI, with the launch context in the request.",
                    );
            })?;
            let launch = t.param("launch").map(str::to_string);
            t.skip_if(launch.is_none(), "No launch context received")?;
            request_authorization(t, launch.as_deref())
        })
        .test("Client app receives code parameter and correct state parameter", |t| {
            t.metadata(|m| {
                m.id("05")
                    .link("http://www.hl7.org/fhir/smart-app-launch/#step-2-ehr-evaluates-authorization-request-asks-for-end-user-input")
                    .desc("The redirect carries the code and the state sent with the request.");
            })?;
            check_callback(t)
        })
        .test("OAuth token exchange request succeeds when supplied correct information", |t| {
            t.metadata(|m| {
                m.id("06")
                    .link("http://www.hl7.org/fhir/smart-app-launch/#step-3-app-exchanges-authorization-code-for-access-token")
                    .desc("The authorization code is exchanged for an access token.");
            })?;
            exchange_code(t)
        })
        .test("Token response headers disable caching", |t| {
            t.metadata(|m| {
                m.id("07").optional().desc(
                    "The token response carries `Cache-Control: no-store` and
                     `Pragma: no-cache`.",
                );
            })?;
            check_token_headers(t)
        })
}

pub fn onc_ehr_launch_sequence() -> SequenceBuilder {
    SequenceBuilder::new("OncEhrLaunchSequence")
        .extends("EhrLaunchSequence")
        .title("ONC EHR Launch")
        .description("Demonstrate the ONC SMART EHR launch sequence.")
        .group("Authorization")
        .test_id_prefix("OELS")
        .requires(&EHR_INPUTS)
        .defines(&LAUNCH_OUTPUTS)
        .test("Scopes enabling user-level access with OpenID Connect and refresh token present", |t| {
            t.metadata(|m| {
                m.id("08")
                    .link(SCOPES_LINK)
                    .desc("The requested scopes follow the SMART app launch guidelines.");
            })?;
            let scopes = required_param(t, "scopes")?;
            check_scopes(t, scopes, ScopeLevel::User)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{DetachedClient, LoggedRestClient};
    use crate::instance::TestingInstance;
    use crate::runner::Scratch;
    use crate::validation::NullValidator;

    fn outcome_of(instance: &mut TestingInstance, check: impl FnOnce(&TestContext<'_>) -> TestOutcome) -> TestOutcome {
        outcome_with(instance, &[], check)
    }

    fn outcome_with(
        instance: &mut TestingInstance,
        params: &[(&str, &str)],
        check: impl FnOnce(&TestContext<'_>) -> TestOutcome,
    ) -> TestOutcome {
        let mut client = DetachedClient;
        let mut rest = LoggedRestClient::detached();
        let mut scratch = Scratch::default();
        let params: BTreeMap<String, String> =
            params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let t = TestContext::new(instance, &mut client, &mut rest, &NullValidator, &mut scratch, &params);
        check(&t)
    }

    fn message(outcome: TestOutcome) -> Option<String> {
        match outcome {
            Ok(()) => None,
            Err(Signal::Assertion { message, .. }) => Some(message),
            Err(other) => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn accepts_patient_scopes() {
        let mut instance = TestingInstance::new("i1");
        let scopes = "openid fhirUser launch/patient offline_access patient/*.read patient/Observation.read";
        assert_eq!(message(outcome_of(&mut instance, |t| check_scopes(t, scopes, ScopeLevel::Patient))), None);
    }

    #[test]
    fn rejects_malformed_scopes() {
        let mut instance = TestingInstance::new("i1");
        assert_eq!(
            message(outcome_of(&mut instance, |t| check_scopes(t, "openid fhirUser patient/*.read", ScopeLevel::Patient))),
            Some("Scope did not include \"launch/patient\"".to_string())
        );
        assert_eq!(
            message(outcome_of(&mut instance, |t| {
                check_scopes(
                    t,
                    "openid fhirUser launch/patient offline_access user/*.read",
                    ScopeLevel::Patient,
                )
            })),
            Some("Scope 'user/*.read' does not follow the format: patient/[ resource | * ].[ read | * ]".to_string())
        );
        assert_eq!(
            message(outcome_of(&mut instance, |t| {
                check_scopes(t, "openid fhirUser launch/patient offline_access", ScopeLevel::Patient)
            })),
            Some("Must contain a patient-level scope in the format: patient/[ resource | * ].[ read | * ]".to_string())
        );
    }

    #[test]
    fn user_level_scopes_need_the_launch_scope() {
        let mut instance = TestingInstance::new("i1");
        let scopes = "openid fhirUser launch offline_access online_access user/*.read user/Patient.*";
        assert_eq!(
            message(outcome_of(&mut instance, |t| check_scopes(t, scopes, ScopeLevel::User))),
            None
        );
        assert_eq!(
            message(outcome_of(&mut instance, |t| {
                check_scopes(t, "openid fhirUser launch/patient offline_access user/*.read", ScopeLevel::User)
            })),
            Some("Scope did not include \"launch\"".to_string())
        );
        assert_eq!(
            message(outcome_of(&mut instance, |t| {
                check_scopes(t, "openid fhirUser launch offline_access patient/*.read", ScopeLevel::User)
            })),
            Some("Scope 'patient/*.read' does not follow the format: user/[ resource | * ].[ read | * ]".to_string())
        );
    }

    #[test]
    fn launch_request_must_name_this_server() {
        let mut instance = TestingInstance::new("i1").with("url", "https://fhir.example/r4");
        let checked = |instance: &mut TestingInstance, params: &[(&str, &str)]| {
            message(outcome_with(instance, params, check_launch_params))
        };
        assert_eq!(checked(&mut instance, &[("iss", "https://fhir.example/r4/"), ("launch", "xyz")]), None);
        assert_eq!(
            checked(&mut instance, &[("launch", "xyz")]),
            Some("Expected iss to be submitted in launch request".to_string())
        );
        assert_eq!(
            checked(&mut instance, &[("iss", "https://fhir.example/r4")]),
            Some("Expected launch to be submitted in launch request".to_string())
        );
        assert!(
            checked(&mut instance, &[("iss", "https://other.example/r4"), ("launch", "xyz")])
                .is_some_and(|m| m.starts_with("iss does not match the FHIR server url"))
        );
    }

    #[test]
    fn encodes_client_credentials() {
        assert_eq!(basic_credentials("app", "s3cret"), "Basic YXBwOnMzY3JldA==");
    }

    #[test]
    fn builds_authorize_url() {
        let mut instance = TestingInstance::new("i1")
            .with("oauth_authorize_endpoint", "https://auth.example/authorize")
            .with("client_id", "app")
            .with("redirect_uri", "https://harness.example/redirect")
            .with("scopes", "launch/patient openid")
            .with("url", "https://fhir.example/r4")
            .with(STATE, "s1");
        let mut url = String::new();
        outcome_of(&mut instance, |t| {
            url = authorize_url(t, None)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(
            url,
            "https://auth.example/authorize?response_type=code&client_id=app\
             &redirect_uri=https%3A%2F%2Fharness.example%2Fredirect&scope=launch%2Fpatient+openid\
             &state=s1&aud=https%3A%2F%2Ffhir.example%2Fr4"
        );
    }

    #[test]
    fn authorize_url_carries_the_ehr_launch_context() {
        let mut instance = TestingInstance::new("i1")
            .with("oauth_authorize_endpoint", "https://auth.example/authorize")
            .with("client_id", "app")
            .with("redirect_uri", "https://harness.example/redirect")
            .with("scopes", "launch openid")
            .with(STATE, "s1");
        let mut url = String::new();
        outcome_of(&mut instance, |t| {
            url = authorize_url(t, Some("xyz"))?;
            Ok(())
        })
        .unwrap();
        assert!(url.contains("&scope=launch+openid&launch=xyz&state=s1&"), "{url}");
    }
}
