use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::method::HttpMethod;
use super::request::RequestRecord;
use super::response::ResponseRecord;

/// Which way a captured request travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Harness to server under test.
    Outbound,
    /// External callback into the harness.
    Inbound,
}

/// Transport-level log entry kept by a client until the runner drains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedExchange {
    /// Self-reported direction; `None` for ordinary client calls.
    pub direction: Option<Direction>,
    pub request: RequestRecord,
    pub response: Option<ResponseRecord>,
}

impl RecordedExchange {
    pub fn outbound(request: RequestRecord, response: ResponseRecord) -> Self {
        Self {
            direction: Some(Direction::Outbound),
            request,
            response: Some(response),
        }
    }
}

/// A request reaching the harness from outside, such as an OAuth redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub body: String,
}

/// A request/response pair attached to a test result. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedExchange {
    pub id: String,
    pub direction: Direction,
    pub request_method: String,
    pub request_url: String,
    /// JSON object of request headers.
    pub request_headers: String,
    pub request_payload: Option<String>,
    pub response_code: Option<u16>,
    /// JSON object of response headers.
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    pub instance_id: String,
    pub timestamp: u64,
}

impl CapturedExchange {
    /// Builds a capture from a transport log entry. `direction` overrides the
    /// entry's own; with neither, the call is treated as outbound.
    pub fn from_record(
        record: &RecordedExchange,
        instance_id: &str,
        direction: Option<Direction>,
    ) -> Self {
        let response = record.response.as_ref();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction: direction.or(record.direction).unwrap_or(Direction::Outbound),
            request_method: record.request.method.as_lowercase(),
            request_url: record.request.url.clone(),
            request_headers: headers_json(&record.request.headers),
            request_payload: record.request.payload.clone(),
            response_code: response.map(|r| r.code),
            response_headers: response.map(|r| headers_json(&r.headers)),
            response_body: response.map(|r| r.body.clone()),
            instance_id: instance_id.to_string(),
            timestamp: current_unix_timestamp(),
        }
    }

    pub fn inbound(
        request: &InboundRequest,
        headers: &BTreeMap<String, String>,
        instance_id: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction: Direction::Inbound,
            request_method: request.method.as_lowercase(),
            request_url: request.url.clone(),
            request_headers: headers_json(headers),
            request_payload: Some(request.body.clone()),
            response_code: None,
            response_headers: None,
            response_body: None,
            instance_id: instance_id.to_string(),
            timestamp: current_unix_timestamp(),
        }
    }
}

fn headers_json(headers: &BTreeMap<String, String>) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_string())
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(direction: Option<Direction>) -> RecordedExchange {
        RecordedExchange {
            direction,
            request: RequestRecord::new(HttpMethod::Get, "https://fhir.example/Patient/1")
                .header("Accept", "application/fhir+json"),
            response: Some(ResponseRecord {
                code: 200,
                headers: BTreeMap::from([("Content-Type".into(), "application/fhir+json".into())]),
                body: "{}".into(),
            }),
        }
    }

    #[test]
    fn override_wins_over_self_reported_direction() {
        let captured = CapturedExchange::from_record(
            &record(Some(Direction::Inbound)),
            "inst-1",
            Some(Direction::Outbound),
        );
        assert_eq!(captured.direction, Direction::Outbound);
    }

    #[test]
    fn self_reported_direction_is_kept() {
        let captured = CapturedExchange::from_record(&record(Some(Direction::Inbound)), "inst-1", None);
        assert_eq!(captured.direction, Direction::Inbound);
        assert_eq!(captured.request_method, "get");
        assert_eq!(captured.response_code, Some(200));
        assert_eq!(captured.request_headers, r#"{"Accept":"application/fhir+json"}"#);
    }

    #[test]
    fn inbound_capture_has_no_response() {
        let request = InboundRequest {
            method: HttpMethod::Get,
            url: "https://harness/redirect?code=abc".into(),
            body: String::new(),
        };
        let captured = CapturedExchange::inbound(&request, &BTreeMap::new(), "inst-1");
        assert_eq!(captured.direction, Direction::Inbound);
        assert!(captured.response_code.is_none());
        assert_eq!(captured.instance_id, "inst-1");
    }
}
