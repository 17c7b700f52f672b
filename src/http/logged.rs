use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::config::HttpConfig;
use crate::error::ClientError;

use super::client::{build_headers, collect_headers};
use super::exchange::{Direction, RecordedExchange};
use super::method::HttpMethod;
use super::request::RequestRecord;
use super::response::ResponseRecord;

/// Sends one raw request. Abstracted so tests can stub the wire.
pub trait RestTransport {
    fn execute(&self, request: &RequestRecord) -> Result<ResponseRecord, ClientError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(options: &HttpConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::blocking::Client::builder();
        if let Some(ms) = options.timeout_ms.filter(|ms| *ms > 0) {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if !options.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| ClientError::Request(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl RestTransport for ReqwestTransport {
    fn execute(&self, request: &RequestRecord) -> Result<ResponseRecord, ClientError> {
        let mut builder = self
            .client
            .request(request.method.into(), &request.url)
            .headers(build_headers(&request.headers)?);
        if let Some(payload) = &request.payload {
            builder = builder.body(payload.clone());
        }

        let response = builder.send()?;
        let code = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.text()?;
        Ok(ResponseRecord {
            code,
            headers,
            body,
        })
    }
}

/// Transport with nothing behind it; every call fails with
/// [`ClientError::Detached`].
#[derive(Debug, Default)]
pub struct DetachedTransport;

impl RestTransport for DetachedTransport {
    fn execute(&self, _request: &RequestRecord) -> Result<ResponseRecord, ClientError> {
        Err(ClientError::Detached)
    }
}

/// Raw REST access for tests that talk to endpoints other than the FHIR
/// server, such as an OAuth token endpoint. Every call is logged alongside
/// the FHIR client's own log and captured on the test result.
pub struct LoggedRestClient {
    transport: Box<dyn RestTransport>,
    log: Vec<RecordedExchange>,
}

impl LoggedRestClient {
    pub fn new(transport: Box<dyn RestTransport>) -> Self {
        Self {
            transport,
            log: Vec::new(),
        }
    }

    pub fn detached() -> Self {
        Self::new(Box::new(DetachedTransport))
    }

    pub fn execute(&mut self, request: RequestRecord) -> Result<ResponseRecord, ClientError> {
        let response = self.transport.execute(&request);
        let logged = response.as_ref().ok().cloned();
        tracing::debug!(method = %request.method, url = %request.url, ok = logged.is_some(), "logged rest call");
        self.log.push(RecordedExchange {
            direction: Some(Direction::Outbound),
            request,
            response: logged,
        });
        response
    }

    pub fn get(
        &mut self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ResponseRecord, ClientError> {
        let mut request = RequestRecord::new(HttpMethod::Get, url);
        request.headers = headers.clone();
        self.execute(request)
    }

    /// POSTs `form` as `application/x-www-form-urlencoded`.
    pub fn post_form(
        &mut self,
        url: &str,
        form: &[(&str, &str)],
        headers: &BTreeMap<String, String>,
    ) -> Result<ResponseRecord, ClientError> {
        let mut request = RequestRecord::new(HttpMethod::Post, url)
            .payload(encode_form(form))
            .header("Content-Type", "application/x-www-form-urlencoded");
        request.headers.extend(headers.clone());
        self.execute(request)
    }

    /// Logs an exchange that did not go through this client, keeping its
    /// self-reported direction.
    pub fn record(&mut self, exchange: RecordedExchange) {
        self.log.push(exchange);
    }

    pub fn requests(&self) -> &[RecordedExchange] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

/// Parses a response body as JSON, as token endpoints return.
pub fn json_body(response: &ResponseRecord) -> Result<Value, serde_json::Error> {
    serde_json::from_str(&response.body)
}

fn encode_form(form: &[(&str, &str)]) -> String {
    let Ok(mut url) = reqwest::Url::parse("http://form.invalid/") else {
        return String::new();
    };
    url.query_pairs_mut().extend_pairs(form);
    url.query().unwrap_or_default().to_string()
}
