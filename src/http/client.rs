use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::HttpConfig;
use crate::error::ClientError;

use super::exchange::RecordedExchange;
use super::method::HttpMethod;
use super::reply::Reply;
use super::request::RequestRecord;
use super::response::ResponseRecord;

/// The operations a test body may perform against the server under test.
///
/// Every call is appended to a request log that the runner drains after each
/// test and resets before the next one.
pub trait FhirClient {
    fn search(&mut self, resource_type: &str, params: &[(&str, &str)]) -> Result<Reply, ClientError>;

    fn read(&mut self, resource_type: &str, id: &str) -> Result<Reply, ClientError>;

    fn vread(&mut self, resource_type: &str, id: &str, version_id: &str) -> Result<Reply, ClientError>;

    fn history(&mut self, resource_type: &str, id: &str) -> Result<Reply, ClientError>;

    fn capability_statement(&mut self) -> Result<Reply, ClientError>;

    /// Unfiltered type-level read, `GET [base]/[type]`.
    fn read_feed(&mut self, resource_type: &str) -> Result<Reply, ClientError>;

    /// Follows `link[relation=next]`; `None` on the last page.
    fn next_page(&mut self, reply: &Reply) -> Result<Option<Reply>, ClientError>;

    fn set_bearer_token(&mut self, token: &str);

    /// Drops authorization, for negative tests.
    fn set_no_auth(&mut self);

    fn requests(&self) -> &[RecordedExchange];

    fn clear_requests(&mut self);

    fn is_connected(&self) -> bool {
        true
    }
}

/// A client with no server behind it. Every call fails with
/// [`ClientError::Detached`] and nothing is logged.
#[derive(Debug, Default)]
pub struct DetachedClient;

impl FhirClient for DetachedClient {
    fn search(&mut self, _: &str, _: &[(&str, &str)]) -> Result<Reply, ClientError> {
        Err(ClientError::Detached)
    }

    fn read(&mut self, _: &str, _: &str) -> Result<Reply, ClientError> {
        Err(ClientError::Detached)
    }

    fn vread(&mut self, _: &str, _: &str, _: &str) -> Result<Reply, ClientError> {
        Err(ClientError::Detached)
    }

    fn history(&mut self, _: &str, _: &str) -> Result<Reply, ClientError> {
        Err(ClientError::Detached)
    }

    fn capability_statement(&mut self) -> Result<Reply, ClientError> {
        Err(ClientError::Detached)
    }

    fn read_feed(&mut self, _: &str) -> Result<Reply, ClientError> {
        Err(ClientError::Detached)
    }

    fn next_page(&mut self, _: &Reply) -> Result<Option<Reply>, ClientError> {
        Err(ClientError::Detached)
    }

    fn set_bearer_token(&mut self, _: &str) {}

    fn set_no_auth(&mut self) {}

    fn requests(&self) -> &[RecordedExchange] {
        &[]
    }

    fn clear_requests(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }
}

/// Blocking reqwest-backed FHIR REST client.
pub struct RestFhirClient {
    base_url: String,
    http: reqwest::blocking::Client,
    accept: String,
    bearer_token: Option<String>,
    requests: Vec<RecordedExchange>,
}

impl RestFhirClient {
    pub fn new(base_url: &str, options: &HttpConfig) -> Result<Self, ClientError> {
        reqwest::Url::parse(base_url).map_err(|e| ClientError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        let mut builder =
            reqwest::blocking::Client::builder().redirect(reqwest::redirect::Policy::limited(10));

        if let Some(ms) = options.timeout_ms {
            if ms > 0 {
                builder = builder.timeout(Duration::from_millis(ms));
            }
        }

        if !options.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| ClientError::Request(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            accept: options.accept.clone(),
            bearer_token: None,
            requests: Vec::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<String, ClientError> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut url = reqwest::Url::parse(&raw).map_err(|e| ClientError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        if !params.is_empty() {
            let mut query_pairs = url.query_pairs_mut();
            for (key, value) in params {
                query_pairs.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    fn get(&mut self, url: String) -> Result<Reply, ClientError> {
        let mut request = RequestRecord::new(HttpMethod::Get, url).header("Accept", self.accept.clone());
        if let Some(token) = &self.bearer_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = self
            .http
            .request(request.method.into(), &request.url)
            .headers(build_headers(&request.headers)?)
            .send()?;

        let code = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.text()?;

        let response = ResponseRecord {
            code,
            headers,
            body,
        };
        tracing::debug!(url = %request.url, code, "fhir request");
        self.requests
            .push(RecordedExchange::outbound(request, response.clone()));

        Ok(Reply::from(response))
    }
}

impl FhirClient for RestFhirClient {
    fn search(&mut self, resource_type: &str, params: &[(&str, &str)]) -> Result<Reply, ClientError> {
        let url = self.url(resource_type, params)?;
        self.get(url)
    }

    fn read(&mut self, resource_type: &str, id: &str) -> Result<Reply, ClientError> {
        let url = self.url(&format!("{resource_type}/{id}"), &[])?;
        self.get(url)
    }

    fn vread(&mut self, resource_type: &str, id: &str, version_id: &str) -> Result<Reply, ClientError> {
        let url = self.url(&format!("{resource_type}/{id}/_history/{version_id}"), &[])?;
        self.get(url)
    }

    fn history(&mut self, resource_type: &str, id: &str) -> Result<Reply, ClientError> {
        let url = self.url(&format!("{resource_type}/{id}/_history"), &[])?;
        self.get(url)
    }

    fn capability_statement(&mut self) -> Result<Reply, ClientError> {
        let url = self.url("metadata", &[])?;
        self.get(url)
    }

    fn read_feed(&mut self, resource_type: &str) -> Result<Reply, ClientError> {
        let url = self.url(resource_type, &[])?;
        self.get(url)
    }

    fn next_page(&mut self, reply: &Reply) -> Result<Option<Reply>, ClientError> {
        match reply.next_link() {
            Some(next) => self.get(next.to_string()).map(Some),
            None => Ok(None),
        }
    }

    fn set_bearer_token(&mut self, token: &str) {
        self.bearer_token = Some(token.to_string());
    }

    fn set_no_auth(&mut self) {
        self.bearer_token = None;
    }

    fn requests(&self) -> &[RecordedExchange] {
        &self.requests
    }

    fn clear_requests(&mut self) {
        self.requests.clear();
    }
}

pub(crate) fn build_headers(input: &BTreeMap<String, String>) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();

    for (key, value) in input {
        if key.is_empty() {
            continue;
        }

        let header_name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|err| ClientError::Header(format!("{key}: {err}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|err| ClientError::Header(format!("{key}: {err}")))?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

pub(crate) fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected = BTreeMap::new();
    for (name, value) in headers {
        let value = value.to_str().unwrap_or("<binary>");
        collected.insert(name.to_string(), value.to_string());
    }
    collected
}
