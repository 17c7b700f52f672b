use std::collections::BTreeMap;

use serde_json::Value;

use super::response::ResponseRecord;

/// A server reply, with the body parsed as a FHIR resource when it is JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub resource: Option<Value>,
}

impl Reply {
    pub fn new(code: u16, resource: Value) -> Self {
        Self {
            code,
            headers: BTreeMap::new(),
            body: resource.to_string(),
            resource: Some(resource),
        }
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.resource
            .as_ref()
            .and_then(|resource| resource.get("resourceType"))
            .and_then(Value::as_str)
    }

    pub fn is_bundle(&self) -> bool {
        self.resource_type() == Some("Bundle")
    }

    /// The `type` of a Bundle reply, e.g. `searchset` or `history`.
    pub fn bundle_type(&self) -> Option<&str> {
        if !self.is_bundle() {
            return None;
        }
        self.resource
            .as_ref()
            .and_then(|resource| resource.get("type"))
            .and_then(Value::as_str)
    }

    /// Bundle entries; empty for non-bundles.
    pub fn entries(&self) -> Vec<&Value> {
        self.resource
            .as_ref()
            .filter(|_| self.is_bundle())
            .and_then(|resource| resource.get("entry"))
            .and_then(Value::as_array)
            .map(|entries| entries.iter().collect())
            .unwrap_or_default()
    }

    /// Resources of the given type carried by the bundle entries.
    pub fn entry_resources(&self, resource_type: &str) -> Vec<&Value> {
        self.entries()
            .into_iter()
            .filter_map(|entry| entry.get("resource"))
            .filter(|resource| {
                resource.get("resourceType").and_then(Value::as_str) == Some(resource_type)
            })
            .collect()
    }

    pub fn total(&self) -> Option<u64> {
        self.resource
            .as_ref()
            .and_then(|resource| resource.get("total"))
            .and_then(Value::as_u64)
    }

    /// Absolute URL of the next page, from `link[relation=next]`.
    pub fn next_link(&self) -> Option<&str> {
        self.resource
            .as_ref()?
            .get("link")?
            .as_array()?
            .iter()
            .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
            .get("url")?
            .as_str()
    }
}

impl From<ResponseRecord> for Reply {
    fn from(response: ResponseRecord) -> Self {
        let resource = serde_json::from_str::<Value>(&response.body)
            .ok()
            .filter(Value::is_object);
        Self {
            code: response.code,
            headers: response.headers,
            body: response.body,
            resource,
        }
    }
}
