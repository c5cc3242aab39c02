use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::TransportError;

/// Latest usage of one resource instance up to `:end`
pub const FETCH_USAGE_PATH: &str = "/v1/metering/organizations/:organization_id/spaces/:space_id/consumers/:consumer_id/resources/:resource_id/resource_instances/:resource_instance_id/usage?end=:end";

/// Usage submission endpoint of the collector
pub const SUBMIT_USAGE_PATH: &str = "/v1/metering/collected/usage";

/// Concurrency limits a transport imposes on its callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    /// Minimum spacing between two outgoing calls, in milliseconds
    pub delay_ms: u64,
    /// Maximum number of records dispatched together
    pub max_batch: usize,
    /// Maximum number of calls in flight
    pub max_calls: usize,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            delay_ms: 20,
            max_batch: 10,
            max_calls: 100,
        }
    }
}

impl ThrottlePolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Template parameters, credentials and body of a collector call
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub params: BTreeMap<String, String>,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn authorization(mut self, authorization: Option<String>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Status, headers (lower-cased names) and JSON body of a collector answer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectorResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl CollectorResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Where the collector stored an accepted submission
    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// HTTP access to the usage collector.
///
/// Implementations already apply batching, throttling, retries and circuit
/// breaking: a returned error means the call failed for good.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, uri: &str, options: &RequestOptions) -> Result<CollectorResponse, TransportError>;

    async fn post(&self, uri: &str, options: &RequestOptions) -> Result<CollectorResponse, TransportError>;

    fn policy(&self) -> ThrottlePolicy {
        ThrottlePolicy::default()
    }
}

/// Replaces every `:name` placeholder of `template` with the percent-encoded
/// value of the matching parameter
pub fn expand_uri(template: &str, params: &BTreeMap<String, String>) -> Result<String, TransportError> {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(index) = rest.find(':') {
        expanded.push_str(&rest[..index]);
        let after = &rest[index + 1..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());

        // scheme separators and ports are not placeholders
        let starts_name = after
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
        if name_len == 0 || !starts_name {
            expanded.push(':');
            rest = after;
            continue;
        }

        let name = &after[..name_len];
        let value = params
            .get(name)
            .ok_or_else(|| TransportError::InvalidUri(format!("missing parameter {name} in {template}")))?;
        expanded.push_str(&urlencoding::encode(value));
        rest = &after[name_len..];
    }
    expanded.push_str(rest);

    Ok(expanded)
}
