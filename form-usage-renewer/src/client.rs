use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    config::ClientSettings,
    errors::TransportError,
    retry::{with_retry, RetryConfig},
    throttle::Throttle,
    transport::{expand_uri, CollectorResponse, RequestOptions, ThrottlePolicy, Transport},
};

/// Resilient HTTP client of the usage collector
#[derive(Clone)]
pub struct CollectorClient {
    client: Client,
    base_url: String,
    retry_config: RetryConfig,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    throttle: Throttle,
}

impl CollectorClient {
    /// Creates a client with default retry and throttle settings and no circuit breaker
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_settings(base_url, &ClientSettings::default())
    }

    /// Creates a client from deployment settings, circuit breaker included
    pub fn from_settings(base_url: impl Into<String>, settings: &ClientSettings) -> Result<Self, TransportError> {
        Ok(Self::with_settings(base_url, settings)?.with_circuit_breaker(settings.circuit_breaker_config()))
    }

    fn with_settings(base_url: impl Into<String>, settings: &ClientSettings) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(settings.timeout()).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry_config: settings.retry_config(),
            circuit_breaker: None,
            throttle: Throttle::new(settings.throttle.clone()),
        })
    }

    /// Sets a custom retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Sets a circuit breaker with custom configuration
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(Arc::new(CircuitBreaker::new(config)));
        self
    }

    pub fn with_default_circuit_breaker(self) -> Self {
        self.with_circuit_breaker(CircuitBreakerConfig::default())
    }

    pub fn with_throttle_policy(mut self, policy: ThrottlePolicy) -> Self {
        self.throttle = Throttle::new(policy);
        self
    }

    fn resolve(&self, uri: &str, options: &RequestOptions) -> Result<String, TransportError> {
        let expanded = expand_uri(uri, &options.params)?;
        if expanded.starts_with("http://") || expanded.starts_with("https://") {
            Ok(expanded)
        } else {
            Ok(format!("{}{}", self.base_url, expanded))
        }
    }

    /// Sends a request through the throttle, retry policy and circuit breaker.
    ///
    /// Server errors are retried; once retries are exhausted the last server
    /// error response is returned like any other response.
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        options: &RequestOptions,
    ) -> Result<CollectorResponse, TransportError> {
        let url = self.resolve(uri, options)?;

        if let Some(ref cb) = self.circuit_breaker {
            if !cb.allow_request().await {
                return Err(TransportError::CircuitBreakerOpen);
            }
        }

        let _permit = self.throttle.acquire().await?;

        let result = with_retry(
            || self.call_without_retry(method.clone(), &url, options),
            &self.retry_config,
        )
        .await;

        if let Some(ref cb) = self.circuit_breaker {
            match &result {
                Ok(_) => cb.record_success().await,
                Err(_) => cb.record_failure().await,
            }
        }

        match result {
            Err(TransportError::ServerStatus(response)) => {
                log::warn!("{method} {url} answered {} after retries", response.status);
                Ok(response)
            }
            other => other,
        }
    }

    async fn call_without_retry(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<CollectorResponse, TransportError> {
        let mut request = self.client.request(method, url);
        if let Some(authorization) = &options.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        let response = CollectorResponse { status, headers, body };
        if response.is_server_error() {
            return Err(TransportError::ServerStatus(response));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for CollectorClient {
    async fn get(&self, uri: &str, options: &RequestOptions) -> Result<CollectorResponse, TransportError> {
        self.call(Method::GET, uri, options).await
    }

    async fn post(&self, uri: &str, options: &RequestOptions) -> Result<CollectorResponse, TransportError> {
        self.call(Method::POST, uri, options).await
    }

    fn policy(&self) -> ThrottlePolicy {
        self.throttle.policy().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::transport::SUBMIT_USAGE_PATH;
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_get_expands_template_and_sends_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/usage/app-1")
            .match_header("authorization", "Bearer token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"start":1476878391000}"#)
            .create_async()
            .await;

        let client = CollectorClient::new(server.url()).unwrap().with_retry_config(fast_retry(0));
        let options = RequestOptions::new()
            .param("id", "app-1")
            .authorization(Some("Bearer token".to_string()));

        let response = client.get("/v1/usage/:id", &options).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["start"], json!(1476878391000i64));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_returns_location() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", SUBMIT_USAGE_PATH)
            .match_body(Matcher::Json(json!({ "organization_id": "1" })))
            .with_status(202)
            .with_header("Location", "http://collector/v1/metering/collected/usage/t/1")
            .create_async()
            .await;

        let client = CollectorClient::new(server.url()).unwrap().with_retry_config(fast_retry(0));
        let options = RequestOptions::new().body(json!({ "organization_id": "1" }));

        let response = client.post(SUBMIT_USAGE_PATH, &options).await.unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(response.location(), Some("http://collector/v1/metering/collected/usage/t/1"));
        assert_eq!(response.body, Value::Null);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_returned() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/usage")
            .with_status(500)
            .with_body("collector down")
            .expect(3)
            .create_async()
            .await;

        let client = CollectorClient::new(server.url()).unwrap().with_retry_config(fast_retry(2));

        let response = client.get("/v1/usage", &RequestOptions::new()).await.unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body, json!("collector down"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/usage")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = CollectorClient::new(server.url()).unwrap().with_retry_config(fast_retry(3));

        let response = client.get("/v1/usage", &RequestOptions::new()).await.unwrap();
        assert_eq!(response.status, 404);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_calling() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", SUBMIT_USAGE_PATH)
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let client = CollectorClient::new(server.url())
            .unwrap()
            .with_retry_config(fast_retry(0))
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                half_open_allowed_calls: 1,
            });

        let first = client.post(SUBMIT_USAGE_PATH, &RequestOptions::new()).await.unwrap();
        assert_eq!(first.status, 503);
        assert_eq!(
            client.circuit_breaker.as_ref().unwrap().get_state().await,
            CircuitState::Open
        );

        let second = client.post(SUBMIT_USAGE_PATH, &RequestOptions::new()).await;
        assert!(matches!(second, Err(TransportError::CircuitBreakerOpen)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_collector() {
        let client = CollectorClient::new("http://127.0.0.1:1").unwrap().with_retry_config(fast_retry(1));
        let result = client.get("/v1/usage", &RequestOptions::new()).await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
    }

    #[test]
    fn test_policy_comes_from_throttle() {
        let policy = ThrottlePolicy { delay_ms: 0, max_batch: 3, max_calls: 4 };
        let client = CollectorClient::new("http://collector/").unwrap().with_throttle_policy(policy.clone());
        assert_eq!(client.policy(), policy);
        assert_eq!(client.base_url, "http://collector");
    }

    #[tokio::test]
    async fn test_settings_timeout_applies() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let settings = ClientSettings {
            timeout_ms: 50,
            max_retries: 0,
            ..ClientSettings::default()
        };
        let client = CollectorClient::from_settings(format!("http://{addr}"), &settings).unwrap();
        assert!(client.circuit_breaker.is_some());

        let started = std::time::Instant::now();
        let result = client.get("/v1/usage", &RequestOptions::new()).await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
