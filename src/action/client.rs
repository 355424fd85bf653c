//! Authenticated HTTP client handed to action steps.
//!
//! A [`RequestClient`] carries the request options produced by the
//! destination's extensions (prefix URL, default query parameters, headers)
//! and records every exchange into the invocation's [`ExchangeLog`].
//!
//! ```rust,ignore
//! let person = client
//!     .get("persons/search")
//!     .query("term", "ada@example.com")
//!     .send()
//!     .await?;
//! ```

use super::{ExecuteInput, StepError};
use parking_lot::Mutex;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Options layered onto every request made through a client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub prefix_url: Option<String>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix_url(mut self, prefix: impl Into<String>) -> Self {
        self.prefix_url = Some(prefix.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Layer `other` on top: its prefix and timeout win, query parameters
    /// and headers accumulate.
    pub fn merge(mut self, other: RequestOptions) -> Self {
        if other.prefix_url.is_some() {
            self.prefix_url = other.prefix_url;
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        self.query.extend(other.query);
        self.headers.extend(other.headers);
        self
    }
}

/// A destination-level function deriving request options from the
/// invocation (usually from its settings).
pub type RequestExtension = Arc<dyn Fn(&ExecuteInput) -> RequestOptions + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// One request and, unless the transport failed, its response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub request: RecordedRequest,
    pub response: Option<RecordedResponse>,
}

/// Exchanges made during one invocation, in the order they completed.
#[derive(Debug, Clone, Default)]
pub struct ExchangeLog {
    entries: Arc<Mutex<Vec<Exchange>>>,
}

impl ExchangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, exchange: Exchange) {
        self.entries.lock().push(exchange);
    }

    pub fn snapshot(&self) -> Vec<Exchange> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

#[derive(Clone)]
pub struct RequestClient {
    http: reqwest::Client,
    options: RequestOptions,
    log: ExchangeLog,
}

impl RequestClient {
    pub fn new(http: reqwest::Client, options: RequestOptions, log: ExchangeLog) -> Self {
        Self { http, options, log }
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder {
            client: self,
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    /// Absolute URLs are used as-is; relative ones are joined to the prefix.
    fn resolve_url(&self, url: &str) -> Result<String, StepError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_string());
        }
        match &self.options.prefix_url {
            Some(prefix) => Ok(format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                url.trim_start_matches('/')
            )),
            None => Err(StepError::Failed(format!(
                "relative URL '{}' used without a prefix URL",
                url
            ))),
        }
    }
}

pub struct RequestBuilder<'a> {
    client: &'a RequestClient,
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Value>,
}

impl<'a> RequestBuilder<'a> {
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Send the request. Non-2xx responses become [`StepError::Http`].
    pub async fn send(self) -> Result<HttpResponse, StepError> {
        let client = self.client;
        let url = client.resolve_url(&self.url)?;

        let query: Vec<(String, String)> = client
            .options
            .query
            .iter()
            .cloned()
            .chain(self.query)
            .collect();
        let headers: BTreeMap<String, String> = client
            .options
            .headers
            .iter()
            .cloned()
            .chain(self.headers)
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();

        let mut request = client.http.request(self.method.clone(), &url).query(&query);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.body {
            request = request.json(body);
        }
        if let Some(timeout) = client.options.timeout {
            request = request.timeout(timeout);
        }

        let full_url = if query.is_empty() {
            url.clone()
        } else {
            let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            format!("{}?{}", url, pairs.join("&"))
        };
        let recorded = RecordedRequest {
            method: self.method.to_string(),
            url: full_url,
            headers,
            body: self.body,
        };

        debug!(method = %self.method, url = %url, "Sending request");

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(method = %self.method, url = %url, error = %e, "Request failed");
                client.log.record(Exchange {
                    request: recorded,
                    response: None,
                });
                return Err(StepError::Transport(e));
            }
        };

        let status = response.status();
        let response_headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        client.log.record(Exchange {
            request: recorded,
            response: Some(RecordedResponse {
                status_code: status.as_u16(),
                status_message: status.canonical_reason().unwrap_or("").to_string(),
                headers: response_headers.clone(),
                body: body.clone(),
            }),
        });

        if !status.is_success() {
            warn!(
                method = %self.method,
                url = %url,
                status = %status,
                "Destination returned an error status"
            );
            return Err(StepError::Http {
                status: status.as_u16(),
                method: self.method.to_string(),
                url,
                body,
            });
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            headers: response_headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(options: RequestOptions) -> (RequestClient, ExchangeLog) {
        let log = ExchangeLog::new();
        (
            RequestClient::new(reqwest::Client::new(), options, log.clone()),
            log,
        )
    }

    #[test]
    fn test_merge_options() {
        let base = RequestOptions::new()
            .prefix_url("https://a.example")
            .query("api_token", "t")
            .timeout(Duration::from_secs(3));
        let merged = base.merge(RequestOptions::new().prefix_url("https://b.example").header("x", "1"));

        assert_eq!(merged.prefix_url.as_deref(), Some("https://b.example"));
        assert_eq!(merged.query, vec![("api_token".to_string(), "t".to_string())]);
        assert_eq!(merged.headers.len(), 1);
        assert_eq!(merged.timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_resolve_url() {
        let (with_prefix, _) = client(RequestOptions::new().prefix_url("https://acme.example/api/v1/"));
        assert_eq!(
            with_prefix.resolve_url("persons").unwrap(),
            "https://acme.example/api/v1/persons"
        );
        assert_eq!(
            with_prefix.resolve_url("https://other.example/x").unwrap(),
            "https://other.example/x"
        );

        let (bare, _) = client(RequestOptions::new());
        assert!(bare.resolve_url("persons").is_err());
    }

    #[tokio::test]
    async fn test_send_applies_options_and_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/persons"))
            .and(query_param("api_token", "secret"))
            .and(header("x-source", "relay"))
            .and(body_json(json!({"name": "Ada"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 9})))
            .expect(1)
            .mount(&server)
            .await;

        let (client, log) = client(
            RequestOptions::new()
                .prefix_url(format!("{}/api", server.uri()))
                .query("api_token", "secret")
                .header("X-Source", "relay"),
        );

        let response = client
            .post("persons")
            .json(json!({"name": "Ada"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body, json!({"id": 9}));

        let exchanges = log.snapshot();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].request.method, "POST");
        assert!(exchanges[0].request.url.ends_with("/api/persons?api_token=secret"));
        assert_eq!(exchanges[0].response.as_ref().unwrap().status_code, 201);
    }

    #[tokio::test]
    async fn test_error_status_is_step_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let (client, log) = client(RequestOptions::new().prefix_url(server.uri()));
        let err = client.get("users/me").send().await.unwrap_err();

        match err {
            StepError::Http { status, body, .. } => {
                assert_eq!(status, 404);
                assert_eq!(body, json!("missing"));
            }
            other => panic!("expected http error, got {:?}", other),
        }
        assert_eq!(log.len(), 1);
    }
}
