//! HTTP with a fixed pre-request delay and bounded retries on transport failure.
//!
//! [`RetryingHttpClient::send`] makes up to `max_tries` attempts. Each attempt is preceded by
//! a fixed sleep that keeps a slow endpoint from being hammered; it is unrelated to the call
//! quota enforced by [`RateLimiter`](super::rate::RateLimiter).
//!
//! Only transport failures (connection refused, timeout, truncated body) are retried. Any HTTP
//! status, including 4xx and 5xx, ends the loop as a [`SendOutcome::Completed`] response and the
//! caller decides what the status means. When every attempt fails the client hands back a
//! [`TransportFailure`] value instead of an error, so retrieval loops can keep going.
//!
//! # Examples
//!
//! ```no_run
//! use bibnet::clients::retry::{RetrievalRequest, RetryPolicy, RetryingHttpClient, SendOutcome};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), bibnet::errors::BibnetError> {
//! let client = RetryingHttpClient::new(RetryPolicy::default())?;
//! let request = RetrievalRequest::post("https://api.lens.org/scholarly/search", json!({"size": 0}))
//!   .with_header("Authorization", "Bearer token");
//!
//! match client.send(&request).await {
//!   SendOutcome::Completed(response) => println!("status {}", response.status),
//!   SendOutcome::Failed(failure) => println!("gave up after {} attempts", failure.attempts),
//! }
//! # Ok(())
//! # }
//! ```

use reqwest::Method;
use serde::de::DeserializeOwned;

use super::*;

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Maximum number of attempts, at least one
  pub max_tries: usize,
  /// Fixed sleep before every attempt
  pub delay:     Duration,
  /// Socket timeout of a single attempt
  pub timeout:   Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self { max_tries: 10, delay: Duration::from_millis(300), timeout: Duration::from_secs(60) }
  }
}

/// One HTTP request, immutable across attempts.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
  /// HTTP method
  pub method:  Method,
  /// Target URL
  pub url:     String,
  /// Extra headers
  pub headers: Vec<(String, String)>,
  /// Optional JSON body
  pub body:    Option<Json>,
}

impl RetrievalRequest {
  /// A GET request without body.
  pub fn get(url: impl Into<String>) -> Self {
    Self { method: Method::GET, url: url.into(), headers: Vec::new(), body: None }
  }

  /// A POST request carrying a JSON body.
  pub fn post(url: impl Into<String>, body: Json) -> Self {
    Self { method: Method::POST, url: url.into(), headers: Vec::new(), body: Some(body) }
  }

  /// Adds a header.
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }
}

/// A response that made it over the wire, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  /// HTTP status code
  pub status: u16,
  /// Raw body bytes
  pub body:   Vec<u8>,
}

impl HttpResponse {
  /// Whether the status is 2xx.
  pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

  /// Body decoded as UTF-8, lossily.
  pub fn text(&self) -> String { String::from_utf8_lossy(&self.body).into_owned() }

  /// Parses the body as JSON.
  ///
  /// # Errors
  ///
  /// Returns [`BibnetError::MalformedResponse`] if the body is not valid JSON for `T`.
  pub fn json<T: DeserializeOwned>(&self) -> Result<T, BibnetError> {
    serde_json::from_slice(&self.body)
      .map_err(|e| BibnetError::MalformedResponse(format!("invalid JSON body: {e}")))
  }
}

/// Every attempt failed at the transport level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
  /// Attempts made before giving up
  pub attempts:   usize,
  /// Message of the last transport error
  pub last_error: String,
}

/// Result of [`RetryingHttpClient::send`]; callers must check which one they got.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
  /// The server answered; the status may still be an error status.
  Completed(HttpResponse),
  /// No attempt got an answer.
  Failed(TransportFailure),
}

impl SendOutcome {
  /// Turns the outcome into a successful response or an error naming `context`.
  ///
  /// For callers that cannot degrade gracefully, such as one-off baseline downloads.
  pub fn into_success(self, context: &str) -> Result<HttpResponse, BibnetError> {
    match self {
      SendOutcome::Completed(response) if response.is_success() => Ok(response),
      SendOutcome::Completed(response) => Err(BibnetError::ApiError(format!(
        "{context} returned status {}: {}",
        response.status,
        response.text()
      ))),
      SendOutcome::Failed(failure) => Err(BibnetError::ApiError(format!(
        "{context} failed after {} attempts: {}",
        failure.attempts, failure.last_error
      ))),
    }
  }
}

/// HTTP client applying a [`RetryPolicy`] to every request.
#[derive(Debug, Clone)]
pub struct RetryingHttpClient {
  client: reqwest::Client,
  policy: RetryPolicy,
}

impl RetryingHttpClient {
  /// Creates a client with the policy's socket timeout.
  pub fn new(policy: RetryPolicy) -> Result<Self, BibnetError> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("bibnet/", env!("CARGO_PKG_VERSION")))
      .timeout(policy.timeout)
      .build()?;
    Ok(Self { client, policy: RetryPolicy { max_tries: policy.max_tries.max(1), ..policy } })
  }

  /// The policy in effect.
  pub fn policy(&self) -> RetryPolicy { self.policy }

  /// Sends `request`, retrying transport failures up to `max_tries` times.
  pub async fn send(&self, request: &RetrievalRequest) -> SendOutcome {
    let mut last_error = String::new();
    for attempt in 1..=self.policy.max_tries {
      tokio::time::sleep(self.policy.delay).await;
      match self.attempt(request).await {
        Ok(response) => {
          debug!("{} {} -> {} (attempt {attempt})", request.method, request.url, response.status);
          return SendOutcome::Completed(response);
        },
        Err(e) => {
          warn!("{} {} failed (attempt {attempt}/{}): {e}", request.method, request.url, self.policy.max_tries);
          last_error = e.to_string();
        },
      }
    }
    SendOutcome::Failed(TransportFailure { attempts: self.policy.max_tries, last_error })
  }

  async fn attempt(&self, request: &RetrievalRequest) -> Result<HttpResponse, reqwest::Error> {
    let mut builder = self.client.request(request.method.clone(), &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let body = response.bytes().await?.to_vec();
    trace!("Response body: {}", String::from_utf8_lossy(&body));
    Ok(HttpResponse { status, body })
  }
}
