use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// A pull (or, in principle, push) request the engine issues (§6).
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: HttpMethod,
  pub url: String,
  pub headers: HashMap<String, String>,
  pub body: Option<String>,
  pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
  Get,
}

/// `statusCode == 0` with a populated `error_message` represents a
/// transport-level failure (no response at all), per §4.6's retry policy.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status_code: u16,
  pub body: String,
  pub error_message: Option<String>,
}

impl HttpResponse {
  pub fn is_transport_error(&self) -> bool {
    self.status_code == 0
  }

  pub fn is_retryable(&self) -> bool {
    self.is_transport_error() || matches!(self.status_code, 408 | 429) || (500..600).contains(&self.status_code)
  }

  pub fn is_auth_required(&self) -> bool {
    matches!(self.status_code, 401 | 403)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status_code)
  }
}

/// Collaborator interface for dispatching HTTP requests (§6).
#[async_trait]
pub trait HttpTransport: Send + Sync {
  async fn execute(&self, request: HttpRequest) -> HttpResponse;
}

/// Default `HttpTransport` backed by a pooled `reqwest::Client`.
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Self {
    ReqwestTransport { client: reqwest::Client::new() }
  }
}

impl Default for ReqwestTransport {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
  async fn execute(&self, request: HttpRequest) -> HttpResponse {
    let mut builder = match request.method {
      HttpMethod::Get => self.client.get(&request.url),
    };
    for (key, value) in &request.headers {
      builder = builder.header(key, value);
    }
    builder = builder.timeout(request.timeout);

    match builder.send().await {
      Ok(response) => {
        let status_code = response.status().as_u16();
        match response.text().await {
          Ok(body) => HttpResponse { status_code, body, error_message: None },
          Err(e) => HttpResponse { status_code, body: String::new(), error_message: Some(e.to_string()) },
        }
      }
      Err(e) => HttpResponse { status_code: 0, body: String::new(), error_message: Some(e.to_string()) },
    }
  }
}
