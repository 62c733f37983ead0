//! Transport-neutral request/response types.

use serde::{Deserialize, Serialize};

/// An outbound HTTP request as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
  /// Uppercase method name
  pub method: String,
  /// Absolute URL
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl HttpRequest {
  pub fn get(url: impl Into<String>) -> Self {
    Self::new("GET", url)
  }

  pub fn new(method: &str, url: impl Into<String>) -> Self {
    Self {
      method: method.to_uppercase(),
      url: url.into(),
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.push((name.to_string(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

/// An HTTP response, either from the network, the cache or synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn empty(status: u16) -> Self {
    Self::new(status, Vec::new())
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string())
      .with_header("content-type", "application/json")
  }

  pub fn html(status: u16, html: &str) -> Self {
    Self::new(status, html).with_header("content-type", "text/html; charset=utf-8")
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.push((name.to_string(), value.into()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Body as lossy UTF-8, for logs and error messages.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// A write captured by the router while the backend was unreachable.
///
/// Stored as the payload of a `captured-request` queue entry. The body is
/// kept byte for byte (base64 in the stored JSON) so uploads replay intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedRequest {
  pub url: String,
  pub method: String,
  pub headers: Vec<(String, String)>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
  pub body: Option<Vec<u8>>,
}

mod base64_body {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match body {
      Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
    Option::<String>::deserialize(deserializer)?
      .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
      .transpose()
  }
}

impl From<&HttpRequest> for CapturedRequest {
  fn from(req: &HttpRequest) -> Self {
    Self {
      url: req.url.clone(),
      method: req.method.clone(),
      headers: req.headers.clone(),
      body: if req.body.is_empty() {
        None
      } else {
        Some(req.body.clone())
      },
    }
  }
}

impl From<CapturedRequest> for HttpRequest {
  fn from(captured: CapturedRequest) -> Self {
    Self {
      method: captured.method.to_uppercase(),
      url: captured.url,
      headers: captured.headers,
      body: captured.body.unwrap_or_default(),
    }
  }
}
