//! Maps queued operations onto backend writes.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::backend::{CapturedRequest, HttpRequest, Transport};
use crate::queue::{OperationKind, QueuedOperation};

/// Header carrying the client-generated idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Replays one queued operation against the backend.
#[async_trait]
pub trait Replay: Send + Sync {
  async fn replay(&self, op: &QueuedOperation) -> Result<()>;
}

/// Replays operations against a PostgREST-style data API.
///
/// A sale is a single idempotent call (`rpc/create_sale`) that records the
/// sale and decrements stock server side, so a retried drain never applies
/// it twice.
pub struct BackendReplayer {
  transport: Arc<dyn Transport>,
  base_url: Url,
  api_key: Option<String>,
}

impl BackendReplayer {
  pub fn new(transport: Arc<dyn Transport>, base_url: &str, api_key: Option<String>) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid backend url {}: {}", base_url, e))?;

    // Url::join replaces the last segment unless the path ends with '/'
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    Ok(Self {
      transport,
      base_url,
      api_key,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))
  }

  fn backend_request(&self, method: &str, url: Url, body: &Value, op: &QueuedOperation) -> HttpRequest {
    let mut request = HttpRequest::new(method, url.as_str())
      .with_header("content-type", "application/json")
      .with_header("prefer", "return=minimal")
      .with_header(IDEMPOTENCY_HEADER, op.idempotency_key.clone())
      .with_body(body.to_string());

    if let Some(key) = &self.api_key {
      request = request
        .with_header("apikey", key.clone())
        .with_header("authorization", format!("Bearer {}", key));
    }
    request
  }

  fn update(&self, table: &str, op: &QueuedOperation) -> Result<HttpRequest> {
    let id = op
      .payload
      .get("id")
      .and_then(id_to_string)
      .ok_or_else(|| eyre!("{} payload has no id", op.kind))?;

    let changes = match op.payload.get("updates") {
      Some(updates) => updates.clone(),
      None => {
        let mut fields = op.payload.clone();
        if let Some(map) = fields.as_object_mut() {
          map.remove("id");
        }
        fields
      }
    };

    let mut url = self.endpoint(table)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id));
    Ok(self.backend_request("PATCH", url, &changes, op))
  }

  /// Build the request that replays `op`.
  pub fn request_for(&self, op: &QueuedOperation) -> Result<HttpRequest> {
    let request = match op.kind {
      OperationKind::CreateSale => {
        let sale = op.payload.get("sale").cloned().unwrap_or_else(|| {
          let mut header = op.payload.clone();
          if let Some(map) = header.as_object_mut() {
            map.remove("items");
          }
          header
        });
        let items = op.payload.get("items").cloned().unwrap_or_else(|| json!([]));
        let body = json!({
          "idempotency_key": op.idempotency_key,
          "sale": sale,
          "items": items,
        });
        self.backend_request("POST", self.endpoint("rpc/create_sale")?, &body, op)
      }
      OperationKind::CreateProduct => {
        self.backend_request("POST", self.endpoint("products")?, &op.payload, op)
      }
      OperationKind::UpdateProduct => self.update("products", op)?,
      OperationKind::CreateCustomer => {
        self.backend_request("POST", self.endpoint("customers")?, &op.payload, op)
      }
      OperationKind::UpdateCustomer => self.update("customers", op)?,
      OperationKind::CreateExpense => {
        self.backend_request("POST", self.endpoint("expenses")?, &op.payload, op)
      }
      OperationKind::CapturedRequest => {
        let captured: CapturedRequest = serde_json::from_value(op.payload.clone())
          .map_err(|e| eyre!("Captured request {} is malformed: {}", op.id, e))?;
        let mut request = HttpRequest::from(captured);
        if request.header(IDEMPOTENCY_HEADER).is_none() {
          request = request.with_header(IDEMPOTENCY_HEADER, op.idempotency_key.clone());
        }
        request
      }
    };

    Ok(request)
  }
}

fn id_to_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

#[async_trait]
impl Replay for BackendReplayer {
  async fn replay(&self, op: &QueuedOperation) -> Result<()> {
    let request = self.request_for(op)?;
    let response = self
      .transport
      .send(&request)
      .await
      .map_err(|e| eyre!("{} {}: {}", request.method, request.url, e))?;

    if response.is_success() {
      debug!(id = %op.id, kind = %op.kind, status = response.status, "Replay accepted");
      return Ok(());
    }

    // Only rpc/create_sale honours the idempotency key; on table inserts a
    // 409 is a real constraint conflict and must stay visible
    if response.status == 409 && op.kind == OperationKind::CreateSale {
      info!(id = %op.id, kind = %op.kind, "Sale was already recorded; treating as applied");
      return Ok(());
    }

    let mut detail = response.text();
    detail.truncate(200);
    Err(eyre!(
      "{} {} returned HTTP {}: {}",
      request.method,
      request.url,
      response.status,
      detail
    ))
  }
}
