//! Order backend API client.
//!
//! Authenticated HTTP communication with the managed backend: the
//! `create_offline_order` procedure, direct row updates on `orders`, the
//! self-heal lookup, and a lightweight connectivity probe.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::RemoteError;
use crate::remote::{
    CreateOrderPayload, CreateOrderResponse, OrderUpdatePatch, RemoteOrderRef,
    RemoteOrderService, UpdateTarget,
};

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

const CREATE_ORDER_RPC: &str = "/rest/v1/rpc/create_offline_order";
const ORDERS_TABLE: &str = "/rest/v1/orders";

/// PostgreSQL `unique_violation`.
const PG_UNIQUE_VIOLATION: &str = "23505";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Connection strings are `{"url", "key", "mid"}` as JSON or base64(url-safe) JSON.
pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key", "apiKey"])
}

pub fn extract_backend_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"])
        .map(|u| normalize_backend_url(&u))
        .filter(|s| !s.is_empty())
}

pub fn extract_machine_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["mid", "machineId"])
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into the remote error taxonomy.
fn transport_error(url: &str, err: &reqwest::Error, timeout: Duration) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout(timeout.as_secs());
    }
    if err.is_connect() {
        return RemoteError::Network(format!("cannot reach backend at {url}"));
    }
    if err.is_builder() {
        return RemoteError::Rpc(format!("invalid backend URL: {url}"));
    }
    RemoteError::Network(format!("network error communicating with {url}: {err}"))
}

/// Map a non-success HTTP response body into the remote error taxonomy.
fn status_error(status: StatusCode, body_text: &str) -> RemoteError {
    let json = serde_json::from_str::<Value>(body_text).ok();
    let code = json
        .as_ref()
        .and_then(|j| j.get("code"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = json
        .as_ref()
        .and_then(|j| j.get("message").or_else(|| j.get("error")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body_text.trim().to_string());
    let detail = if message.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{message} (HTTP {})", status.as_u16())
    };

    if code == PG_UNIQUE_VIOLATION
        || status == StatusCode::CONFLICT
        || message.to_lowercase().contains("duplicate key")
    {
        return RemoteError::DuplicateKey(detail);
    }

    match status.as_u16() {
        401 | 403 => RemoteError::Auth(detail),
        408 | 429 => RemoteError::Network(detail),
        s if s >= 500 => RemoteError::Server { status: s, message },
        _ => RemoteError::Rejected(detail),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the managed order backend.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = normalize_backend_url(base_url);
        if base_url.is_empty() {
            return Err(RemoteError::Rpc("backend URL is empty".into()));
        }
        let api_key = extract_api_key_from_connection_string(api_key)
            .unwrap_or_else(|| api_key.trim().to_string());

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Rpc(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_key,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let resp = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e, self.timeout))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body_text = resp.text().await.unwrap_or_default();
        Err(status_error(status, &body_text))
    }

    async fn json_body(resp: Response) -> Result<Value, RemoteError> {
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| RemoteError::Rpc(format!("invalid JSON from backend: {e}")))
    }

    fn target_filter(target: &UpdateTarget) -> String {
        match target {
            UpdateTarget::ServerId(id) => format!("id=eq.{}", percent_encode(id)),
            UpdateTarget::LocalRef(local_id) => format!("ref_local_id=eq.{local_id}"),
        }
    }

    /// Reachability check used by the connectivity monitor. Any HTTP answer
    /// counts as online; only transport failures count as offline.
    pub async fn check_connectivity(&self) -> ConnectivityResult {
        let url = format!("{}/rest/v1/", self.base_url);
        let start = Instant::now();
        match self
            .authed(self.http.get(&url).timeout(CONNECTIVITY_TIMEOUT))
            .send()
            .await
        {
            Ok(resp) => {
                let latency = start.elapsed().as_millis() as u64;
                debug!(latency_ms = latency, status = resp.status().as_u16(), "backend reachable");
                ConnectivityResult {
                    online: true,
                    latency_ms: Some(latency),
                    error: None,
                }
            }
            Err(e) => ConnectivityResult {
                online: false,
                latency_ms: None,
                error: Some(transport_error(&self.base_url, &e, CONNECTIVITY_TIMEOUT).to_string()),
            },
        }
    }
}

/// Result of a connectivity probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectivityResult {
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
impl RemoteOrderService for BackendClient {
    async fn create_order(
        &self,
        payload: &CreateOrderPayload,
    ) -> Result<CreateOrderResponse, RemoteError> {
        let url = format!("{}{CREATE_ORDER_RPC}", self.base_url);
        let body = serde_json::json!({ "payload": payload });
        let resp = self.send(self.http.post(&url).json(&body)).await?;
        let value = Self::json_body(resp).await?;

        // A procedure returning SETOF yields an array; take its single row.
        let value = match value {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            other => other,
        };
        let parsed: CreateOrderResponse = serde_json::from_value(value)
            .map_err(|e| RemoteError::Rpc(format!("unexpected create_order response: {e}")))?;

        info!(
            local_id = payload.ref_local_id,
            success = parsed.success,
            order_number = parsed.order_number.as_deref().unwrap_or(""),
            "create_offline_order answered"
        );
        Ok(parsed)
    }

    async fn update_order(
        &self,
        target: &UpdateTarget,
        patch: &OrderUpdatePatch,
    ) -> Result<(), RemoteError> {
        let url = format!(
            "{}{ORDERS_TABLE}?{}",
            self.base_url,
            Self::target_filter(target)
        );
        let resp = self
            .send(
                self.http
                    .patch(&url)
                    .header("Prefer", "return=representation")
                    .json(patch),
            )
            .await?;

        match Self::json_body(resp).await? {
            Value::Array(rows) if rows.is_empty() => {
                Err(RemoteError::NotFound(format!("{target:?}")))
            }
            _ => Ok(()),
        }
    }

    async fn lookup_by_local_ref(
        &self,
        local_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<RemoteOrderRef>, RemoteError> {
        let url = format!(
            "{}{ORDERS_TABLE}?ref_local_id=eq.{local_id}&idempotency_key=eq.{}&select=id,order_number,status&limit=1",
            self.base_url,
            percent_encode(idempotency_key)
        );
        let resp = self.send(self.http.get(&url)).await?;
        let rows: Vec<RemoteOrderRef> = match Self::json_body(resp).await? {
            Value::Null => Vec::new(),
            value => serde_json::from_value(value)
                .map_err(|e| RemoteError::Rpc(format!("unexpected lookup response: {e}")))?,
        };
        Ok(rows.into_iter().next())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LineItem, PaymentStatus, ProductionStatus};
    use crate::remote::{CustomerPayload, PaymentPayload};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> CreateOrderPayload {
        CreateOrderPayload {
            ref_local_id: 4,
            local_created_at: "2026-03-02T10:00:00.000Z".into(),
            source: crate::remote::OFFLINE_SOURCE,
            idempotency_key: "b7d4c1de-0000-4000-8000-000000000004".into(),
            machine_id: "MACHINE-01".into(),
            is_tempo: false,
            customer: CustomerPayload {
                name: "Dewi".into(),
                phone: None,
            },
            payment: PaymentPayload {
                amount: 0.0,
                method: None,
                received_by: None,
            },
            items: vec![LineItem {
                product_name: "Flyer A5".into(),
                quantity: 500.0,
                unit_price: 400.0,
                line_total: 200000.0,
                specs: serde_json::json!({}),
            }],
            total_amount: 200000.0,
            discount: 0.0,
            paid_amount: 0.0,
            remaining_amount: 200000.0,
            payment_status: PaymentStatus::Unpaid.as_str().into(),
            production_status: ProductionStatus::Queue.as_str().into(),
            meta: serde_json::json!({}),
        }
    }

    fn patch() -> OrderUpdatePatch {
        OrderUpdatePatch {
            production_status: "READY".into(),
            payment_status: "PAID".into(),
            paid_amount: 200000.0,
            remaining_amount: 0.0,
            payment_method: Some("CASH".into()),
            last_financial_action: Some("SETTLEMENT".into()),
            financial_action_by: Some("kasir-1".into()),
            financial_action_at: Some("2026-03-02T11:00:00.000Z".into()),
            updated_at: "2026-03-02T11:00:00.000Z".into(),
        }
    }

    fn client(server: &MockServer) -> BackendClient {
        BackendClient::new(&server.uri(), "service-key", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_normalize_backend_url() {
        assert_eq!(
            normalize_backend_url("abc.supabase.co/rest/v1/"),
            "https://abc.supabase.co"
        );
        assert_eq!(
            normalize_backend_url("localhost:54321//"),
            "http://localhost:54321"
        );
        assert_eq!(normalize_backend_url("  "), "");
    }

    #[test]
    fn test_connection_string_decoding() {
        let json = r#"{"url":"shop.example.com","key":"sk-123","mid":"MACHINE-07"}"#;
        assert_eq!(
            extract_api_key_from_connection_string(json).as_deref(),
            Some("sk-123")
        );

        let encoded = BASE64_STANDARD.encode(json);
        let url_safe = encoded.replace('+', "-").replace('/', "_").replace('=', "");
        assert_eq!(
            extract_backend_url_from_connection_string(&url_safe).as_deref(),
            Some("https://shop.example.com")
        );
        assert_eq!(
            extract_machine_id_from_connection_string(&encoded).as_deref(),
            Some("MACHINE-07")
        );
        assert_eq!(extract_api_key_from_connection_string("plain-key"), None);
    }

    #[test]
    fn test_status_error_mapping() {
        let dup = status_error(
            StatusCode::CONFLICT,
            r#"{"code":"23505","message":"duplicate key value violates unique constraint \"orders_idempotency_key_key\""}"#,
        );
        assert!(matches!(dup, RemoteError::DuplicateKey(_)));

        let dup_400 = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":"23505","message":"unique"}"#,
        );
        assert!(matches!(dup_400, RemoteError::DuplicateKey(_)));

        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            RemoteError::Auth(_)
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            RemoteError::Network(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "upstream"),
            RemoteError::Server { status: 502, .. }
        ));
        let rejected = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":"P0001","message":"customer phone required"}"#,
        );
        assert_eq!(
            rejected,
            RemoteError::Rejected("customer phone required (HTTP 400)".into())
        );
    }

    #[tokio::test]
    async fn test_create_order_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/create_offline_order"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer service-key"))
            .and(body_partial_json(serde_json::json!({
                "payload": { "ref_local_id": 4, "source": "OFFLINE" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "order_id": "X",
                "order_number": "JGL-0001",
                "status": "QUEUE"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resp = client(&server).create_order(&payload()).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.order_id.as_deref(), Some("X"));
        assert_eq!(resp.order_number.as_deref(), Some("JGL-0001"));
    }

    #[tokio::test]
    async fn test_create_order_duplicate_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/create_offline_order"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint"
            })))
            .mount(&server)
            .await;

        let err = client(&server).create_order(&payload()).await.unwrap_err();
        assert!(matches!(err, RemoteError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn test_update_order_by_server_id() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/orders"))
            .and(query_param("id", "eq.srv-1"))
            .and(header("prefer", "return=representation"))
            .and(body_partial_json(serde_json::json!({ "production_status": "READY" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{ "id": "srv-1" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .update_order(&UpdateTarget::ServerId("srv-1".into()), &patch())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_order_empty_representation_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/orders"))
            .and(query_param("ref_local_id", "eq.9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let err = client(&server)
            .update_order(&UpdateTarget::LocalRef(9), &patch())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_lookup_by_local_ref() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/orders"))
            .and(query_param("ref_local_id", "eq.4"))
            .and(query_param("idempotency_key", "eq.key-4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": "X", "order_number": "JGL-0001", "status": "QUEUE" }
            ])))
            .mount(&server)
            .await;

        let found = client(&server)
            .lookup_by_local_ref(4, "key-4")
            .await
            .unwrap()
            .expect("row found");
        assert_eq!(found.id, "X");
        assert_eq!(found.order_number.as_deref(), Some("JGL-0001"));
    }

    #[tokio::test]
    async fn test_lookup_accepts_integer_primary_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/orders"))
            .and(query_param("ref_local_id", "eq.9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": 1204, "order_number": "JGL-1204", "status": "QUEUE" }
            ])))
            .mount(&server)
            .await;

        let found = client(&server)
            .lookup_by_local_ref(9, "key-9")
            .await
            .unwrap()
            .expect("row found");
        assert_eq!(found.id, "1204");
    }

    #[tokio::test]
    async fn test_connectivity_offline_when_unreachable() {
        let unreachable =
            BackendClient::new("http://127.0.0.1:9", "k", Duration::from_secs(2)).unwrap();
        let result = unreachable.check_connectivity().await;
        assert!(!result.online);
        assert!(result.error.is_some());
    }
}
