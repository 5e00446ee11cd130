//! REST facade over the gateway's programmatic surface.
//!
//! Mounted under `/api/bridge`. Store ids contain `#`, so callers must
//! percent-encode it (`demo%23ab12cd`).

use super::gateway::Gateway;
use crate::error::BridgeError;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Routes of the facade, relative to its mount point.
pub fn routes() -> Router<Gateway> {
    Router::new()
        .route("/stores", get(list_stores))
        .route("/stores/{store_id}", get(get_store))
        .route("/stores/{store_id}/state", get(get_state).post(set_state))
        .route("/stores/{store_id}/dispatch", post(dispatch))
        .route("/pages/{page_id}/stores", get(page_stores))
        .fallback(not_found)
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self {
            BridgeError::StoreNotFound(_) => "Store not found".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, BridgeError>;

/// Body of `POST /stores/{id}/state`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStateBody {
    /// Replacement state
    pub state: Value,
    /// Optimistic-concurrency guard
    #[serde(default)]
    pub expected_version: Option<u64>,
}

/// Body of `POST /stores/{id}/dispatch`.
#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    /// Action object
    pub action: Value,
}

async fn list_stores(State(gateway): State<Gateway>) -> ApiResult {
    Ok(Json(json!({ "stores": gateway.list_stores() })))
}

async fn get_store(State(gateway): State<Gateway>, Path(store_id): Path<String>) -> ApiResult {
    let info = gateway
        .get_store(&store_id)
        .ok_or(BridgeError::StoreNotFound(store_id))?;
    Ok(Json(serde_json::to_value(info)?))
}

async fn get_state(State(gateway): State<Gateway>, Path(store_id): Path<String>) -> ApiResult {
    let snapshot = gateway
        .get_state(&store_id)
        .ok_or(BridgeError::StoreNotFound(store_id))?;
    Ok(Json(serde_json::to_value(snapshot)?))
}

async fn page_stores(State(gateway): State<Gateway>, Path(page_id): Path<String>) -> ApiResult {
    Ok(Json(json!({ "stores": gateway.page_stores(&page_id) })))
}

async fn set_state(
    State(gateway): State<Gateway>,
    Path(store_id): Path<String>,
    body: std::result::Result<Json<SetStateBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(|e| BridgeError::InvalidParams(e.body_text()))?;
    gateway
        .set_state(&store_id, body.state, body.expected_version)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn dispatch(
    State(gateway): State<Gateway>,
    Path(store_id): Path<String>,
    body: std::result::Result<Json<DispatchBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(|e| BridgeError::InvalidParams(e.body_text()))?;
    gateway.dispatch(&store_id, body.action).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::host::{GatewayCommand, HostMessage, RegisterPayload, StateChangedPayload};
    use crate::server::GatewayConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(gateway: &Gateway) -> Router {
        routes().with_state(gateway.clone())
    }

    fn register(gateway: &Gateway) -> (crate::server::ConnectionHandle, tokio::sync::mpsc::Receiver<String>) {
        let (host, rx) = gateway.open_connection();
        gateway.handle_host_message(
            &host,
            HostMessage::Register(RegisterPayload {
                store_id: "demo#ab12cd".into(),
                page_id: "demo".into(),
                store_key: Some("main".into()),
                description: None,
                initial_state: json!({"count": 0}),
            }),
        );
        (host, rx)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(b) => Body::from(b.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let gateway = Gateway::new(GatewayConfig::default());
        let _host = register(&gateway);

        let (status, body) = call(app(&gateway), "GET", "/stores", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stores"][0]["storeId"], "demo#ab12cd");

        let (status, body) = call(app(&gateway), "GET", "/stores/demo%23ab12cd/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["count"], 0);
        assert_eq!(body["version"], 0);

        let (status, body) = call(app(&gateway), "GET", "/pages/demo/stores", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stores"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_store_is_404() {
        let gateway = Gateway::new(GatewayConfig::default());

        let (status, body) = call(app(&gateway), "GET", "/stores/missing%231", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Store not found");

        let (status, _) = call(
            app(&gateway),
            "POST",
            "/stores/missing%231/dispatch",
            Some(json!({"action": {"type": "noop"}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(app(&gateway), "GET", "/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");
    }

    #[tokio::test]
    async fn test_bad_body_is_400() {
        let gateway = Gateway::new(GatewayConfig::default());
        let _host = register(&gateway);
        let (status, body) = call(
            app(&gateway),
            "POST",
            "/stores/demo%23ab12cd/dispatch",
            Some(json!({"nope": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_host() {
        let gateway = Gateway::new(GatewayConfig::default());
        let (host, mut host_rx) = register(&gateway);

        let request = tokio::spawn(call(
            app(&gateway),
            "POST",
            "/stores/demo%23ab12cd/dispatch",
            Some(json!({"action": {"type": "counter.add", "payload": {"n": 2}}})),
        ));

        let frame = tokio::time::timeout(Duration::from_secs(1), host_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let command = GatewayCommand::from_value(serde_json::from_str(&frame).unwrap()).unwrap();
        gateway.handle_host_message(
            &host,
            HostMessage::StateChanged(StateChangedPayload {
                store_id: "demo#ab12cd".into(),
                state: json!({"count": 2}),
                version: 1,
                source: None,
                forward_id: command.forward_id(),
            }),
        );

        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_forward_timeout_is_500() {
        let gateway = Gateway::new(GatewayConfig {
            forward_timeout_ms: 50,
            ..Default::default()
        });
        let _host = register(&gateway);
        let (status, body) = call(
            app(&gateway),
            "POST",
            "/stores/demo%23ab12cd/state",
            Some(json!({"state": {"count": 9}, "expectedVersion": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("timed out"));
    }
}
