// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Webhook HTTP channel.
//!
//! Each configured hook owns one `POST` path.  Signed hooks verify
//! `X-Webhook-Signature: sha256=<hex>` — HMAC-SHA256 over the raw body,
//! compared in constant time (`subtle::ConstantTimeEq`).  Unsigned hooks
//! accept any request, signature header or not.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use miclaw_config::{HookConfig, HookFormat, WebhookConfig};
use miclaw_core::{Input, InputSink, Source};

pub struct WebhookServer {
    config: WebhookConfig,
    sink: Arc<dyn InputSink>,
}

#[derive(Clone)]
struct HookState {
    hook: Arc<HookConfig>,
    sink: Arc<dyn InputSink>,
}

impl WebhookServer {
    pub fn new(config: WebhookConfig, sink: Arc<dyn InputSink>) -> Self {
        Self { config, sink }
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new().route("/health", get(health_handler));
        for hook in &self.config.hooks {
            let state = HookState {
                hook: Arc::new(hook.clone()),
                sink: self.sink.clone(),
            };
            router = router.route(&hook.path, post(hook_handler).with_state(state));
        }
        router
    }

    /// Bind and serve until `shutdown` flips; graceful stop completes
    /// within a second since handlers only enqueue.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen).await?;
        info!(listen = %self.config.listen, hooks = self.config.hooks.len(), "webhook server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        info!("webhook server stopped");
        Ok(())
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn hook_handler(
    State(state): State<HookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.hook.secret.as_deref().filter(|s| !s.is_empty()) {
        let provided = headers
            .get("x-webhook-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret.as_bytes(), &body, provided) {
            warn!(hook = %state.hook.id, "webhook signature verification failed");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "invalid signature"})),
            )
                .into_response();
        }
    }

    let content = match extract_content(state.hook.format, &body) {
        Ok(c) => c,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": message})),
            )
                .into_response();
        }
    };

    debug!(hook = %state.hook.id, bytes = body.len(), "webhook accepted");
    let mut input = Input::new(
        format!("webhook:{}", state.hook.id),
        content,
        Source::Webhook,
    );
    input
        .metadata
        .insert("id".into(), state.hook.id.clone());
    state.sink.enqueue(input).await;

    (StatusCode::ACCEPTED, Json(serde_json::json!({"status": "accepted"}))).into_response()
}

/// Constant-time verification of `sha256=<hex>` over the raw body.
fn verify_signature(secret: &[u8], body: &[u8], provided: &str) -> bool {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1
}

/// Normalize the request body into the input text.
///
/// Text hooks forward the body verbatim.  JSON hooks look for a
/// conventional message field and fall back to pretty-printing the whole
/// payload so nothing is silently lost.
fn extract_content(format: HookFormat, body: &[u8]) -> Result<String, String> {
    match format {
        HookFormat::Text => Ok(String::from_utf8_lossy(body).into_owned()),
        HookFormat::Json => {
            let value: serde_json::Value =
                serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))?;
            for key in ["content", "text", "message"] {
                if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                    return Ok(text.to_string());
                }
            }
            Ok(serde_json::to_string_pretty(&value).unwrap_or_default())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct Recorder {
        inputs: Mutex<Vec<Input>>,
    }

    #[async_trait]
    impl InputSink for Recorder {
        async fn enqueue(&self, input: Input) {
            self.inputs.lock().unwrap().push(input);
        }
    }

    fn server(secret: Option<&str>, format: HookFormat) -> (WebhookServer, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            inputs: Mutex::new(vec![]),
        });
        let config = WebhookConfig {
            enabled: true,
            listen: "127.0.0.1:0".into(),
            hooks: vec![HookConfig {
                id: "test".into(),
                path: "/test".into(),
                secret: secret.map(str::to_string),
                format,
            }],
        };
        (WebhookServer::new(config, recorder.clone()), recorder)
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    async fn send(
        router: Router,
        path: &str,
        method: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> StatusCode {
        let mut request = axum::http::Request::builder().method(method).uri(path);
        if let Some(sig) = signature {
            request = request.header("x-webhook-signature", sig);
        }
        let request = request
            .body(axum::body::Body::from(body.to_vec()))
            .unwrap();
        router.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn unsigned_hook_accepts_and_enqueues() {
        let (server, recorder) = server(None, HookFormat::Text);
        let status = send(server.router(), "/test", "POST", b"What is 2+2?", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let inputs = recorder.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].session_id, "webhook:test");
        assert_eq!(inputs[0].content, "What is 2+2?");
        assert_eq!(inputs[0].source, Source::Webhook);
        assert_eq!(inputs[0].metadata.get("id").unwrap(), "test");
    }

    #[tokio::test]
    async fn unsigned_hook_ignores_stray_signature_header() {
        let (server, recorder) = server(None, HookFormat::Text);
        let status = send(
            server.router(),
            "/test",
            "POST",
            b"x",
            Some("sha256=bogus"),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(recorder.inputs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn signed_hook_accepts_valid_signature() {
        let (server, recorder) = server(Some("s3cret"), HookFormat::Text);
        let body = b"payload";
        let sig = sign("s3cret", body);
        let status = send(server.router(), "/test", "POST", body, Some(&sig)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(recorder.inputs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn signed_hook_rejects_bad_or_missing_signature() {
        let (server, recorder) = server(Some("s3cret"), HookFormat::Text);
        let router = server.router();
        let status = send(router.clone(), "/test", "POST", b"x", Some("sha256=wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let status = send(router, "/test", "POST", b"x", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(recorder.inputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_path_is_404_and_wrong_method_405() {
        let (server, _) = server(None, HookFormat::Text);
        let router = server.router();
        assert_eq!(
            send(router.clone(), "/nope", "POST", b"", None).await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            send(router, "/test", "GET", b"", None).await,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (server, _) = server(None, HookFormat::Text);
        let response = server
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn json_hook_extracts_message_field() {
        let (server, recorder) = server(None, HookFormat::Json);
        let status = send(
            server.router(),
            "/test",
            "POST",
            br#"{"message": "from json"}"#,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(recorder.inputs.lock().unwrap()[0].content, "from json");
    }

    #[tokio::test]
    async fn json_hook_rejects_invalid_json() {
        let (server, recorder) = server(None, HookFormat::Json);
        let status = send(server.router(), "/test", "POST", b"not json", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(recorder.inputs.lock().unwrap().is_empty());
    }
}
