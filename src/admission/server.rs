//! Webhook Server
//!
//! Routes AdmissionReview posts to the admitters and serves them over TLS.

use super::{Admitter, Request, Verdict};
use crate::error::Result;
use crate::inventory::web::{serve, TlsPaths};
use crate::metrics;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionResponse, AdmissionReview};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// State
// =============================================================================

/// Admitters served by the webhook router
#[derive(Clone)]
pub struct WebhookState {
    pub secret_mutator: Arc<dyn Admitter>,
    pub secret_validator: Arc<dyn Admitter>,
    pub provider_mutator: Arc<dyn Admitter>,
    pub provider_validator: Arc<dyn Admitter>,
    pub plan_mutator: Arc<dyn Admitter>,
    pub plan_validator: Arc<dyn Admitter>,
    pub migration_validator: Arc<dyn Admitter>,
}

impl WebhookState {
    fn mutator(&self, kind: &str) -> Option<&Arc<dyn Admitter>> {
        match kind {
            "secret" | "secrets" => Some(&self.secret_mutator),
            "provider" | "providers" => Some(&self.provider_mutator),
            "plan" | "plans" => Some(&self.plan_mutator),
            _ => None,
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Build the webhook router.
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/secret-validate", post(validate_secret))
        .route("/provider-validate", post(validate_provider))
        .route("/plan-validate", post(validate_plan))
        .route("/migration-validate", post(validate_migration))
        .route("/mutate/:kind", post(mutate))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Run one admitter over a review and wrap the response.
async fn review(
    kind: &str,
    admitter: &dyn Admitter,
    body: AdmissionReview<DynamicObject>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: Request = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(kind, error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let verdict = admitter.admit(&req).await;
    debug!(kind, uid = %req.uid, name = %req.name, allowed = verdict.is_allowed(), "Admission decided");
    if let Verdict::Deny { message, .. } = &verdict {
        info!(kind, uid = %req.uid, name = %req.name, reason = %message, "Admission denied");
    }
    metrics::record_admission(kind, verdict.is_allowed());
    Json(verdict.into_response(&req).into_review())
}

async fn validate_secret(
    State(state): State<WebhookState>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review("secret-validate", state.secret_validator.as_ref(), body).await
}

async fn validate_provider(
    State(state): State<WebhookState>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review("provider-validate", state.provider_validator.as_ref(), body).await
}

async fn validate_plan(
    State(state): State<WebhookState>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review("plan-validate", state.plan_validator.as_ref(), body).await
}

async fn validate_migration(
    State(state): State<WebhookState>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review("migration-validate", state.migration_validator.as_ref(), body).await
}

async fn mutate(
    State(state): State<WebhookState>,
    Path(kind): Path<String>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Response {
    let Some(admitter) = state.mutator(&kind) else {
        return (StatusCode::NOT_FOUND, format!("no mutator for {}", kind)).into_response();
    };
    let label = format!("{}-mutate", kind.trim_end_matches('s'));
    review(&label, admitter.as_ref(), body).await.into_response()
}

// =============================================================================
// Server
// =============================================================================

/// Webhook server configuration
#[derive(Debug, Clone)]
pub struct WebhookServerConfig {
    pub addr: SocketAddr,
    /// The API server only calls webhooks over TLS; plain HTTP is for tests
    pub tls: Option<TlsPaths>,
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            tls: None,
        }
    }
}

/// Admission webhook server
pub struct WebhookServer {
    config: WebhookServerConfig,
    state: WebhookState,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebhookServer {
    pub fn new(config: WebhookServerConfig, state: WebhookState) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            state,
            shutdown_tx,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = webhook_router(self.state.clone()).layer(TraceLayer::new_for_http());
        info!(addr = %self.config.addr, tls = self.config.tls.is_some(), "Webhook server listening");
        serve(self.config.addr, app, self.config.tls.as_ref(), self.shutdown_tx.subscribe()).await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::tests::request;
    use crate::admission::{ProviderMutator, ProviderValidator};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct Fixed(Verdict);

    #[async_trait]
    impl Admitter for Fixed {
        async fn admit(&self, _req: &Request) -> Verdict {
            self.0.clone()
        }
    }

    fn state() -> WebhookState {
        let allow: Arc<dyn Admitter> = Arc::new(Fixed(Verdict::Allow));
        WebhookState {
            secret_mutator: allow.clone(),
            secret_validator: Arc::new(Fixed(Verdict::deny("Invalid credentials"))),
            provider_mutator: Arc::new(ProviderMutator),
            provider_validator: Arc::new(ProviderValidator),
            plan_mutator: allow.clone(),
            plan_validator: allow.clone(),
            migration_validator: allow,
        }
    }

    fn review_body(kind: &str, object: Value) -> Value {
        let req = request(kind, "CREATE", object);
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": serde_json::to_value(&req).unwrap()
        }))
        .unwrap();
        serde_json::to_value(review).unwrap()
    }

    async fn post(uri: &str, body: Value) -> (StatusCode, Value) {
        let resp = webhook_router(state())
            .oneshot(
                HttpRequest::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn ova_provider() -> Value {
        json!({
            "apiVersion": "forklift.konveyor.io/v1beta1",
            "kind": "Provider",
            "metadata": {"name": "ova", "namespace": "konveyor"},
            "spec": {"type": "ova", "url": "nfs:/ova", "secret": {"namespace": "konveyor", "name": "ova"}}
        })
    }

    #[tokio::test]
    async fn test_validate_denies_with_code() {
        let secret = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s", "namespace": "konveyor"}});
        let (status, body) = post("/secret-validate", review_body("Secret", secret)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["uid"], "req-1");
        assert_eq!(body["response"]["allowed"], false);
        assert_eq!(body["response"]["status"]["code"], 403);
        assert_eq!(body["response"]["status"]["message"], "Invalid credentials");
    }

    #[tokio::test]
    async fn test_mutate_returns_patch() {
        let (status, body) = post("/mutate/provider", review_body("Provider", ova_provider())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["allowed"], true);
        assert_eq!(body["response"]["patchType"], "JSONPatch");
        assert!(body["response"]["patch"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_mutator_is_404() {
        let (status, _) = post("/mutate/hook", review_body("Provider", ova_provider())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
