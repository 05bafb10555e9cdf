//! Inventory REST Handlers
//!
//! Read-only views of each provider's inventory. Every inventory handler
//! goes through [`prepare`]: paging is parsed, the provider resolved in the
//! container and the request held until the collector reports a consistent
//! inventory (503 after the gate timeout).

use crate::error::{Error, Result};
use crate::inventory::container::{Container, Registration, ReconcilerStats};
use crate::inventory::model::{Cluster, Datacenter, Datastore, Folder, Host, Model, Network, Vm};
use crate::inventory::store::{ListOptions, Page, Store};
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default wait for collector consistency
pub const CONSISTENCY_TIMEOUT: Duration = Duration::from_secs(30);
const CONSISTENCY_POLL: Duration = Duration::from_millis(100);

// =============================================================================
// Request/Response Types
// =============================================================================

/// Paging and selection query parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    /// Zero-based page number
    #[serde(default)]
    pub page: Option<usize>,
    /// Page size; absent or zero returns everything
    #[serde(default)]
    pub size: Option<usize>,
    /// Exact name match
    #[serde(default)]
    pub name: Option<String>,
}

impl ListQuery {
    fn page(&self) -> Option<Page> {
        match (self.page, self.size) {
            (_, None) | (_, Some(0)) => None,
            (number, Some(size)) => Some(Page::new(number.unwrap_or(0), size)),
        }
    }

    fn options(&self) -> ListOptions {
        let mut opts = ListOptions::default();
        if let Some(page) = self.page() {
            opts = opts.with_page(page);
        }
        if let Some(name) = &self.name {
            opts = opts.with_name(name.clone());
        }
        opts
    }
}

/// Provider record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub url: String,
    pub object_count: usize,
    pub updates: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<chrono::DateTime<chrono::Utc>>,
    pub consistent: bool,
}

impl From<&Registration> for ProviderRecord {
    fn from(r: &Registration) -> Self {
        let ReconcilerStats {
            object_count,
            updates,
            last_update,
            consistent,
        } = r.reconciler.stats();
        Self {
            uid: r.provider.uid().to_string(),
            name: r.provider.name().to_string(),
            namespace: r.provider.namespace().to_string(),
            provider_type: r
                .provider
                .provider_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            url: r.provider.spec.url.clone(),
            object_count,
            updates,
            last_update,
            consistent,
        }
    }
}

/// Providers of every type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderDirectory {
    pub counts: BTreeMap<String, usize>,
    pub providers: BTreeMap<String, Vec<ProviderRecord>>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn error_response(status: StatusCode, error: &str, message: String) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            error: error.into(),
            message,
            details: None,
        }),
    )
        .into_response()
}

impl From<Error> for ApiErrorResponse {
    fn from(e: Error) -> Self {
        Self {
            error: e.kind().to_string(),
            message: e.to_string(),
            details: None,
        }
    }
}

fn store_error(e: Error) -> Response {
    let status = match e.status_code() {
        404 => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Inventory read failed");
    }
    (status, Json(ApiErrorResponse::from(e))).into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    container: Arc<Container>,
    consistency_timeout: Duration,
}

impl RestRouter {
    pub fn new(container: Arc<Container>) -> Self {
        Self {
            container,
            consistency_timeout: CONSISTENCY_TIMEOUT,
        }
    }

    /// Override the consistency gate timeout
    pub fn with_consistency_timeout(mut self, timeout: Duration) -> Self {
        self.consistency_timeout = timeout;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            container: self.container,
            consistency_timeout: self.consistency_timeout,
        };

        Router::new()
            .route("/providers", get(list_providers))
            .route("/providers/:type", get(list_providers_of_type))
            .route("/providers/:type/:provider", get(get_provider))
            .route("/providers/:type/:provider/:collection", get(list_collection))
            .route("/providers/:type/:provider/:collection/:id", get(get_entity))
            .route("/providers/:type/:provider/:collection/:id/:relation", get(traverse))
            .route("/health", get(health_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    container: Arc<Container>,
    consistency_timeout: Duration,
}

// =============================================================================
// Prepare
// =============================================================================

/// Resolve the provider and hold until its inventory is consistent.
async fn prepare(state: &AppState, provider_type: &str, provider: &str) -> std::result::Result<Registration, Response> {
    let Some(registration) = state.container.find(provider_type, provider) else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("provider {}/{} not found", provider_type, provider),
        ));
    };

    let reconciler = registration.reconciler.clone();
    let gate = async {
        while !reconciler.has_consistency() {
            tokio::time::sleep(CONSISTENCY_POLL).await;
        }
    };
    if tokio::time::timeout(state.consistency_timeout, gate).await.is_err() {
        warn!(provider = %reconciler.name(), "Inventory not consistent, rejecting read");
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Unavailable",
            format!("inventory of provider {} is not yet consistent", provider),
        ));
    }
    Ok(registration)
}

// =============================================================================
// Collections
// =============================================================================

/// Collection path segment to entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Folders,
    Datacenters,
    Clusters,
    Hosts,
    Networks,
    Datastores,
    Vms,
}

impl Collection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "folders" => Some(Collection::Folders),
            "datacenters" => Some(Collection::Datacenters),
            "clusters" => Some(Collection::Clusters),
            "hosts" => Some(Collection::Hosts),
            "networks" => Some(Collection::Networks),
            "datastores" => Some(Collection::Datastores),
            "vms" => Some(Collection::Vms),
            _ => None,
        }
    }

    fn list(&self, store: &Store, opts: &ListOptions) -> Result<Vec<Value>> {
        match self {
            Collection::Folders => summaries::<Folder>(store, opts),
            Collection::Datacenters => summaries::<Datacenter>(store, opts),
            Collection::Clusters => summaries::<Cluster>(store, opts),
            Collection::Hosts => summaries::<Host>(store, opts),
            Collection::Networks => summaries::<Network>(store, opts),
            Collection::Datastores => summaries::<Datastore>(store, opts),
            Collection::Vms => summaries::<Vm>(store, opts),
        }
    }

    fn get(&self, store: &Store, id: &str) -> Result<Value> {
        match self {
            Collection::Folders => detail::<Folder>(store, id),
            Collection::Datacenters => detail::<Datacenter>(store, id),
            Collection::Clusters => detail::<Cluster>(store, id),
            Collection::Hosts => detail::<Host>(store, id),
            Collection::Networks => detail::<Network>(store, id),
            Collection::Datastores => detail::<Datastore>(store, id),
            Collection::Vms => detail::<Vm>(store, id),
        }
    }

    /// Traversal below one entity; `None` when the relation is not defined.
    fn traverse(&self, store: &Store, id: &str, relation: Collection) -> Option<Result<Vec<Value>>> {
        let result = match (self, relation) {
            (Collection::Datacenters, _) => {
                let dc: Datacenter = match store.find(id) {
                    Ok(dc) => dc,
                    Err(e) => return Some(Err(e)),
                };
                match relation {
                    Collection::Vms => dc.vm_list(store).map(to_summaries),
                    Collection::Clusters => dc.cluster_list(store).map(to_summaries),
                    Collection::Hosts => dc.host_list(store).map(to_summaries),
                    Collection::Networks => dc.net_list(store).map(to_summaries),
                    Collection::Datastores => dc.ds_list(store).map(to_summaries),
                    _ => return None,
                }
            }
            (Collection::Clusters, Collection::Vms | Collection::Hosts) => {
                let cluster: Cluster = match store.find(id) {
                    Ok(c) => c,
                    Err(e) => return Some(Err(e)),
                };
                if relation == Collection::Vms {
                    cluster.vm_list(store).map(to_summaries)
                } else {
                    cluster.host_list(store).map(to_summaries)
                }
            }
            _ => return None,
        };
        Some(result)
    }
}

fn to_summaries<M: Model>(items: Vec<M>) -> Vec<Value> {
    items.iter().map(Model::summary).collect()
}

fn summaries<M: Model>(store: &Store, opts: &ListOptions) -> Result<Vec<Value>> {
    Ok(to_summaries(store.list::<M>(opts)?))
}

fn detail<M: Model>(store: &Store, id: &str) -> Result<Value> {
    let m: M = store.find(id)?;
    Ok(serde_json::to_value(m)?)
}

fn unknown_collection(collection: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "NotFound",
        format!("collection {} not found", collection),
    )
}

// =============================================================================
// Handlers
// =============================================================================

/// Merged directory across provider types
async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let mut directory = ProviderDirectory::default();
    for registration in state.container.list() {
        let record = ProviderRecord::from(&registration);
        *directory.counts.entry(record.provider_type.clone()).or_default() += 1;
        directory
            .providers
            .entry(record.provider_type.clone())
            .or_default()
            .push(record);
    }
    (StatusCode::OK, Json(directory)).into_response()
}

async fn list_providers_of_type(
    State(state): State<AppState>,
    Path(provider_type): Path<String>,
) -> impl IntoResponse {
    let records: Vec<ProviderRecord> = state
        .container
        .list()
        .iter()
        .map(ProviderRecord::from)
        .filter(|r| r.provider_type == provider_type)
        .collect();
    (StatusCode::OK, Json(records)).into_response()
}

async fn get_provider(
    State(state): State<AppState>,
    Path((provider_type, provider)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.container.find(&provider_type, &provider) {
        Some(registration) => (StatusCode::OK, Json(ProviderRecord::from(&registration))).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("provider {}/{} not found", provider_type, provider),
        ),
    }
}

async fn list_collection(
    State(state): State<AppState>,
    Path((provider_type, provider, collection)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let Some(kind) = Collection::parse(&collection) else {
        return unknown_collection(&collection);
    };
    let registration = match prepare(&state, &provider_type, &provider).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    debug!(provider = %provider, collection = %collection, "Listing inventory");

    match kind.list(registration.reconciler.db(), &query.options()) {
        Ok(items) => (StatusCode::OK, Json(items)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_entity(
    State(state): State<AppState>,
    Path((provider_type, provider, collection, id)): Path<(String, String, String, String)>,
) -> impl IntoResponse {
    let Some(kind) = Collection::parse(&collection) else {
        return unknown_collection(&collection);
    };
    let registration = match prepare(&state, &provider_type, &provider).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match kind.get(registration.reconciler.db(), &id) {
        Ok(item) => (StatusCode::OK, Json(item)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn traverse(
    State(state): State<AppState>,
    Path((provider_type, provider, collection, id, relation)): Path<(String, String, String, String, String)>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let (Some(kind), Some(related)) = (Collection::parse(&collection), Collection::parse(&relation)) else {
        return unknown_collection(&format!("{}/{}", collection, relation));
    };
    let registration = match prepare(&state, &provider_type, &provider).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match kind.traverse(registration.reconciler.db(), &id, related) {
        None => unknown_collection(&format!("{}/{}", collection, relation)),
        Some(Ok(items)) => {
            let items = match query.page() {
                Some(page) => page.slice(items),
                None => items,
            };
            (StatusCode::OK, Json(items)).into_response()
        }
        Some(Err(e)) => store_error(e),
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::container::tests::{vsphere, FakeBuilder};
    use crate::inventory::model::{Ref, RefList};
    use axum::body::Body;
    use axum::http::Request;
    use k8s_openapi::api::core::v1::Secret;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    async fn fixture(consistent: bool) -> (Router, Store) {
        let builder = Arc::new(FakeBuilder::default());
        let container = Arc::new(Container::new(builder.clone()));
        container
            .ensure(&vsphere("vc", "uid-1", "https://vc/sdk"), &Secret::default())
            .await
            .unwrap();
        let fake = builder.built.lock()[0].clone();
        fake.consistent.store(consistent, Ordering::SeqCst);

        let store = fake.store.clone();
        for i in 0..5 {
            let mut host = Host::with_id(&format!("host-{}", i));
            host.base.name = format!("esx{}", i);
            host.base.object.insert("config.product.version".into(), "8.0".into());
            store.insert(&mut host).unwrap();
        }

        let mut dc = Datacenter::with_id("datacenter-1");
        dc.host_folder = Ref::new("Folder", "group-h1");
        store.insert(&mut dc).unwrap();
        let mut folder = Folder::with_id("group-h1");
        folder.children = vec![Ref::new("Host", "host-0"), Ref::new("Host", "host-1")]
            .into_iter()
            .collect::<RefList>();
        store.insert(&mut folder).unwrap();

        let router = RestRouter::new(container)
            .with_consistency_timeout(Duration::from_millis(50))
            .build();
        (router, store)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_list_is_paged_and_omits_payload() {
        let (router, _) = fixture(true).await;
        let (status, body) = get_json(router.clone(), "/providers/vsphere/vc/hosts?page=1&size=2").await;
        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], "host-2");
        assert!(items[0].get("object").is_none());

        let (_, body) = get_json(router, "/providers/vsphere/uid-1/hosts").await;
        assert_eq!(body.as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_detail_includes_payload_and_404s() {
        let (router, _) = fixture(true).await;
        let (status, body) = get_json(router.clone(), "/providers/vsphere/vc/hosts/host-3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["object"]["config.product.version"], "8.0");

        let (status, _) = get_json(router.clone(), "/providers/vsphere/vc/hosts/host-99").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(router.clone(), "/providers/vsphere/missing/hosts").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(router, "/providers/vsphere/vc/widgets").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_inconsistent_inventory_returns_503() {
        let (router, _) = fixture(false).await;
        let (status, body) = get_json(router, "/providers/vsphere/vc/hosts").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Unavailable");
    }

    #[tokio::test]
    async fn test_provider_directory_and_record() {
        let (router, _) = fixture(false).await;
        let (status, body) = get_json(router.clone(), "/providers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["counts"]["vsphere"], 1);
        assert_eq!(body["providers"]["vsphere"][0]["name"], "vc");

        let (status, body) = get_json(router, "/providers/vsphere/vc").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["objectCount"], 7);
        assert_eq!(body["consistent"], false);
    }

    #[tokio::test]
    async fn test_datacenter_traversal() {
        let (router, _) = fixture(true).await;
        let (status, body) = get_json(router.clone(), "/providers/vsphere/vc/datacenters/datacenter-1/hosts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = get_json(router.clone(), "/providers/vsphere/vc/datacenters/datacenter-1/vms").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = get_json(router, "/providers/vsphere/vc/hosts/host-1/vms").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
