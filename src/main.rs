//! Forklift Controller
//!
//! Runs the VM migration controller plane in one process:
//! - Provider, Plan and Migration controllers
//! - the inventory collectors and their REST API
//! - the admission webhook server
//! - health and metrics endpoints

use anyhow::Context as _;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use forklift_controller::admission::{
    KubeAccessReviewer, KubeClusterLookup, MigrationValidator, PlanMutator, PlanValidator, ProviderMutator,
    ProviderValidator, SecretMutator, SecretValidator, WebhookServer, WebhookServerConfig, WebhookState,
};
use forklift_controller::connector::{ovirt::HttpCaFetcher, DefaultConnectorFactory};
use forklift_controller::controller::{build_controllers, Context};
use forklift_controller::destination::KubeDestinationFactory;
use forklift_controller::inventory::vsphere::{CollectorBuilder, VimControlFactory};
use forklift_controller::inventory::web::{ApiServer, ApiServerConfig, TlsPaths};
use forklift_controller::inventory::Container;
use forklift_controller::{crd, ClusterLookup, Engine, EngineConfig, Settings};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Forklift Controller - migrate virtual machines into KubeVirt
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Inventory REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Admission webhook bind address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:443")]
    webhook_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// TLS certificate for the webhook and inventory API
    #[arg(long, env = "TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key for the webhook and inventory API
    #[arg(long, env = "TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    settings: Settings,
}

impl Args {
    fn tls(&self) -> anyhow::Result<Option<TlsPaths>> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some(TlsPaths {
                cert: cert.clone(),
                key: key.clone(),
            })),
            (None, None) => Ok(None),
            _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.crd {
        print!("{}", crd::crd_yaml()?);
        return Ok(());
    }

    init_logging(&args);

    let settings = args.settings.clone();
    info!("Starting Forklift Controller");
    info!("  Version: {}", forklift_controller::VERSION);
    info!("  Namespace: {}", settings.namespace);
    info!("  Inventory API: {}", args.api_addr);
    info!("  Webhook: {}", args.webhook_addr);
    info!("  Max concurrent VMs: {}", settings.max_concurrent_vms);
    info!("  Keep VM on success: {}", settings.keep_vm_on_success);
    match &settings.inventory_path {
        Some(path) => info!("  Inventory path: {}", path.display()),
        None => info!("  Inventory path: (in memory)"),
    }

    let tls = args.tls()?;
    if tls.is_none() {
        warn!("No TLS material configured; the API server will not call plain-HTTP webhooks");
    }

    let client = kube::Client::try_default()
        .await
        .context("building Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Shared collaborators
    let lookup: Arc<dyn ClusterLookup> = Arc::new(KubeClusterLookup::new(client.clone()));
    let reviewer = Arc::new(KubeAccessReviewer::new(client.clone()));
    let connectors = Arc::new(DefaultConnectorFactory);
    let destinations = Arc::new(KubeDestinationFactory::new(client.clone()));
    let container = Arc::new(Container::new(Arc::new(CollectorBuilder::new(
        settings.inventory_path.clone(),
    ))));

    // Inventory API
    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            addr: parse_addr(&args.api_addr, "inventory API")?,
            tls: tls.clone(),
            ..Default::default()
        },
        container.clone(),
    ));
    let api = api_server.clone();
    tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!("Inventory API error: {}", e);
        }
    });

    // Admission webhooks
    let state = WebhookState {
        secret_mutator: Arc::new(SecretMutator::new(Arc::new(HttpCaFetcher))),
        secret_validator: Arc::new(SecretValidator::new(connectors.clone())),
        provider_mutator: Arc::new(ProviderMutator),
        provider_validator: Arc::new(ProviderValidator),
        plan_mutator: Arc::new(PlanMutator::new(lookup.clone(), destinations.clone())),
        plan_validator: Arc::new(PlanValidator::new(lookup.clone(), reviewer.clone())),
        migration_validator: Arc::new(MigrationValidator::new(lookup.clone(), reviewer)),
    };
    let webhook_server = Arc::new(WebhookServer::new(
        WebhookServerConfig {
            addr: parse_addr(&args.webhook_addr, "webhook")?,
            tls,
        },
        state,
    ));
    let webhooks = webhook_server.clone();
    tokio::spawn(async move {
        if let Err(e) = webhooks.run().await {
            error!("Webhook server error: {}", e);
        }
    });

    // Plan execution engine
    let engine = Arc::new(Engine::new(
        lookup.clone(),
        container.clone(),
        destinations,
        Arc::new(VimControlFactory),
        EngineConfig::from_settings(&settings),
    ));

    let ctx = Arc::new(Context {
        client,
        lookup,
        container: container.clone(),
        connectors,
        engine,
        settings,
    });

    info!("Starting controllers:");
    futures::future::join_all(build_controllers(ctx)).await;

    info!("Controllers stopped, shutting down");
    api_server.shutdown();
    webhook_server.shutdown();
    container.shutdown().await;

    info!("Controller shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, what: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid {} address: {}", what, addr))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text(StatusCode::OK, "ok"),
                _ => text(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr = parse_addr(addr, "health server")?;
    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("health server")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // Register controller metrics up front so the first scrape sees them
    let _ = forklift_controller::metrics::metrics();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            error!(error = %e, "Metric encoding failed");
                            text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr = parse_addr(addr, "metrics server")?;
    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("metrics server")?;

    Ok(())
}
