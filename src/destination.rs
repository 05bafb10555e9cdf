//! Destination cluster clients
//!
//! A destination provider is either the local cluster (an OpenShift provider
//! without a URL) or a remote cluster reached with the bearer token in the
//! provider's secret. Remote clients are rate limited to `qps` requests
//! per second with at most `burst` requests in flight.

use crate::connector::{ca_cert, insecure_skip_verify, secret_field, SECRET_TOKEN};
use crate::crd::Provider;
use crate::domain::ports::{DestinationClient, DestinationFactory};
use crate::error::{Error, Result};
use crate::plan::cluster::KubeDestination;
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::client::ClientBuilder;
use kube::config::AuthInfo;
use kube::{Api, Client, Config};
use std::sync::Arc;
use std::time::Duration;
use tower::limit::rate::Rate;
use tower::limit::{ConcurrencyLimit, RateLimit};
use tower::Layer;
use tracing::{debug, info};

/// Client-side request rate towards a destination
pub const DESTINATION_QPS: f32 = 100.0;
/// Client-side burst towards a destination
pub const DESTINATION_BURST: u32 = 1000;

/// Connection settings for a destination cluster
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub kube: Config,
    pub qps: f32,
    pub burst: u32,
}

impl RestConfig {
    fn with_defaults(kube: Config) -> Self {
        Self {
            kube,
            qps: DESTINATION_QPS,
            burst: DESTINATION_BURST,
        }
    }
}

/// Configuration of a remote destination built from its secret.
pub fn remote_config(provider: &Provider, secret: &Secret) -> Result<RestConfig> {
    let url = provider
        .spec
        .url
        .parse::<hyper::Uri>()
        .map_err(|e| Error::Configuration(format!("invalid provider url '{}': {}", provider.spec.url, e)))?;
    let mut config = Config::new(url);

    let token = secret_field(secret, SECRET_TOKEN).unwrap_or_default();
    config.auth_info = serde_json::from_value::<AuthInfo>(serde_json::json!({ "token": token.trim() }))?;

    config.accept_invalid_certs = insecure_skip_verify(secret);
    if !config.accept_invalid_certs {
        if let Some(ca) = ca_cert(secret) {
            let certs = pem::parse_many(ca.as_bytes())
                .map_err(|e| Error::Configuration(format!("invalid cacert: {}", e)))?;
            config.root_cert = Some(certs.iter().map(|c| c.contents().to_vec()).collect());
        }
    }
    Ok(RestConfig::with_defaults(config))
}

/// Request limits of a destination client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    /// Requests admitted per second
    pub rate: u64,
    /// Requests in flight
    pub concurrency: usize,
}

impl RequestLimits {
    pub fn of(config: &RestConfig) -> Self {
        Self {
            rate: config.qps.round().max(1.0) as u64,
            concurrency: config.burst.max(1) as usize,
        }
    }
}

impl<S> Layer<S> for RequestLimits {
    type Service = ConcurrencyLimit<RateLimit<S>>;

    fn layer(&self, inner: S) -> Self::Service {
        let rate = Rate::new(self.rate, Duration::from_secs(1));
        ConcurrencyLimit::new(RateLimit::new(inner, rate), self.concurrency)
    }
}

/// Build a rate-limited client for a destination.
pub fn limited_client(config: RestConfig) -> Result<Client> {
    let limits = RequestLimits::of(&config);
    let client = ClientBuilder::try_from(config.kube)?.with_layer(&limits).build();
    Ok(client)
}

/// Configuration for a destination provider. The local host uses the
/// controller's own in-cluster (or kubeconfig) settings.
pub async fn rest_config(provider: &Provider, secret: Option<&Secret>) -> Result<RestConfig> {
    if provider.is_host() {
        let config = Config::infer().await.map_err(|e| Error::KubeConfig(e.to_string()))?;
        return Ok(RestConfig::with_defaults(config));
    }
    let secret = secret.ok_or_else(|| {
        Error::InvariantViolation(format!("provider {}/{} has no secret", provider.namespace(), provider.name()))
    })?;
    remote_config(provider, secret)
}

// =============================================================================
// Factory
// =============================================================================

struct Cached {
    version: String,
    client: Arc<dyn DestinationClient>,
}

/// Builds and caches destination clients. A cached client is rebuilt when
/// the provider or its secret changes.
pub struct KubeDestinationFactory {
    local: Client,
    cache: DashMap<String, Cached>,
}

impl KubeDestinationFactory {
    pub fn new(local: Client) -> Self {
        Self {
            local,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl DestinationFactory for KubeDestinationFactory {
    async fn client_for(&self, provider: &Provider) -> Result<Arc<dyn DestinationClient>> {
        if provider.is_host() {
            return Ok(Arc::new(KubeDestination::new(self.local.clone())));
        }

        let secret_ref = &provider.spec.secret;
        let secrets: Api<Secret> = Api::namespaced(self.local.clone(), &secret_ref.namespace);
        let secret = secrets.get(&secret_ref.name).await?;

        let key = format!("{}/{}", provider.namespace(), provider.name());
        let version = format!(
            "{}:{}",
            provider.metadata.resource_version.as_deref().unwrap_or_default(),
            secret.metadata.resource_version.as_deref().unwrap_or_default()
        );
        if let Some(cached) = self.cache.get(&key) {
            if cached.version == version {
                return Ok(cached.client.clone());
            }
        }

        let config = rest_config(provider, Some(&secret)).await?;
        debug!(provider = %key, url = %provider.spec.url, qps = config.qps, burst = config.burst, "Building destination client");
        let client: Arc<dyn DestinationClient> = Arc::new(KubeDestination::new(limited_client(config)?));
        self.cache.insert(
            key.clone(),
            Cached {
                version,
                client: client.clone(),
            },
        );
        info!(provider = %key, "Destination client ready");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::secret;
    use crate::crd::{ProviderSpec, ProviderType};

    const PEM_A: &str = "-----BEGIN CERTIFICATE-----\nAAECAwQ=\n-----END CERTIFICATE-----\n";

    fn remote(url: &str) -> Provider {
        Provider::new(
            "remote",
            ProviderSpec {
                provider_type: Some(ProviderType::OpenShift),
                url: url.into(),
                secret: crate::crd::ObjectRef::new("konveyor", "remote"),
                settings: Default::default(),
            },
        )
    }

    #[test]
    fn test_remote_config_with_ca() {
        let s = secret(&[("token", "abc\n"), ("cacert", PEM_A)]);
        let config = remote_config(&remote("https://api.remote:6443"), &s).unwrap();
        assert_eq!(config.kube.cluster_url.host(), Some("api.remote"));
        assert!(!config.kube.accept_invalid_certs);
        assert_eq!(config.kube.root_cert, Some(vec![vec![0, 1, 2, 3, 4]]));
        assert!(config.kube.auth_info.token.is_some());
        assert_eq!(config.qps, 100.0);
        assert_eq!(config.burst, 1000);
    }

    #[tokio::test]
    async fn test_request_limits_throttle_beyond_rate() {
        use futures::FutureExt;
        use tower::{service_fn, Service, ServiceExt};

        let s = secret(&[("token", "abc")]);
        let mut config = remote_config(&remote("https://api.remote:6443"), &s).unwrap();
        assert_eq!(RequestLimits::of(&config), RequestLimits { rate: 100, concurrency: 1000 });

        config.qps = 2.0;
        config.burst = 0;
        let limits = RequestLimits::of(&config);
        assert_eq!(limits, RequestLimits { rate: 2, concurrency: 1 });

        let mut svc = limits.layer(service_fn(|n: u32| async move { Ok::<_, std::convert::Infallible>(n) }));
        for n in 0..2 {
            let ready = ServiceExt::<u32>::ready(&mut svc).await.unwrap();
            assert_eq!(ready.call(n).await.unwrap(), n);
        }
        assert!(ServiceExt::<u32>::ready(&mut svc).now_or_never().is_none());
    }

    #[test]
    fn test_remote_config_insecure_ignores_ca() {
        let s = secret(&[("token", "abc"), ("insecureSkipVerify", "true"), ("cacert", PEM_A)]);
        let config = remote_config(&remote("https://api.remote:6443"), &s).unwrap();
        assert!(config.kube.accept_invalid_certs);
        assert!(config.kube.root_cert.is_none());
    }

    #[test]
    fn test_remote_config_rejects_bad_url() {
        let err = remote_config(&remote("not a url"), &secret(&[])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_remote_without_secret() {
        let err = rest_config(&remote("https://api.remote:6443"), None).await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }
}
