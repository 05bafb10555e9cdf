//! Secret admitters
//!
//! Only secrets labelled `createdForProviderType` are touched. The mutator
//! defaults `insecureSkipVerify` and, for oVirt, repairs `cacert` by
//! appending the engine CA. The validator tests the credentials against
//! the platform they were created for.

use super::{decode, diff_patch, Admitter, Request, Verdict};
use crate::connector::ovirt::engine_ca_url;
use crate::connector::{
    ca_cert, insecure_skip_verify, secret_field, CA_CERT_UPDATED, CREATED_FOR_PROVIDER_TYPE, SECRET_CACERT,
    SECRET_INSECURE, SECRET_URL,
};
use crate::crd::{ObjectRef, Provider, ProviderSpec, ProviderType};
use crate::domain::ports::{CaFetcher, ConnectorFactory, ProbeResult};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::admission::Operation;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PATCHED_PATHS: &[&str] = &["/data", "/metadata/labels"];

/// Provider type a secret was created for
fn created_for(secret: &Secret) -> Option<String> {
    secret
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(CREATED_FOR_PROVIDER_TYPE))
        .cloned()
}

/// PEM text with line breaks removed, for containment checks.
fn flatten(pem: &str) -> String {
    pem.chars().filter(|c| *c != '\n' && *c != '\r').collect()
}

/// Append `ca` to `bundle` with exactly one separating newline.
fn append_ca(bundle: &str, ca: &str) -> String {
    if bundle.is_empty() {
        ca.to_string()
    } else if bundle.ends_with('\n') {
        format!("{}{}", bundle, ca)
    } else {
        format!("{}\n{}", bundle, ca)
    }
}

fn set_data(secret: &mut Secret, key: &str, value: &str) {
    secret
        .data
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
}

// =============================================================================
// Mutator
// =============================================================================

/// Defaults verification and appends the oVirt engine CA
pub struct SecretMutator {
    fetcher: Arc<dyn CaFetcher>,
}

impl SecretMutator {
    pub fn new(fetcher: Arc<dyn CaFetcher>) -> Self {
        Self { fetcher }
    }

    /// Returns true when `cacert` was extended.
    async fn append_engine_ca(&self, secret: &mut Secret) -> bool {
        let Some(url) = secret_field(secret, SECRET_URL) else {
            debug!("oVirt secret has no url, skipping engine CA");
            return false;
        };
        let ca_url = match engine_ca_url(&url) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "Cannot derive engine CA URL");
                return false;
            }
        };
        let bundle = ca_cert(secret).unwrap_or_default();
        let trusted = (!bundle.is_empty()).then_some(bundle.as_str());
        let fetched = match self.fetcher.fetch(&ca_url, trusted).await {
            Ok(pem) => pem,
            Err(e) => {
                warn!(url = %ca_url, error = %e, "Failed to fetch engine CA");
                return false;
            }
        };
        let fetched = fetched.trim_end_matches('\n');
        if fetched.is_empty() || flatten(&bundle).contains(&flatten(fetched)) {
            return false;
        }

        let updated = append_ca(&bundle, fetched);
        set_data(secret, SECRET_CACERT, &updated);
        secret
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(CA_CERT_UPDATED.to_string(), "true".to_string());
        info!(secret = ?secret.metadata.name, "Appended engine CA to cacert");
        true
    }

    async fn mutate(&self, secret: &Secret) -> Result<Option<json_patch::Patch>> {
        let Some(provider_type) = created_for(secret) else {
            return Ok(None);
        };
        let mut mutated = secret.clone();

        if secret_field(&mutated, SECRET_INSECURE).is_none() {
            set_data(&mut mutated, SECRET_INSECURE, "false");
        }
        if provider_type == ProviderType::OVirt.as_str() && !insecure_skip_verify(&mutated) {
            self.append_engine_ca(&mut mutated).await;
        }

        diff_patch(
            &serde_json::to_value(secret)?,
            &serde_json::to_value(&mutated)?,
            PATCHED_PATHS,
        )
    }
}

#[async_trait]
impl Admitter for SecretMutator {
    async fn admit(&self, req: &Request) -> Verdict {
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return Verdict::Allow;
        }
        let secret: Secret = match decode(req) {
            Ok(s) => s,
            Err(e) => return Verdict::invalid(e.to_string()),
        };
        match self.mutate(&secret).await {
            Ok(patch) => Verdict::patched(patch),
            Err(e) => Verdict::failed(&e),
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Tests the credentials of provider secrets
pub struct SecretValidator {
    connectors: Arc<dyn ConnectorFactory>,
}

impl SecretValidator {
    pub fn new(connectors: Arc<dyn ConnectorFactory>) -> Self {
        Self { connectors }
    }

    /// Transient provider described by the secret's labels and data.
    fn provider(secret: &Secret, provider_type: ProviderType) -> Provider {
        let mut provider = Provider::new(
            secret.metadata.name.as_deref().unwrap_or("secret"),
            ProviderSpec {
                provider_type: Some(provider_type),
                url: secret_field(secret, SECRET_URL).unwrap_or_default(),
                secret: ObjectRef::new(
                    secret.metadata.namespace.clone().unwrap_or_default(),
                    secret.metadata.name.clone().unwrap_or_default(),
                ),
                settings: Default::default(),
            },
        );
        provider.metadata.namespace = secret.metadata.namespace.clone();
        provider
    }

    async fn validate(&self, secret: &Secret) -> Verdict {
        let Some(label) = created_for(secret) else {
            return Verdict::Allow;
        };
        let provider_type: ProviderType = match label.parse() {
            Ok(t) => t,
            Err(_) => {
                debug!(label = %label, "Secret created for unknown provider type");
                return Verdict::Allow;
            }
        };
        let provider = Self::provider(secret, provider_type);
        let connector = match self.connectors.build(&provider, secret) {
            Ok(c) => c,
            Err(e) => return Verdict::invalid(e.to_string()),
        };

        match connector.test().await {
            Ok(()) => {}
            Err(Error::SourceApi { code: 400 | 401, .. }) => return Verdict::deny("Invalid credentials"),
            Err(e) => {
                warn!(provider_type = %provider_type, error = %e, "Credential test inconclusive, allowing");
                return Verdict::Allow;
            }
        }

        if provider_type == ProviderType::OVirt {
            match connector.probe_transfer().await {
                ProbeResult::CertificateRejected(message) => return Verdict::deny(message),
                ProbeResult::Inconclusive(reason) => debug!(reason = %reason, "Transfer probe inconclusive"),
                ProbeResult::Passed => {}
            }
        }
        Verdict::Allow
    }
}

#[async_trait]
impl Admitter for SecretValidator {
    async fn admit(&self, req: &Request) -> Verdict {
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return Verdict::Allow;
        }
        match decode::<Secret>(req) {
            Ok(secret) => self.validate(&secret).await,
            Err(e) => Verdict::invalid(e.to_string()),
        }
    }
}
