//! Provider admitters

use super::{decode, diff_patch, Admitter, Request, Verdict};
use crate::crd::{
    Provider, ProviderType, SDK_ENDPOINT, SDK_ENDPOINT_ESXI, SDK_ENDPOINT_VCENTER, USE_VDDK_AIO_OPTIMIZATION,
    VDDK_CONFIG, VDDK_IMAGE,
};
use crate::error::Result;
use async_trait::async_trait;
use kube::core::admission::Operation;
use tracing::debug;

const PATCHED_PATHS: &[&str] = &["/spec", "/metadata/finalizers"];

// =============================================================================
// Mutator
// =============================================================================

/// Defaults vSphere settings and adds type finalizers
#[derive(Debug, Default, Clone)]
pub struct ProviderMutator;

impl ProviderMutator {
    fn mutate(provider: &Provider, create: bool) -> Result<Option<json_patch::Patch>> {
        let mut mutated = provider.clone();

        if provider.provider_type() == Some(ProviderType::VSphere) {
            let settings = &mut mutated.spec.settings;
            settings
                .entry(SDK_ENDPOINT.to_string())
                .or_insert_with(|| SDK_ENDPOINT_VCENTER.to_string());
            let has_image = settings.get(VDDK_IMAGE).map(|i| !i.is_empty()).unwrap_or(false);
            if !has_image {
                settings.remove(USE_VDDK_AIO_OPTIMIZATION);
                settings.remove(VDDK_CONFIG);
            }
        }

        if create {
            if let Some(finalizer) = provider.provider_type().and_then(|t| t.finalizer()) {
                let finalizers = mutated.metadata.finalizers.get_or_insert_with(Vec::new);
                if !finalizers.iter().any(|f| f == finalizer) {
                    debug!(provider = %provider.name(), finalizer, "Adding provider finalizer");
                    finalizers.push(finalizer.to_string());
                }
            }
        }

        diff_patch(
            &serde_json::to_value(provider)?,
            &serde_json::to_value(&mutated)?,
            PATCHED_PATHS,
        )
    }
}

#[async_trait]
impl Admitter for ProviderMutator {
    async fn admit(&self, req: &Request) -> Verdict {
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return Verdict::Allow;
        }
        let provider: Provider = match decode(req) {
            Ok(p) => p,
            Err(e) => return Verdict::invalid(e.to_string()),
        };
        match Self::mutate(&provider, req.operation == Operation::Create) {
            Ok(patch) => Verdict::patched(patch),
            Err(e) => Verdict::failed(&e),
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Structural checks on Provider objects
#[derive(Debug, Default, Clone)]
pub struct ProviderValidator;

impl ProviderValidator {
    fn validate(provider: &Provider) -> Verdict {
        let Some(provider_type) = provider.provider_type() else {
            return Verdict::invalid("provider type must be set");
        };

        let needs_url = !matches!(provider_type, ProviderType::OpenShift | ProviderType::Ec2);
        if needs_url && provider.spec.url.is_empty() {
            return Verdict::invalid(format!("url is required for {} providers", provider_type));
        }
        if !provider.is_host() && !provider.spec.secret.is_set() {
            return Verdict::invalid("secret reference is required");
        }

        if provider_type == ProviderType::VSphere {
            if let Some(endpoint) = provider.spec.settings.get(SDK_ENDPOINT) {
                if endpoint != SDK_ENDPOINT_VCENTER && endpoint != SDK_ENDPOINT_ESXI {
                    return Verdict::invalid(format!(
                        "invalid sdkEndpoint '{}', expected '{}' or '{}'",
                        endpoint, SDK_ENDPOINT_VCENTER, SDK_ENDPOINT_ESXI
                    ));
                }
            }
        }
        Verdict::Allow
    }
}

#[async_trait]
impl Admitter for ProviderValidator {
    async fn admit(&self, req: &Request) -> Verdict {
        if req.operation == Operation::Delete {
            return Verdict::Allow;
        }
        match decode::<Provider>(req) {
            Ok(provider) => Self::validate(&provider),
            Err(e) => Verdict::invalid(format!("invalid provider: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::tests::{apply, message, request};
    use crate::crd::OVA_PROVIDER_FINALIZER;
    use serde_json::{json, Value};

    fn provider(provider_type: &str, url: &str, settings: Value) -> Value {
        json!({
            "apiVersion": "forklift.konveyor.io/v1beta1",
            "kind": "Provider",
            "metadata": {"name": "p", "namespace": "konveyor"},
            "spec": {
                "type": provider_type,
                "url": url,
                "secret": {"namespace": "konveyor", "name": "p-secret"},
                "settings": settings
            }
        })
    }

    #[tokio::test]
    async fn test_mutator_vsphere_defaults() {
        let object = provider(
            "vsphere",
            "https://vc/sdk",
            json!({"useVddkAioOptimization": "true", "vddkConfig": "x"}),
        );
        let verdict = ProviderMutator.admit(&request("Provider", "UPDATE", object.clone())).await;
        let patched = apply(&verdict, &object);
        assert_eq!(patched["spec"]["settings"], json!({"sdkEndpoint": "vcenter"}));

        let again = ProviderMutator.admit(&request("Provider", "UPDATE", patched)).await;
        assert_eq!(again, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_mutator_keeps_vddk_settings_with_image() {
        let object = provider(
            "vsphere",
            "https://vc/sdk",
            json!({"sdkEndpoint": "esxi", "vddkImage": "quay.io/vddk:8", "vddkConfig": "x"}),
        );
        let verdict = ProviderMutator.admit(&request("Provider", "UPDATE", object)).await;
        assert_eq!(verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_mutator_adds_finalizer_on_create() {
        let object = provider("ova", "nfs.example:/ova", json!({}));
        let verdict = ProviderMutator.admit(&request("Provider", "CREATE", object.clone())).await;
        let patched = apply(&verdict, &object);
        assert_eq!(patched["metadata"]["finalizers"], json!([OVA_PROVIDER_FINALIZER]));

        let update = ProviderMutator.admit(&request("Provider", "UPDATE", object)).await;
        assert_eq!(update, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_validator() {
        let ok = provider("vsphere", "https://vc/sdk", json!({"sdkEndpoint": "esxi"}));
        assert!(ProviderValidator.admit(&request("Provider", "CREATE", ok)).await.is_allowed());

        let bad_endpoint = provider("vsphere", "https://vc/sdk", json!({"sdkEndpoint": "host"}));
        let verdict = ProviderValidator.admit(&request("Provider", "CREATE", bad_endpoint)).await;
        assert!(message(&verdict).contains("sdkEndpoint"));

        let no_url = provider("ovirt", "", json!({}));
        assert!(!ProviderValidator.admit(&request("Provider", "CREATE", no_url)).await.is_allowed());

        let unknown = provider("xen", "https://x", json!({}));
        let verdict = ProviderValidator.admit(&request("Provider", "CREATE", unknown)).await;
        assert!(message(&verdict).starts_with("invalid provider"));

        let mut host = provider("openshift", "", json!({}));
        host["spec"]["secret"] = json!({});
        assert!(ProviderValidator.admit(&request("Provider", "CREATE", host)).await.is_allowed());
    }
}
