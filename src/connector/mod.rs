//! Provider connectors
//!
//! Live credential tests per provider type, plus the helpers shared by
//! every outbound HTTP client: reading secret fields and building a
//! reqwest client whose trust store is the user supplied CA.

pub mod openstack;
pub mod ovirt;

use crate::crd::{Provider, ProviderType};
use crate::domain::ports::{Connector, ConnectorFactory};
use crate::error::{Error, Result};
use crate::inventory::vsphere::client::{Credentials, VimClient};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Secret fields
// =============================================================================

pub const SECRET_USER: &str = "user";
pub const SECRET_PASSWORD: &str = "password";
pub const SECRET_CACERT: &str = "cacert";
pub const SECRET_INSECURE: &str = "insecureSkipVerify";
pub const SECRET_TOKEN: &str = "token";
pub const SECRET_URL: &str = "url";

/// Label naming the provider type a secret was created for
pub const CREATED_FOR_PROVIDER_TYPE: &str = "createdForProviderType";
/// Label set when the engine CA was appended to `cacert`
pub const CA_CERT_UPDATED: &str = "ca-cert-updated";

/// Decoded string field of a secret (`data`, then `stringData`).
pub fn secret_field(secret: &Secret, key: &str) -> Option<String> {
    if let Some(v) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(String::from_utf8_lossy(&v.0).to_string());
    }
    secret.string_data.as_ref().and_then(|d| d.get(key)).cloned()
}

/// `insecureSkipVerify`, defaulting to false on absence or parse failure.
pub fn insecure_skip_verify(secret: &Secret) -> bool {
    secret_field(secret, SECRET_INSECURE)
        .map(|v| v.trim().parse::<bool>().unwrap_or(false))
        .unwrap_or(false)
}

/// Non-empty `cacert`.
pub fn ca_cert(secret: &Secret) -> Option<String> {
    secret_field(secret, SECRET_CACERT).filter(|c| !c.trim().is_empty())
}

// =============================================================================
// HTTP client
// =============================================================================

/// Build an HTTP client. With `ca` set only that bundle is trusted; with
/// `insecure` set certificates are not verified at all.
pub fn http_client(ca: Option<&str>, insecure: bool, timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().cookie_store(true);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    } else if let Some(ca) = ca {
        let certs = pem::parse_many(ca)
            .map_err(|e| Error::InvariantViolation(format!("invalid cacert: {}", e)))?;
        if certs.is_empty() {
            return Err(Error::InvariantViolation("cacert contains no certificate".into()));
        }
        builder = builder.tls_built_in_root_certs(false);
        for cert in certs.iter().filter(|c| c.tag() == "CERTIFICATE") {
            builder = builder.add_root_certificate(reqwest::Certificate::from_der(cert.contents())?);
        }
    }
    Ok(builder.build()?)
}

/// Turn a non-success response into `Error::SourceApi`.
pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::SourceApi {
        code: status.as_u16(),
        message: body.chars().take(512).collect(),
    })
}

/// Whether an HTTP error was caused by certificate verification.
pub fn is_certificate_error(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let text = e.to_string().to_lowercase();
        if text.contains("certificate") || text.contains("unknownissuer") {
            return true;
        }
        source = e.source();
    }
    false
}

// =============================================================================
// Connectors
// =============================================================================

/// vSphere: login and logout
pub struct VSphereConnector {
    url: String,
    credentials: Credentials,
}

#[async_trait]
impl Connector for VSphereConnector {
    async fn test(&self) -> Result<()> {
        let client = VimClient::connect(&self.url, &self.credentials).await?;
        client.logout().await
    }
}

/// Remote OpenShift: an authenticated discovery call
pub struct OpenShiftConnector {
    url: String,
    token: String,
    ca: Option<String>,
    insecure: bool,
}

#[async_trait]
impl Connector for OpenShiftConnector {
    async fn test(&self) -> Result<()> {
        let client = http_client(self.ca.as_deref(), self.insecure, Some(Duration::from_secs(30)))?;
        let url = format!("{}/apis", self.url.trim_end_matches('/'));
        let resp = client.get(&url).bearer_auth(&self.token).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}

/// Providers without a live credential test (local host, OVA, EC2, Hyper-V)
pub struct NoopConnector;

#[async_trait]
impl Connector for NoopConnector {
    async fn test(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds the connector matching a provider type
#[derive(Debug, Default, Clone)]
pub struct DefaultConnectorFactory;

impl ConnectorFactory for DefaultConnectorFactory {
    fn build(&self, provider: &Provider, secret: &Secret) -> Result<Box<dyn Connector>> {
        let provider_type = provider
            .provider_type()
            .ok_or_else(|| Error::InvariantViolation("provider type not set".into()))?;
        let url = provider.spec.url.clone();
        let ca = ca_cert(secret);
        let insecure = insecure_skip_verify(secret);
        debug!(provider = %provider.name(), kind = %provider_type, "Building connector");

        let connector: Box<dyn Connector> = match provider_type {
            ProviderType::VSphere => Box::new(VSphereConnector {
                url,
                credentials: Credentials::from_secret(secret),
            }),
            ProviderType::OVirt => Box::new(ovirt::OVirtConnector::new(
                url,
                secret_field(secret, SECRET_USER).unwrap_or_default(),
                secret_field(secret, SECRET_PASSWORD).unwrap_or_default(),
                ca,
                insecure,
            )),
            ProviderType::OpenStack => Box::new(openstack::OpenStackConnector::from_secret(url, secret)),
            ProviderType::OpenShift if !provider.is_host() => Box::new(OpenShiftConnector {
                url,
                token: secret_field(secret, SECRET_TOKEN).unwrap_or_default(),
                ca,
                insecure,
            }),
            _ => Box::new(NoopConnector),
        };
        Ok(connector)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    pub(crate) fn secret(data: &[(&str, &str)]) -> Secret {
        let data: BTreeMap<String, ByteString> = data
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect();
        Secret {
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn test_secret_fields() {
        let s = secret(&[("user", "admin"), ("insecureSkipVerify", "true"), ("cacert", "  ")]);
        assert_eq!(secret_field(&s, SECRET_USER).as_deref(), Some("admin"));
        assert!(insecure_skip_verify(&s));
        assert_eq!(ca_cert(&s), None);

        let s = secret(&[("insecureSkipVerify", "maybe")]);
        assert!(!insecure_skip_verify(&s));
    }

    #[test]
    fn test_http_client_rejects_garbage_ca() {
        assert!(http_client(Some("not a pem"), false, None).is_err());
        assert!(http_client(Some("not a pem"), true, None).is_ok());
        assert!(http_client(None, false, None).is_ok());
    }

    #[test]
    fn test_factory_picks_noop_for_host() {
        let provider = Provider::new(
            "host",
            crate::crd::ProviderSpec {
                provider_type: Some(ProviderType::OpenShift),
                url: String::new(),
                secret: Default::default(),
                settings: Default::default(),
            },
        );
        let built = DefaultConnectorFactory.build(&provider, &secret(&[]));
        assert!(built.is_ok());

        let untyped = Provider::new("x", Default::default());
        assert!(DefaultConnectorFactory.build(&untyped, &secret(&[])).is_err());
    }
}
