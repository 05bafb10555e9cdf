//! oVirt connector and engine CA retrieval
//!
//! Besides the credential test, oVirt secrets get a data-path probe: an
//! image transfer is opened on an OVF store disk and the imageio proxy is
//! contacted with the user supplied CA. A rejected certificate there means
//! disk transfers would fail later even though the API login works.

use super::{check_status, http_client, is_certificate_error};
use crate::domain::ports::{CaFetcher, Connector, ProbeResult};
use crate::error::{Error, Result};
use crate::inventory::vsphere::xml;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for CA retrieval and the transfer probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// URL of the engine CA derived from the provider URL.
pub fn engine_ca_url(provider_url: &str) -> Result<String> {
    let url = reqwest::Url::parse(provider_url)
        .map_err(|e| Error::InvariantViolation(format!("invalid provider URL {}: {}", provider_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvariantViolation(format!("provider URL {} has no host", provider_url)))?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Ok(format!(
        "{}://{}/ovirt-engine/services/pki-resource?resource=ca-certificate&format=X509-PEM-CA",
        url.scheme(),
        authority
    ))
}

/// Fetches CA bundles over HTTPS
#[derive(Debug, Default, Clone)]
pub struct HttpCaFetcher;

#[async_trait]
impl CaFetcher for HttpCaFetcher {
    async fn fetch(&self, url: &str, trusted: Option<&str>) -> Result<String> {
        let client = http_client(trusted, false, Some(PROBE_TIMEOUT))?;
        let resp = client.get(url).send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.text().await?)
    }
}

pub struct OVirtConnector {
    url: String,
    user: String,
    password: String,
    ca: Option<String>,
    insecure: bool,
}

impl OVirtConnector {
    pub fn new(url: String, user: String, password: String, ca: Option<String>, insecure: bool) -> Self {
        Self {
            url,
            user,
            password,
            ca,
            insecure,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn get_xml(&self, client: &reqwest::Client, path: &str) -> Result<xml::Element> {
        let resp = client
            .get(self.api(path))
            .basic_auth(&self.user, Some(&self.password))
            .header("Accept", "application/xml")
            .header("Version", "4")
            .send()
            .await?;
        let body = check_status(resp).await?.text().await?;
        xml::parse(&body)
    }

    async fn post_xml(&self, client: &reqwest::Client, path: &str, body: String) -> Result<xml::Element> {
        let resp = client
            .post(self.api(path))
            .basic_auth(&self.user, Some(&self.password))
            .header("Accept", "application/xml")
            .header("Content-Type", "application/xml")
            .header("Version", "4")
            .body(body)
            .send()
            .await?;
        let body = check_status(resp).await?.text().await?;
        xml::parse(&body)
    }

    async fn probe(&self) -> Result<ProbeResult> {
        let client = http_client(self.ca.as_deref(), self.insecure, Some(PROBE_TIMEOUT))?;

        let disks = self.get_xml(&client, "disks?search=name%3DOVF_STORE").await?;
        let Some(disk_id) = disks.descendant("disk").and_then(|d| d.attr("id")).map(str::to_string) else {
            return Ok(ProbeResult::Inconclusive("no OVF store disk found".into()));
        };

        let body = format!(
            "<image_transfer><disk id=\"{}\"/><direction>download</direction></image_transfer>",
            xml::escape(&disk_id)
        );
        let transfer = self.post_xml(&client, "imagetransfers", body).await?;
        let transfer_el = transfer.child("image_transfer").unwrap_or(&transfer);
        let transfer_id = transfer_el.attr("id").unwrap_or_default().to_string();
        let proxy_url = transfer_el.child_text("proxy_url").unwrap_or_default().to_string();

        let result = if proxy_url.is_empty() {
            ProbeResult::Inconclusive("image transfer has no proxy URL".into())
        } else {
            match client.get(&proxy_url).send().await {
                Ok(_) => ProbeResult::Passed,
                Err(e) if is_certificate_error(&e) => ProbeResult::CertificateRejected(format!(
                    "The certificate of the imageio proxy at {} is not trusted by the provided CA certificate: {}",
                    proxy_url, e
                )),
                Err(e) => ProbeResult::Inconclusive(e.to_string()),
            }
        };

        if !transfer_id.is_empty() {
            let path = format!("imagetransfers/{}/cancel", transfer_id);
            if let Err(e) = self.post_xml(&client, &path, "<action/>".into()).await {
                debug!(transfer = %transfer_id, error = %e, "Failed to cancel probe transfer");
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl Connector for OVirtConnector {
    async fn test(&self) -> Result<()> {
        let client = http_client(self.ca.as_deref(), self.insecure, Some(PROBE_TIMEOUT))?;
        self.get_xml(&client, "").await?;
        Ok(())
    }

    async fn probe_transfer(&self) -> ProbeResult {
        match tokio::time::timeout(PROBE_TIMEOUT, self.probe()).await {
            Ok(Ok(result)) => result,
            Ok(Err(Error::Http(e))) if is_certificate_error(&e) => {
                ProbeResult::CertificateRejected(format!("The provided CA certificate is not valid for {}: {}", self.url, e))
            }
            Ok(Err(e)) => {
                warn!(url = %self.url, error = %e, "OVF store probe failed");
                ProbeResult::Inconclusive(e.to_string())
            }
            Err(_) => ProbeResult::Inconclusive("probe timed out".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_ca_url() {
        assert_eq!(
            engine_ca_url("https://e.example/").unwrap(),
            "https://e.example/ovirt-engine/services/pki-resource?resource=ca-certificate&format=X509-PEM-CA"
        );
        assert_eq!(
            engine_ca_url("https://e.example:8443/ovirt-engine/api").unwrap(),
            "https://e.example:8443/ovirt-engine/services/pki-resource?resource=ca-certificate&format=X509-PEM-CA"
        );
        assert!(engine_ca_url("not a url").is_err());
    }

    #[test]
    fn test_api_join() {
        let c = OVirtConnector::new("https://e/ovirt-engine/api/".into(), "u".into(), "p".into(), None, true);
        assert_eq!(c.api("/disks"), "https://e/ovirt-engine/api/disks");
    }
}
