//! OpenStack connector: Keystone v3 password authentication.

use super::{ca_cert, check_status, http_client, insecure_skip_verify, secret_field};
use crate::domain::ports::Connector;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use serde_json::json;
use std::time::Duration;

pub const SECRET_DOMAIN_NAME: &str = "domainName";
pub const SECRET_PROJECT_NAME: &str = "projectName";
pub const SECRET_REGION_NAME: &str = "regionName";

pub struct OpenStackConnector {
    url: String,
    user: String,
    password: String,
    domain: String,
    project: String,
    ca: Option<String>,
    insecure: bool,
}

impl OpenStackConnector {
    pub fn from_secret(url: String, secret: &Secret) -> Self {
        Self {
            url,
            user: secret_field(secret, super::SECRET_USER).unwrap_or_default(),
            password: secret_field(secret, super::SECRET_PASSWORD).unwrap_or_default(),
            domain: secret_field(secret, SECRET_DOMAIN_NAME).unwrap_or_else(|| "Default".into()),
            project: secret_field(secret, SECRET_PROJECT_NAME).unwrap_or_default(),
            ca: ca_cert(secret),
            insecure: insecure_skip_verify(secret),
        }
    }

    fn body(&self) -> serde_json::Value {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.user,
                            "domain": {"name": self.domain},
                            "password": self.password
                        }
                    }
                },
                "scope": {
                    "project": {"name": self.project, "domain": {"name": self.domain}}
                }
            }
        })
    }
}

#[async_trait]
impl Connector for OpenStackConnector {
    async fn test(&self) -> Result<()> {
        let client = http_client(self.ca.as_deref(), self.insecure, Some(Duration::from_secs(30)))?;
        let url = format!("{}/auth/tokens", self.url.trim_end_matches('/'));
        let resp = client.post(&url).json(&self.body()).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}
