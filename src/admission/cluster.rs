//! Kubernetes adapters for the admission ports
//!
//! `SubjectAccessReview` backed permission checks and typed reads of the
//! Forklift and core objects admitters consult.

use crate::crd::{NetworkMap, ObjectRef, Plan, Provider, StorageMap};
use crate::domain::ports::{AccessCheck, AccessReviewer, ClusterLookup};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::UserInfo;
use k8s_openapi::api::authorization::v1::{ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

// =============================================================================
// Access Review
// =============================================================================

/// Delegates permission checks to the API server
#[derive(Clone)]
pub struct KubeAccessReviewer {
    client: Client,
}

impl KubeAccessReviewer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn review(user: &UserInfo, check: &AccessCheck) -> SubjectAccessReview {
        let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());
        SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: user.username.clone(),
                uid: user.uid.clone(),
                groups: user.groups.clone(),
                extra: user.extra.clone(),
                resource_attributes: Some(ResourceAttributes {
                    verb: optional(&check.verb),
                    group: Some(check.group.clone()),
                    resource: optional(&check.resource),
                    namespace: optional(&check.namespace),
                    name: optional(&check.name),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl AccessReviewer for KubeAccessReviewer {
    async fn allowed(&self, user: &UserInfo, check: &AccessCheck) -> Result<bool> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let review = api.create(&PostParams::default(), &Self::review(user, check)).await?;
        let allowed = review.status.map(|s| s.allowed).unwrap_or(false);
        debug!(user = ?user.username, check = %check, allowed, "Access review");
        Ok(allowed)
    }
}

// =============================================================================
// Cluster Lookup
// =============================================================================

/// Reads objects from the local cluster
#[derive(Clone)]
pub struct KubeClusterLookup {
    client: Client,
}

impl KubeClusterLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get<K>(&self, r: &ObjectRef) -> Result<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &r.namespace);
        Ok(api.get(&r.name).await?)
    }
}

#[async_trait]
impl ClusterLookup for KubeClusterLookup {
    async fn provider(&self, r: &ObjectRef) -> Result<Provider> {
        self.get(r).await
    }

    async fn secret(&self, r: &ObjectRef) -> Result<Secret> {
        self.get(r).await
    }

    async fn plan(&self, r: &ObjectRef) -> Result<Plan> {
        self.get(r).await
    }

    async fn storage_map(&self, r: &ObjectRef) -> Result<StorageMap> {
        self.get(r).await
    }

    async fn network_map(&self, r: &ObjectRef) -> Result<NetworkMap> {
        self.get(r).await
    }

    async fn storage_class(&self, name: &str) -> Result<StorageClass> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_spec() {
        let user = UserInfo {
            username: Some("alice".into()),
            groups: Some(vec!["devs".into()]),
            ..Default::default()
        };
        let check = AccessCheck::new("create", "kubevirt.io", "virtualmachines", "target", "");
        let review = KubeAccessReviewer::review(&user, &check);
        assert_eq!(review.spec.user.as_deref(), Some("alice"));
        let attrs = review.spec.resource_attributes.unwrap();
        assert_eq!(attrs.verb.as_deref(), Some("create"));
        assert_eq!(attrs.namespace.as_deref(), Some("target"));
        assert_eq!(attrs.name, None);
    }
}
