//! Cluster API boundary
//!
//! [`ClusterApi`] is the only way the operator talks to Kubernetes. Reads return
//! `Option` and deletes return `bool`, so "not found" is a value rather than an
//! error: every `Err` coming out of this module is a real API failure.
//!
//! [`KubeClusterApi`] implements the trait on top of `kube::Api`.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, ResourceRequirements, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Label Kubernetes puts on every pod created for a Job
pub const JOB_NAME_LABEL: &str = "job-name";

/// Declarative resource kinds managed by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Config,
    Service,
    Ingress,
    Deployment,
}

impl ResourceKind {
    /// All kinds in creation order
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Ingress,
        ResourceKind::Config,
        ResourceKind::Service,
        ResourceKind::Deployment,
    ];

    /// Name of the manifest template that renders this kind
    pub fn template_name(&self) -> &'static str {
        match self {
            ResourceKind::Config => "config-map",
            ResourceKind::Service => "service",
            ResourceKind::Ingress => "ingress",
            ResourceKind::Deployment => "server-deployment",
        }
    }

    /// Kubernetes kind name
    pub fn api_kind(&self) -> &'static str {
        match self {
            ResourceKind::Config => "ConfigMap",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Deployment => "Deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_kind())
    }
}

/// Identity of a managed resource: (kind, name, namespace)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} in {}", self.kind, self.name, self.namespace)
    }
}

/// A typed Kubernetes object of one of the managed kinds
///
/// Only the fields the operator mutates are touched (name, namespace,
/// annotations, container resources); everything else passes through from
/// the rendered template untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedResource {
    Config(ConfigMap),
    Service(Service),
    Ingress(Ingress),
    Deployment(Deployment),
}

impl ManagedResource {
    /// Build a typed resource from a rendered manifest
    pub fn from_manifest(kind: ResourceKind, manifest: serde_json::Value) -> Result<Self> {
        let resource = match kind {
            ResourceKind::Config => ManagedResource::Config(serde_json::from_value(manifest)?),
            ResourceKind::Service => ManagedResource::Service(serde_json::from_value(manifest)?),
            ResourceKind::Ingress => ManagedResource::Ingress(serde_json::from_value(manifest)?),
            ResourceKind::Deployment => {
                ManagedResource::Deployment(serde_json::from_value(manifest)?)
            }
        };
        Ok(resource)
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ManagedResource::Config(_) => ResourceKind::Config,
            ManagedResource::Service(_) => ResourceKind::Service,
            ManagedResource::Ingress(_) => ResourceKind::Ingress,
            ManagedResource::Deployment(_) => ResourceKind::Deployment,
        }
    }

    fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            ManagedResource::Config(r) => &r.metadata,
            ManagedResource::Service(r) => &r.metadata,
            ManagedResource::Ingress(r) => &r.metadata,
            ManagedResource::Deployment(r) => &r.metadata,
        }
    }

    fn meta_mut(&mut self) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            ManagedResource::Config(r) => &mut r.metadata,
            ManagedResource::Service(r) => &mut r.metadata,
            ManagedResource::Ingress(r) => &mut r.metadata,
            ManagedResource::Deployment(r) => &mut r.metadata,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.meta().name.as_deref()
    }

    /// Override metadata.name and metadata.namespace
    pub fn set_identity(&mut self, name: &str, namespace: &str) {
        let meta = self.meta_mut();
        meta.name = Some(name.to_string());
        meta.namespace = Some(namespace.to_string());
    }

    /// Current metadata annotations (empty when unset)
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.meta().annotations.clone().unwrap_or_default()
    }

    /// Replace the annotation map
    ///
    /// Deployments also get the annotations on their pod template, so that a
    /// changed annotation (e.g. a new version) rolls the pods.
    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        if let ManagedResource::Deployment(deployment) = self {
            if let Some(spec) = deployment.spec.as_mut() {
                let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
                template_meta.annotations = Some(annotations.clone());
            }
        }
        self.meta_mut().annotations = Some(annotations);
    }

    /// Set the resource requirements of the first container.
    ///
    /// Only meaningful for Deployments; other kinds ignore the call.
    pub fn set_container_resources(&mut self, resources: ResourceRequirements) {
        if let ManagedResource::Deployment(deployment) = self {
            if let Some(container) = deployment
                .spec
                .as_mut()
                .and_then(|s| s.template.spec.as_mut())
                .and_then(|p| p.containers.first_mut())
            {
                container.resources = Some(resources);
            }
        }
    }

    /// Whether the reported status counts as available
    ///
    /// Deployments need `availableReplicas == replicas` and no unavailable
    /// replicas; the other kinds are available as soon as they exist.
    pub fn is_available(&self) -> bool {
        match self {
            ManagedResource::Deployment(deployment) => match deployment.status.as_ref() {
                Some(status) => {
                    status.available_replicas.unwrap_or(0) == status.replicas.unwrap_or(0)
                        && status.unavailable_replicas.unwrap_or(0) == 0
                }
                None => false,
            },
            _ => true,
        }
    }
}

/// CRUD and status reads for every kind the operator touches
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read a managed resource; `None` when it does not exist
    async fn get_resource(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ManagedResource>>;

    async fn create_resource(&self, namespace: &str, resource: &ManagedResource) -> Result<()>;

    /// Patch an existing resource with the full desired body
    async fn patch_resource(&self, namespace: &str, resource: &ManagedResource) -> Result<()>;

    /// Delete a managed resource; `false` when it was already absent
    async fn delete_resource(&self, namespace: &str, kind: ResourceKind, name: &str)
        -> Result<bool>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()>;

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Names of the pods labeled with the given job name
    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<String>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// [`ClusterApi`] backed by a live Kubernetes client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_typed<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_typed<K>(&self, namespace: &str, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        api.create(&PostParams::default(), obj).await?;
        Ok(())
    }

    async fn patch_typed<K>(&self, namespace: &str, name: &str, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        api.patch(name, &PatchParams::default(), &Patch::Strategic(obj))
            .await?;
        Ok(())
    }

    async fn delete_typed<K>(&self, namespace: &str, name: &str) -> Result<bool>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if OperatorError::is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn require_name(resource: &ManagedResource) -> Result<&str> {
    resource.name().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} missing metadata.name", resource.kind()))
    })
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_resource(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ManagedResource>> {
        debug!(%kind, name = %name, namespace = %namespace, "Reading resource");
        let resource = match kind {
            ResourceKind::Config => self
                .get_typed::<ConfigMap>(namespace, name)
                .await?
                .map(ManagedResource::Config),
            ResourceKind::Service => self
                .get_typed::<Service>(namespace, name)
                .await?
                .map(ManagedResource::Service),
            ResourceKind::Ingress => self
                .get_typed::<Ingress>(namespace, name)
                .await?
                .map(ManagedResource::Ingress),
            ResourceKind::Deployment => self
                .get_typed::<Deployment>(namespace, name)
                .await?
                .map(ManagedResource::Deployment),
        };
        Ok(resource)
    }

    async fn create_resource(&self, namespace: &str, resource: &ManagedResource) -> Result<()> {
        debug!(kind = %resource.kind(), name = ?resource.name(), "Creating resource");
        match resource {
            ManagedResource::Config(r) => self.create_typed(namespace, r).await,
            ManagedResource::Service(r) => self.create_typed(namespace, r).await,
            ManagedResource::Ingress(r) => self.create_typed(namespace, r).await,
            ManagedResource::Deployment(r) => self.create_typed(namespace, r).await,
        }
    }

    async fn patch_resource(&self, namespace: &str, resource: &ManagedResource) -> Result<()> {
        let name = require_name(resource)?;
        debug!(kind = %resource.kind(), name = %name, "Patching resource");
        match resource {
            ManagedResource::Config(r) => self.patch_typed(namespace, name, r).await,
            ManagedResource::Service(r) => self.patch_typed(namespace, name, r).await,
            ManagedResource::Ingress(r) => self.patch_typed(namespace, name, r).await,
            ManagedResource::Deployment(r) => self.patch_typed(namespace, name, r).await,
        }
    }

    async fn delete_resource(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<bool> {
        match kind {
            ResourceKind::Config => self.delete_typed::<ConfigMap>(namespace, name).await,
            ResourceKind::Service => self.delete_typed::<Service>(namespace, name).await,
            ResourceKind::Ingress => self.delete_typed::<Ingress>(namespace, name).await,
            ResourceKind::Deployment => self.delete_typed::<Deployment>(namespace, name).await,
        }
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.get_typed::<Job>(namespace, name).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()> {
        self.create_typed(namespace, job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<bool> {
        self.delete_typed::<Job>(namespace, name).await
    }

    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<String>> {
        let api: Api<Pod> = self.api(namespace);
        let lp = ListParams::default().labels(&format!("{}={}", JOB_NAME_LABEL, job_name));
        let pods = api.list(&lp).await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get_typed::<Pod>(namespace, name).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        self.delete_typed::<Pod>(namespace, name).await
    }
}
