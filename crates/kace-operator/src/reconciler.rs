//! Resource Reconciler
//!
//! Idempotent create-or-update over the four serving resource kinds of a
//! server set (config, service, ingress, deployment). A server set is a
//! directory of manifest templates plus a name prefix; resources of a set are
//! named `{set}-{target}`.
//!
//! Reconciliation is read-then-write without compare-and-swap: two callers
//! reconciling the same resource concurrently can lose an update.

use crate::cluster::{ClusterApi, ManagedResource, ResourceKind, ResourceRef};
use crate::error::Result;
use crate::templates::TemplateProvider;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Well-known server sets
pub const FUSEKI_SET: &str = "fuseki";
pub const FEDERATION_SET: &str = "federation";
pub const LDF_SET: &str = "ldf";

/// Target name used by the shared secondary sets
pub const SHARED_TARGET: &str = "all";

/// CPU/memory requests and limits for a workload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceAllocation {
    pub requests: BTreeMap<String, Quantity>,
    pub limits: BTreeMap<String, Quantity>,
}

impl ResourceAllocation {
    /// Identical cpu/memory requests and limits
    pub fn cpu_memory(cpu: &str, memory: &str) -> Self {
        let mut values = BTreeMap::new();
        values.insert("cpu".to_string(), Quantity(cpu.to_string()));
        values.insert("memory".to_string(), Quantity(memory.to_string()));
        Self {
            requests: values.clone(),
            limits: values,
        }
    }

    /// Limits only, requests left to the cluster defaults
    pub fn limits(cpu: &str, memory: &str) -> Self {
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), Quantity(cpu.to_string()));
        limits.insert("memory".to_string(), Quantity(memory.to_string()));
        Self {
            requests: BTreeMap::new(),
            limits,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }

    pub fn to_requirements(&self) -> ResourceRequirements {
        ResourceRequirements {
            requests: (!self.requests.is_empty()).then(|| self.requests.clone()),
            limits: (!self.limits.is_empty()).then(|| self.limits.clone()),
            ..Default::default()
        }
    }
}

/// Desired state of one managed resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub parameters: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub resources: Option<ResourceAllocation>,
}

impl ResourceSpec {
    pub fn identity(&self) -> ResourceRef {
        ResourceRef::new(self.kind, &self.name, &self.namespace)
    }
}

/// Whether a reconcile created the resource or patched an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Created,
    Updated,
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::Created => f.write_str("created"),
            ReconcileAction::Updated => f.write_str("updated"),
        }
    }
}

/// Reconciler for a single server set
#[derive(Clone)]
pub struct ResourceReconciler {
    set: String,
    namespace: String,
    cluster: Arc<dyn ClusterApi>,
    templates: Arc<dyn TemplateProvider>,
    defaults: BTreeMap<String, String>,
}

impl ResourceReconciler {
    pub fn new(
        set: impl Into<String>,
        namespace: impl Into<String>,
        cluster: Arc<dyn ClusterApi>,
        templates: Arc<dyn TemplateProvider>,
    ) -> Self {
        let namespace = namespace.into();
        let mut defaults = BTreeMap::new();
        defaults.insert("namespace".to_string(), namespace.clone());
        Self {
            set: set.into(),
            namespace,
            cluster,
            templates,
            defaults,
        }
    }

    /// Add a default template parameter; caller parameters take precedence
    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.insert(key.into(), value.into());
        self
    }

    pub fn set_name(&self) -> &str {
        &self.set
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the resources this set creates for a target
    pub fn resource_name(&self, target: &str) -> String {
        format!("{}-{}", self.set, target)
    }

    /// Identities of every resource of this set for a target, in creation order
    pub fn resource_refs(&self, target: &str) -> Vec<ResourceRef> {
        let name = self.resource_name(target);
        ResourceKind::ALL
            .iter()
            .map(|kind| ResourceRef::new(*kind, &name, &self.namespace))
            .collect()
    }

    /// Desired state of one kind of this set for a target
    pub fn spec_for(
        &self,
        kind: ResourceKind,
        target: &str,
        parameters: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        resources: Option<&ResourceAllocation>,
    ) -> ResourceSpec {
        let mut params = parameters.clone();
        params
            .entry("target".to_string())
            .or_insert_with(|| target.to_string());
        ResourceSpec {
            kind,
            name: self.resource_name(target),
            namespace: self.namespace.clone(),
            parameters: params,
            annotations: annotations.clone(),
            resources: resources.cloned(),
        }
    }

    /// Render the desired body of a spec
    ///
    /// Annotations are the template's own annotations overlaid with the
    /// supplied ones.
    pub fn render(&self, spec: &ResourceSpec) -> Result<ManagedResource> {
        let mut parameters = self.defaults.clone();
        parameters.extend(spec.parameters.clone());
        parameters.insert("name".to_string(), spec.name.clone());

        let manifest = self.templates.render(spec.kind.template_name(), &parameters)?;
        let mut resource = ManagedResource::from_manifest(spec.kind, manifest)?;
        resource.set_identity(&spec.name, &spec.namespace);

        let mut annotations = resource.annotations();
        annotations.extend(spec.annotations.clone());
        resource.set_annotations(annotations);

        if let Some(allocation) = spec.resources.as_ref().filter(|r| !r.is_empty()) {
            resource.set_container_resources(allocation.to_requirements());
        }
        Ok(resource)
    }

    /// Create the resource if absent, otherwise patch it with the full body
    ///
    /// Annotations already on the live object are kept unless the desired
    /// body overrides the same key. API errors are returned unchanged.
    #[instrument(skip(self, spec), fields(set = %self.set, kind = %spec.kind, name = %spec.name))]
    pub async fn create_or_update(&self, spec: &ResourceSpec) -> Result<ReconcileAction> {
        let mut desired = self.render(spec)?;

        let action = match self
            .cluster
            .get_resource(&spec.namespace, spec.kind, &spec.name)
            .await?
        {
            None => {
                debug!("Resource absent, creating");
                self.cluster.create_resource(&spec.namespace, &desired).await?;
                ReconcileAction::Created
            }
            Some(live) => {
                let mut annotations = live.annotations();
                annotations.extend(desired.annotations());
                desired.set_annotations(annotations);
                debug!("Resource exists, patching");
                self.cluster.patch_resource(&spec.namespace, &desired).await?;
                ReconcileAction::Updated
            }
        };

        metrics::counter!(
            "kace_reconciliations_total",
            "kind" => spec.kind.api_kind(),
            "action" => action.to_string()
        )
        .increment(1);
        info!(%action, "Reconciled resource");
        Ok(action)
    }

    /// Delete a resource; an absent resource counts as deleted
    #[instrument(skip(self), fields(set = %self.set))]
    pub async fn delete(&self, identity: &ResourceRef) -> Result<()> {
        info!(resource = %identity, "Deleting resource");
        let deleted = self
            .cluster
            .delete_resource(&identity.namespace, identity.kind, &identity.name)
            .await?;
        if !deleted {
            info!(resource = %identity, "Resource not found, nothing to delete");
        }
        Ok(())
    }

    /// Reconcile ingress, config, service and deployment for a target
    pub async fn create_all(
        &self,
        target: &str,
        parameters: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        resources: Option<&ResourceAllocation>,
    ) -> Result<Vec<ResourceRef>> {
        let mut refs = Vec::with_capacity(ResourceKind::ALL.len());
        for kind in ResourceKind::ALL {
            let spec = self.spec_for(kind, target, parameters, annotations, resources);
            self.create_or_update(&spec).await?;
            refs.push(spec.identity());
        }
        Ok(refs)
    }

    /// Delete every resource of this set for a target
    pub async fn delete_all(&self, target: &str) -> Result<()> {
        for identity in self.resource_refs(target) {
            self.delete(&identity).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResourceReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceReconciler")
            .field("set", &self.set)
            .field("namespace", &self.namespace)
            .field("defaults", &self.defaults)
            .finish()
    }
}
