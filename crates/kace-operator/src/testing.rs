//! In-memory doubles shared by the unit tests

use crate::clock::Sleeper;
use crate::cluster::{ClusterApi, ManagedResource, ResourceKind, ResourceRef, JOB_NAME_LABEL};
use crate::error::{OperatorError, Result};
use crate::jobs::{JobController, JobTemplate, JobTemplateRegistry};
use crate::notify::{NotificationContext, NotificationGateway, NotificationSink};
use crate::pipeline::{Orchestrator, PipelineSettings};
use crate::readiness::ReadinessWaiter;
use crate::reconciler::{ResourceReconciler, FEDERATION_SET, FUSEKI_SET, LDF_SET};
use crate::release::next_release_tag;
use crate::templates::FileTemplateProvider;
use crate::transfer::{CommitInfo, FileTransfer, LocalArtifact, ObjectInfo, PublishedRelease};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

pub(crate) const TEST_NAMESPACE: &str = "kace";

fn api_error(code: u16, message: &str) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: match code {
            404 => "NotFound",
            409 => "AlreadyExists",
            _ => "InternalError",
        }
        .to_string(),
        code,
    }))
}

fn deleting_now() -> Time {
    Time(chrono::Utc::now())
}

#[derive(Default)]
struct ClusterState {
    resources: BTreeMap<ResourceRef, ManagedResource>,
    scripted: HashMap<ResourceRef, VecDeque<ManagedResource>>,
    jobs: BTreeMap<String, Job>,
    job_scripts: HashMap<String, VecDeque<(i32, i32)>>,
    /// Job name -> reads left before a pending deletion completes
    deleting: HashMap<String, u32>,
    pods: BTreeMap<String, Pod>,
    ops: Vec<String>,
    fail_next: Option<u16>,
    deletion_delay: u32,
    fail_pod_reads: bool,
    succeed_jobs: bool,
    deployments_available: bool,
}

/// Cluster double holding resources, jobs and pods in memory
#[derive(Default)]
pub(crate) struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

/// Pop the next scripted value; the last one repeats
fn next_scripted<T: Clone>(script: &mut VecDeque<T>) -> Option<T> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    /// Lock the state, failing the call if an error was injected
    fn guarded(&self) -> Result<MutexGuard<'_, ClusterState>> {
        let mut state = self.state();
        match state.fail_next.take() {
            Some(code) => Err(api_error(code, "injected failure")),
            None => Ok(state),
        }
    }

    /// Make the next API call fail with the given status code
    pub fn fail_next_with(&self, code: u16) {
        self.state().fail_next = Some(code);
    }

    pub fn resource_count(&self) -> usize {
        self.state().resources.len()
    }

    pub fn resource(&self, identity: &ResourceRef) -> Option<ManagedResource> {
        self.state().resources.get(identity).cloned()
    }

    /// Successive reads of `identity` return these bodies in turn
    pub fn script_resource(&self, identity: &ResourceRef, bodies: Vec<ManagedResource>) {
        self.state()
            .scripted
            .insert(identity.clone(), bodies.into_iter().collect());
    }

    /// Report every stored deployment as fully rolled out
    pub fn make_deployments_available(&self) {
        self.state().deployments_available = true;
    }

    /// Deleted jobs stay visible, marked for deletion, for `reads` reads
    pub fn set_deletion_delay(&self, reads: u32) {
        self.state().deletion_delay = reads;
    }

    /// New jobs report one succeeded pod right away
    pub fn succeed_jobs_immediately(&self) {
        self.state().succeed_jobs = true;
    }

    /// Successive reads of an existing job report these (succeeded, failed) counts
    pub fn script_job_status(&self, name: &str, statuses: &[(i32, i32)]) {
        self.state()
            .job_scripts
            .insert(name.to_string(), statuses.iter().copied().collect());
    }

    pub fn insert_job(&self, job: Job) {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.state().jobs.insert(name, job);
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.state().jobs.get(name).cloned()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.state().jobs.keys().cloned().collect()
    }

    pub fn add_pod(&self, name: &str, job_name: &str) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    JOB_NAME_LABEL.to_string(),
                    job_name.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        self.state().pods.insert(name.to_string(), pod);
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state().pods.keys().cloned().collect()
    }

    pub fn fail_pod_reads(&self) {
        self.state().fail_pod_reads = true;
    }

    /// Mutating calls in the order they were made
    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_resource(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ManagedResource>> {
        let mut state = self.guarded()?;
        let identity = ResourceRef::new(kind, name, namespace);
        if let Some(script) = state.scripted.get_mut(&identity) {
            return Ok(next_scripted(script));
        }

        let available = state.deployments_available;
        Ok(state.resources.get(&identity).cloned().map(|mut resource| {
            if let ManagedResource::Deployment(deployment) = &mut resource {
                if available {
                    let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    deployment.status = Some(DeploymentStatus {
                        replicas: Some(replicas),
                        available_replicas: Some(replicas),
                        unavailable_replicas: None,
                        ..Default::default()
                    });
                }
            }
            resource
        }))
    }

    async fn create_resource(&self, namespace: &str, resource: &ManagedResource) -> Result<()> {
        let mut state = self.guarded()?;
        let name = resource.name().unwrap_or_default().to_string();
        let identity = ResourceRef::new(resource.kind(), &name, namespace);
        if state.resources.contains_key(&identity) {
            return Err(api_error(409, "already exists"));
        }
        state.ops.push(format!("create_resource {}", identity));
        state.resources.insert(identity, resource.clone());
        Ok(())
    }

    async fn patch_resource(&self, namespace: &str, resource: &ManagedResource) -> Result<()> {
        let mut state = self.guarded()?;
        let name = resource.name().unwrap_or_default().to_string();
        let identity = ResourceRef::new(resource.kind(), &name, namespace);
        if !state.resources.contains_key(&identity) {
            return Err(api_error(404, "not found"));
        }
        state.ops.push(format!("patch_resource {}", identity));
        state.resources.insert(identity, resource.clone());
        Ok(())
    }

    async fn delete_resource(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<bool> {
        let mut state = self.guarded()?;
        let identity = ResourceRef::new(kind, name, namespace);
        state.ops.push(format!("delete_resource {}", identity));
        Ok(state.resources.remove(&identity).is_some())
    }

    async fn get_job(&self, _namespace: &str, name: &str) -> Result<Option<Job>> {
        let mut guard = self.guarded()?;
        let state = &mut *guard;

        if let Some(remaining) = state.deleting.get_mut(name) {
            if *remaining == 0 {
                state.deleting.remove(name);
                state.jobs.remove(name);
                return Ok(None);
            }
            *remaining -= 1;
        }

        let Some(job) = state.jobs.get_mut(name) else {
            return Ok(None);
        };
        let status = state.job_scripts.get_mut(name).and_then(next_scripted);
        if let Some((succeeded, failed)) = status {
            job.status = Some(JobStatus {
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            });
        }
        Ok(Some(job.clone()))
    }

    async fn create_job(&self, _namespace: &str, job: &Job) -> Result<()> {
        let mut state = self.guarded()?;
        let name = job.metadata.name.clone().unwrap_or_default();
        if state.jobs.contains_key(&name) {
            return Err(api_error(409, "job already exists"));
        }
        let mut job = job.clone();
        if state.succeed_jobs {
            job.status = Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            });
        }
        state.ops.push(format!("create_job {}", name));
        state.jobs.insert(name, job);
        Ok(())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.guarded()?;
        if !state.jobs.contains_key(name) {
            return Ok(false);
        }
        state.ops.push(format!("delete_job {}", name));
        let delay = state.deletion_delay;
        if delay == 0 {
            state.jobs.remove(name);
        } else if !state.deleting.contains_key(name) {
            state.deleting.insert(name.to_string(), delay);
            if let Some(job) = state.jobs.get_mut(name) {
                job.metadata.deletion_timestamp = Some(deleting_now());
            }
        }
        Ok(true)
    }

    async fn list_job_pods(&self, _namespace: &str, job_name: &str) -> Result<Vec<String>> {
        let state = self.guarded()?;
        Ok(state
            .pods
            .iter()
            .filter(|(_, pod)| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(JOB_NAME_LABEL))
                    .is_some_and(|j| j == job_name)
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>> {
        let state = self.guarded()?;
        if state.fail_pod_reads {
            return Err(api_error(500, "pod read failed"));
        }
        Ok(state.pods.get(name).cloned())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.guarded()?;
        state.ops.push(format!("delete_pod {}", name));
        Ok(state.pods.remove(name).is_some())
    }
}

/// Deployment body with the given rollout status
pub(crate) fn deployment_with_status(
    name: &str,
    annotations: BTreeMap<String, String>,
    replicas: i32,
    available: i32,
) -> ManagedResource {
    let manifest = serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "annotations": annotations },
        "spec": {
            "replicas": replicas,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "containers": [{ "name": "server", "image": "fuseki:latest" }] }
            }
        },
        "status": {
            "replicas": replicas,
            "availableReplicas": available,
            "unavailableReplicas": replicas - available
        }
    });
    match ManagedResource::from_manifest(ResourceKind::Deployment, manifest) {
        Ok(resource) => resource,
        Err(e) => panic!("invalid deployment fixture: {e}"),
    }
}

const CONFIG_MAP_TEMPLATE: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: "{{ name }}"
  namespace: "{{ namespace }}"
  annotations:
    kace/managed: "true"
data:
  target: "{{ target }}"
"#;

const SERVICE_TEMPLATE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: "{{ name }}"
  namespace: "{{ namespace }}"
spec:
  selector:
    app: "{{ name }}"
  ports:
    - name: http
      port: 3030
      targetPort: 3030
"#;

const INGRESS_TEMPLATE: &str = r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: "{{ name }}"
  namespace: "{{ namespace }}"
spec:
  rules:
    - host: "{{ host_name }}"
      http:
        paths:
          - path: "/{{ target }}"
            pathType: Prefix
            backend:
              service:
                name: "{{ name }}"
                port:
                  number: 3030
"#;

const DEPLOYMENT_TEMPLATE: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: "{{ name }}"
  namespace: "{{ namespace }}"
spec:
  replicas: 1
  selector:
    matchLabels:
      app: "{{ name }}"
  template:
    metadata:
      labels:
        app: "{{ name }}"
    spec:
      containers:
        - name: server
          image: "fuseki:latest"
          volumeMounts:
            - name: graphs
              mountPath: /fuseki/databases
      volumes:
        - name: graphs
          persistentVolumeClaim:
            claimName: "{{ pvc_name }}"
"#;

/// Serving templates for every managed kind
pub(crate) fn serving_templates() -> FileTemplateProvider {
    FileTemplateProvider::from_templates(HashMap::from([
        ("config-map".to_string(), CONFIG_MAP_TEMPLATE.to_string()),
        ("service".to_string(), SERVICE_TEMPLATE.to_string()),
        ("ingress".to_string(), INGRESS_TEMPLATE.to_string()),
        ("server-deployment".to_string(), DEPLOYMENT_TEMPLATE.to_string()),
    ]))
    .expect("serving templates parse")
}

/// Conversion, documentation and notarization job types
pub(crate) fn job_registry() -> JobTemplateRegistry {
    let template = |image: &str, command: &[&str]| JobTemplate {
        image: image.to_string(),
        command: command.iter().map(|c| c.to_string()).collect(),
        backoff_limit: None,
    };
    let templates = BTreeMap::from([
        (
            "hdt-job".to_string(),
            template("kace/rdf2hdt:latest", &["/opt/rdf2hdt/convert.sh"]),
        ),
        (
            "doc-job".to_string(),
            template("kace/widoco:latest", &["/opt/widoco/document.sh"]),
        ),
        ("spider-job".to_string(), template("kace/spider-client:latest", &["python3"])),
    ]);
    JobTemplateRegistry::new(templates, "local-data")
}

/// Sleeper that records requested delays and only yields
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Sink that keeps every notification
#[derive(Default)]
pub(crate) struct RecordingSink {
    notifications: Mutex<Vec<(String, NotificationContext)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(String, NotificationContext)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .map(|(event, _)| event)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, event: &str, context: &NotificationContext) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((event.to_string(), context.clone()));
        Ok(())
    }
}

/// One call to [`FileTransfer::upload`]
#[derive(Debug, Clone)]
pub(crate) struct UploadRecord {
    pub repo: String,
    pub root_branch: String,
    pub remote_paths: Vec<String>,
    pub release: PublishedRelease,
}

/// Data repository double; objects are keyed by (repo, reference)
#[derive(Default)]
pub(crate) struct FakeTransfer {
    objects: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
    tags: Mutex<BTreeMap<String, Vec<String>>>,
    committer: String,
    fail_commit_lookup: bool,
    uploads: Mutex<Vec<UploadRecord>>,
}

impl FakeTransfer {
    pub fn new() -> Self {
        Self {
            committer: "kace".to_string(),
            ..Default::default()
        }
    }

    pub fn with_object(mut self, repo: &str, reference: &str, path: &str, bytes: &[u8]) -> Self {
        self.objects
            .entry((repo.to_string(), reference.to_string()))
            .or_default()
            .insert(path.to_string(), bytes.to_vec());
        self
    }

    pub fn with_tags(self, repo: &str, tags: &[&str]) -> Self {
        self.tags
            .lock()
            .unwrap()
            .insert(repo.to_string(), tags.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_committer(mut self, committer: &str) -> Self {
        self.committer = committer.to_string();
        self
    }

    pub fn failing_commit_lookup(mut self) -> Self {
        self.fail_commit_lookup = true;
        self
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.uploads.lock().unwrap().clone()
    }

    fn missing(what: String) -> OperatorError {
        OperatorError::Transfer {
            status: 404,
            message: what,
        }
    }
}

#[async_trait]
impl FileTransfer for FakeTransfer {
    async fn list_objects(&self, repo: &str, reference: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let key = (repo.to_string(), reference.to_string());
        Ok(self
            .objects
            .get(&key)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(path, _)| path.starts_with(prefix))
                    .map(|(path, bytes)| ObjectInfo {
                        path: path.clone(),
                        size: bytes.len() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn download(&self, repo: &str, reference: &str, path: &str) -> Result<Vec<u8>> {
        let key = (repo.to_string(), reference.to_string());
        self.objects
            .get(&key)
            .and_then(|objects| objects.get(path))
            .cloned()
            .ok_or_else(|| Self::missing(format!("{repo}@{reference}/{path}")))
    }

    async fn upload(
        &self,
        repo: &str,
        root_branch: &str,
        artifacts: &[LocalArtifact],
    ) -> Result<PublishedRelease> {
        let mut tags = self.tags.lock().unwrap();
        let existing = tags.entry(repo.to_string()).or_default();
        let tag_name = next_release_tag(existing.iter());
        existing.push(tag_name.clone());

        let release = PublishedRelease {
            branch_name: crate::release::stable_branch_name(&tag_name),
            tag_name,
        };
        self.uploads.lock().unwrap().push(UploadRecord {
            repo: repo.to_string(),
            root_branch: root_branch.to_string(),
            remote_paths: artifacts.iter().map(LocalArtifact::remote_path).collect(),
            release: release.clone(),
        });
        Ok(release)
    }

    async fn resolve_commit(&self, repo: &str, commit_id: &str) -> Result<CommitInfo> {
        if self.fail_commit_lookup {
            return Err(OperatorError::Transfer {
                status: 503,
                message: format!("commit lookup unavailable for {repo}"),
            });
        }
        Ok(CommitInfo {
            id: commit_id.to_string(),
            committer: self.committer.clone(),
            message: String::new(),
            creation_date: 0,
            metadata: BTreeMap::new(),
        })
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        Ok(self
            .tags
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }
}

/// Orchestrator wired to in-memory doubles and temporary data directories
pub(crate) struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub transfer: Arc<FakeTransfer>,
    pub sink: Arc<RecordingSink>,
    pub sleeper: Arc<RecordingSleeper>,
    pub orchestrator: Arc<Orchestrator>,
    settings: PipelineSettings,
    local: TempDir,
    shared: TempDir,
}

impl Harness {
    pub fn new(transfer: FakeTransfer) -> Self {
        let local = TempDir::new().unwrap();
        let shared = TempDir::new().unwrap();
        let settings = PipelineSettings {
            local_data_dir: local.path().to_path_buf(),
            shared_data_dir: shared.path().to_path_buf(),
            ..PipelineSettings::default()
        };
        let cluster = Arc::new(InMemoryCluster::new());
        let transfer = Arc::new(transfer);
        let sink = Arc::new(RecordingSink::new());
        let sleeper = Arc::new(RecordingSleeper::new());
        let orchestrator = Self::orchestrator(&cluster, &transfer, &sink, &sleeper, &settings);
        Self {
            cluster,
            transfer,
            sink,
            sleeper,
            orchestrator,
            settings,
            local,
            shared,
        }
    }

    fn orchestrator(
        cluster: &Arc<InMemoryCluster>,
        transfer: &Arc<FakeTransfer>,
        sink: &Arc<RecordingSink>,
        sleeper: &Arc<RecordingSleeper>,
        settings: &PipelineSettings,
    ) -> Arc<Orchestrator> {
        let templates = Arc::new(serving_templates());
        let reconciler = |set: &str| {
            ResourceReconciler::new(set, TEST_NAMESPACE, cluster.clone(), templates.clone())
                .with_default("host_name", settings.serving_host.clone())
                .with_default("pvc_name", "shared-data")
        };
        let jobs = JobController::new(
            TEST_NAMESPACE,
            cluster.clone(),
            Arc::new(job_registry()),
            sleeper.clone(),
        );
        Arc::new(Orchestrator::new(
            reconciler(FUSEKI_SET),
            vec![reconciler(FEDERATION_SET), reconciler(LDF_SET)],
            jobs,
            ReadinessWaiter::new(cluster.clone(), sleeper.clone()),
            transfer.clone(),
            NotificationGateway::new().with_sink(sink.clone()),
            settings.clone(),
        ))
    }

    fn rebuild(mut self) -> Self {
        self.orchestrator = Self::orchestrator(
            &self.cluster,
            &self.transfer,
            &self.sink,
            &self.sleeper,
            &self.settings,
        );
        self
    }

    pub fn with_spider(mut self, host: &str, port: u16) -> Self {
        self.settings.spider_host = host.to_string();
        self.settings.spider_port = port;
        self.rebuild()
    }

    pub fn with_readiness_retries(mut self, retries: u32) -> Self {
        self.settings.readiness_retries = retries;
        self.rebuild()
    }

    pub fn local_dir(&self) -> &Path {
        self.local.path()
    }

    pub fn shared_dir(&self) -> &Path {
        self.shared.path()
    }
}
