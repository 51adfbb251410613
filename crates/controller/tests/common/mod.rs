//! In-memory collaborators for reconciler tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use capdc_cloud::{
    CloudClient, CloudError, CreateInstanceRequest, Credentials, Image, Instance, InstanceState,
    LoadBalancer, LoadBalancerSpec, SshKey,
};
use capdc_controller::crds::{DataCrunchMachine, DataCrunchMachineSpec, MACHINE_FINALIZER};
use capdc_controller::tasks::cloud::{CloudConnector, SecretLocation};
use capdc_controller::tasks::events::EventSink;
use capdc_controller::tasks::machine::MachineScope;
use capdc_controller::tasks::store::{SecretData, SecretReader};
use capdc_controller::tasks::{CallGuard, ControllerConfig, Result, Services};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "default";
pub const CREDENTIALS_SECRET: &str = "datacrunch-credentials";
pub const BOOTSTRAP_SECRET: &str = "worker-0-bootstrap";
pub const INSTANCE_ID: &str = "inst-1";

/// How a stubbed call should fail.
#[derive(Clone, Copy, Debug)]
pub enum Failure {
    NotFound,
    Status(u16),
}

impl Failure {
    fn error(self, operation: &str) -> CloudError {
        match self {
            Self::NotFound => CloudError::NotFound {
                operation: operation.to_string(),
                resource: operation.to_string(),
            },
            Self::Status(status) => CloudError::Api {
                operation: operation.to_string(),
                status,
                message: "stubbed failure".to_string(),
            },
        }
    }
}

#[derive(Default)]
pub struct StubState {
    pub instance: Option<Instance>,
    pub created_state: Option<InstanceState>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub last_request: Option<CreateInstanceRequest>,
    pub fail_create: Option<Failure>,
    pub fail_get: Option<Failure>,
    pub fail_start: Option<Failure>,
    pub fail_delete: Option<Failure>,
    pub fail_delete_load_balancer: Option<Failure>,
}

/// A [`CloudClient`] holding at most one instance.
#[derive(Default)]
pub struct StubCloud {
    pub state: Mutex<StubState>,
    pub creates: AtomicUsize,
    pub gets: AtomicUsize,
    pub starts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub load_balancer_deletes: AtomicUsize,
}

impl StubCloud {
    pub fn with_created_state(state: InstanceState) -> Self {
        let cloud = Self::default();
        cloud.state.lock().unwrap().created_state = Some(state);
        cloud
    }

    /// Change what the provider reports for the existing instance.
    pub fn set_instance_state(&self, state: InstanceState) {
        let mut guard = self.state.lock().unwrap();
        if let Some(instance) = guard.instance.as_mut() {
            instance.state = state;
        }
    }

    pub fn set_addresses(&self, private_ip: Option<&str>, public_ip: Option<&str>) {
        let private_ip = private_ip.map(str::to_string);
        let public_ip = public_ip.map(str::to_string);
        let mut guard = self.state.lock().unwrap();
        if let Some(instance) = guard.instance.as_mut() {
            instance.private_ip = private_ip.clone();
            instance.public_ip = public_ip.clone();
        }
        guard.private_ip = private_ip;
        guard.public_ip = public_ip;
    }

    pub fn seed_instance(&self, state: InstanceState) {
        let mut guard = self.state.lock().unwrap();
        guard.instance = Some(Instance {
            id: INSTANCE_ID.to_string(),
            name: "worker-0".to_string(),
            state,
            instance_type: "1xH100".to_string(),
            image_id: "ubuntu-22.04-cuda-12.1".to_string(),
            public_ip: guard.public_ip.clone(),
            private_ip: guard.private_ip.clone(),
            ssh_key_name: None,
            created_at: None,
        });
    }

    pub fn fail(&self, configure: impl FnOnce(&mut StubState)) {
        configure(&mut self.state.lock().unwrap());
    }

    pub fn last_request(&self) -> Option<CreateInstanceRequest> {
        self.state.lock().unwrap().last_request.clone()
    }

    pub fn has_instance(&self) -> bool {
        self.state.lock().unwrap().instance.is_some()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn load_balancer_deletes(&self) -> usize {
        self.load_balancer_deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudClient for StubCloud {
    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<Instance, CloudError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.state.lock().unwrap();
        if let Some(failure) = guard.fail_create {
            return Err(failure.error("create instance"));
        }
        let instance = Instance {
            id: INSTANCE_ID.to_string(),
            name: req.name.clone(),
            state: guard.created_state.clone().unwrap_or(InstanceState::Pending),
            instance_type: req.instance_type.clone(),
            image_id: req.image_id.clone(),
            public_ip: guard.public_ip.clone(),
            private_ip: guard.private_ip.clone(),
            ssh_key_name: req.ssh_key_name.clone(),
            created_at: None,
        };
        guard.last_request = Some(req);
        guard.instance = Some(instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let guard = self.state.lock().unwrap();
        if let Some(failure) = guard.fail_get {
            return Err(failure.error(&format!("get instance {id}")));
        }
        guard
            .instance
            .clone()
            .filter(|instance| instance.id == id)
            .ok_or_else(|| Failure::NotFound.error(&format!("get instance {id}")))
    }

    async fn delete_instance(&self, id: &str) -> Result<(), CloudError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.state.lock().unwrap();
        if let Some(failure) = guard.fail_delete {
            return Err(failure.error(&format!("delete instance {id}")));
        }
        guard.instance = None;
        Ok(())
    }

    async fn start_instance(&self, id: &str) -> Result<(), CloudError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let guard = self.state.lock().unwrap();
        match guard.fail_start {
            Some(failure) => Err(failure.error(&format!("start instance {id}"))),
            None => Ok(()),
        }
    }

    async fn stop_instance(&self, _id: &str) -> Result<(), CloudError> {
        Err(CloudError::Unimplemented("stop_instance"))
    }

    async fn list_images(&self) -> Result<Vec<Image>, CloudError> {
        Err(CloudError::Unimplemented("list_images"))
    }

    async fn get_image(&self, _id: &str) -> Result<Image, CloudError> {
        Err(CloudError::Unimplemented("get_image"))
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>, CloudError> {
        Err(CloudError::Unimplemented("list_ssh_keys"))
    }

    async fn create_ssh_key(&self, _name: &str, _public_key: &str) -> Result<SshKey, CloudError> {
        Err(CloudError::Unimplemented("create_ssh_key"))
    }

    async fn delete_ssh_key(&self, _id: &str) -> Result<(), CloudError> {
        Err(CloudError::Unimplemented("delete_ssh_key"))
    }

    async fn create_load_balancer(
        &self,
        _spec: LoadBalancerSpec,
    ) -> Result<LoadBalancer, CloudError> {
        Err(CloudError::Unimplemented("create_load_balancer"))
    }

    async fn get_load_balancer(&self, _id: &str) -> Result<LoadBalancer, CloudError> {
        Err(CloudError::Unimplemented("get_load_balancer"))
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError> {
        self.load_balancer_deletes.fetch_add(1, Ordering::SeqCst);
        let guard = self.state.lock().unwrap();
        match guard.fail_delete_load_balancer {
            Some(failure) => Err(failure.error(&format!("delete load balancer {id}"))),
            None => Ok(()),
        }
    }

    async fn update_load_balancer_targets(
        &self,
        _id: &str,
        _targets: Vec<String>,
    ) -> Result<(), CloudError> {
        Err(CloudError::Unimplemented("update_load_balancer_targets"))
    }
}

/// Hands out the shared [`StubCloud`], or fails like a bad credential set.
pub struct StubConnector {
    pub cloud: Arc<StubCloud>,
    pub fail: bool,
    pub connects: AtomicUsize,
    pub last_credentials: Mutex<Option<Credentials>>,
}

impl StubConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl CloudConnector for StubConnector {
    fn connect(&self, credentials: Credentials) -> Result<Arc<dyn CloudClient>, CloudError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_credentials.lock().unwrap() = Some(credentials);
        if self.fail {
            return Err(CloudError::Config("stubbed connector failure".to_string()));
        }
        Ok(self.cloud.clone())
    }
}

#[derive(Default)]
pub struct StubSecrets {
    pub secrets: Mutex<HashMap<(String, String), SecretData>>,
}

impl StubSecrets {
    pub fn insert(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.as_bytes().to_vec()))
            .collect::<BTreeMap<_, _>>();
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl SecretReader for StubSecrets {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: Option<String>,
    pub event_type: EventType,
    pub reason: String,
    pub action: String,
    pub note: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(
        &self,
        reference: &ObjectReference,
        event_type: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: reference.name.clone(),
            event_type,
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Stubbed collaborators wired into [`Services`].
pub struct Harness {
    pub cloud: Arc<StubCloud>,
    pub connector: Arc<StubConnector>,
    pub secrets: Arc<StubSecrets>,
    pub events: Arc<RecordingEvents>,
    pub services: Services,
}

impl Harness {
    pub fn new(cloud: StubCloud) -> Self {
        Self::build(cloud, false)
    }

    /// A harness whose connector always fails.
    pub fn failing_connector() -> Self {
        Self::build(StubCloud::default(), true)
    }

    fn build(cloud: StubCloud, fail: bool) -> Self {
        let cloud = Arc::new(cloud);
        let connector = Arc::new(StubConnector {
            cloud: cloud.clone(),
            fail,
            connects: AtomicUsize::new(0),
            last_credentials: Mutex::new(None),
        });
        let secrets = Arc::new(StubSecrets::default());
        secrets.insert(
            NAMESPACE,
            CREDENTIALS_SECRET,
            &[("clientID", "client-id"), ("clientSecret", "client-secret")],
        );
        secrets.insert(NAMESPACE, BOOTSTRAP_SECRET, &[("value", "#cloud-config\n")]);
        let events = Arc::new(RecordingEvents::default());

        let services = Services {
            connector: connector.clone(),
            secrets: secrets.clone(),
            events: events.clone(),
            config: Arc::new(ControllerConfig::default()),
        };

        Self {
            cloud,
            connector,
            secrets,
            events,
            services,
        }
    }
}

pub fn guard() -> CallGuard {
    CallGuard::new(CancellationToken::new(), Duration::from_secs(60))
}

pub fn credentials() -> SecretLocation {
    SecretLocation {
        namespace: NAMESPACE.to_string(),
        name: CREDENTIALS_SECRET.to_string(),
    }
}

pub fn machine_scope() -> MachineScope {
    MachineScope {
        cluster_name: "demo".to_string(),
        machine_name: "demo-md-0-abcde".to_string(),
        namespace: NAMESPACE.to_string(),
        region: "FIN-01".to_string(),
        infrastructure_ready: true,
        bootstrap_data_secret: Some(BOOTSTRAP_SECRET.to_string()),
        credentials: credentials(),
    }
}

/// A DataCrunchMachine as created from a template, without a finalizer yet.
pub fn new_machine() -> DataCrunchMachine {
    let mut machine = DataCrunchMachine::new(
        "worker-0",
        DataCrunchMachineSpec {
            instance_type: "1xH100".to_string(),
            image: "ubuntu-22.04-cuda-12.1".to_string(),
            ..DataCrunchMachineSpec::default()
        },
    );
    machine.metadata.namespace = Some(NAMESPACE.to_string());
    machine
}

/// A DataCrunchMachine past its first reconcile.
pub fn machine() -> DataCrunchMachine {
    let mut machine = new_machine();
    machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
    machine
}

pub fn requeue_interval() -> Duration {
    ControllerConfig::default().requeue_interval()
}

pub fn sync_period() -> Duration {
    ControllerConfig::default().sync_period()
}
