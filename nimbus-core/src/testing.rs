//! Small cloud type and wiring shared by the unit tests of this crate.

use crate::classloading::{CodeProvider, CodeSource};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::ids::{HostId, ObjectId};
use crate::messages::{HostCommand, HostReply};
use crate::pool::{HostEndpoint, HostSpec, InProcessProvisioner, ProvisionedHost, Provisioner};
use crate::registry::{InvocationContext, OutboundEvent};
use crate::types::{CloudObject, FieldError, TypeCatalog, TypeDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

/// Holds one byte string
#[derive(Default)]
pub(crate) struct Cell {
    value: Mutex<Vec<u8>>,
}

impl CloudObject for Cell {
    fn invoke(&self, method: &str, params: &[Vec<u8>], _: &[String], _: &InvocationContext) -> Result<Vec<u8>, String> {
        match method {
            "get" => Ok(self.value.lock().clone()),
            "put" => {
                *self.value.lock() = params.first().cloned().unwrap_or_default();
                Ok(Vec::new())
            }
            other => Err(format!("no method {other}")),
        }
    }

    fn field(&self, name: &str) -> Option<Vec<u8>> {
        (name == "value").then(|| self.value.lock().clone())
    }

    fn set_field(&self, name: &str, value: &[u8]) -> Result<(), FieldError> {
        if name != "value" {
            return Err(FieldError::Unknown);
        }
        *self.value.lock() = value.to_vec();
        Ok(())
    }

    fn reset_field(&self, name: &str) -> bool {
        self.set_field(name, &[]).is_ok()
    }

    fn field_names(&self) -> Vec<String> {
        vec!["value".into()]
    }
}

pub(crate) fn cell_catalog() -> Arc<TypeCatalog> {
    let mut catalog = TypeCatalog::new();
    catalog.register_fn(TypeDescriptor::builder("Cell").build(), |_, _, _| {
        Ok(Arc::new(Cell::default()) as Arc<dyn CloudObject>)
    });
    Arc::new(catalog)
}

pub(crate) fn cell_code() -> Arc<dyn CodeSource> {
    let mut provider = CodeProvider::new();
    provider.register_unit("Cell", b"cell".to_vec());
    Arc::new(provider)
}

pub(crate) fn in_process(scratch: &Path) -> (InProcessProvisioner, mpsc::UnboundedReceiver<OutboundEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let provisioner = InProcessProvisioner::new(cell_catalog(), cell_code(), Arc::new(tx), RuntimeConfig::default(), scratch);
    (provisioner, rx)
}

pub(crate) async fn create_cell(endpoint: &dyn HostEndpoint) -> ObjectId {
    let command = HostCommand::CreateObject { type_name: "Cell".into(), params: Vec::new(), param_names: Vec::new() };
    match endpoint.call(command).await.unwrap() {
        HostReply::Created { object_id } => object_id,
        other => panic!("unexpected reply {other:?}"),
    }
}

/// Parks every host command it matches until the test opens it
pub(crate) struct CommandGate {
    matches: fn(&HostCommand) -> bool,
    reached: Notify,
    open: watch::Sender<bool>,
}

impl CommandGate {
    pub(crate) fn new(matches: fn(&HostCommand) -> bool) -> Arc<Self> {
        let (open, _) = watch::channel(false);
        Arc::new(Self { matches, reached: Notify::new(), open })
    }

    /// Resolves once a matching command is parked
    pub(crate) async fn reached(&self) {
        self.reached.notified().await;
    }

    pub(crate) fn open(&self) {
        self.open.send_replace(true);
    }

    async fn pass(&self, command: &HostCommand) {
        if !(self.matches)(command) {
            return;
        }
        self.reached.notify_one();
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }
}

struct GatedEndpoint {
    inner: Arc<dyn HostEndpoint>,
    gate: Arc<CommandGate>,
}

#[async_trait]
impl HostEndpoint for GatedEndpoint {
    async fn call(&self, command: HostCommand) -> Result<HostReply> {
        self.gate.pass(&command).await;
        self.inner.call(command).await
    }
}

/// In-process hosts whose endpoints go through a [`CommandGate`]
pub(crate) struct GatedProvisioner {
    inner: InProcessProvisioner,
    gate: Arc<CommandGate>,
}

impl GatedProvisioner {
    pub(crate) fn new(inner: InProcessProvisioner, gate: Arc<CommandGate>) -> Self {
        Self { inner, gate }
    }

    pub(crate) fn inner(&self) -> &InProcessProvisioner {
        &self.inner
    }
}

#[async_trait]
impl Provisioner for GatedProvisioner {
    async fn provision(&self, host: HostId, spec: &HostSpec) -> Result<ProvisionedHost> {
        let provisioned = self.inner.provision(host, spec).await?;
        let endpoint = Arc::new(GatedEndpoint { inner: provisioned.endpoint, gate: self.gate.clone() });
        Ok(ProvisionedHost { address: provisioned.address, endpoint })
    }

    async fn release(&self, host: HostId) -> Result<()> {
        self.inner.release(host).await
    }
}
