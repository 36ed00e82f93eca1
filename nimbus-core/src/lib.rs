/*!
# Nimbus Core - cloud object orchestration engine

Places stateful objects on remote hosts and keeps track of them:
- per-host object registry with asynchronous invocations
- on-demand transfer of code and file dependencies
- host pools (plain and aggregated) driven by pluggable scaling policies
- live migration of objects between hosts
- MQTT transport between the kernel and its hosts
*/

pub mod classloading;
pub mod config;
pub mod error;
pub mod ids;
pub mod messages;
pub mod migration;
pub mod model;
pub mod policy;
pub mod pool;
pub mod registry;
pub mod results;
pub mod runtime;
pub mod state;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use classloading::{ClassTransfer, CodeProvider, CodeSource};
pub use config::{RegistryConfig, RuntimeConfig};
pub use error::{NimbusError, Result};
pub use ids::{HostId, ObjectId, RequestId};
pub use migration::{MigrationEngine, MigrationPhase, MigrationRecord};
pub use model::{CloudObjectDescriptor, HostState, HostView, ObjectState, ObjectView};
pub use policy::{PolicyConfig, ScalingEventHandler, ScalingPolicy};
pub use pool::{AggregatedHostPool, HostEndpoint, HostPool, HostSnapshot, HostSpec, Provisioner, VirtualHostPool};
pub use registry::{CloudObjectRegistry, HostOutbox, InvocationContext};
pub use results::ResultCollector;
pub use runtime::CloudRuntime;
pub use types::{CloudObject, FieldError, TypeCatalog, TypeDescriptor};
