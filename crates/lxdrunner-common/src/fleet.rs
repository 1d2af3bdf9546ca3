// FleetApi: the fleet management control plane as seen by the engine.

use crate::config::InstanceType;
use crate::errors::FleetError;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Where an instance's root image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceSource {
    /// An alias in the fleet's local image store.
    Local { alias: String },
    /// An alias on an image server, pulled on demand.
    Remote {
        alias: String,
        server: String,
        protocol: String,
    },
}

/// Everything needed to create one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub ephemeral: bool,
    pub profiles: Vec<String>,
    pub source: InstanceSource,
    pub instance_type: InstanceType,
}

/// Result of a command run inside an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One message from the fleet's lifecycle event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// e.g. `instance-deleted`.
    pub action: String,
    /// Resource path, e.g. `/1.0/instances/lxdrunner-a1b2c3`.
    pub source: String,
}

impl LifecycleEvent {
    /// Instance name for instance events. A `?project=` suffix is ignored.
    pub fn instance_name(&self) -> Option<&str> {
        let path = self.source.split('?').next().unwrap_or_default();
        let name = path.strip_prefix("/1.0/instances/")?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(name)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Instance operations of the fleet API. Create, start, stop and delete
/// return once the underlying async operation has finished.
#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn image_alias_exists(&self, alias: &str) -> Result<bool, FleetError>;

    async fn profile_exists(&self, profile: &str) -> Result<bool, FleetError>;

    /// Names of all instances known to the fleet.
    async fn list_instances(&self) -> Result<Vec<String>, FleetError>;

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), FleetError>;

    async fn start_instance(&self, name: &str) -> Result<(), FleetError>;

    async fn stop_instance(&self, name: &str, force: bool) -> Result<(), FleetError>;

    async fn delete_instance(&self, name: &str) -> Result<(), FleetError>;

    /// Create a directory inside the instance. Fails while the guest agent
    /// is not yet reachable.
    async fn mkdir(&self, name: &str, path: &str, mode: u32) -> Result<(), FleetError>;

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        contents: Vec<u8>,
        mode: u32,
    ) -> Result<(), FleetError>;

    async fn execute(
        &self,
        name: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, FleetError>;

    /// Open the lifecycle event stream. The stream ends when the connection
    /// drops; callers resubscribe.
    async fn subscribe_lifecycle_events(
        &self,
    ) -> Result<BoxStream<'static, Result<LifecycleEvent, FleetError>>, FleetError>;
}
