//! External collaborator interfaces
//!
//! The manager only ever sees the outside world through these seams: the
//! container runtime it pushes cpuset updates to, and the read-only pod
//! sources it reconciles against.

use api_types::Pod;
use api_types::PodStatus;
use thiserror::Error;

/// Container resources pushed to the runtime. The cpuset field carries the
/// canonical cpuset list form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerResources {
    pub cpuset_cpus: String,
}

/// Failure reported by the container runtime.
#[derive(Debug, Error)]
#[error("runtime failed to update resources of container {container_id}: {message}")]
pub struct RuntimeError {
    pub container_id: String,
    pub message: String,
}

/// The one runtime operation the manager consumes.
pub trait ContainerRuntime: Send + Sync {
    fn update_container_resources(
        &self,
        container_id: &str,
        resources: &ContainerResources,
    ) -> Result<(), RuntimeError>;
}

/// Snapshot source of the pods currently active on the node.
pub trait ActivePodsProvider: Send + Sync {
    fn active_pods(&self) -> Vec<Pod>;
}

/// Read access to pod statuses, including runtime container IDs.
pub trait PodStatusProvider: Send + Sync {
    fn pod_status(&self, pod_uid: &str) -> Option<PodStatus>;
}

/// Readiness of the node's pod configuration sources. Stale-state garbage
/// collection is gated on this so the active-pods list is authoritative.
pub trait SourcesReady: Send + Sync {
    fn all_ready(&self) -> bool;
}

/// Always-ready gate for callers without a readiness signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourcesReadyStub;

impl SourcesReady for SourcesReadyStub {
    fn all_ready(&self) -> bool {
        true
    }
}
