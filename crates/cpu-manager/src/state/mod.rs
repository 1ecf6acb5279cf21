//! CPU manager state
//!
//! The state store maps (pod UID, container name) pairs to exclusively
//! assigned CPU sets and holds the shared default set. It is not
//! independently thread-safe; the manager's mutex serializes access. The
//! checkpointed implementation flushes durably after every mutation, so a
//! successful mutating call implies the new state is on disk.

mod checkpoint;
mod memory;

use std::collections::HashMap;

pub use checkpoint::CheckpointError;
pub use checkpoint::CheckpointState;
pub use checkpoint::CPU_MANAGER_STATE_FILE;
pub use memory::MemoryState;

use crate::cpuset::CpuSet;

/// Snapshot of exclusive assignments: pod UID → container name → CPU set.
pub type CpuAssignments = HashMap<String, HashMap<String, CpuSet>>;

/// Read-only view of the state store.
pub trait Reader: Send {
    /// The exclusively assigned set for a container, if any.
    fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet>;

    /// The assigned set for a container, falling back to the default set.
    fn cpu_set_or_default(&self, pod_uid: &str, container_name: &str) -> CpuSet {
        self.cpu_set(pod_uid, container_name)
            .unwrap_or_else(|| self.default_cpu_set())
    }

    /// The shared pool available to containers without exclusive CPUs.
    fn default_cpu_set(&self) -> CpuSet;

    /// A snapshot of all exclusive assignments.
    fn cpu_assignments(&self) -> CpuAssignments;
}

/// Mutable state store. Every mutating call persists before returning.
pub trait State: Reader {
    fn set_cpu_set(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
    ) -> error_stack::Result<(), CheckpointError>;

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> error_stack::Result<(), CheckpointError>;

    fn delete(
        &mut self,
        pod_uid: &str,
        container_name: &str,
    ) -> error_stack::Result<(), CheckpointError>;

    fn clear_state(&mut self) -> error_stack::Result<(), CheckpointError>;
}
