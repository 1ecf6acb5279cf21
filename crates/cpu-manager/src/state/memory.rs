//! In-memory state store

use crate::cpuset::CpuSet;

use super::CheckpointError;
use super::CpuAssignments;
use super::Reader;
use super::State;

/// Plain in-memory state with no durability. The checkpointed store wraps
/// this; it is also what the `none` policy effectively runs on.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    assignments: CpuAssignments,
    default_cpu_set: CpuSet,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn replace(&mut self, default_cpu_set: CpuSet, assignments: CpuAssignments) {
        self.default_cpu_set = default_cpu_set;
        self.assignments = assignments;
    }
}

impl Reader for MemoryState {
    fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.assignments
            .get(pod_uid)
            .and_then(|containers| containers.get(container_name))
            .cloned()
    }

    fn default_cpu_set(&self) -> CpuSet {
        self.default_cpu_set.clone()
    }

    fn cpu_assignments(&self) -> CpuAssignments {
        self.assignments.clone()
    }
}

impl State for MemoryState {
    fn set_cpu_set(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
    ) -> error_stack::Result<(), CheckpointError> {
        self.assignments
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), cpus);
        Ok(())
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> error_stack::Result<(), CheckpointError> {
        self.default_cpu_set = cpus;
        Ok(())
    }

    fn delete(
        &mut self,
        pod_uid: &str,
        container_name: &str,
    ) -> error_stack::Result<(), CheckpointError> {
        if let Some(containers) = self.assignments.get_mut(pod_uid) {
            containers.remove(container_name);
            if containers.is_empty() {
                self.assignments.remove(pod_uid);
            }
        }
        Ok(())
    }

    fn clear_state(&mut self) -> error_stack::Result<(), CheckpointError> {
        self.assignments.clear();
        self.default_cpu_set = CpuSet::new();
        Ok(())
    }
}
