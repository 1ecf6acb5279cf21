//! The no-op policy
//!
//! Containers keep whatever CPUs the runtime gives them; the manager only
//! maintains the shared pool at the full CPU set and refuses to start over
//! a checkpoint that carries exclusive assignments.

use tracing::info;

use crate::cpuset::CpuSet;
use crate::state::State;

use super::PolicyError;

#[derive(Debug)]
pub struct NonePolicy {
    all_cpus: CpuSet,
}

impl NonePolicy {
    pub fn new(all_cpus: CpuSet) -> Self {
        Self { all_cpus }
    }

    pub(super) fn start(&self, state: &mut dyn State) -> Result<(), PolicyError> {
        let assignments = state.cpu_assignments();
        if !assignments.is_empty() {
            return Err(PolicyError::InvalidState {
                reason: format!(
                    "the none policy found {} exclusive assignment(s) in the checkpoint",
                    assignments.values().map(|containers| containers.len()).sum::<usize>()
                ),
            });
        }

        if state.default_cpu_set() != self.all_cpus {
            state.set_default_cpu_set(self.all_cpus.clone())?;
        }
        info!(cpus = %self.all_cpus, "none policy started, all CPUs shared");
        Ok(())
    }
}
