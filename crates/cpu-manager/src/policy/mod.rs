//! CPU assignment policies
//!
//! A policy decides which CPUs a container gets and mutates the state store
//! accordingly. The two implementations are a tagged variant behind one
//! thin dispatch surface, so callers never branch on the policy kind.

mod assignment;
mod none;
mod static_policy;

use api_types::Container;
use api_types::Pod;
use error_stack::Report;
use thiserror::Error;

pub use assignment::take_by_topology;
pub use assignment::AllocationError;
pub use none::NonePolicy;
pub use static_policy::StaticPolicy;

use crate::hints::ResourceHints;
use crate::state::CheckpointError;
use crate::state::State;

/// Name of the no-op policy.
pub const POLICY_NONE: &str = "none";

/// Name of the static exclusive-assignment policy.
pub const POLICY_STATIC: &str = "static";

/// Errors surfaced by policy operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("not enough CPUs available, requested {requested}, available {available}")]
    NotEnoughCpus { requested: usize, available: usize },

    #[error("invalid explicit reserved CPU set: {reason}")]
    InvalidReservedSet { reason: String },

    #[error(
        "checkpointed state is inconsistent: {reason}; \
         drain the node and remove the CPU manager state file, then restart"
    )]
    InvalidState { reason: String },

    #[error("failed to persist state checkpoint: {0}")]
    Checkpoint(Report<CheckpointError>),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

impl From<Report<CheckpointError>> for PolicyError {
    fn from(report: Report<CheckpointError>) -> Self {
        Self::Checkpoint(report)
    }
}

/// The active CPU assignment policy.
#[derive(Debug)]
pub enum Policy {
    None(NonePolicy),
    Static(StaticPolicy),
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None(_) => POLICY_NONE,
            Self::Static(_) => POLICY_STATIC,
        }
    }

    /// Validate or initialize the state store at startup.
    pub fn start(&self, state: &mut dyn State) -> Result<(), PolicyError> {
        match self {
            Self::None(policy) => policy.start(state),
            Self::Static(policy) => policy.start(state),
        }
    }

    /// Reserve CPUs for a container about to start.
    pub fn add_container(
        &self,
        state: &mut dyn State,
        pod: &Pod,
        container: &Container,
    ) -> Result<(), PolicyError> {
        match self {
            Self::None(_) => Ok(()),
            Self::Static(policy) => policy.add_container(state, pod, container),
        }
    }

    /// Release any CPUs held for a container. Idempotent.
    pub fn remove_container(
        &self,
        state: &mut dyn State,
        pod_uid: &str,
        container_name: &str,
    ) -> Result<(), PolicyError> {
        match self {
            Self::None(_) => Ok(()),
            Self::Static(policy) => policy.remove_container(state, pod_uid, container_name),
        }
    }

    /// NUMA affinity hints for a pending container.
    pub fn topology_hints(
        &self,
        state: &dyn State,
        pod: &Pod,
        container: &Container,
    ) -> ResourceHints {
        match self {
            Self::None(_) => ResourceHints::new(),
            Self::Static(policy) => policy.topology_hints(state, pod, container),
        }
    }
}
