//! Node-local CPU manager
//!
//! Assigns physical CPUs to pod containers, enforces the assignments
//! against the container runtime, and preserves them across restarts
//! through a checkpointed state file. The static policy grants exclusive
//! CPUs to Guaranteed-QoS containers requesting whole CPUs; everything
//! else shares the default pool.

// Configuration layer
pub mod config;

// Logging setup
pub mod logging;

// Core data types
pub mod containermap;
pub mod cpuset;
pub mod hints;
pub mod topology;

// State store and checkpointing
pub mod state;

// Assignment policies
pub mod policy;

// External collaborator seams
pub mod runtime;

// Orchestration
pub mod manager;

// Re-export the types most callers need
pub use config::new_manager;
pub use config::CpuManagerArgs;
pub use config::CpuManagerConfig;
pub use containermap::ContainerMap;
pub use cpuset::CpuSet;
pub use hints::ResourceHints;
pub use hints::TopologyHint;
pub use manager::CpuManager;
pub use manager::CpuManagerError;
pub use manager::ReconciledContainer;
pub use manager::StateSnapshot;
pub use policy::Policy;
pub use runtime::ActivePodsProvider;
pub use runtime::ContainerResources;
pub use runtime::ContainerRuntime;
pub use runtime::PodStatusProvider;
pub use runtime::SourcesReady;
pub use runtime::SourcesReadyStub;
pub use topology::CpuTopology;
pub use topology::MachineInfo;
