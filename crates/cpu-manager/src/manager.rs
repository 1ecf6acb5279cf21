//! CPU manager orchestration
//!
//! The manager owns the policy, the state store and the container index
//! behind one mutex, pushes resulting CPU sets to the container runtime,
//! and runs the periodic reconciliation that keeps runtime cgroups aligned
//! with checkpointed state across missed events and restarts.
//!
//! Lock discipline: state mutations, policy invocations and checkpoint
//! flushes happen under the mutex; runtime RPCs never do. `add_container`
//! mutates under the lock, releases it for the runtime call, and re-locks
//! to roll back if the runtime rejects the update.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use api_types::Container;
use api_types::ContainerId;
use api_types::Pod;
use api_types::PodPhase;
use error_stack::Report;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::containermap::ContainerMap;
use crate::cpuset::CpuSet;
use crate::hints::ResourceHints;
use crate::policy::Policy;
use crate::policy::PolicyError;
use crate::policy::POLICY_NONE;
use crate::runtime::ActivePodsProvider;
use crate::runtime::ContainerResources;
use crate::runtime::ContainerRuntime;
use crate::runtime::PodStatusProvider;
use crate::runtime::RuntimeError;
use crate::runtime::SourcesReady;
use crate::state::CheckpointError;
use crate::state::CheckpointState;
use crate::state::CpuAssignments;
use crate::state::MemoryState;
use crate::state::State;
use crate::state::CPU_MANAGER_STATE_FILE;
use crate::topology::TopologyError;

/// Errors surfaced by the manager. The construction and start variants are
/// fatal; `RuntimeUpdate` is returned to `add_container` callers after the
/// in-manager rollback has run.
#[derive(Debug, Error)]
pub enum CpuManagerError {
    #[error("unknown CPU manager policy \"{name}\"")]
    UnknownPolicy { name: String },

    #[error("the static policy requires a reserved CPU quantity greater than zero")]
    MissingReservedCpus,

    #[error("invalid reserved CPU quantity \"{value}\"")]
    InvalidReservedQuantity { value: String },

    #[error("failed to discover CPU topology")]
    TopologyDiscovery(#[from] TopologyError),

    #[error("failed to initialize CPU manager state: {0}")]
    Checkpoint(Report<CheckpointError>),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("CPU manager has not been started")]
    NotStarted,

    #[error("CPU manager is already started")]
    AlreadyStarted,

    #[error(transparent)]
    RuntimeUpdate(#[from] RuntimeError),
}

/// A container visited by one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledContainer {
    pub pod_name: String,
    pub container_name: String,
    pub container_id: String,
}

/// Read-only snapshot of the manager's state.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    default_cpu_set: CpuSet,
    assignments: CpuAssignments,
}

impl StateSnapshot {
    pub fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<&CpuSet> {
        self.assignments
            .get(pod_uid)
            .and_then(|containers| containers.get(container_name))
    }

    pub fn default_cpu_set(&self) -> &CpuSet {
        &self.default_cpu_set
    }

    pub fn cpu_assignments(&self) -> &CpuAssignments {
        &self.assignments
    }
}

struct Collaborators {
    active_pods: Arc<dyn ActivePodsProvider>,
    sources_ready: Arc<dyn SourcesReady>,
    pod_status: Arc<dyn PodStatusProvider>,
    runtime: Arc<dyn ContainerRuntime>,
}

struct ManagerInner {
    policy: Policy,
    state: Box<dyn State>,
    container_map: ContainerMap,
}

/// The node-local CPU manager.
pub struct CpuManager {
    inner: Mutex<ManagerInner>,
    collaborators: OnceLock<Collaborators>,
    reconcile_period: Duration,
    state_file_directory: PathBuf,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for CpuManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuManager").finish_non_exhaustive()
    }
}

impl CpuManager {
    /// Create a manager with the given policy. State is loaded and the
    /// reconcile task spawned by [`CpuManager::start`].
    pub fn new(
        policy: Policy,
        reconcile_period: Duration,
        state_file_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                policy,
                state: Box::new(MemoryState::new()),
                container_map: ContainerMap::new(),
            }),
            collaborators: OnceLock::new(),
            reconcile_period,
            state_file_directory: state_file_directory.into(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire in the external collaborators, load (or create) the checkpoint,
    /// let the policy validate it, seed the container index from
    /// `initial_containers`, and spawn the reconcile task for the static
    /// policy.
    pub fn start(
        self: &Arc<Self>,
        active_pods: Arc<dyn ActivePodsProvider>,
        sources_ready: Arc<dyn SourcesReady>,
        pod_status: Arc<dyn PodStatusProvider>,
        runtime: Arc<dyn ContainerRuntime>,
        initial_containers: ContainerMap,
    ) -> Result<(), CpuManagerError> {
        if self.collaborators.get().is_some() {
            return Err(CpuManagerError::AlreadyStarted);
        }

        {
            let mut inner = self.lock_inner();
            let inner = &mut *inner;
            info!(
                policy = inner.policy.name(),
                reconcile_period = ?self.reconcile_period,
                "starting CPU manager"
            );

            let state = CheckpointState::new(
                &self.state_file_directory,
                CPU_MANAGER_STATE_FILE,
                inner.policy.name(),
            )
            .map_err(CpuManagerError::Checkpoint)?;
            inner.state = Box::new(state);
            inner.container_map = initial_containers;

            inner.policy.start(&mut *inner.state)?;
        }

        let _ = self.collaborators.set(Collaborators {
            active_pods,
            sources_ready,
            pod_status,
            runtime,
        });

        if self.lock_inner().policy.name() == POLICY_NONE {
            return Ok(());
        }

        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.reconcile_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("CPU manager reconcile task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let (success, failure) = manager.reconcile_state();
                        debug!(
                            success = success.len(),
                            failure = failure.len(),
                            "reconciled container CPU sets"
                        );
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop the reconcile task. Cooperative: an in-flight pass finishes,
    /// but no further tick fires.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Assign CPUs to a container between its creation and start, and push
    /// the resulting set to the runtime.
    pub fn add_container(
        &self,
        pod: &Pod,
        container: &Container,
        container_id: &str,
    ) -> Result<(), CpuManagerError> {
        let runtime = self.runtime()?;

        let cpus = {
            let mut inner = self.lock_inner();
            let inner = &mut *inner;

            // Init containers have run to completion before any app
            // container starts; reclaim their CPUs eagerly.
            for init_container in &pod.spec.init_containers {
                if init_container.name == container.name {
                    continue;
                }
                if let Err(err) =
                    inner.policy_remove_container_by_ref(&pod.uid, &init_container.name)
                {
                    warn!(
                        pod = %pod.name,
                        init_container = %init_container.name,
                        error = %err,
                        "unable to reclaim init container CPUs"
                    );
                }
            }

            if let Err(err) = inner.policy.add_container(&mut *inner.state, pod, container) {
                error!(
                    pod = %pod.name,
                    container = %container.name,
                    error = %err,
                    "failed to add container"
                );
                return Err(err.into());
            }
            inner
                .container_map
                .add(&pod.uid, &container.name, container_id);

            inner.state.cpu_set_or_default(&pod.uid, &container.name)
        };

        if cpus.is_empty() {
            // Shared-pool container before the default set exists.
            debug!(
                pod = %pod.name,
                container = %container.name,
                "skipping runtime update, cpu set is empty"
            );
            return Ok(());
        }

        if let Err(err) = update_container_cpu_set(runtime.as_ref(), container_id, &cpus) {
            error!(
                pod = %pod.name,
                container = %container.name,
                container_id = %container_id,
                error = %err,
                "failed to update container resources, rolling back assignment"
            );
            let mut inner = self.lock_inner();
            if let Err(rollback_err) = inner.policy_remove_container_by_id(container_id) {
                error!(
                    container_id = %container_id,
                    error = %rollback_err,
                    "rollback of container assignment failed"
                );
            }
            return Err(err.into());
        }

        Ok(())
    }

    /// Release the CPUs of a container. Unknown container IDs succeed.
    pub fn remove_container(&self, container_id: &str) -> Result<(), CpuManagerError> {
        let mut inner = self.lock_inner();
        inner
            .policy_remove_container_by_id(container_id)
            .map_err(|err| {
                error!(container_id = %container_id, error = %err, "failed to remove container");
                err.into()
            })
    }

    /// Read-only snapshot of the current assignments and shared pool.
    pub fn state(&self) -> StateSnapshot {
        let inner = self.lock_inner();
        StateSnapshot {
            default_cpu_set: inner.state.default_cpu_set(),
            assignments: inner.state.cpu_assignments(),
        }
    }

    /// NUMA affinity hints for a pending container. Stale state is garbage
    /// collected first so hints never count CPUs held by dead containers.
    pub fn topology_hints(&self, pod: &Pod, container: &Container) -> ResourceHints {
        self.remove_stale_state();
        let inner = self.lock_inner();
        inner.policy.topology_hints(&*inner.state, pod, container)
    }

    /// Drop assignments for containers that are no longer part of any
    /// active pod. Gated on source readiness so an incomplete pod list
    /// never looks like deleted pods.
    fn remove_stale_state(&self) {
        let Some(collaborators) = self.collaborators.get() else {
            return;
        };
        if !collaborators.sources_ready.all_ready() {
            return;
        }
        let active_pods = collaborators.active_pods.active_pods();
        if active_pods.is_empty() {
            // An empty list is indistinguishable from a source hiccup;
            // try again next pass.
            return;
        }

        let mut inner = self.lock_inner();
        let assignments = inner.state.cpu_assignments();
        for (pod_uid, containers) in &assignments {
            let active = active_pods.iter().find(|pod| &pod.uid == pod_uid);
            for container_name in containers.keys() {
                let declared = active.is_some_and(|pod| {
                    pod.all_containers()
                        .any(|container| &container.name == container_name)
                });
                if declared {
                    continue;
                }
                info!(
                    pod_uid = %pod_uid,
                    container = %container_name,
                    "removing stale container state"
                );
                if let Err(err) = inner.policy_remove_container_by_ref(pod_uid, container_name) {
                    error!(
                        pod_uid = %pod_uid,
                        container = %container_name,
                        error = %err,
                        "failed to remove stale container state"
                    );
                }
            }
        }
    }

    /// One reconciliation pass: garbage collect stale state, re-admit
    /// running containers that dropped out of state, and re-apply every
    /// container's CPU set to the runtime.
    pub fn reconcile_state(&self) -> (Vec<ReconciledContainer>, Vec<ReconciledContainer>) {
        let mut success = Vec::new();
        let mut failure = Vec::new();

        let Some(collaborators) = self.collaborators.get() else {
            return (success, failure);
        };

        self.remove_stale_state();

        for pod in collaborators.active_pods.active_pods() {
            let status = collaborators.pod_status.pod_status(&pod.uid);

            for container in pod.all_containers() {
                let Some(status) = status.as_ref() else {
                    warn!(pod = %pod.name, "skipping pod, status not found");
                    failure.push(ReconciledContainer {
                        pod_name: pod.name.clone(),
                        container_name: container.name.clone(),
                        container_id: String::new(),
                    });
                    break;
                };

                let container_id = status
                    .raw_container_id(&container.name)
                    .and_then(|raw| ContainerId::parse(raw).ok());
                let Some(container_id) = container_id else {
                    warn!(
                        pod = %pod.name,
                        container = %container.name,
                        "skipping container, ID not found in pod status"
                    );
                    failure.push(ReconciledContainer {
                        pod_name: pod.name.clone(),
                        container_name: container.name.clone(),
                        container_id: String::new(),
                    });
                    continue;
                };
                let container_id = container_id.id;

                // A container can be absent from state because the policy
                // ignores it, because the checkpoint was fresh, or because
                // it was already removed. Only running, non-terminating
                // containers are re-admitted.
                let assigned = {
                    let inner = self.lock_inner();
                    inner.state.cpu_set(&pod.uid, &container.name)
                };
                if assigned.is_none() {
                    if status.phase == PodPhase::Running && pod.deletion_timestamp.is_none() {
                        debug!(
                            pod = %pod.name,
                            container = %container.name,
                            container_id = %container_id,
                            "container missing from state, re-adding"
                        );
                        if let Err(err) = self.add_container(&pod, container, &container_id) {
                            error!(
                                pod = %pod.name,
                                container = %container.name,
                                error = %err,
                                "failed to re-add container"
                            );
                            failure.push(ReconciledContainer {
                                pod_name: pod.name.clone(),
                                container_name: container.name.clone(),
                                container_id,
                            });
                            continue;
                        }
                    } else {
                        // Terminating or not yet running; it will either go
                        // away or be picked up on a later pass.
                        continue;
                    }
                }

                let cpus = {
                    let inner = self.lock_inner();
                    inner.state.cpu_set_or_default(&pod.uid, &container.name)
                };
                if cpus.is_empty() {
                    warn!(
                        pod = %pod.name,
                        container = %container.name,
                        "skipping container, assigned cpu set is empty"
                    );
                    failure.push(ReconciledContainer {
                        pod_name: pod.name.clone(),
                        container_name: container.name.clone(),
                        container_id,
                    });
                    continue;
                }

                if let Err(err) =
                    update_container_cpu_set(collaborators.runtime.as_ref(), &container_id, &cpus)
                {
                    error!(
                        pod = %pod.name,
                        container = %container.name,
                        container_id = %container_id,
                        cpus = %cpus,
                        error = %err,
                        "failed to update container during reconciliation"
                    );
                    failure.push(ReconciledContainer {
                        pod_name: pod.name.clone(),
                        container_name: container.name.clone(),
                        container_id,
                    });
                    continue;
                }

                success.push(ReconciledContainer {
                    pod_name: pod.name.clone(),
                    container_name: container.name.clone(),
                    container_id,
                });
            }
        }

        (success, failure)
    }

    fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>, CpuManagerError> {
        self.collaborators
            .get()
            .map(|collaborators| Arc::clone(&collaborators.runtime))
            .ok_or(CpuManagerError::NotStarted)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ManagerInner {
    fn policy_remove_container_by_id(&mut self, container_id: &str) -> Result<(), PolicyError> {
        let Some((pod_uid, container_name)) = self
            .container_map
            .container_ref(container_id)
            .map(|(pod_uid, container_name)| (pod_uid.to_string(), container_name.to_string()))
        else {
            return Ok(());
        };

        self.policy
            .remove_container(&mut *self.state, &pod_uid, &container_name)?;
        self.container_map.remove_by_container_id(container_id);
        Ok(())
    }

    fn policy_remove_container_by_ref(
        &mut self,
        pod_uid: &str,
        container_name: &str,
    ) -> Result<(), PolicyError> {
        self.policy
            .remove_container(&mut *self.state, pod_uid, container_name)?;
        self.container_map
            .remove_by_container_ref(pod_uid, container_name);
        Ok(())
    }
}

fn update_container_cpu_set(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    cpus: &CpuSet,
) -> Result<(), RuntimeError> {
    runtime.update_container_resources(
        container_id,
        &ContainerResources {
            cpuset_cpus: cpus.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use api_types::ContainerStatus;
    use api_types::PodSpec;
    use api_types::PodStatus;
    use api_types::Quantity;
    use api_types::ResourceRequirements;
    use api_types::RESOURCE_CPU;
    use api_types::RESOURCE_MEMORY;
    use tempfile::TempDir;

    use crate::config::new_manager;
    use crate::config::CpuManagerConfig;
    use crate::runtime::SourcesReadyStub;
    use crate::topology::MachineInfo;

    use super::*;

    #[derive(Default)]
    struct RecordingRuntime {
        calls: Mutex<Vec<(String, String)>>,
        should_fail: AtomicBool,
    }

    impl RecordingRuntime {
        fn set_should_fail(&self, should_fail: bool) {
            self.should_fail.store(should_fail, Ordering::SeqCst);
        }

        fn last_call_for(&self, container_id: &str) -> Option<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(id, _)| id == container_id)
                .map(|(_, cpus)| cpus.clone())
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl ContainerRuntime for RecordingRuntime {
        fn update_container_resources(
            &self,
            container_id: &str,
            resources: &ContainerResources,
        ) -> Result<(), RuntimeError> {
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(RuntimeError {
                    container_id: container_id.to_string(),
                    message: "injected failure".to_string(),
                });
            }
            self.calls
                .lock()
                .unwrap()
                .push((container_id.to_string(), resources.cpuset_cpus.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct PodList {
        pods: Mutex<Vec<Pod>>,
    }

    impl PodList {
        fn set(&self, pods: Vec<Pod>) {
            *self.pods.lock().unwrap() = pods;
        }
    }

    impl ActivePodsProvider for PodList {
        fn active_pods(&self) -> Vec<Pod> {
            self.pods.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct StatusMap {
        statuses: Mutex<HashMap<String, PodStatus>>,
    }

    impl StatusMap {
        fn set_running(&self, pod: &Pod, scheme_prefixed_ids: &[(&str, &str)]) {
            let statuses = scheme_prefixed_ids
                .iter()
                .map(|(name, id)| ContainerStatus {
                    name: name.to_string(),
                    container_id: id.to_string(),
                })
                .collect();
            self.statuses.lock().unwrap().insert(
                pod.uid.clone(),
                PodStatus {
                    phase: PodPhase::Running,
                    init_container_statuses: Vec::new(),
                    container_statuses: statuses,
                },
            );
        }
    }

    impl PodStatusProvider for StatusMap {
        fn pod_status(&self, pod_uid: &str) -> Option<PodStatus> {
            self.statuses.lock().unwrap().get(pod_uid).cloned()
        }
    }

    fn cpu_container(name: &str, cpus: &str) -> Container {
        let resources: api_types::ResourceList = [
            (RESOURCE_CPU.to_string(), Quantity::parse(cpus).unwrap()),
            (RESOURCE_MEMORY.to_string(), Quantity::from_whole(100)),
        ]
        .into_iter()
        .collect();
        Container {
            name: name.to_string(),
            resources: ResourceRequirements {
                requests: resources.clone(),
                limits: resources,
            },
        }
    }

    fn guaranteed_pod(uid: &str, containers: Vec<Container>) -> Pod {
        Pod {
            uid: uid.to_string(),
            name: format!("pod-{uid}"),
            namespace: "default".to_string(),
            spec: PodSpec {
                init_containers: Vec::new(),
                containers,
            },
            deletion_timestamp: None,
        }
    }

    struct Fixture {
        manager: Arc<CpuManager>,
        runtime: Arc<RecordingRuntime>,
        pods: Arc<PodList>,
        statuses: Arc<StatusMap>,
        _state_dir: TempDir,
    }

    fn started_manager() -> Fixture {
        let state_dir = TempDir::new().unwrap();
        let config = CpuManagerConfig {
            policy_name: "static".to_string(),
            reconcile_period: Duration::from_secs(3600),
            reserved_cpus: Quantity::from_whole(1),
            reserved_cpu_set: None,
            state_file_directory: state_dir.path().to_path_buf(),
        };
        let manager = Arc::new(
            new_manager(&config, &MachineInfo::uniform(2, 2, 2)).unwrap(),
        );

        let runtime = Arc::new(RecordingRuntime::default());
        let pods = Arc::new(PodList::default());
        let statuses = Arc::new(StatusMap::default());
        manager
            .start(
                pods.clone(),
                Arc::new(SourcesReadyStub),
                statuses.clone(),
                runtime.clone(),
                ContainerMap::new(),
            )
            .unwrap();

        Fixture {
            manager,
            runtime,
            pods,
            statuses,
            _state_dir: state_dir,
        }
    }

    #[tokio::test]
    async fn add_container_pushes_the_assigned_set() {
        let fixture = started_manager();
        let pod = guaranteed_pod("p1", vec![cpu_container("c1", "2")]);

        fixture
            .manager
            .add_container(&pod, &pod.spec.containers[0], "cid-1")
            .unwrap();

        let snapshot = fixture.manager.state();
        let assigned = snapshot.cpu_set("p1", "c1").unwrap();
        assert_eq!(assigned.to_string(), "4-5");
        assert_eq!(
            fixture.runtime.last_call_for("cid-1").unwrap(),
            assigned.to_string()
        );
    }

    #[tokio::test]
    async fn shared_pool_containers_receive_the_default_set() {
        let fixture = started_manager();
        let mut container = cpu_container("c1", "500m");
        container
            .resources
            .limits
            .insert(RESOURCE_CPU.to_string(), Quantity::from_whole(1));
        let pod = guaranteed_pod("p1", vec![container.clone()]);

        fixture
            .manager
            .add_container(&pod, &container, "cid-1")
            .unwrap();

        let snapshot = fixture.manager.state();
        assert_eq!(snapshot.cpu_set("p1", "c1"), None);
        assert_eq!(snapshot.default_cpu_set().to_string(), "0-7");
        assert_eq!(fixture.runtime.last_call_for("cid-1").unwrap(), "0-7");
    }

    #[tokio::test]
    async fn runtime_failure_rolls_back_the_assignment() {
        let fixture = started_manager();
        let pod = guaranteed_pod("p1", vec![cpu_container("c1", "2")]);

        fixture.runtime.set_should_fail(true);
        let err = fixture
            .manager
            .add_container(&pod, &pod.spec.containers[0], "cid-1")
            .unwrap_err();
        assert!(matches!(err, CpuManagerError::RuntimeUpdate(_)));

        let snapshot = fixture.manager.state();
        assert_eq!(snapshot.cpu_set("p1", "c1"), None);
        assert_eq!(snapshot.default_cpu_set().to_string(), "0-7");
    }

    #[tokio::test]
    async fn remove_container_is_idempotent() {
        let fixture = started_manager();
        let pod = guaranteed_pod("p1", vec![cpu_container("c1", "2")]);
        fixture
            .manager
            .add_container(&pod, &pod.spec.containers[0], "cid-1")
            .unwrap();

        fixture.manager.remove_container("cid-1").unwrap();
        let after_first = fixture.manager.state();
        assert_eq!(after_first.cpu_set("p1", "c1"), None);
        assert_eq!(after_first.default_cpu_set().to_string(), "0-7");

        fixture.manager.remove_container("cid-1").unwrap();
        let after_second = fixture.manager.state();
        assert_eq!(after_second.default_cpu_set().to_string(), "0-7");

        fixture.manager.remove_container("never-seen").unwrap();
    }

    #[tokio::test]
    async fn init_containers_are_reclaimed_before_app_allocation() {
        let fixture = started_manager();
        let init = cpu_container("i1", "1");
        let app = cpu_container("c1", "2");
        let mut pod = guaranteed_pod("p1", vec![app.clone()]);
        pod.spec.init_containers = vec![init.clone()];

        fixture.manager.add_container(&pod, &init, "cid-i1").unwrap();
        assert!(fixture.manager.state().cpu_set("p1", "i1").is_some());

        fixture.manager.add_container(&pod, &app, "cid-c1").unwrap();

        let snapshot = fixture.manager.state();
        assert_eq!(snapshot.cpu_set("p1", "i1"), None);
        let app_cpus = snapshot.cpu_set("p1", "c1").unwrap();
        assert_eq!(app_cpus.to_string(), "4-5");
        assert_eq!(
            snapshot.default_cpu_set().union(app_cpus).to_string(),
            "0-7"
        );
    }

    #[tokio::test]
    async fn reconcile_restores_missing_assignments() {
        let fixture = started_manager();
        let pod = guaranteed_pod("p1", vec![cpu_container("c1", "2")]);
        fixture
            .manager
            .add_container(&pod, &pod.spec.containers[0], "cid-1")
            .unwrap();
        let assigned = fixture
            .manager
            .state()
            .cpu_set("p1", "c1")
            .unwrap()
            .to_string();

        // Simulate state loss from a missed lifecycle event.
        fixture.manager.remove_container("cid-1").unwrap();
        assert_eq!(fixture.manager.state().cpu_set("p1", "c1"), None);

        fixture.pods.set(vec![pod.clone()]);
        fixture
            .statuses
            .set_running(&pod, &[("c1", "containerd://cid-1")]);

        let (success, failure) = fixture.manager.reconcile_state();
        assert_eq!(success.len(), 1);
        assert!(failure.is_empty());
        assert_eq!(
            fixture.manager.state().cpu_set("p1", "c1").unwrap().to_string(),
            assigned
        );
        assert_eq!(fixture.runtime.last_call_for("cid-1").unwrap(), assigned);
    }

    #[tokio::test]
    async fn reconcile_records_failures_for_missing_status() {
        let fixture = started_manager();
        let pod = guaranteed_pod("p1", vec![cpu_container("c1", "2")]);
        fixture.pods.set(vec![pod]);

        let (success, failure) = fixture.manager.reconcile_state();
        assert!(success.is_empty());
        assert_eq!(failure.len(), 1);
        assert_eq!(failure[0].container_name, "c1");
        assert!(failure[0].container_id.is_empty());
        assert_eq!(fixture.runtime.call_count(), 0);
    }

    #[tokio::test]
    async fn reconcile_skips_containers_without_ids() {
        let fixture = started_manager();
        let pod = guaranteed_pod("p1", vec![cpu_container("c1", "2")]);
        fixture.pods.set(vec![pod.clone()]);
        fixture.statuses.set_running(&pod, &[("c1", "")]);

        let (success, failure) = fixture.manager.reconcile_state();
        assert!(success.is_empty());
        assert_eq!(failure.len(), 1);
    }

    #[tokio::test]
    async fn starting_twice_fails() {
        let fixture = started_manager();
        let err = fixture
            .manager
            .start(
                fixture.pods.clone(),
                Arc::new(SourcesReadyStub),
                fixture.statuses.clone(),
                fixture.runtime.clone(),
                ContainerMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CpuManagerError::AlreadyStarted));
    }

    #[tokio::test]
    async fn add_before_start_fails() {
        let manager = {
            let config = CpuManagerConfig {
                policy_name: "static".to_string(),
                reconcile_period: Duration::from_secs(3600),
                reserved_cpus: Quantity::from_whole(1),
                reserved_cpu_set: None,
                state_file_directory: std::env::temp_dir(),
            };
            new_manager(&config, &MachineInfo::uniform(2, 2, 2)).unwrap()
        };
        let pod = guaranteed_pod("p1", vec![cpu_container("c1", "2")]);

        let err = manager
            .add_container(&pod, &pod.spec.containers[0], "cid-1")
            .unwrap_err();
        assert!(matches!(err, CpuManagerError::NotStarted));
    }
}
