//! The static policy
//!
//! Grants exclusive CPUs to Guaranteed-QoS containers that request a whole
//! number of CPUs; everything else runs in the shared pool. A reserved
//! slice of the shared pool is held back for system overhead and never
//! handed out exclusively.

use std::sync::Arc;

use api_types::qos_class;
use api_types::Container;
use api_types::Pod;
use api_types::QosClass;
use api_types::RESOURCE_CPU;
use tracing::debug;
use tracing::info;

use crate::cpuset::CpuSet;
use crate::hints::NumaMask;
use crate::hints::ResourceHints;
use crate::hints::TopologyHint;
use crate::state::State;
use crate::topology::CpuTopology;

use super::assignment::take_by_topology;
use super::PolicyError;

#[derive(Debug)]
pub struct StaticPolicy {
    topology: Arc<CpuTopology>,
    /// CPUs held back for system overhead; always part of the shared pool.
    reserved: CpuSet,
}

impl StaticPolicy {
    /// Build the policy, deriving the reserved set. An explicit set must
    /// have exactly `num_reserved_cpus` CPUs and be part of the topology;
    /// otherwise the reserved set is chosen by the same topology-aware
    /// selection used for allocation, so restarts re-derive it identically.
    pub fn new(
        topology: Arc<CpuTopology>,
        num_reserved_cpus: usize,
        specific_cpus: Option<CpuSet>,
    ) -> Result<Self, PolicyError> {
        let all_cpus = topology.all_cpus();
        let reserved = match specific_cpus {
            Some(cpus) => {
                if cpus.size() != num_reserved_cpus {
                    return Err(PolicyError::InvalidReservedSet {
                        reason: format!(
                            "\"{cpus}\" has {} CPUs, expected {num_reserved_cpus}",
                            cpus.size()
                        ),
                    });
                }
                if !cpus.is_subset_of(&all_cpus) {
                    return Err(PolicyError::InvalidReservedSet {
                        reason: format!("\"{cpus}\" is not a subset of the node's CPUs"),
                    });
                }
                cpus
            }
            None => take_by_topology(&topology, &all_cpus, num_reserved_cpus)?,
        };

        info!(reserved = %reserved, "static policy reserved CPUs");
        Ok(Self { topology, reserved })
    }

    pub fn reserved_cpus(&self) -> &CpuSet {
        &self.reserved
    }

    /// Initialize empty state, or validate a restored checkpoint against
    /// the topology invariants.
    pub(super) fn start(&self, state: &mut dyn State) -> Result<(), PolicyError> {
        let all_cpus = self.topology.all_cpus();
        let default = state.default_cpu_set();
        let assignments = state.cpu_assignments();

        if default.is_empty() && assignments.is_empty() {
            state.set_default_cpu_set(all_cpus)?;
            return Ok(());
        }

        if !self.reserved.is_subset_of(&default) {
            return Err(PolicyError::InvalidState {
                reason: format!(
                    "reserved CPUs \"{}\" are not fully contained in the shared pool \"{default}\"",
                    self.reserved
                ),
            });
        }

        let mut assigned_union = CpuSet::new();
        for (pod_uid, containers) in &assignments {
            for (container_name, cpus) in containers {
                if !cpus.intersection(&assigned_union).is_empty() {
                    return Err(PolicyError::InvalidState {
                        reason: format!(
                            "CPUs \"{cpus}\" of container {container_name} in pod {pod_uid} \
                             overlap another exclusive assignment"
                        ),
                    });
                }
                if !cpus.intersection(&default).is_empty() {
                    return Err(PolicyError::InvalidState {
                        reason: format!(
                            "CPUs \"{cpus}\" of container {container_name} in pod {pod_uid} \
                             overlap the shared pool"
                        ),
                    });
                }
                assigned_union = assigned_union.union(cpus);
            }
        }

        if default.union(&assigned_union) != all_cpus {
            return Err(PolicyError::InvalidState {
                reason: format!(
                    "shared pool \"{default}\" plus exclusive assignments \"{assigned_union}\" \
                     do not cover the node's CPUs \"{all_cpus}\""
                ),
            });
        }

        Ok(())
    }

    pub(super) fn add_container(
        &self,
        state: &mut dyn State,
        pod: &Pod,
        container: &Container,
    ) -> Result<(), PolicyError> {
        let requested = guaranteed_cpus(pod, container);
        if requested == 0 {
            // Shared-pool container; nothing to track.
            return Ok(());
        }

        if state.cpu_set(&pod.uid, &container.name).is_some() {
            debug!(
                pod = %pod.name,
                container = %container.name,
                "container already has exclusive CPUs, nothing to do"
            );
            return Ok(());
        }

        let default = state.default_cpu_set();
        let available = default.difference(&self.reserved);
        if available.size() < requested {
            return Err(PolicyError::NotEnoughCpus {
                requested,
                available: available.size(),
            });
        }

        let cpus = take_by_topology(&self.topology, &available, requested)?;
        state.set_default_cpu_set(default.difference(&cpus))?;
        state.set_cpu_set(&pod.uid, &container.name, cpus.clone())?;

        info!(
            pod = %pod.name,
            container = %container.name,
            cpus = %cpus,
            "allocated exclusive CPUs"
        );
        Ok(())
    }

    pub(super) fn remove_container(
        &self,
        state: &mut dyn State,
        pod_uid: &str,
        container_name: &str,
    ) -> Result<(), PolicyError> {
        let Some(cpus) = state.cpu_set(pod_uid, container_name) else {
            return Ok(());
        };

        state.delete(pod_uid, container_name)?;
        state.set_default_cpu_set(state.default_cpu_set().union(&cpus))?;

        info!(
            pod_uid = %pod_uid,
            container = %container_name,
            cpus = %cpus,
            "released exclusive CPUs back to the shared pool"
        );
        Ok(())
    }

    /// Hints for the `cpu` resource: every NUMA node subset whose CPUs
    /// contain enough assignable CPUs, the narrowest marked preferred.
    pub(super) fn topology_hints(
        &self,
        state: &dyn State,
        pod: &Pod,
        container: &Container,
    ) -> ResourceHints {
        let requested = guaranteed_cpus(pod, container);
        if requested == 0 {
            return ResourceHints::new();
        }

        if let Some(assigned) = state.cpu_set(&pod.uid, &container.name) {
            // Regenerating hints for an already-running container: pin to
            // the NUMA nodes it already occupies.
            let nodes: Vec<usize> = assigned
                .iter()
                .filter_map(|cpu| self.topology.cpu_details.info(cpu))
                .map(|info| info.numa_node_id)
                .collect();
            let hint = TopologyHint {
                numa_affinity: NumaMask::from_nodes(&nodes),
                preferred: true,
            };
            return ResourceHints::from([(RESOURCE_CPU.to_string(), vec![hint])]);
        }

        let available = state.default_cpu_set().difference(&self.reserved);
        let hints = self.generate_hints(&available, requested);
        ResourceHints::from([(RESOURCE_CPU.to_string(), hints)])
    }

    fn generate_hints(&self, available: &CpuSet, requested: usize) -> Vec<TopologyHint> {
        let nodes = self.topology.numa_nodes();
        let mut satisfying: Vec<NumaMask> = Vec::new();

        for bits in 1..(1u128 << nodes.len()) {
            let subset: Vec<usize> = nodes
                .iter()
                .enumerate()
                .filter(|(index, _)| bits & (1 << index) != 0)
                .map(|(_, node)| *node)
                .collect();
            let cpus = self
                .topology
                .cpu_details
                .cpus_in_numa_nodes(&subset)
                .intersection(available);
            if cpus.size() >= requested {
                satisfying.push(NumaMask::from_nodes(&subset));
            }
        }

        let min_count = satisfying.iter().map(NumaMask::count).min();
        satisfying
            .into_iter()
            .map(|numa_affinity| TopologyHint {
                numa_affinity,
                preferred: Some(numa_affinity.count()) == min_count,
            })
            .collect()
    }
}

/// The number of exclusive CPUs a container qualifies for: its pod must be
/// Guaranteed QoS and its CPU request a positive whole number of CPUs;
/// otherwise zero.
fn guaranteed_cpus(pod: &Pod, container: &Container) -> usize {
    if qos_class(pod) != QosClass::Guaranteed {
        return 0;
    }
    match container.resources.requests.get(RESOURCE_CPU) {
        Some(request) if request.is_whole_units() => request.whole_units() as usize,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use api_types::Quantity;
    use api_types::ResourceRequirements;

    use crate::state::MemoryState;
    use crate::state::Reader;
    use crate::state::State as _;
    use crate::topology::MachineInfo;

    use super::*;

    fn dual_socket_topology() -> Arc<CpuTopology> {
        Arc::new(CpuTopology::discover(&MachineInfo::uniform(2, 2, 2)).unwrap())
    }

    fn guaranteed_container(name: &str, cpus: &str) -> Container {
        let quantity = Quantity::parse(cpus).unwrap();
        let resources: api_types::ResourceList = [
            (RESOURCE_CPU.to_string(), quantity),
            ("memory".to_string(), Quantity::from_whole(100)),
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

    fn guaranteed_pod(uid: &str, container: Container) -> Pod {
        Pod {
            uid: uid.to_string(),
            name: format!("pod-{uid}"),
            namespace: "default".to_string(),
            spec: api_types::PodSpec {
                init_containers: Vec::new(),
                containers: vec![container],
            },
            deletion_timestamp: None,
        }
    }

    fn started_policy_and_state(reserved: usize) -> (StaticPolicy, MemoryState) {
        let policy = StaticPolicy::new(dual_socket_topology(), reserved, None).unwrap();
        let mut state = MemoryState::new();
        policy.start(&mut state).unwrap();
        (policy, state)
    }

    #[test]
    fn reserved_set_is_derived_deterministically() {
        let policy = StaticPolicy::new(dual_socket_topology(), 1, None).unwrap();
        assert_eq!(policy.reserved_cpus().to_string(), "0");

        let again = StaticPolicy::new(dual_socket_topology(), 1, None).unwrap();
        assert_eq!(policy.reserved_cpus(), again.reserved_cpus());
    }

    #[test]
    fn explicit_reserved_set_is_validated() {
        let specific = CpuSet::parse("0-1").unwrap();
        let policy = StaticPolicy::new(dual_socket_topology(), 2, Some(specific)).unwrap();
        assert_eq!(policy.reserved_cpus().to_string(), "0-1");

        let wrong_size =
            StaticPolicy::new(dual_socket_topology(), 2, Some(CpuSet::parse("0").unwrap()));
        assert!(matches!(
            wrong_size.unwrap_err(),
            PolicyError::InvalidReservedSet { .. }
        ));

        let out_of_range =
            StaticPolicy::new(dual_socket_topology(), 2, Some(CpuSet::parse("30-31").unwrap()));
        assert!(matches!(
            out_of_range.unwrap_err(),
            PolicyError::InvalidReservedSet { .. }
        ));
    }

    #[test]
    fn start_initializes_empty_state() {
        let (_, state) = started_policy_and_state(1);
        assert_eq!(state.default_cpu_set().to_string(), "0-7");
    }

    #[test]
    fn start_rejects_overlapping_checkpoint() {
        let policy = StaticPolicy::new(dual_socket_topology(), 1, None).unwrap();
        let mut state = MemoryState::new();
        state
            .set_default_cpu_set(CpuSet::parse("0-7").unwrap())
            .unwrap();
        state
            .set_cpu_set("pod-1", "main", CpuSet::parse("4-5").unwrap())
            .unwrap();

        let err = policy.start(&mut state).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidState { .. }));
    }

    #[test]
    fn start_rejects_incomplete_coverage() {
        let policy = StaticPolicy::new(dual_socket_topology(), 1, None).unwrap();
        let mut state = MemoryState::new();
        // CPU 7 is neither shared nor assigned.
        state
            .set_default_cpu_set(CpuSet::parse("0-5").unwrap())
            .unwrap();
        state
            .set_cpu_set("pod-1", "main", CpuSet::parse("6").unwrap())
            .unwrap();

        let err = policy.start(&mut state).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidState { .. }));
    }

    #[test]
    fn start_rejects_reserved_outside_shared_pool() {
        let policy = StaticPolicy::new(dual_socket_topology(), 1, None).unwrap();
        let mut state = MemoryState::new();
        state
            .set_default_cpu_set(CpuSet::parse("1-7").unwrap())
            .unwrap();
        state
            .set_cpu_set("pod-1", "main", CpuSet::parse("0").unwrap())
            .unwrap();

        let err = policy.start(&mut state).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidState { .. }));
    }

    #[test]
    fn add_container_takes_a_whole_socket() {
        let (policy, mut state) = started_policy_and_state(1);
        let pod = guaranteed_pod("p1", guaranteed_container("c1", "4"));

        policy
            .add_container(&mut state, &pod, &pod.spec.containers[0])
            .unwrap();

        // Socket 0 holds the reserved CPU, so socket 1 is the only whole one.
        assert_eq!(state.cpu_set("p1", "c1").unwrap().to_string(), "4-7");
        assert_eq!(state.default_cpu_set().to_string(), "0-3");
    }

    #[test]
    fn add_container_is_idempotent() {
        let (policy, mut state) = started_policy_and_state(1);
        let pod = guaranteed_pod("p1", guaranteed_container("c1", "2"));

        policy
            .add_container(&mut state, &pod, &pod.spec.containers[0])
            .unwrap();
        let first = state.cpu_set("p1", "c1").unwrap();
        policy
            .add_container(&mut state, &pod, &pod.spec.containers[0])
            .unwrap();

        assert_eq!(state.cpu_set("p1", "c1").unwrap(), first);
    }

    #[test]
    fn non_guaranteed_containers_stay_in_the_shared_pool() {
        let (policy, mut state) = started_policy_and_state(1);
        let mut container = guaranteed_container("c1", "500m");
        container.resources.limits.insert(
            RESOURCE_CPU.to_string(),
            Quantity::parse("1").unwrap(),
        );
        let pod = guaranteed_pod("p1", container.clone());

        policy.add_container(&mut state, &pod, &container).unwrap();
        assert_eq!(state.cpu_set("p1", "c1"), None);
        assert_eq!(state.default_cpu_set().to_string(), "0-7");
    }

    #[test]
    fn fractional_guaranteed_requests_are_not_exclusive() {
        let (policy, mut state) = started_policy_and_state(1);
        let container = guaranteed_container("c1", "1500m");
        let pod = guaranteed_pod("p1", container.clone());

        policy.add_container(&mut state, &pod, &container).unwrap();
        assert_eq!(state.cpu_set("p1", "c1"), None);
    }

    #[test]
    fn reserved_cpus_are_never_allocated() {
        let (policy, mut state) = started_policy_and_state(1);
        let pod = guaranteed_pod("p1", guaranteed_container("c1", "7"));

        policy
            .add_container(&mut state, &pod, &pod.spec.containers[0])
            .unwrap();

        let assigned = state.cpu_set("p1", "c1").unwrap();
        assert_eq!(assigned.size(), 7);
        assert!(!assigned.contains(0));
        assert_eq!(state.default_cpu_set().to_string(), "0");
    }

    #[test]
    fn not_enough_cpus_leaves_state_untouched() {
        let (policy, mut state) = started_policy_and_state(1);
        let pod = guaranteed_pod("p3", guaranteed_container("c3", "8"));

        let err = policy
            .add_container(&mut state, &pod, &pod.spec.containers[0])
            .unwrap_err();
        assert!(matches!(
            err,
            PolicyError::NotEnoughCpus {
                requested: 8,
                available: 7
            }
        ));
        assert_eq!(state.default_cpu_set().to_string(), "0-7");
        assert!(state.cpu_assignments().is_empty());
    }

    #[test]
    fn remove_container_returns_cpus_and_is_idempotent() {
        let (policy, mut state) = started_policy_and_state(1);
        let pod = guaranteed_pod("p1", guaranteed_container("c1", "2"));
        policy
            .add_container(&mut state, &pod, &pod.spec.containers[0])
            .unwrap();

        policy.remove_container(&mut state, "p1", "c1").unwrap();
        assert_eq!(state.default_cpu_set().to_string(), "0-7");
        assert_eq!(state.cpu_set("p1", "c1"), None);

        policy.remove_container(&mut state, "p1", "c1").unwrap();
        assert_eq!(state.default_cpu_set().to_string(), "0-7");
    }

    #[test]
    fn hints_enumerate_satisfying_numa_subsets() {
        let (policy, state) = started_policy_and_state(1);
        let pod = guaranteed_pod("p1", guaranteed_container("c1", "4"));

        let hints = policy.topology_hints(&state, &pod, &pod.spec.containers[0]);
        let cpu_hints = &hints[RESOURCE_CPU];

        // Node 0 has 3 assignable CPUs (one is reserved), node 1 has 4:
        // {1} satisfies and is the narrowest, {0,1} satisfies but is wider.
        assert_eq!(cpu_hints.len(), 2);
        let narrow = cpu_hints
            .iter()
            .find(|hint| hint.numa_affinity == NumaMask::from_nodes(&[1]))
            .unwrap();
        assert!(narrow.preferred);
        let wide = cpu_hints
            .iter()
            .find(|hint| hint.numa_affinity == NumaMask::from_nodes(&[0, 1]))
            .unwrap();
        assert!(!wide.preferred);
    }

    #[test]
    fn hints_for_assigned_container_pin_current_nodes() {
        let (policy, mut state) = started_policy_and_state(1);
        let pod = guaranteed_pod("p1", guaranteed_container("c1", "2"));
        policy
            .add_container(&mut state, &pod, &pod.spec.containers[0])
            .unwrap();

        let hints = policy.topology_hints(&state, &pod, &pod.spec.containers[0]);
        let cpu_hints = &hints[RESOURCE_CPU];
        assert_eq!(cpu_hints.len(), 1);
        assert!(cpu_hints[0].preferred);
        assert_eq!(cpu_hints[0].numa_affinity.count(), 1);
    }

    #[test]
    fn hints_are_empty_for_non_qualifying_containers() {
        let (policy, state) = started_policy_and_state(1);
        let container = guaranteed_container("c1", "500m");
        let pod = guaranteed_pod("p1", container.clone());

        let hints = policy.topology_hints(&state, &pod, &container);
        assert!(hints.is_empty());
    }
}
