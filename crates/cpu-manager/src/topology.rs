//! CPU topology discovery and queries
//!
//! [`CpuTopology`] is an immutable description of the node's sockets, cores,
//! logical CPUs and NUMA nodes, discovered once at startup from a
//! [`MachineInfo`] snapshot. All queries are pure; the static policy drives
//! its allocation decisions entirely through [`CpuDetails`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use thiserror::Error;

use crate::cpuset::CpuSet;

/// Errors surfaced while discovering the CPU topology.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("machine info reports no CPUs")]
    NoCpus,

    #[error("duplicate logical CPU id {cpu} in machine info")]
    DuplicateCpu { cpu: usize },

    #[error("non-uniform topology: {cpus} CPUs over {units} {kind}s")]
    NonUniform {
        cpus: usize,
        units: usize,
        kind: &'static str,
    },
}

/// One logical CPU as reported by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineCpu {
    pub cpu_id: usize,
    pub socket_id: usize,
    /// Physical core id, unique across the whole machine.
    pub core_id: usize,
    pub numa_node_id: usize,
}

/// Raw machine description handed to [`CpuTopology::discover`].
#[derive(Debug, Clone, Default)]
pub struct MachineInfo {
    pub cpus: Vec<MachineCpu>,
}

impl MachineInfo {
    /// A uniform machine: `sockets` sockets of `cores_per_socket` physical
    /// cores with `threads_per_core` hardware threads each, logical CPU ids
    /// assigned contiguously and one NUMA node per socket.
    pub fn uniform(sockets: usize, cores_per_socket: usize, threads_per_core: usize) -> Self {
        let mut cpus = Vec::with_capacity(sockets * cores_per_socket * threads_per_core);
        for socket_id in 0..sockets {
            for core in 0..cores_per_socket {
                let core_id = socket_id * cores_per_socket + core;
                for thread in 0..threads_per_core {
                    cpus.push(MachineCpu {
                        cpu_id: core_id * threads_per_core + thread,
                        socket_id,
                        core_id,
                        numa_node_id: socket_id,
                    });
                }
            }
        }
        Self { cpus }
    }
}

/// Location of a logical CPU within the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub socket_id: usize,
    pub core_id: usize,
    pub numa_node_id: usize,
}

/// Per-CPU topology details keyed by logical CPU id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuDetails(BTreeMap<usize, CpuInfo>);

impl CpuDetails {
    /// The set of all CPUs in these details.
    pub fn cpus(&self) -> CpuSet {
        self.0.keys().copied().collect()
    }

    pub fn info(&self, cpu: usize) -> Option<&CpuInfo> {
        self.0.get(&cpu)
    }

    /// Socket ids present, ascending.
    pub fn sockets(&self) -> Vec<usize> {
        self.collect_ids(|info| info.socket_id)
    }

    /// Core ids present, ascending.
    pub fn cores(&self) -> Vec<usize> {
        self.collect_ids(|info| info.core_id)
    }

    /// NUMA node ids present, ascending.
    pub fn numa_nodes(&self) -> Vec<usize> {
        self.collect_ids(|info| info.numa_node_id)
    }

    pub fn cpus_in_sockets(&self, sockets: &[usize]) -> CpuSet {
        self.filter_cpus(|info| sockets.contains(&info.socket_id))
    }

    pub fn cpus_in_cores(&self, cores: &[usize]) -> CpuSet {
        self.filter_cpus(|info| cores.contains(&info.core_id))
    }

    pub fn cpus_in_numa_nodes(&self, nodes: &[usize]) -> CpuSet {
        self.filter_cpus(|info| nodes.contains(&info.numa_node_id))
    }

    /// Details restricted to the given CPU set.
    pub fn keep_only(&self, cpus: &CpuSet) -> CpuDetails {
        CpuDetails(
            self.0
                .iter()
                .filter(|(cpu, _)| cpus.contains(**cpu))
                .map(|(cpu, info)| (*cpu, *info))
                .collect(),
        )
    }

    fn collect_ids(&self, id: impl Fn(&CpuInfo) -> usize) -> Vec<usize> {
        self.0
            .values()
            .map(id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn filter_cpus(&self, keep: impl Fn(&CpuInfo) -> bool) -> CpuSet {
        self.0
            .iter()
            .filter(|(_, info)| keep(info))
            .map(|(cpu, _)| *cpu)
            .collect()
    }
}

/// Immutable description of the node's CPU topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    pub num_cpus: usize,
    pub num_cores: usize,
    pub num_sockets: usize,
    pub num_numa_nodes: usize,
    pub cpu_details: CpuDetails,
}

impl CpuTopology {
    /// Discover the topology from a machine snapshot. Pure: the same input
    /// always yields the same topology.
    pub fn discover(machine: &MachineInfo) -> Result<Self, TopologyError> {
        if machine.cpus.is_empty() {
            return Err(TopologyError::NoCpus);
        }

        let mut details = BTreeMap::new();
        for cpu in &machine.cpus {
            let previous = details.insert(
                cpu.cpu_id,
                CpuInfo {
                    socket_id: cpu.socket_id,
                    core_id: cpu.core_id,
                    numa_node_id: cpu.numa_node_id,
                },
            );
            if previous.is_some() {
                return Err(TopologyError::DuplicateCpu { cpu: cpu.cpu_id });
            }
        }

        let cpu_details = CpuDetails(details);
        let num_cpus = machine.cpus.len();
        let num_cores = cpu_details.cores().len();
        let num_sockets = cpu_details.sockets().len();
        let num_numa_nodes = cpu_details.numa_nodes().len();

        // The allocation algorithm assumes a uniform thread/core layout.
        if num_cpus % num_cores != 0 {
            return Err(TopologyError::NonUniform {
                cpus: num_cpus,
                units: num_cores,
                kind: "core",
            });
        }
        if num_cpus % num_sockets != 0 {
            return Err(TopologyError::NonUniform {
                cpus: num_cpus,
                units: num_sockets,
                kind: "socket",
            });
        }

        Ok(Self {
            num_cpus,
            num_cores,
            num_sockets,
            num_numa_nodes,
            cpu_details,
        })
    }

    /// Hardware threads per physical core.
    pub fn cpus_per_core(&self) -> usize {
        self.num_cpus / self.num_cores
    }

    /// Logical CPUs per socket.
    pub fn cpus_per_socket(&self) -> usize {
        self.num_cpus / self.num_sockets
    }

    /// The set of all logical CPUs.
    pub fn all_cpus(&self) -> CpuSet {
        self.cpu_details.cpus()
    }

    /// NUMA node ids, ascending.
    pub fn numa_nodes(&self) -> Vec<usize> {
        self.cpu_details.numa_nodes()
    }
}
