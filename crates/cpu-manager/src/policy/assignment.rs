//! Topology-aware CPU selection
//!
//! Picks CPUs so that allocations fragment the topology as little as
//! possible: whole sockets first, then whole cores, then single hardware
//! threads. Tie-breaks are fully deterministic so the same inputs always
//! yield the same selection, across process restarts included.

use thiserror::Error;

use crate::cpuset::CpuSet;
use crate::topology::CpuDetails;
use crate::topology::CpuTopology;

/// Internal allocation failure. Callers are expected to have verified the
/// pool size first, so hitting this indicates inconsistent state.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("failed to allocate {requested} CPUs from a pool of {available}")]
pub struct AllocationError {
    pub requested: usize,
    pub available: usize,
}

/// Select `num_cpus` CPUs from `available`, preferring the smallest
/// topological units that still satisfy the request.
pub fn take_by_topology(
    topology: &CpuTopology,
    available: &CpuSet,
    num_cpus: usize,
) -> Result<CpuSet, AllocationError> {
    let mut accumulator = CpuAccumulator::new(topology, available, num_cpus);
    accumulator.take_full_sockets();
    accumulator.take_full_cores();
    accumulator.take_remaining_cpus();
    accumulator.finish()
}

struct CpuAccumulator<'a> {
    topology: &'a CpuTopology,
    /// Details restricted to CPUs still available for this allocation.
    details: CpuDetails,
    num_needed: usize,
    initial_pool: usize,
    result: CpuSet,
}

impl<'a> CpuAccumulator<'a> {
    fn new(topology: &'a CpuTopology, available: &CpuSet, num_cpus: usize) -> Self {
        Self {
            topology,
            details: topology.cpu_details.keep_only(available),
            num_needed: num_cpus,
            initial_pool: available.size(),
            result: CpuSet::new(),
        }
    }

    fn take(&mut self, cpus: &CpuSet) {
        self.result = self.result.union(cpus);
        let remaining = self.details.cpus().difference(cpus);
        self.details = self.details.keep_only(&remaining);
        self.num_needed -= cpus.size();
    }

    fn free_cpus_in_socket(&self, socket: usize) -> usize {
        self.details.cpus_in_sockets(&[socket]).size()
    }

    /// Step 1: whole sockets, lowest socket id first.
    fn take_full_sockets(&mut self) {
        while self.num_needed >= self.topology.cpus_per_socket() {
            let free_socket = self
                .details
                .sockets()
                .into_iter()
                .find(|socket| self.free_cpus_in_socket(*socket) == self.topology.cpus_per_socket());
            match free_socket {
                Some(socket) => {
                    let cpus = self.details.cpus_in_sockets(&[socket]);
                    self.take(&cpus);
                }
                None => break,
            }
        }
    }

    /// Step 2: whole cores, preferring the core whose socket has the most
    /// free CPUs; ties go to the lowest socket id, then the lowest core id.
    fn take_full_cores(&mut self) {
        while self.num_needed >= self.topology.cpus_per_core() {
            let mut free_cores: Vec<(usize, usize)> = self
                .details
                .cores()
                .into_iter()
                .filter_map(|core| {
                    let cpus = self.details.cpus_in_cores(&[core]);
                    if cpus.size() != self.topology.cpus_per_core() {
                        return None;
                    }
                    let socket = self.socket_of_core(core);
                    Some((core, socket))
                })
                .collect();
            if free_cores.is_empty() {
                break;
            }

            free_cores.sort_by_key(|(core, socket)| {
                (
                    std::cmp::Reverse(self.free_cpus_in_socket(*socket)),
                    *socket,
                    *core,
                )
            });
            let (core, _) = free_cores[0];
            let cpus = self.details.cpus_in_cores(&[core]);
            self.take(&cpus);
        }
    }

    /// Step 3: single CPUs. Candidates sort by free CPUs in their socket
    /// (descending), then free CPUs in their core (descending), then socket
    /// id, core id and CPU id ascending.
    fn take_remaining_cpus(&mut self) {
        while self.num_needed > 0 {
            let mut candidates: Vec<(usize, usize, usize)> = self
                .details
                .cpus()
                .iter()
                .map(|cpu| {
                    let info = self
                        .details
                        .info(cpu)
                        .expect("available CPU must have details");
                    (cpu, info.socket_id, info.core_id)
                })
                .collect();
            if candidates.is_empty() {
                break;
            }

            candidates.sort_by_key(|(cpu, socket, core)| {
                (
                    std::cmp::Reverse(self.free_cpus_in_socket(*socket)),
                    std::cmp::Reverse(self.details.cpus_in_cores(&[*core]).size()),
                    *socket,
                    *core,
                    *cpu,
                )
            });
            let (cpu, _, _) = candidates[0];
            self.take(&[cpu].into_iter().collect());
        }
    }

    fn socket_of_core(&self, core: usize) -> usize {
        self.details
            .cpus_in_cores(&[core])
            .iter()
            .next()
            .and_then(|cpu| self.details.info(cpu))
            .map(|info| info.socket_id)
            .expect("free core must have at least one CPU")
    }

    fn finish(self) -> Result<CpuSet, AllocationError> {
        if self.num_needed > 0 {
            return Err(AllocationError {
                requested: self.num_needed + self.result.size(),
                available: self.initial_pool,
            });
        }
        Ok(self.result)
    }
}
