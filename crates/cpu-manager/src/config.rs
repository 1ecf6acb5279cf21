//! CPU manager configuration
//!
//! Command-line / environment configuration in the node agent's style, and
//! the factory that turns validated configuration plus a machine snapshot
//! into a [`CpuManager`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api_types::Quantity;
use clap::Parser;

use crate::cpuset::CpuSet;
use crate::manager::CpuManager;
use crate::manager::CpuManagerError;
use crate::policy::NonePolicy;
use crate::policy::Policy;
use crate::policy::PolicyError;
use crate::policy::StaticPolicy;
use crate::policy::POLICY_NONE;
use crate::policy::POLICY_STATIC;
use crate::topology::CpuTopology;
use crate::topology::MachineInfo;

#[derive(Parser, Clone, Debug)]
pub struct CpuManagerArgs {
    #[arg(
        long,
        env = "CPU_MANAGER_POLICY",
        default_value = "none",
        help = "CPU manager policy, either 'none' or 'static'"
    )]
    pub cpu_manager_policy: String,

    #[arg(
        long,
        env = "CPU_MANAGER_RECONCILE_PERIOD_SECS",
        default_value = "10",
        help = "Seconds between reconciliation passes against the container runtime"
    )]
    pub cpu_manager_reconcile_period_secs: u64,

    #[arg(
        long,
        env = "CPU_MANAGER_RESERVED_CPUS",
        default_value = "0",
        help = "CPU quantity reserved for system overhead, e.g. '500m' or '1'; \
                must be nonzero under the static policy"
    )]
    pub reserved_cpus: String,

    #[arg(
        long,
        env = "CPU_MANAGER_RESERVED_CPU_SET",
        help = "Explicit reserved CPU set in cpuset list form, e.g. '0-1'; \
                derived from the topology when unset"
    )]
    pub reserved_cpu_set: Option<String>,

    #[arg(
        long,
        env = "CPU_MANAGER_STATE_DIR",
        default_value = "/var/lib/cpu-manager",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the CPU manager state checkpoint"
    )]
    pub state_dir: PathBuf,
}

/// Validated manager configuration.
#[derive(Debug, Clone)]
pub struct CpuManagerConfig {
    pub policy_name: String,
    pub reconcile_period: Duration,
    /// Reserved CPU quantity from the node allocatable reservation.
    pub reserved_cpus: Quantity,
    /// Explicit reserved set; derived from the topology when absent.
    pub reserved_cpu_set: Option<CpuSet>,
    pub state_file_directory: PathBuf,
}

impl CpuManagerArgs {
    pub fn into_config(self) -> Result<CpuManagerConfig, CpuManagerError> {
        let reserved_cpus = Quantity::parse(&self.reserved_cpus).map_err(|_| {
            CpuManagerError::InvalidReservedQuantity {
                value: self.reserved_cpus.clone(),
            }
        })?;

        let reserved_cpu_set = self
            .reserved_cpu_set
            .map(|value| {
                CpuSet::parse(&value).map_err(|err| {
                    PolicyError::InvalidReservedSet {
                        reason: err.to_string(),
                    }
                })
            })
            .transpose()?;

        Ok(CpuManagerConfig {
            policy_name: self.cpu_manager_policy,
            reconcile_period: Duration::from_secs(self.cpu_manager_reconcile_period_secs),
            reserved_cpus,
            reserved_cpu_set,
            state_file_directory: self.state_dir,
        })
    }
}

/// Build a manager from configuration and a machine snapshot.
///
/// Topology discovery runs once for either policy. Under the static policy
/// the reserved CPU count is the ceiling of the reserved quantity, since
/// fractional CPUs cannot be excluded from exclusive allocation.
pub fn new_manager(
    config: &CpuManagerConfig,
    machine: &MachineInfo,
) -> Result<CpuManager, CpuManagerError> {
    let topology = Arc::new(CpuTopology::discover(machine)?);

    let policy = match config.policy_name.as_str() {
        POLICY_NONE => Policy::None(NonePolicy::new(topology.all_cpus())),
        POLICY_STATIC => {
            if config.reserved_cpus.milli_value() <= 0 {
                // A zero reservation would let exclusive allocations drain
                // the shared pool completely.
                return Err(CpuManagerError::MissingReservedCpus);
            }
            let num_reserved = (config.reserved_cpus.milli_value() as u64).div_ceil(1000) as usize;
            Policy::Static(StaticPolicy::new(
                topology,
                num_reserved,
                config.reserved_cpu_set.clone(),
            )?)
        }
        other => {
            return Err(CpuManagerError::UnknownPolicy {
                name: other.to_string(),
            })
        }
    };

    Ok(CpuManager::new(
        policy,
        config.reconcile_period,
        config.state_file_directory.clone(),
    ))
}
