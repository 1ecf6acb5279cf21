//! Durable, checkpointed state store
//!
//! Persists the policy name, the default CPU set and all exclusive
//! assignments as a checksummed JSON document. Every mutation re-writes the
//! file through a temp-file rename, so readers never observe a torn
//! document and a successful mutating call implies durability.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::cpuset::CpuSet;

use super::CpuAssignments;
use super::MemoryState;
use super::Reader;
use super::State;

/// File name of the checkpoint within the state directory.
pub const CPU_MANAGER_STATE_FILE: &str = "cpu_manager_state";

const CHECKPOINT_VERSION: &str = "v1";

/// Errors surfaced by the checkpointed store. Corruption and policy
/// mismatch are unrecoverable without operator intervention, so their
/// messages carry the remediation directive verbatim.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read CPU manager checkpoint")]
    Read,

    #[error("failed to write CPU manager checkpoint")]
    Write,

    #[error(
        "CPU manager checkpoint is corrupt: {reason}; \
         drain the node and remove the CPU manager state file, then restart"
    )]
    Corrupt { reason: String },

    #[error(
        "CPU manager checkpoint was written by policy \"{persisted}\" but policy \
         \"{configured}\" is configured; \
         drain the node and remove the CPU manager state file, then restart"
    )]
    PolicyMismatch {
        configured: String,
        persisted: String,
    },
}

/// On-disk document. `entries` maps pod UID → container name → cpuset list
/// string; `checksum` is the IEEE CRC32 of the document serialized with the
/// checksum field zeroed.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDocument {
    version: String,
    policy_name: String,
    default_cpu_set: String,
    entries: BTreeMap<String, BTreeMap<String, String>>,
    checksum: u32,
}

impl CheckpointDocument {
    fn compute_checksum(&mut self) -> error_stack::Result<u32, CheckpointError> {
        let previous = std::mem::take(&mut self.checksum);
        let bytes = serde_json::to_vec(self).change_context(CheckpointError::Write)?;
        self.checksum = previous;
        Ok(crc32(&bytes))
    }
}

/// CRC32 (IEEE polynomial, reflected) over a byte slice.
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in bytes {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// State store backed by a checkpoint file.
#[derive(Debug)]
pub struct CheckpointState {
    memory: MemoryState,
    path: PathBuf,
    policy_name: String,
}

impl CheckpointState {
    /// Open or create the checkpoint under `state_dir`. An existing
    /// checkpoint must verify its checksum and carry the configured policy
    /// name; a missing file yields empty state and an initial flush.
    pub fn new(
        state_dir: &Path,
        file_name: &str,
        policy_name: &str,
    ) -> error_stack::Result<Self, CheckpointError> {
        let mut state = Self {
            memory: MemoryState::new(),
            path: state_dir.join(file_name),
            policy_name: policy_name.to_string(),
        };

        if state.path.exists() {
            state.restore()?;
            info!(
                path = %state.path.display(),
                policy = policy_name,
                "restored CPU manager state from checkpoint"
            );
        } else {
            state.flush()?;
            info!(
                path = %state.path.display(),
                policy = policy_name,
                "initialized new CPU manager state checkpoint"
            );
        }
        Ok(state)
    }

    fn restore(&mut self) -> error_stack::Result<(), CheckpointError> {
        let bytes = fs::read(&self.path).change_context(CheckpointError::Read)?;

        let mut document: CheckpointDocument = serde_json::from_slice(&bytes)
            .change_context(CheckpointError::Corrupt {
                reason: "not a valid checkpoint document".to_string(),
            })?;

        if document.version != CHECKPOINT_VERSION {
            return Err(Report::new(CheckpointError::Corrupt {
                reason: format!(
                    "unsupported checkpoint version \"{}\", expected \"{CHECKPOINT_VERSION}\"",
                    document.version
                ),
            }));
        }

        let stored = document.checksum;
        let computed = document.compute_checksum()?;
        if stored != computed {
            return Err(Report::new(CheckpointError::Corrupt {
                reason: format!("checksum mismatch, stored {stored}, computed {computed}"),
            }));
        }

        if document.policy_name != self.policy_name {
            return Err(Report::new(CheckpointError::PolicyMismatch {
                configured: self.policy_name.clone(),
                persisted: document.policy_name,
            }));
        }

        let parse_set = |value: &str| {
            CpuSet::parse(value).map_err(|err| {
                Report::new(CheckpointError::Corrupt {
                    reason: err.to_string(),
                })
            })
        };

        let default_cpu_set = parse_set(&document.default_cpu_set)?;
        let mut assignments = CpuAssignments::new();
        for (pod_uid, containers) in &document.entries {
            let entry = assignments.entry(pod_uid.clone()).or_default();
            for (container_name, cpus) in containers {
                entry.insert(container_name.clone(), parse_set(cpus)?);
            }
        }

        self.memory.replace(default_cpu_set, assignments);
        Ok(())
    }

    /// Serialize the current state and atomically replace the file.
    fn flush(&self) -> error_stack::Result<(), CheckpointError> {
        let mut entries: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (pod_uid, containers) in self.memory.cpu_assignments() {
            let entry = entries.entry(pod_uid).or_default();
            for (container_name, cpus) in containers {
                entry.insert(container_name, cpus.to_string());
            }
        }

        let mut document = CheckpointDocument {
            version: CHECKPOINT_VERSION.to_string(),
            policy_name: self.policy_name.clone(),
            default_cpu_set: self.memory.default_cpu_set().to_string(),
            entries,
            checksum: 0,
        };
        document.checksum = document.compute_checksum()?;

        let bytes = serde_json::to_vec(&document).change_context(CheckpointError::Write)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes).change_context(CheckpointError::Write)?;
        fs::rename(&tmp_path, &self.path).change_context(CheckpointError::Write)?;

        debug!(path = %self.path.display(), "flushed CPU manager state checkpoint");
        Ok(())
    }
}

impl Reader for CheckpointState {
    fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.memory.cpu_set(pod_uid, container_name)
    }

    fn default_cpu_set(&self) -> CpuSet {
        self.memory.default_cpu_set()
    }

    fn cpu_assignments(&self) -> CpuAssignments {
        self.memory.cpu_assignments()
    }
}

impl State for CheckpointState {
    fn set_cpu_set(
        &mut self,
        pod_uid: &str,
        container_name: &str,
        cpus: CpuSet,
    ) -> error_stack::Result<(), CheckpointError> {
        self.memory.set_cpu_set(pod_uid, container_name, cpus)?;
        self.flush()
    }

    fn set_default_cpu_set(&mut self, cpus: CpuSet) -> error_stack::Result<(), CheckpointError> {
        self.memory.set_default_cpu_set(cpus)?;
        self.flush()
    }

    fn delete(
        &mut self,
        pod_uid: &str,
        container_name: &str,
    ) -> error_stack::Result<(), CheckpointError> {
        self.memory.delete(pod_uid, container_name)?;
        self.flush()
    }

    fn clear_state(&mut self) -> error_stack::Result<(), CheckpointError> {
        self.memory.clear_state()?;
        self.flush()
    }
}
