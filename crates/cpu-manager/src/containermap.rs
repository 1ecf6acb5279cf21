//! Container index
//!
//! Bidirectional map between runtime container IDs and the
//! (pod UID, container name) pairs the policy tracks. The manager keeps it
//! consistent with the assignment state: every assigned pair has at most one
//! container ID, and removing the pair removes the index entry.

use std::collections::HashMap;

/// Bidirectional containerID ↔ (podUID, containerName) index.
#[derive(Debug, Clone, Default)]
pub struct ContainerMap {
    by_id: HashMap<String, (String, String)>,
    by_ref: HashMap<(String, String), String>,
}

impl ContainerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a container. A pair can only map to one container ID, so any
    /// previous entry for either key is displaced first.
    pub fn add(&mut self, pod_uid: &str, container_name: &str, container_id: &str) {
        self.remove_by_container_id(container_id);
        self.remove_by_container_ref(pod_uid, container_name);
        self.by_id.insert(
            container_id.to_string(),
            (pod_uid.to_string(), container_name.to_string()),
        );
        self.by_ref.insert(
            (pod_uid.to_string(), container_name.to_string()),
            container_id.to_string(),
        );
    }

    pub fn remove_by_container_id(&mut self, container_id: &str) {
        if let Some(container_ref) = self.by_id.remove(container_id) {
            self.by_ref.remove(&container_ref);
        }
    }

    pub fn remove_by_container_ref(&mut self, pod_uid: &str, container_name: &str) {
        let key = (pod_uid.to_string(), container_name.to_string());
        if let Some(container_id) = self.by_ref.remove(&key) {
            self.by_id.remove(&container_id);
        }
    }

    /// Resolve a container ID to its (pod UID, container name) pair.
    pub fn container_ref(&self, container_id: &str) -> Option<(&str, &str)> {
        self.by_id
            .get(container_id)
            .map(|(pod_uid, container_name)| (pod_uid.as_str(), container_name.as_str()))
    }

    /// Resolve a (pod UID, container name) pair to its container ID.
    pub fn container_id(&self, pod_uid: &str, container_name: &str) -> Option<&str> {
        self.by_ref
            .get(&(pod_uid.to_string(), container_name.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
