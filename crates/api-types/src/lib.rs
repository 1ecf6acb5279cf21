//! Shared pod and container type definitions
//!
//! This crate contains the node-local view of pods and containers consumed
//! by the CPU manager: resource quantities, QoS classification, and the
//! status types that carry runtime container IDs.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Resource name for CPU requests and limits.
pub const RESOURCE_CPU: &str = "cpu";

/// Resource name for memory requests and limits.
pub const RESOURCE_MEMORY: &str = "memory";

/// Resources that participate in QoS classification.
const QOS_RESOURCES: [&str; 2] = [RESOURCE_CPU, RESOURCE_MEMORY];

/// Errors produced while parsing quantities or container IDs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid quantity: {value}")]
    InvalidQuantity { value: String },

    #[error("invalid container ID, expected <scheme>://<id>: {value}")]
    InvalidContainerId { value: String },
}

/// A resource quantity held in milli-units.
///
/// CPU quantities accept the forms `2`, `2.5` and `500m`; one CPU equals
/// 1000 milli-units. Memory quantities are carried verbatim in milli-bytes,
/// which is lossless for the integral byte counts pods actually declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Quantity(i64);

impl Quantity {
    pub const fn from_milli(milli: i64) -> Self {
        Self(milli)
    }

    pub const fn from_whole(units: i64) -> Self {
        Self(units * 1000)
    }

    pub const fn milli_value(&self) -> i64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Whether this quantity is a positive whole number of units.
    pub const fn is_whole_units(&self) -> bool {
        self.0 > 0 && self.0 % 1000 == 0
    }

    /// The whole number of units, truncating any milli remainder.
    pub const fn whole_units(&self) -> i64 {
        self.0 / 1000
    }

    /// Parse a quantity string such as `2`, `2.5` or `500m`.
    pub fn parse(value: &str) -> Result<Self, ParseError> {
        let value = value.trim();
        let invalid = || ParseError::InvalidQuantity {
            value: value.to_string(),
        };

        if let Some(milli) = value.strip_suffix('m') {
            let milli: i64 = milli.parse().map_err(|_| invalid())?;
            return Ok(Self(milli));
        }

        if let Ok(units) = value.parse::<i64>() {
            return Ok(Self(units * 1000));
        }

        let fractional: f64 = value.parse().map_err(|_| invalid())?;
        if !fractional.is_finite() || fractional < 0.0 {
            return Err(invalid());
        }
        Ok(Self((fractional * 1000.0).round() as i64))
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

/// Named resource quantities, e.g. `cpu: 500m`.
pub type ResourceList = BTreeMap<String, Quantity>;

/// Requests and limits declared by a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub requests: ResourceList,
    pub limits: ResourceList,
}

/// A single container within a pod spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub resources: ResourceRequirements,
}

/// Pod spec restricted to what the CPU manager consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    /// Init containers run to completion, in order, before app containers.
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
}

/// A pod as seen by the node agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    /// Cluster-unique pod UID.
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub spec: PodSpec,
    /// Set once the pod has been marked for deletion.
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Pod {
    /// All containers of the pod, init containers first.
    pub fn all_containers(&self) -> impl Iterator<Item = &Container> {
        self.spec
            .init_containers
            .iter()
            .chain(self.spec.containers.iter())
    }
}

/// Pod quality-of-service class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl std::fmt::Display for QosClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Derive the QoS class of a pod from its containers' requests and limits.
///
/// A pod is Guaranteed when every container sets limits for both CPU and
/// memory and every request equals its limit; BestEffort when no container
/// declares any request or limit; Burstable otherwise.
pub fn qos_class(pod: &Pod) -> QosClass {
    let mut requests: ResourceList = BTreeMap::new();
    let mut limits: ResourceList = BTreeMap::new();
    let mut is_guaranteed = true;

    for container in pod.all_containers() {
        for (name, quantity) in &container.resources.requests {
            if QOS_RESOURCES.contains(&name.as_str()) && !quantity.is_zero() {
                let entry = requests.entry(name.clone()).or_default();
                *entry = Quantity::from_milli(entry.milli_value() + quantity.milli_value());
            }
        }

        let mut qos_limits_found = 0usize;
        for (name, quantity) in &container.resources.limits {
            if QOS_RESOURCES.contains(&name.as_str()) && !quantity.is_zero() {
                qos_limits_found += 1;
                let entry = limits.entry(name.clone()).or_default();
                *entry = Quantity::from_milli(entry.milli_value() + quantity.milli_value());
            }
        }
        if qos_limits_found != QOS_RESOURCES.len() {
            is_guaranteed = false;
        }
    }

    if requests.is_empty() && limits.is_empty() {
        return QosClass::BestEffort;
    }

    if is_guaranteed {
        for (name, request) in &requests {
            match limits.get(name) {
                Some(limit) if limit == request => {}
                _ => {
                    is_guaranteed = false;
                    break;
                }
            }
        }
    }

    if is_guaranteed {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}

/// Pod lifecycle phase reported in status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Status of a single container, carrying the runtime-assigned ID in
/// `<scheme>://<id>` form (empty until the container is created).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub container_id: String,
}

/// Pod status restricted to what reconciliation consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub init_container_statuses: Vec<ContainerStatus>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl Default for PodStatus {
    fn default() -> Self {
        Self {
            phase: PodPhase::Pending,
            init_container_statuses: Vec::new(),
            container_statuses: Vec::new(),
        }
    }
}

impl PodStatus {
    /// Find the raw `<scheme>://<id>` value for a named container, searching
    /// init container statuses first. Empty IDs are treated as absent.
    pub fn raw_container_id(&self, name: &str) -> Option<&str> {
        self.init_container_statuses
            .iter()
            .chain(self.container_statuses.iter())
            .find(|status| status.name == name && !status.container_id.is_empty())
            .map(|status| status.container_id.as_str())
    }
}

/// A parsed runtime container ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerId {
    /// Runtime scheme, e.g. `containerd`.
    pub scheme: String,
    /// Runtime-local container ID.
    pub id: String,
}

impl ContainerId {
    /// Parse the `<scheme>://<id>` form found in container statuses.
    pub fn parse(value: &str) -> Result<Self, ParseError> {
        match value.split_once("://") {
            Some((scheme, id)) if !scheme.is_empty() && !id.is_empty() => Ok(Self {
                scheme: scheme.to_string(),
                id: id.to_string(),
            }),
            _ => Err(ParseError::InvalidContainerId {
                value: value.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_with(requests: &[(&str, &str)], limits: &[(&str, &str)]) -> Container {
        let to_list = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(name, value)| (name.to_string(), Quantity::parse(value).unwrap()))
                .collect::<ResourceList>()
        };
        Container {
            name: "main".to_string(),
            resources: ResourceRequirements {
                requests: to_list(requests),
                limits: to_list(limits),
            },
        }
    }

    fn pod_with(containers: Vec<Container>) -> Pod {
        Pod {
            uid: "uid-1".to_string(),
            name: "pod-1".to_string(),
            namespace: "default".to_string(),
            spec: PodSpec {
                init_containers: Vec::new(),
                containers,
            },
            deletion_timestamp: None,
        }
    }

    #[test]
    fn quantity_parse_whole_and_milli() {
        assert_eq!(Quantity::parse("2").unwrap().milli_value(), 2000);
        assert_eq!(Quantity::parse("500m").unwrap().milli_value(), 500);
        assert_eq!(Quantity::parse("2.5").unwrap().milli_value(), 2500);
        assert!(Quantity::parse("two").is_err());
    }

    #[test]
    fn quantity_whole_units() {
        assert!(Quantity::parse("4").unwrap().is_whole_units());
        assert!(!Quantity::parse("1500m").unwrap().is_whole_units());
        assert!(!Quantity::parse("0").unwrap().is_whole_units());
        assert_eq!(Quantity::parse("4").unwrap().whole_units(), 4);
    }

    #[test]
    fn quantity_display_round_trips() {
        for value in ["2", "500m", "1500m"] {
            let quantity = Quantity::parse(value).unwrap();
            assert_eq!(Quantity::parse(&quantity.to_string()).unwrap(), quantity);
        }
    }

    #[test]
    fn qos_guaranteed_when_requests_equal_limits() {
        let pod = pod_with(vec![container_with(
            &[("cpu", "2"), ("memory", "100")],
            &[("cpu", "2"), ("memory", "100")],
        )]);
        assert_eq!(qos_class(&pod), QosClass::Guaranteed);
    }

    #[test]
    fn qos_burstable_on_partial_limits() {
        let pod = pod_with(vec![container_with(&[("cpu", "500m")], &[("cpu", "1")])]);
        assert_eq!(qos_class(&pod), QosClass::Burstable);
    }

    #[test]
    fn qos_best_effort_without_resources() {
        let pod = pod_with(vec![container_with(&[], &[])]);
        assert_eq!(qos_class(&pod), QosClass::BestEffort);
    }

    #[test]
    fn qos_considers_init_containers() {
        let mut pod = pod_with(vec![container_with(
            &[("cpu", "1"), ("memory", "100")],
            &[("cpu", "1"), ("memory", "100")],
        )]);
        pod.spec.init_containers = vec![container_with(&[("cpu", "500m")], &[])];
        assert_eq!(qos_class(&pod), QosClass::Burstable);
    }

    #[test]
    fn container_id_parse() {
        let id = ContainerId::parse("containerd://abc123").unwrap();
        assert_eq!(id.scheme, "containerd");
        assert_eq!(id.id, "abc123");
        assert_eq!(id.to_string(), "containerd://abc123");

        assert!(ContainerId::parse("abc123").is_err());
        assert!(ContainerId::parse("://abc").is_err());
        assert!(ContainerId::parse("docker://").is_err());
    }

    #[test]
    fn raw_container_id_skips_empty() {
        let status = PodStatus {
            phase: PodPhase::Running,
            init_container_statuses: vec![ContainerStatus {
                name: "init".to_string(),
                container_id: String::new(),
            }],
            container_statuses: vec![ContainerStatus {
                name: "main".to_string(),
                container_id: "containerd://abc".to_string(),
            }],
        };
        assert_eq!(status.raw_container_id("main"), Some("containerd://abc"));
        assert_eq!(status.raw_container_id("init"), None);
        assert_eq!(status.raw_container_id("missing"), None);
    }
}
