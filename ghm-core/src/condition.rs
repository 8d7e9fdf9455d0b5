//! Health conditions and snapshot diffing
//!
//! A [`HealthCondition`] is one raw health signal for one device, produced
//! fresh by every poll. Conditions are identified across polls by their
//! [`ConditionKey`] (device + error code); [`ConditionDiff`] turns two
//! successive snapshots into NEW / ONGOING / CLEARED sets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device id used for node-level conditions that are not tied to a single GPU
pub const NODE_DEVICE_ID: &str = "node";

/// Identity of a condition across polls
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConditionKey {
    /// Device the condition was raised for
    pub device_id: String,
    /// Raw diagnostic code
    pub error_code: String,
}

impl ConditionKey {
    pub fn new(device_id: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            error_code: error_code.into(),
        }
    }
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.error_code)
    }
}

/// A single raw health signal reported by the diagnostic source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCondition {
    /// Device id (GPU index, or [`NODE_DEVICE_ID`])
    pub device_id: String,
    /// Raw diagnostic code
    pub error_code: String,
    /// Health-watch group that raised the condition (PCIE, NVLINK, XID, ...)
    pub system: String,
    /// Message as reported by the source
    pub raw_message: String,
    /// Device serial number, when the source knows it
    pub serial: Option<String>,
    /// When this snapshot was taken
    pub observed_at: DateTime<Utc>,
    /// Node the condition was observed on
    pub node_name: String,
}

impl HealthCondition {
    /// Create a condition observed now
    pub fn new(
        node_name: impl Into<String>,
        device_id: impl Into<String>,
        error_code: impl Into<String>,
        system: impl Into<String>,
        raw_message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            error_code: error_code.into(),
            system: system.into(),
            raw_message: raw_message.into(),
            serial: None,
            observed_at: Utc::now(),
            node_name: node_name.into(),
        }
    }

    /// Attach a device serial number
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn key(&self) -> ConditionKey {
        ConditionKey::new(self.device_id.clone(), self.error_code.clone())
    }
}

/// Lifecycle of a tracked condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// First observation of the condition
    New,
    /// Condition still present since an earlier poll
    Ongoing,
    /// Condition no longer reported
    Cleared,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::New => "NEW",
            LifecycleState::Ongoing => "ONGOING",
            LifecycleState::Cleared => "CLEARED",
        }
    }

    /// Whether the condition is still being reported
    pub fn is_active(&self) -> bool {
        !matches!(self, LifecycleState::Cleared)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Difference between the previous and the current snapshot
#[derive(Debug, Default, Clone)]
pub struct ConditionDiff {
    /// current − previous
    pub new: Vec<HealthCondition>,
    /// current ∩ previous
    pub ongoing: Vec<HealthCondition>,
    /// previous − current (last observed data, stamped with the time the
    /// clear was observed)
    pub cleared: Vec<HealthCondition>,
}

impl ConditionDiff {
    /// Diff `current` against the previous tick's conditions.
    ///
    /// Duplicate keys in `current` collapse to the last occurrence. Output
    /// order is deterministic (sorted by key).
    pub fn compute(
        previous: &HashMap<ConditionKey, HealthCondition>,
        current: &[HealthCondition],
    ) -> Self {
        let current: BTreeMap<ConditionKey, &HealthCondition> =
            current.iter().map(|c| (c.key(), c)).collect();

        let mut diff = ConditionDiff::default();
        for (key, condition) in &current {
            if previous.contains_key(key) {
                diff.ongoing.push((*condition).clone());
            } else {
                diff.new.push((*condition).clone());
            }
        }

        let mut cleared: Vec<&HealthCondition> = previous
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .map(|(_, condition)| condition)
            .collect();
        cleared.sort_by_key(|c| c.key());
        let cleared_at = Utc::now();
        diff.cleared = cleared
            .into_iter()
            .map(|c| HealthCondition {
                observed_at: cleared_at,
                ..c.clone()
            })
            .collect();

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.ongoing.is_empty() && self.cleared.is_empty()
    }

    pub fn len(&self) -> usize {
        self.new.len() + self.ongoing.len() + self.cleared.len()
    }

    /// Flatten into `(condition, transition)` pairs, new first, cleared last
    pub fn into_transitions(self) -> Vec<(HealthCondition, LifecycleState)> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.new.into_iter().map(|c| (c, LifecycleState::New)));
        out.extend(self.ongoing.into_iter().map(|c| (c, LifecycleState::Ongoing)));
        out.extend(self.cleared.into_iter().map(|c| (c, LifecycleState::Cleared)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(device: &str, code: &str) -> HealthCondition {
        HealthCondition::new("node-a", device, code, "PCIE", "test")
    }

    fn index(conditions: &[HealthCondition]) -> HashMap<ConditionKey, HealthCondition> {
        conditions.iter().map(|c| (c.key(), c.clone())).collect()
    }

    #[test]
    fn test_key_display() {
        assert_eq!(condition("0", "DCGM_FR_PCI_REPLAY_RATE").key().to_string(), "0/DCGM_FR_PCI_REPLAY_RATE");
    }

    #[test]
    fn test_diff_partitions_snapshot() {
        let previous = index(&[condition("0", "A"), condition("1", "B")]);
        let current = vec![condition("1", "B"), condition("2", "C")];

        let diff = ConditionDiff::compute(&previous, &current);

        assert_eq!(diff.new.len(), 1);
        assert_eq!(diff.new[0].key(), ConditionKey::new("2", "C"));
        assert_eq!(diff.ongoing.len(), 1);
        assert_eq!(diff.ongoing[0].key(), ConditionKey::new("1", "B"));
        assert_eq!(diff.cleared.len(), 1);
        assert_eq!(diff.cleared[0].key(), ConditionKey::new("0", "A"));
    }

    #[test]
    fn test_same_code_on_different_devices_is_distinct() {
        let previous = index(&[condition("0", "A")]);
        let diff = ConditionDiff::compute(&previous, &[condition("1", "A")]);

        assert_eq!(diff.new.len(), 1);
        assert_eq!(diff.cleared.len(), 1);
        assert!(diff.ongoing.is_empty());
    }

    #[test]
    fn test_duplicate_keys_collapse() {
        let mut second = condition("0", "A");
        second.raw_message = "latest".to_string();
        let diff = ConditionDiff::compute(&HashMap::new(), &[condition("0", "A"), second]);

        assert_eq!(diff.new.len(), 1);
        assert_eq!(diff.new[0].raw_message, "latest");
    }

    #[test]
    fn test_into_transitions_order() {
        let previous = index(&[condition("0", "A"), condition("1", "B")]);
        let diff = ConditionDiff::compute(&previous, &[condition("1", "B"), condition("2", "C")]);

        let states: Vec<LifecycleState> = diff.into_transitions().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            vec![LifecycleState::New, LifecycleState::Ongoing, LifecycleState::Cleared]
        );
    }

    #[test]
    fn test_cleared_stamped_at_clear_time() {
        let mut stale = condition("0", "A");
        stale.observed_at = Utc::now() - chrono::Duration::days(3);
        let before = Utc::now();

        let diff = ConditionDiff::compute(&index(&[stale.clone()]), &[]);
        assert_eq!(diff.cleared.len(), 1);
        assert!(diff.cleared[0].observed_at >= before);
        assert_eq!(diff.cleared[0].raw_message, stale.raw_message);
    }

    #[test]
    fn test_lifecycle_serde_names() {
        assert_eq!(serde_json::to_string(&LifecycleState::Ongoing).unwrap(), "\"ONGOING\"");
        assert_eq!(LifecycleState::Cleared.to_string(), "CLEARED");
        assert!(!LifecycleState::Cleared.is_active());
    }
}
