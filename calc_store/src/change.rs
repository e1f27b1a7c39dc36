//! # Change Detection
//!
//! Decides whether a project state differs enough from the last observed
//! state to deserve a new checkpoint. States are compared by their
//! structural hash (canonical JSON digest), so key order and map
//! construction never register as changes.

use std::collections::HashMap;

use serde::Serialize;

use crate::errors::StoreResult;
use crate::integrity;

/// Last observed structural hash per project.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    hashes: HashMap<String, String>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        ChangeDetector::default()
    }

    /// `true` on first observation or when the hash differs from the last
    /// one recorded for `project_id`; the new hash is then recorded.
    pub fn has_significant_change<T: Serialize + ?Sized>(
        &mut self,
        project_id: &str,
        state: &T,
    ) -> StoreResult<bool> {
        let hash = integrity::checksum_of(state)?;
        match self.hashes.get(project_id) {
            Some(previous) if *previous == hash => Ok(false),
            _ => {
                self.hashes.insert(project_id.to_string(), hash);
                Ok(true)
            }
        }
    }

    /// Forget `project_id`; its next observation counts as the first.
    pub fn clear(&mut self, project_id: &str) {
        self.hashes.remove(project_id);
    }

    /// Number of projects currently tracked
    pub fn tracked(&self) -> usize {
        self.hashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_repeat_and_change() {
        let mut detector = ChangeDetector::new();
        let state = json!({"inputs": {"groundSnowLoad": 35}});

        assert!(detector.has_significant_change("p1", &state).unwrap());
        assert!(!detector.has_significant_change("p1", &state).unwrap());

        let changed = json!({"inputs": {"groundSnowLoad": 45}});
        assert!(detector.has_significant_change("p1", &changed).unwrap());
        assert!(!detector.has_significant_change("p1", &changed).unwrap());
    }

    #[test]
    fn test_projects_are_independent() {
        let mut detector = ChangeDetector::new();
        let state = json!({"span_ft": 12});

        assert!(detector.has_significant_change("p1", &state).unwrap());
        assert!(detector.has_significant_change("p2", &state).unwrap());
        assert!(!detector.has_significant_change("p1", &state).unwrap());
        assert_eq!(detector.tracked(), 2);
    }

    #[test]
    fn test_clear_resets_to_first_observation() {
        let mut detector = ChangeDetector::new();
        let state = json!({"span_ft": 12});

        assert!(detector.has_significant_change("p1", &state).unwrap());
        detector.clear("p1");
        assert_eq!(detector.tracked(), 0);
        assert!(detector.has_significant_change("p1", &state).unwrap());
    }
}
