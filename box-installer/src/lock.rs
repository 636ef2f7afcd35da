//! Per-box single flight for install requests.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

type BoxKey = (String, String);

/// Set of boxes with an install in flight.
#[derive(Clone, Default)]
pub struct InstallLocks {
    held: Arc<Mutex<HashSet<BoxKey>>>,
}

impl InstallLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the box, or `None` if another install holds it. The claim is
    /// released when the permit is dropped.
    pub fn try_acquire(&self, cell: &str, box_name: &str) -> Option<InstallPermit> {
        let key = (cell.to_string(), box_name.to_string());
        if !self.held.lock().insert(key.clone()) {
            return None;
        }
        Some(InstallPermit {
            held: self.held.clone(),
            key,
        })
    }

    pub fn is_held(&self, cell: &str, box_name: &str) -> bool {
        self.held
            .lock()
            .contains(&(cell.to_string(), box_name.to_string()))
    }
}

pub struct InstallPermit {
    held: Arc<Mutex<HashSet<BoxKey>>>,
    key: BoxKey,
}

impl Drop for InstallPermit {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permit_released_on_drop() {
        let locks = InstallLocks::new();
        let permit = locks.try_acquire("cell1", "box1").unwrap();
        assert!(locks.try_acquire("cell1", "box1").is_none());
        assert!(locks.try_acquire("cell1", "box2").is_some());
        assert!(locks.is_held("cell1", "box1"));
        drop(permit);
        assert!(!locks.is_held("cell1", "box1"));
        assert!(locks.try_acquire("cell1", "box1").is_some());
    }
}
