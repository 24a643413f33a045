use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Per-agent committed load.
///
/// `commit` is serialized under one mutex so concurrent routing (across
/// batches) can never double-spend capacity; `snapshot` hands out a
/// consistent copy for lowest-load selection. Routing within one batch is
/// single-threaded by design, the ledger is the only cross-batch shared
/// mutable state.
#[derive(Debug, Default)]
pub struct LoadLedger {
    loads: Mutex<HashMap<String, u32>>,
}

impl LoadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with pre-existing loads (e.g. agents carrying work from an
    /// earlier batch).
    pub fn with_loads(loads: HashMap<String, u32>) -> Self {
        Self {
            loads: Mutex::new(loads),
        }
    }

    /// Consistent copy of every agent's committed load.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.loads.lock().expect("ledger lock poisoned").clone()
    }

    /// Add `delta` to an agent's committed load, returning the new value.
    pub fn commit(&self, agent_id: &str, delta: u32) -> u32 {
        let mut loads = self.loads.lock().expect("ledger lock poisoned");
        let load = loads.entry(agent_id.to_string()).or_insert(0);
        *load += delta;
        debug!(agent = agent_id, load = *load, "load committed");
        *load
    }

    pub fn load_of(&self, agent_id: &str) -> u32 {
        self.loads
            .lock()
            .expect("ledger lock poisoned")
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }

    /// Sum of all committed loads.
    pub fn total(&self) -> u32 {
        self.loads
            .lock()
            .expect("ledger lock poisoned")
            .values()
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn commit_accumulates() {
        let ledger = LoadLedger::new();
        assert_eq!(ledger.commit("a-1", 1), 1);
        assert_eq!(ledger.commit("a-1", 2), 3);
        assert_eq!(ledger.load_of("a-1"), 3);
        assert_eq!(ledger.load_of("a-2"), 0);
        assert_eq!(ledger.total(), 3);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let ledger = LoadLedger::new();
        ledger.commit("a-1", 1);
        let snap = ledger.snapshot();
        ledger.commit("a-1", 1);
        assert_eq!(snap["a-1"], 1);
        assert_eq!(ledger.load_of("a-1"), 2);
    }

    #[test]
    fn seeded_loads_survive() {
        let ledger =
            LoadLedger::with_loads(HashMap::from([("a-1".to_string(), 4u32)]));
        assert_eq!(ledger.load_of("a-1"), 4);
        assert_eq!(ledger.commit("a-1", 1), 5);
    }

    #[test]
    fn concurrent_commits_are_all_counted() {
        let ledger = Arc::new(LoadLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ledger.commit("shared", 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.load_of("shared"), 800);
    }
}
