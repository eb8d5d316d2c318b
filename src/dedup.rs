use std::collections::HashSet;
use std::sync::Mutex;

/// Process-local set of identifiers currently being fetched. A second queue
/// delivery for an in-flight identifier is dropped instead of re-hitting the
/// upstream. This only dedupes within one process; cross-process duplicates
/// are absorbed by idempotent writes.
#[derive(Debug, Default)]
pub struct DedupGuard {
    inflight: Mutex<HashSet<String>>,
}

impl DedupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the identifier is already in flight.
    pub fn begin(&self, id: &str) -> bool {
        self.inflight.lock().unwrap().insert(id.to_string())
    }

    pub fn finish(&self, id: &str) {
        self.inflight.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_while_in_flight() {
        let guard = DedupGuard::new();
        assert!(guard.begin("abc"));
        assert!(!guard.begin("abc"));
        guard.finish("abc");
        assert!(guard.begin("abc"));
    }

    #[test]
    fn finish_is_safe_for_unknown_ids() {
        let guard = DedupGuard::new();
        guard.finish("never-started");
        assert!(guard.is_empty());
    }
}
