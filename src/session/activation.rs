use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Sessions whose execution context is confirmed live.
///
/// An id leaves the set whenever something that affects its context changes
/// (working directory, tool bindings) and comes back only after an establish
/// call followed by the first event of the new stream. Every clear bumps the
/// session's generation, so a stream opened against the old context cannot
/// mark the session ready again.
#[derive(Debug, Clone, Default)]
pub struct ActivationSet {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

#[derive(Debug, Default)]
struct Entry {
    ready: bool,
    generation: u64,
}

impl ActivationSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_ready(&self, session_id: &str) -> bool {
        self.lock().get(session_id).is_some_and(|entry| entry.ready)
    }

    /// Context generation to hand back to [`ActivationSet::mark_ready_since`].
    pub fn generation(&self, session_id: &str) -> u64 {
        self.lock().get(session_id).map_or(0, |entry| entry.generation)
    }

    /// Returns true if the session was not ready before.
    pub fn mark_ready(&self, session_id: &str) -> bool {
        let generation = self.generation(session_id);
        self.mark_ready_since(session_id, generation)
    }

    /// Mark ready only if the context has not been cleared since
    /// `generation` was read. Returns true if the session became ready.
    pub fn mark_ready_since(&self, session_id: &str, generation: u64) -> bool {
        let mut sessions = self.lock();
        let entry = sessions.entry(session_id.to_string()).or_default();
        if entry.generation != generation {
            tracing::debug!(
                "Session {} context changed since generation {}, not marking ready",
                session_id,
                generation
            );
            return false;
        }
        let inserted = !entry.ready;
        entry.ready = true;
        if inserted {
            tracing::debug!("Session {} marked ready", session_id);
        }
        inserted
    }

    /// Returns true if the session was ready before.
    pub fn clear_ready(&self, session_id: &str) -> bool {
        let mut sessions = self.lock();
        let entry = sessions.entry(session_id.to_string()).or_default();
        let removed = entry.ready;
        entry.ready = false;
        entry.generation += 1;
        if removed {
            tracing::debug!("Session {} no longer ready", session_id);
        }
        removed
    }

    pub fn ready_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.ready)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
