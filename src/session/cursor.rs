use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::client::Sequence;
use crate::core::Cursor;

/// Outcome of offering one stream event to the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Applied,
    /// Index below the cursor: already applied once.
    Duplicate,
    /// Index above the cursor: something in between never arrived.
    Gap { expected: usize, got: usize },
}

/// Per-session resume offsets. Entries exist while a response is in flight;
/// only that session's coordinator writes its entry.
#[derive(Debug, Clone, Default)]
pub struct CursorStore {
    cursors: Arc<Mutex<HashMap<String, Cursor>>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Cursor>> {
        self.cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, session_id: &str) -> Option<Cursor> {
        self.lock().get(session_id).copied()
    }

    /// A new response begins.
    pub fn reset(&self, session_id: &str) {
        self.lock().insert(session_id.to_string(), Cursor::START);
    }

    /// Start tracking from a known offset unless a further-along cursor is
    /// already held. Never moves an existing cursor backwards.
    pub fn seed(&self, session_id: &str, cursor: Cursor) -> Cursor {
        let mut cursors = self.lock();
        let entry = cursors.entry(session_id.to_string()).or_insert(cursor);
        entry.chunks_delivered = entry.chunks_delivered.max(cursor.chunks_delivered);
        entry.steps_delivered = entry.steps_delivered.max(cursor.steps_delivered);
        *entry
    }

    pub fn advance(&self, session_id: &str, sequence: Sequence) -> Advance {
        let mut cursors = self.lock();
        let cursor = cursors.entry(session_id.to_string()).or_default();
        let (slot, index) = match sequence {
            Sequence::Chunk(index) => (&mut cursor.chunks_delivered, index),
            Sequence::Step(index) => (&mut cursor.steps_delivered, index),
            Sequence::Terminal => return Advance::Applied,
        };

        if index < *slot {
            Advance::Duplicate
        } else if index > *slot {
            Advance::Gap {
                expected: *slot,
                got: index,
            }
        } else {
            *slot += 1;
            Advance::Applied
        }
    }

    /// The response ended; forget the offset.
    pub fn remove(&self, session_id: &str) -> Option<Cursor> {
        self.lock().remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replayed_indices_below_cursor_are_duplicates() {
        let store = CursorStore::new();
        store.reset("s1");
        assert_eq!(store.advance("s1", Sequence::Chunk(0)), Advance::Applied);
        assert_eq!(store.advance("s1", Sequence::Chunk(1)), Advance::Applied);
        assert_eq!(store.advance("s1", Sequence::Step(0)), Advance::Applied);

        assert_eq!(store.advance("s1", Sequence::Chunk(0)), Advance::Duplicate);
        assert_eq!(store.advance("s1", Sequence::Step(0)), Advance::Duplicate);
        assert_eq!(store.get("s1"), Some(Cursor::new(2, 1)));
    }

    #[test]
    fn gaps_do_not_move_the_cursor() {
        let store = CursorStore::new();
        store.reset("s1");
        assert_eq!(
            store.advance("s1", Sequence::Chunk(3)),
            Advance::Gap { expected: 0, got: 3 }
        );
        assert_eq!(store.get("s1"), Some(Cursor::START));
    }

    #[test]
    fn seed_never_moves_backwards() {
        let store = CursorStore::new();
        assert_eq!(store.seed("s1", Cursor::new(5, 2)), Cursor::new(5, 2));
        assert_eq!(store.seed("s1", Cursor::new(3, 4)), Cursor::new(5, 4));
        store.reset("s1");
        assert_eq!(store.get("s1"), Some(Cursor::START));
        assert_eq!(store.remove("s1"), Some(Cursor::START));
        assert_eq!(store.get("s1"), None);
    }
}
