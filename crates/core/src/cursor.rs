use serde::{Deserialize, Serialize};

use crate::item::{ItemId, WorkItem};

/// Bookmark used to resume a queue scan without revisiting completed items.
///
/// The queue is ordered by status priority descending, then id ascending.
/// An item is "after" the cursor when its priority is lower than
/// `last_priority`, or equal to it with a greater id. `last_priority ==
/// i32::MAX` places the cursor before every item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCursor {
    pub last_item_id: ItemId,
    pub last_priority: i32,
    /// Inclusive lower bound on status priority for this scan.
    pub min_priority: i32,
}

impl Default for ProgressCursor {
    fn default() -> Self {
        Self {
            last_item_id: 0,
            last_priority: i32::MAX,
            min_priority: 0,
        }
    }
}

impl ProgressCursor {
    /// Fresh cursor scanning items with status priority `>= min_priority`.
    pub fn starting_at(min_priority: i32) -> Self {
        Self {
            min_priority,
            ..Self::default()
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.last_priority == i32::MAX
    }

    /// Whether an item with the given queue key lies strictly after the cursor
    /// and passes the priority filter.
    pub fn admits(&self, status_priority: i32, id: ItemId) -> bool {
        if status_priority < self.min_priority {
            return false;
        }
        if self.is_unbounded() {
            return true;
        }
        status_priority < self.last_priority
            || (status_priority == self.last_priority && id > self.last_item_id)
    }

    pub fn advance_to(&mut self, status_priority: i32, id: ItemId) {
        self.last_priority = status_priority;
        self.last_item_id = id;
    }

    pub fn advance_past(&mut self, item: &WorkItem) {
        let (priority, id) = item.queue_key();
        self.advance_to(priority, id);
    }
}

/// Per-scan cursor cache shared by consecutive calls.
///
/// A call with the same or a higher `min_priority` resumes from the cached
/// cursor; a lower one starts over, since items below the old bound were
/// never visited.
#[derive(Debug, Clone, Default)]
pub struct CursorCache {
    cached: Option<ProgressCursor>,
}

impl CursorCache {
    pub fn get(&self, min_priority: i32) -> ProgressCursor {
        match self.cached {
            Some(cursor) if min_priority >= cursor.min_priority => ProgressCursor {
                min_priority,
                ..cursor
            },
            _ => ProgressCursor::starting_at(min_priority),
        }
    }

    /// Cursor of an interrupted scan, if any.
    pub fn current(&self) -> Option<ProgressCursor> {
        self.cached
    }

    pub fn store(&mut self, cursor: ProgressCursor) {
        self.cached = Some(cursor);
    }

    pub fn reset(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cursor_admits_everything_above_min() {
        let c = ProgressCursor::starting_at(2);
        assert!(c.admits(2, 1));
        assert!(c.admits(100, 1));
        assert!(!c.admits(1, 1));
    }

    #[test]
    fn admits_strictly_after() {
        let mut c = ProgressCursor::default();
        c.advance_to(5, 10);
        assert!(!c.admits(5, 10));
        assert!(!c.admits(5, 9));
        assert!(!c.admits(6, 100));
        assert!(c.admits(5, 11));
        assert!(c.admits(4, 1));
    }

    #[test]
    fn cache_resumes_for_same_or_higher_min() {
        let mut cache = CursorCache::default();
        let mut c = cache.get(3);
        c.advance_to(5, 10);
        cache.store(c);

        let resumed = cache.get(3);
        assert_eq!(resumed.last_item_id, 10);
        let higher = cache.get(4);
        assert_eq!(higher.last_item_id, 10);
        assert_eq!(higher.min_priority, 4);
    }

    #[test]
    fn cache_restarts_for_lower_min() {
        let mut cache = CursorCache::default();
        let mut c = cache.get(3);
        c.advance_to(5, 10);
        cache.store(c);

        let restarted = cache.get(2);
        assert_eq!(restarted, ProgressCursor::starting_at(2));
    }
}
