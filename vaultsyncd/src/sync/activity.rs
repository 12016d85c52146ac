use std::collections::BTreeMap;
use std::sync::Mutex;

use super::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Upload,
    Download,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityPhase {
    Pending,
    Active,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub path: String,
    pub kind: ActivityKind,
    pub phase: ActivityPhase,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivitySummary {
    pub syncing: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub entries: Vec<ActivityEntry>,
}

#[derive(Debug, Default)]
struct ActivityInner {
    entries: BTreeMap<String, ActivityEntry>,
    syncing: bool,
    total: usize,
    completed: usize,
    failed: usize,
}

/// Per-file progress for status detail views.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    inner: Mutex<ActivityInner>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&self, path: &str, kind: ActivityKind) {
        let mut inner = lock(&self.inner);
        inner.entries.insert(
            path.to_string(),
            ActivityEntry {
                path: path.to_string(),
                kind,
                phase: ActivityPhase::Pending,
                error: None,
            },
        );
    }

    pub fn remove(&self, path: &str) {
        lock(&self.inner).entries.remove(path);
    }

    /// Opens a sync round of `total` actions. Finished entries from the
    /// previous round are dropped.
    pub fn start_sync(&self, total: usize) {
        let mut inner = lock(&self.inner);
        inner
            .entries
            .retain(|_, entry| entry.phase == ActivityPhase::Pending);
        inner.syncing = true;
        inner.total = total;
        inner.completed = 0;
        inner.failed = 0;
    }

    pub fn mark_active(&self, path: &str, kind: ActivityKind) {
        let mut inner = lock(&self.inner);
        let entry = inner
            .entries
            .entry(path.to_string())
            .or_insert_with(|| ActivityEntry {
                path: path.to_string(),
                kind,
                phase: ActivityPhase::Active,
                error: None,
            });
        entry.kind = kind;
        entry.phase = ActivityPhase::Active;
        entry.error = None;
    }

    pub fn mark_done(&self, path: &str) {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.entries.get_mut(path) {
            entry.phase = ActivityPhase::Done;
        }
        inner.completed += 1;
    }

    pub fn mark_error(&self, path: &str, error: &str) {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.entries.get_mut(path) {
            entry.phase = ActivityPhase::Error;
            entry.error = Some(error.to_string());
        }
        inner.failed += 1;
    }

    /// Closes the round. Entries still marked active belonged to an attempt
    /// that did not finish and are discarded.
    pub fn end_sync(&self) {
        let mut inner = lock(&self.inner);
        inner.syncing = false;
        inner
            .entries
            .retain(|_, entry| entry.phase != ActivityPhase::Active);
    }

    /// Drops pending and finished entries for `paths`; failures stay visible.
    pub fn clear_pending<'a>(&self, paths: impl IntoIterator<Item = &'a str>) {
        let mut inner = lock(&self.inner);
        for path in paths {
            if inner
                .entries
                .get(path)
                .is_some_and(|entry| entry.phase != ActivityPhase::Error)
            {
                inner.entries.remove(path);
            }
        }
        inner
            .entries
            .retain(|_, entry| entry.phase != ActivityPhase::Done);
    }

    pub fn reset(&self) {
        *lock(&self.inner) = ActivityInner::default();
    }

    pub fn summary(&self) -> ActivitySummary {
        let inner = lock(&self.inner);
        ActivitySummary {
            syncing: inner.syncing,
            total: inner.total,
            completed: inner.completed,
            failed: inner.failed,
            entries: inner.entries.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_a_round_from_pending_to_done() {
        let tracker = ActivityTracker::new();
        tracker.add_pending("a.md", ActivityKind::Upload);
        tracker.start_sync(2);
        tracker.mark_active("a.md", ActivityKind::Upload);
        tracker.mark_done("a.md");
        tracker.mark_active("b.md", ActivityKind::Download);
        tracker.mark_error("b.md", "boom");

        let summary = tracker.summary();
        assert!(summary.syncing);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.entries[1].error.as_deref(), Some("boom"));

        tracker.end_sync();
        tracker.clear_pending(["a.md", "b.md"]);
        let summary = tracker.summary();
        assert!(!summary.syncing);
        assert_eq!(summary.entries.len(), 1);
        assert_eq!(summary.entries[0].phase, ActivityPhase::Error);
    }

    #[test]
    fn end_sync_discards_in_flight_entries() {
        let tracker = ActivityTracker::new();
        tracker.start_sync(1);
        tracker.mark_active("a.md", ActivityKind::Upload);
        tracker.end_sync();
        assert!(tracker.summary().entries.is_empty());
    }

    #[test]
    fn later_change_overrides_kind() {
        let tracker = ActivityTracker::new();
        tracker.add_pending("a.md", ActivityKind::Upload);
        tracker.add_pending("a.md", ActivityKind::Delete);
        let summary = tracker.summary();
        assert_eq!(summary.entries.len(), 1);
        assert_eq!(summary.entries[0].kind, ActivityKind::Delete);
    }

    #[test]
    fn start_sync_keeps_only_pending_entries() {
        let tracker = ActivityTracker::new();
        tracker.add_pending("keep.md", ActivityKind::Upload);
        tracker.mark_active("old.md", ActivityKind::Upload);
        tracker.mark_error("old.md", "x");
        tracker.start_sync(0);
        let paths: Vec<_> = tracker
            .summary()
            .entries
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec!["keep.md".to_string()]);
    }
}
