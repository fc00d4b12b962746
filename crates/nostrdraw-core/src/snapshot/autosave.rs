//! Periodic checkpointing of the open canvas.

use super::{SnapshotError, SnapshotService};
use crate::relay::PublishReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default auto-save interval in seconds.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Publishes a checkpoint when the canvas changed and the interval elapsed.
pub struct AutoSaveManager {
    snapshots: Arc<SnapshotService>,
    interval: Duration,
    last_save: Option<Instant>,
    dirty: bool,
    /// Canvas id and display name.
    canvas: Option<(String, String)>,
}

impl AutoSaveManager {
    pub fn new(snapshots: Arc<SnapshotService>) -> Self {
        Self {
            snapshots,
            interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            last_save: None,
            dirty: false,
            canvas: None,
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Track a canvas. Switching canvas resets the dirty state.
    pub fn set_canvas(&mut self, canvas: Option<(String, String)>) {
        self.canvas = canvas;
        self.dirty = false;
        self.last_save = None;
    }

    pub fn canvas_id(&self) -> Option<&str> {
        self.canvas.as_ref().map(|(id, _)| id.as_str())
    }

    /// Dirty, tracking a canvas, and the interval has elapsed since the last save.
    pub fn should_save(&self) -> bool {
        if !self.dirty || self.canvas.is_none() {
            return false;
        }
        match self.last_save {
            Some(last) => last.elapsed() >= self.interval,
            None => true,
        }
    }

    /// Save if [`should_save`](Self::should_save). Returns true if a checkpoint went out.
    pub async fn maybe_save(&mut self) -> Result<bool, SnapshotError> {
        if !self.should_save() {
            return Ok(false);
        }
        Ok(self.save().await?.is_some())
    }

    /// Save now, if a canvas is tracked.
    pub async fn save(&mut self) -> Result<Option<PublishReport>, SnapshotError> {
        let Some((canvas_id, canvas_name)) = self.canvas.clone() else {
            return Ok(None);
        };
        let report = self.snapshots.save(&canvas_id, &canvas_name).await?;
        self.last_save = Some(Instant::now());
        self.dirty = false;
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::CanvasElement;
    use crate::identity::Keys;
    use crate::relay::{MemoryRelay, Relay, RelayPool};
    use crate::store::ElementStore;

    fn manager(relay: &MemoryRelay) -> AutoSaveManager {
        let pool = RelayPool::new(vec![Arc::new(relay.clone()) as Arc<dyn Relay>]);
        let snapshots = SnapshotService::new(pool, Arc::new(Keys::generate()), ElementStore::new().shared());
        AutoSaveManager::new(Arc::new(snapshots))
    }

    #[test]
    fn test_autosave_needs_canvas_and_changes() {
        let mut manager = manager(&MemoryRelay::new("mem://a"));
        assert!(!manager.should_save());

        manager.mark_dirty();
        assert!(!manager.should_save());

        manager.set_canvas(Some(("c1".to_string(), "Sketch".to_string())));
        assert!(!manager.is_dirty());
        manager.mark_dirty();
        assert!(manager.should_save());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_respects_interval() {
        let relay = MemoryRelay::new("mem://a");
        let mut manager = manager(&relay);
        manager.set_canvas(Some(("c1".to_string(), "Sketch".to_string())));

        manager.mark_dirty();
        assert!(manager.maybe_save().await.unwrap());
        assert!(!manager.is_dirty());

        manager.mark_dirty();
        assert!(!manager.maybe_save().await.unwrap());

        tokio::time::advance(Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS)).await;
        assert!(manager.maybe_save().await.unwrap());
        assert!(!relay.stored().is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_stays_dirty() {
        let relay = MemoryRelay::new("mem://down");
        relay.set_online(false);
        let mut manager = manager(&relay);
        manager.set_canvas(Some(("c1".to_string(), "Sketch".to_string())));
        manager
            .snapshots
            .store()
            .with(|store| store.add(CanvasElement::rectangle(0.0, 0.0, 1.0, 1.0, "x")));

        manager.mark_dirty();
        assert!(manager.maybe_save().await.is_err());
        assert!(manager.is_dirty());
    }

    #[tokio::test]
    async fn test_save_without_canvas() {
        let mut manager = manager(&MemoryRelay::new("mem://a"));
        assert_eq!(manager.save().await, Ok(None));
    }
}
