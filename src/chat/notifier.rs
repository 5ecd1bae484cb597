use crate::db::models::SourceMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Render state of the reply being streamed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamView {
    pub chat_id: String,
    pub content: String,
    pub thinking: String,
    pub sources: Option<SourceMap>,
    pub streaming: bool,
}

/// Publishes intermediate views at most once per `min_interval`.
/// Flushes bypass the limit.
pub struct ViewNotifier {
    tx: watch::Sender<Option<StreamView>>,
    min_interval: Duration,
    last_published: Option<Instant>,
}

impl ViewNotifier {
    pub fn new(min_interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            min_interval,
            last_published: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StreamView>> {
        self.tx.subscribe()
    }

    /// Returns whether the view was published. `view` is only built when it is.
    pub fn publish_throttled(&mut self, now: Instant, view: impl FnOnce() -> StreamView) -> bool {
        if let Some(last) = self.last_published {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_published = Some(now);
        self.tx.send_replace(Some(view()));
        true
    }

    pub fn flush(&mut self, view: Option<StreamView>) {
        self.last_published = None;
        self.tx.send_replace(view);
    }

    pub fn current(&self) -> Option<StreamView> {
        self.tx.borrow().clone()
    }
}

impl Default for ViewNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_PUBLISH_INTERVAL)
    }
}
