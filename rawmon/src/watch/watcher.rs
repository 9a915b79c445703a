//! Directory watcher feeding the conversion and upload queues.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Classification, EventClassifier, WatchEvent};
use crate::config::WatchMode;
use crate::domain::Stage;
use crate::queue::{QueueHandle, QueueService};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub paths: Vec<PathBuf>,
    pub mode: WatchMode,
    pub poll_interval: Duration,
    pub dedupe_window: Duration,
}

/// Classifies events and enqueues the accepted ones.
///
/// Repeated events for the same path inside the dedupe window are dropped; instruments
/// and copy tools commonly produce several creates or renames for one acquisition.
pub struct EventRouter {
    classifier: EventClassifier,
    queue: Arc<dyn QueueService>,
    conversion: QueueHandle,
    upload: QueueHandle,
    dedupe_window: Duration,
    recent: HashMap<PathBuf, Instant>,
}

impl EventRouter {
    pub fn new(
        classifier: EventClassifier,
        queue: Arc<dyn QueueService>,
        conversion: QueueHandle,
        upload: QueueHandle,
        dedupe_window: Duration,
    ) -> Self {
        Self {
            classifier,
            queue,
            conversion,
            upload,
            dedupe_window,
            recent: HashMap::new(),
        }
    }

    fn seen_recently(&mut self, path: &Path) -> bool {
        if self.dedupe_window.is_zero() {
            return false;
        }
        let now = Instant::now();
        let window = self.dedupe_window;
        self.recent.retain(|_, seen| now.duration_since(*seen) < window);
        if self.recent.contains_key(path) {
            return true;
        }
        self.recent.insert(path.to_path_buf(), now);
        false
    }

    /// Route one event. Returns the stage it was queued for, if any.
    pub async fn route(&mut self, event: WatchEvent) -> Result<Option<Stage>> {
        let stage = match self.classifier.classify(&event) {
            Classification::Stage(stage) => stage,
            Classification::Ignore(reason) => {
                if reason == "bundle companion" {
                    debug!(path = %event.path.display(), "Ignoring {}", reason);
                } else {
                    info!("Ignoring {} ({})", event.path.display(), reason);
                }
                return Ok(None);
            }
        };

        if self.seen_recently(&event.path) {
            debug!(path = %event.path.display(), "Duplicate event suppressed");
            return Ok(None);
        }

        let handle = match stage {
            Stage::Upload => &self.upload,
            _ => &self.conversion,
        };
        let payload = event.path.to_string_lossy();
        self.queue.enqueue(handle, &payload).await?;
        info!("Adding {} to {} queue", payload, stage);
        Ok(Some(stage))
    }
}

fn translate(event: Event) -> Option<WatchEvent> {
    let translated = match event.kind {
        EventKind::Create(CreateKind::Folder) => {
            return event.paths.into_iter().next().map(|p| WatchEvent::created(p).with_dir(true));
        }
        EventKind::Create(CreateKind::File) => {
            return event.paths.into_iter().next().map(|p| WatchEvent::created(p).with_dir(false));
        }
        EventKind::Create(_) => event.paths.into_iter().next().map(WatchEvent::created),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.into_iter().next().map(WatchEvent::moved)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().nth(1).map(WatchEvent::moved)
        }
        _ => None,
    }?;
    // The event did not say; ask the filesystem. A vanished entry stays unknown.
    Some(match std::fs::metadata(&translated.path) {
        Ok(meta) => translated.with_dir(meta.is_dir()),
        Err(_) => translated,
    })
}

enum Backend {
    Native(RecommendedWatcher),
    Poll(PollWatcher),
}

impl Backend {
    fn watch(&mut self, path: &Path) -> notify::Result<()> {
        match self {
            Backend::Native(w) => w.watch(path, RecursiveMode::Recursive),
            Backend::Poll(w) => w.watch(path, RecursiveMode::Recursive),
        }
    }
}

/// Watches the configured roots and hands events to an [`EventRouter`].
///
/// Dropping the notify backend stops new events; the forwarding task then drains what
/// is already buffered unless cancelled first.
pub struct FsWatcher {
    backend: Option<Backend>,
    task: Option<JoinHandle<()>>,
    token: CancellationToken,
}

impl FsWatcher {
    pub fn start(
        settings: &WatcherSettings,
        mut router: EventRouter,
        token: CancellationToken,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WatchEvent>();

        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Some(watch_event) = translate(event)
                    && tx.send(watch_event).is_err()
                {
                    debug!("Watcher channel closed; dropping event");
                }
            }
            Err(e) => error!("Watch error: {:?}", e),
        };

        let mut backend = match settings.mode {
            WatchMode::Local => Backend::Native(
                RecommendedWatcher::new(handler, Config::default())
                    .map_err(|e| Error::Watch(format!("failed to create watcher: {e}")))?,
            ),
            WatchMode::Remote => Backend::Poll(
                PollWatcher::new(
                    handler,
                    Config::default().with_poll_interval(settings.poll_interval),
                )
                .map_err(|e| Error::Watch(format!("failed to create polling watcher: {e}")))?,
            ),
        };

        for path in &settings.paths {
            backend
                .watch(path)
                .map_err(|e| Error::Watch(format!("failed to watch {}: {e}", path.display())))?;
            info!("Watching path: {}", path.display());
        }

        let task_token = token.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = task_token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = router.route(event).await {
                    warn!("Failed to enqueue watched path: {}", e);
                }
            }
            debug!("Watcher event loop finished");
        });

        Ok(Self {
            backend: Some(backend),
            task: Some(task),
            token,
        })
    }

    /// Stop accepting filesystem events and wait for the forwarding task to exit.
    pub async fn stop(&mut self) {
        if self.backend.take().is_some() {
            info!("Stopped watching for new files");
        }
        self.token.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Watcher task ended abnormally: {}", e);
        }
    }
}
