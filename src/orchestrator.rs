//! Download pipeline controller.
//!
//! A run is owned by a single worker task. Entries are processed strictly one
//! at a time in manifest order: fetch, integrity check, validate, persist.
//! Pause, resume and stop are messages to the worker, which answers each one
//! after applying it. Pausing simply stops polling the in-flight attempt, so
//! the request is suspended in place. Stopping abandons the network fetch
//! only; validation and storage that have begun always finish.

use crate::download::{Fetcher, HttpFetcher};
use crate::error::{FetchError, PullError};
use crate::state::{BatchRun, Effect, Event};
use crate::storage::{FsStorage, StorageSink};
use crate::types::{
    AcceptedMedia, FailedEntry, FailureKind, PendingEntry, PipelineConfig, RunProgress, RunReport,
    RunSnapshot, RunState,
};
use crate::verify::{MediaValidator, Validator};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Run state shared between the worker (writer) and the controller (snapshots).
type SharedRun = Arc<StdMutex<BatchRun>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collaborators shared by every run.
struct Services {
    fetcher: Arc<dyn Fetcher>,
    validator: Arc<dyn Validator>,
    storage: Arc<dyn StorageSink>,
    config: PipelineConfig,
}

/// A control request plus the channel the worker acknowledges on.
struct Control {
    event: Event,
    ack: oneshot::Sender<RunState>,
}

struct ActiveRun {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

/// Receives the final report of one run.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<RunReport>,
}

impl Completion {
    /// Waits for the run to reach `Completed`.
    pub async fn wait(self) -> Result<RunReport, PullError> {
        self.rx
            .await
            .map_err(|_| PullError::Pipeline("worker exited without a report".to_string()))
    }
}

/// Sequential, pausable, cancellable batch downloader.
///
/// Dropping the controller stops its active run.
///
/// # Example
///
/// ```no_run
/// use snappull::{manifest, DownloadController, PipelineConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let controller = DownloadController::from_config(PipelineConfig::default())?;
/// let entries = manifest::parse_file("memories_history.json".as_ref()).await;
///
/// let completion = controller.start(entries).await;
/// let report = completion.wait().await?;
/// println!("{} saved, {} failed", report.accepted.len(), report.failed.len());
/// # Ok(())
/// # }
/// ```
pub struct DownloadController {
    services: Arc<Services>,
    progress: Arc<watch::Sender<RunProgress>>,
    current: StdMutex<SharedRun>,
    active: Mutex<Option<ActiveRun>>,
}

impl DownloadController {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        validator: Arc<dyn Validator>,
        storage: Arc<dyn StorageSink>,
        config: PipelineConfig,
    ) -> Self {
        let (progress, _) = watch::channel(RunProgress::default());
        Self {
            services: Arc::new(Services {
                fetcher,
                validator,
                storage,
                config,
            }),
            progress: Arc::new(progress),
            current: StdMutex::new(Arc::new(StdMutex::new(BatchRun::idle()))),
            active: Mutex::new(None),
        }
    }

    /// Controller wired to HTTP, the default media probes and the media directory.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PullError> {
        let fetcher =
            HttpFetcher::new(&config.user_agent)?.with_max_body_bytes(config.max_payload_bytes);
        let validator = MediaValidator::with_defaults(&config.ffmpeg_path, &config.scratch_dir);
        let storage = FsStorage::new(&config.media_dir);
        Ok(Self::new(
            Arc::new(fetcher),
            Arc::new(validator),
            Arc::new(storage),
            config,
        ))
    }

    /// Starts a new run over `entries`.
    ///
    /// A run already in progress is stopped first; its report still goes to
    /// its own [`Completion`].
    pub async fn start(&self, entries: Vec<PendingEntry>) -> Completion {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!("Superseding the active run");
            let _ = send_control(&previous.control, Event::Stop).await;
            if let Err(e) = previous.task.await {
                warn!("Previous run ended abnormally: {}", e);
            }
        }

        info!("Starting run with {} entries", entries.len());
        let run: SharedRun = Arc::new(StdMutex::new(BatchRun::new(entries)));
        *lock(&self.current) = Arc::clone(&run);
        let progress = lock(&run).progress();
        self.progress.send_replace(progress);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(run_batch(
            Arc::clone(&self.services),
            run,
            control_rx,
            Arc::clone(&self.progress),
            done_tx,
        ));

        *active = Some(ActiveRun {
            control: control_tx,
            task,
        });
        Completion { rx: done_rx }
    }

    /// Suspends the run. Pausing a paused run changes nothing.
    pub async fn pause(&self) -> RunState {
        self.control(Event::Pause).await
    }

    /// Continues a paused run.
    pub async fn resume(&self) -> RunState {
        self.control(Event::Resume).await
    }

    /// Cancels the in-flight fetch and discards the rest of the queue.
    /// A no-op once the run has completed.
    pub async fn stop(&self) -> RunState {
        self.control(Event::Stop).await
    }

    /// Current view of the run, including the queue and result lists.
    pub fn snapshot(&self) -> RunSnapshot {
        let run = Arc::clone(&lock(&self.current));
        let guard = lock(&run);
        guard.snapshot()
    }

    /// Current counters of the run.
    pub fn progress(&self) -> RunProgress {
        *self.progress.borrow()
    }

    /// Live feed of run counters, updated after every state change.
    pub fn subscribe(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    async fn control(&self, event: Event) -> RunState {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => match send_control(&run.control, event).await {
                Some(state) => state,
                None => self.progress.borrow().state,
            },
            None => self.progress.borrow().state,
        }
    }
}

/// Returns `None` when the worker has already finished.
async fn send_control(control: &mpsc::UnboundedSender<Control>, event: Event) -> Option<RunState> {
    let (ack, ack_rx) = oneshot::channel();
    control.send(Control { event, ack }).ok()?;
    ack_rx.await.ok()
}

/// Why an entry was not accepted.
#[derive(Debug)]
struct EntryFailure {
    kind: FailureKind,
    detail: String,
    /// Set when the fetch itself failed.
    cause: Option<FetchError>,
}

impl EntryFailure {
    fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            cause: None,
        }
    }

    fn fetch(error: FetchError) -> Self {
        Self {
            kind: FailureKind::Transport,
            detail: error.to_string(),
            cause: Some(error),
        }
    }

    /// Only a dropped connection or an expired budget can come from sitting
    /// paused. An answer from the server is final.
    fn broken_by_pause(&self) -> bool {
        matches!(
            self.cause,
            Some(FetchError::Timeout | FetchError::Transport(_))
        )
    }
}

#[derive(Debug)]
enum AttemptError {
    /// A stop abandoned the fetch. The entry is neither accepted nor failed.
    Cancelled,
    Failed(EntryFailure),
}

impl From<EntryFailure> for AttemptError {
    fn from(failure: EntryFailure) -> Self {
        AttemptError::Failed(failure)
    }
}

/// Resolves once a stop has been requested.
async fn stopped(cancel: &mut watch::Receiver<bool>) {
    let seen = cancel.wait_for(|stop| *stop).await.is_ok();
    if !seen {
        // Sender gone: the worker is tearing down and will not poll us again
        std::future::pending::<()>().await;
    }
}

/// URLs to try for an entry: the primary, then a distinct fallback.
///
/// When the primary is empty the fallback is the only candidate, so it is
/// never attempted twice.
fn attempt_plan(entry: &PendingEntry) -> Vec<(String, Url)> {
    let parse = |raw: &str| {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Some((raw.to_string(), url)),
            _ => {
                debug!("Ignoring unusable URL '{}'", raw);
                None
            }
        }
    };

    let mut plan = Vec::with_capacity(2);
    plan.extend(parse(&entry.primary_url));
    if entry.fallback_url.trim() != entry.primary_url.trim() {
        plan.extend(parse(&entry.fallback_url));
    }
    plan
}

/// Fetch, check, validate and persist one URL.
///
/// Only the fetch races against a stop. Once a payload is in hand it is
/// validated and, if good, persisted regardless.
async fn attempt_url(
    services: &Services,
    entry: &PendingEntry,
    raw: &str,
    url: &Url,
    cancel: &mut watch::Receiver<bool>,
) -> Result<AcceptedMedia, AttemptError> {
    let config = &services.config;

    let fetched = tokio::select! {
        biased;
        _ = stopped(cancel) => return Err(AttemptError::Cancelled),
        fetched = services.fetcher.fetch(url, config.fetch_timeout) => fetched,
    };
    let payload = fetched
        .and_then(|response| response.into_usable(config.min_payload_bytes))
        .map_err(EntryFailure::fetch)?;

    if !services
        .validator
        .validate(payload.clone(), entry.media_kind)
        .await
    {
        return Err(EntryFailure::new(
            FailureKind::Integrity,
            format!("payload is not a decodable {}", entry.media_kind),
        )
        .into());
    }

    let storage_ref = services
        .storage
        .persist(payload, entry.media_kind)
        .await
        .map_err(|e| EntryFailure::new(FailureKind::Persistence, e.to_string()))?;

    Ok(AcceptedMedia::from_entry(entry, raw, storage_ref))
}

/// Runs an entry through its primary URL and, on failure, its fallback once.
async fn process_entry(
    services: &Services,
    entry: &PendingEntry,
    mut cancel: watch::Receiver<bool>,
) -> Result<AcceptedMedia, AttemptError> {
    let plan = attempt_plan(entry);
    if plan.is_empty() {
        return Err(EntryFailure::new(FailureKind::Unschedulable, "no usable download URL").into());
    }

    let mut last_failure = None;
    for (index, (raw, url)) in plan.iter().enumerate() {
        if index > 0 {
            let stopping = *cancel.borrow();
            if stopping {
                return Err(AttemptError::Cancelled);
            }
            info!("Retrying with fallback URL for {}", entry.captured_at);
        }
        match attempt_url(services, entry, raw, url, &mut cancel).await {
            Ok(media) => return Ok(media),
            Err(AttemptError::Cancelled) => return Err(AttemptError::Cancelled),
            Err(AttemptError::Failed(failure)) if failure.kind == FailureKind::Persistence => {
                warn!("Could not save {}: {}", entry.captured_at, failure.detail);
                return Err(failure.into());
            }
            Err(AttemptError::Failed(failure)) => {
                warn!("Attempt at {} failed: {}", raw, failure.detail);
                last_failure = Some(failure);
            }
        }
    }

    let failure = last_failure
        .unwrap_or_else(|| EntryFailure::new(FailureKind::Unschedulable, "no attempt made"));
    Err(failure.into())
}

/// Worker loop. Owns the run until it completes.
async fn run_batch(
    services: Arc<Services>,
    run: SharedRun,
    mut control: mpsc::UnboundedReceiver<Control>,
    progress: Arc<watch::Sender<RunProgress>>,
    done: oneshot::Sender<RunReport>,
) {
    let (cancel, _) = watch::channel(false);
    let mut control_open = true;

    let publish = || {
        let counters = lock(&run).progress();
        progress.send_replace(counters);
    };

    // Applies a control message and tells the caller the resulting state
    let handle = |message: Option<Control>| -> Effect {
        let (event, ack) = match message {
            Some(Control { event, ack }) => (event, Some(ack)),
            // Every controller handle is gone, nobody can resume
            None => (Event::Stop, None),
        };
        let (effect, state) = {
            let mut guard = lock(&run);
            let effect = guard.apply(event);
            (effect, guard.state())
        };
        match effect {
            Effect::SuspendFetch => info!("⏸️  Paused"),
            Effect::ResumeFetch => info!("▶️  Resumed"),
            Effect::CancelFetch => {
                info!("⏹️  Stop requested, discarding queue");
                cancel.send_replace(true);
            }
            _ => {}
        }
        publish();
        if let Some(ack) = ack {
            let _ = ack.send(state);
        }
        effect
    };

    loop {
        let (state, cancelled) = {
            let guard = lock(&run);
            (guard.state(), guard.cancel_requested())
        };
        if cancelled {
            lock(&run).apply(Event::CancelObserved);
            break;
        }
        if state == RunState::Paused {
            let message = control.recv().await;
            control_open &= message.is_some();
            handle(message);
            continue;
        }

        let next = lock(&run).next_entry();
        let Some(entry) = next else {
            lock(&run).apply(Event::Drained);
            break;
        };
        publish();
        debug!("Processing entry {} ({})", entry.captured_at, entry.media_kind);

        let (result, interrupted) = {
            let attempt = process_entry(&services, &entry, cancel.subscribe());
            tokio::pin!(attempt);
            let mut interrupted = false;

            loop {
                let paused = lock(&run).state() == RunState::Paused;
                if paused {
                    // Not polling `attempt` keeps it suspended where it is
                    let message = control.recv().await;
                    control_open &= message.is_some();
                    handle(message);
                    continue;
                }
                tokio::select! {
                    biased;
                    // A finished attempt is recorded before any pending control message
                    result = &mut attempt => break (result, interrupted),
                    message = control.recv(), if control_open => {
                        control_open &= message.is_some();
                        if handle(message) == Effect::SuspendFetch {
                            interrupted = true;
                        }
                    }
                }
            }
        };

        match result {
            Ok(media) => {
                info!("✅ Saved {} as {}", entry.captured_at, media.storage_ref);
                lock(&run).record_accepted(media);
            }
            Err(AttemptError::Cancelled) => {
                debug!("Abandoned in-flight fetch for {}", entry.captured_at)
            }
            Err(AttemptError::Failed(failure)) if interrupted && failure.broken_by_pause() => {
                // The transport could not survive the pause; start this entry over
                info!("Re-queueing {} after interrupted transfer", entry.captured_at);
                lock(&run).requeue_front(entry);
            }
            Err(AttemptError::Failed(failure)) => {
                warn!(
                    "❌ Giving up on {}: {} ({})",
                    entry.captured_at, failure.kind, failure.detail
                );
                lock(&run).record_failed(FailedEntry {
                    entry,
                    kind: failure.kind,
                    detail: failure.detail,
                });
            }
        }
        publish();
    }

    publish();
    let report = lock(&run).report();
    info!(
        "Run finished: {} accepted, {} failed, {} total{}",
        report.accepted.len(),
        report.failed.len(),
        report.total,
        if report.stopped { " (stopped)" } else { "" }
    );
    let _ = done.send(report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    fn entry(primary: &str, fallback: &str) -> PendingEntry {
        PendingEntry {
            captured_at: "2023-05-01 18:22:03 UTC".into(),
            media_kind: MediaKind::Photo,
            location_label: String::new(),
            primary_url: primary.into(),
            fallback_url: fallback.into(),
        }
    }

    fn raws(plan: Vec<(String, Url)>) -> Vec<String> {
        plan.into_iter().map(|(raw, _)| raw).collect()
    }

    #[test]
    fn test_plan_primary_then_fallback() {
        let plan = attempt_plan(&entry("https://a.example/1.jpg", "https://b.example/1"));
        assert_eq!(raws(plan), vec!["https://a.example/1.jpg", "https://b.example/1"]);
    }

    #[test]
    fn test_plan_uses_fallback_when_primary_empty() {
        let plan = attempt_plan(&entry("", "https://b.example/1"));
        assert_eq!(raws(plan), vec!["https://b.example/1"]);
    }

    #[test]
    fn test_plan_skips_identical_fallback() {
        let plan = attempt_plan(&entry("https://a.example/1", "https://a.example/1"));
        assert_eq!(raws(plan), vec!["https://a.example/1"]);
    }

    #[test]
    fn test_plan_empty_without_usable_urls() {
        assert!(attempt_plan(&entry("", "")).is_empty());
        assert!(attempt_plan(&entry("not a url", "ftp://files.example/x")).is_empty());
    }

    #[test]
    fn test_plan_skips_unparseable_primary() {
        let plan = attempt_plan(&entry("::::", "https://b.example/1"));
        assert_eq!(raws(plan), vec!["https://b.example/1"]);
    }
}
