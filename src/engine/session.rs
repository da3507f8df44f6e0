// Playback session engine: load, fall back, retry with backoff, and preload ahead.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast::error::RecvError, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backoff::{countdown_secs, retry_delay};
use super::preload::{LookaheadQueue, PreloadGuard, PreloadTick};
use super::readiness::{bind_and_wait, Readiness};
use super::stats::{SessionStats, StatsSnapshot};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::server::delivery::{ProxyDelivery, ResourceHandle};
use crate::source::traits::{MediaCandidate, MediaKind, MediaRequest, Resolver};
use crate::surface::state::{PlaybackState, VideoState};
use crate::surface::traits::{Surface, SurfaceEvent};

/// Collaborators a session drives.
#[derive(Clone)]
pub struct SessionParts {
    pub resolver: Arc<dyn Resolver>,
    pub delivery: Arc<dyn ProxyDelivery>,
    pub surface: Arc<dyn Surface>,
}

/// User-facing status line.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    Idle,
    Loading,
    Playing,
    Failed { message: String, retry_in_secs: u64 },
    Cleared,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Another load was in flight (or the session is closed); nothing happened.
    Dropped,
    Loaded { via_proxy: bool, from_queue: bool },
    /// Failed; one retry is scheduled after `delay`.
    Failed { delay: Duration },
    /// The cache was cleared while loading; the result was discarded.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub epoch: u64,
    pub current_source: Option<String>,
    pub consecutive_failures: u32,
    pub auto_advance: bool,
    pub queued: usize,
    pub is_loading: bool,
    pub retry_pending: bool,
    pub last_retry_delay: Option<Duration>,
    pub preloading: bool,
    pub visible: bool,
}

/// The source bound to the surface, plus the handle backing it when proxied.
struct BoundSource {
    url: String,
    /// Upstream URL of the logical item; portable across contexts.
    origin_url: String,
    handle: Option<ResourceHandle>,
    /// Playback state an adopted source was seeded with.
    seeded: Option<PlaybackState>,
}

impl BoundSource {
    fn direct(url: &str) -> Self {
        Self {
            url: url.to_string(),
            origin_url: url.to_string(),
            handle: None,
            seeded: None,
        }
    }

    fn adopted(video: &VideoState) -> Self {
        Self {
            seeded: Some(video.playback.clone()),
            ..Self::direct(&video.src)
        }
    }

    /// Enough to put this source back on the surface after another bind displaced it.
    fn rebind_info(&self) -> (String, Option<PlaybackState>) {
        (self.url.clone(), self.seeded.clone())
    }

    fn release(self) {
        if let Some(handle) = self.handle {
            handle.release();
        }
    }
}

/// A deferred `request_load` with its cancel handle.
struct ScheduledRetry {
    token: CancellationToken,
}

struct SessionState {
    epoch: u64,
    current: Option<BoundSource>,
    consecutive_failures: u32,
    auto_advance: bool,
    queue: LookaheadQueue,
    is_loading: bool,
    retry: Option<ScheduledRetry>,
    last_retry_delay: Option<Duration>,
    preload: Option<CancellationToken>,
    /// Event watcher of the currently bound source.
    watch: Option<CancellationToken>,
    visible: bool,
}

impl SessionState {
    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.token.cancel();
        }
    }

    fn replace_retry(&mut self, retry: ScheduledRetry) {
        self.cancel_retry();
        self.retry = Some(retry);
    }

    fn stop_preload(&mut self) {
        if let Some(token) = self.preload.take() {
            token.cancel();
        }
    }

    fn stop_watch(&mut self) {
        if let Some(token) = self.watch.take() {
            token.cancel();
        }
    }
}

enum Trigger {
    Retry(CancellationToken),
    Ended,
    PlaybackError(String),
}

struct Inner {
    session_id: String,
    kind: MediaKind,
    request: Mutex<MediaRequest>,
    parts: SessionParts,
    ready_timeout: Duration,
    preload_interval: Duration,
    preload_min_buffer_secs: f64,
    state: Mutex<SessionState>,
    preload_in_flight: AtomicBool,
    stats: SessionStats,
    status_tx: watch::Sender<EngineStatus>,
    triggers: mpsc::UnboundedSender<Trigger>,
    shutdown: CancellationToken,
}

impl Inner {
    fn set_status(&self, status: EngineStatus) {
        self.status_tx.send_replace(status);
    }

    fn live_epoch(&self, captured: u64) -> Result<()> {
        let live = self.state.lock().epoch;
        if live == captured {
            Ok(())
        } else {
            Err(EngineError::StaleResult { captured, live })
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let state = self.state.get_mut();
        state.cancel_retry();
        state.stop_preload();
        state.stop_watch();
    }
}

/// Clears `is_loading` on every exit path of a load.
struct LoadingFlag<'a> {
    inner: &'a Inner,
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().is_loading = false;
    }
}

/// One playback session bound to one surface. Cheap to clone.
///
/// Must be created inside a tokio runtime: it spawns a trigger pump that
/// runs scheduled retries, auto-advance and playback-error recovery.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Inner>,
}

impl SessionEngine {
    pub fn new(parts: SessionParts, request: MediaRequest, config: &EngineConfig) -> Self {
        let (status_tx, _) = watch::channel(EngineStatus::Idle);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4().to_string();

        let inner = Arc::new(Inner {
            session_id,
            kind: request.kind,
            request: Mutex::new(request),
            ready_timeout: config.ready_timeout(),
            preload_interval: config.preload_interval(),
            preload_min_buffer_secs: config.preload_min_buffer_secs,
            state: Mutex::new(SessionState {
                epoch: 0,
                current: None,
                consecutive_failures: 0,
                auto_advance: true,
                queue: LookaheadQueue::new(config.preload_capacity),
                is_loading: false,
                retry: None,
                last_retry_delay: None,
                preload: None,
                watch: None,
                visible: true,
            }),
            preload_in_flight: AtomicBool::new(false),
            stats: SessionStats::new(),
            status_tx,
            triggers: trigger_tx,
            shutdown: CancellationToken::new(),
            parts,
        });

        tokio::spawn(run_trigger_pump(
            Arc::downgrade(&inner),
            trigger_rx,
            inner.shutdown.clone(),
        ));
        debug!("session {} created for {:?}", inner.session_id, inner.kind);
        Self { inner }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn surface(&self) -> &Arc<dyn Surface> {
        &self.inner.parts.surface
    }

    /// Load the next item: lookahead queue first, resolver otherwise.
    ///
    /// Dropped while another load is in flight. Failures schedule exactly one
    /// automatic retry; results that outlive a cache clear are discarded.
    pub async fn request_load(&self) -> LoadOutcome {
        let inner = &*self.inner;
        let (epoch, previous, queued) = {
            let mut st = inner.state.lock();
            if st.is_loading || inner.shutdown.is_cancelled() {
                debug!("session {} load dropped: already loading", inner.session_id);
                return LoadOutcome::Dropped;
            }
            st.is_loading = true;
            st.cancel_retry();
            st.stop_preload();
            st.stop_watch();
            (st.epoch, st.current.take(), st.queue.pop())
        };
        let _loading = LoadingFlag { inner };

        if let Some(previous) = previous {
            previous.release();
        }

        inner.stats.record_load_started();
        inner.set_status(EngineStatus::Loading);

        let from_queue = queued.is_some();
        let candidate = match queued {
            Some(candidate) => {
                inner.stats.record_preload_hit();
                debug!(
                    "session {} using preloaded {}",
                    inner.session_id, candidate.primary_url
                );
                Ok(candidate)
            }
            None => {
                let request = inner.request.lock().clone();
                inner.parts.resolver.resolve(&request).await
            }
        };

        let bound = match candidate {
            Ok(candidate) => match inner.live_epoch(epoch) {
                Ok(()) => self.bind_candidate(candidate, epoch).await,
                Err(stale) => Err(stale),
            },
            Err(e) => Err(e),
        };

        match bound {
            Ok(bound) => self.finish_success(epoch, bound, from_queue),
            Err(EngineError::StaleResult { captured, live }) => {
                debug!(
                    "session {} dropped stale load (epoch {} -> {})",
                    inner.session_id, captured, live
                );
                inner.stats.record_stale();
                LoadOutcome::Stale
            }
            Err(e) => self.finish_failure(epoch, e),
        }
    }

    /// Manual "next". Supersedes a pending retry.
    pub async fn skip(&self) -> LoadOutcome {
        self.request_load().await
    }

    /// Natural end of an item; advances only when auto-advance is on.
    pub async fn on_ended(&self) -> LoadOutcome {
        if !self.auto_advance() {
            debug!("session {} ended, auto-advance off", self.inner.session_id);
            return LoadOutcome::Dropped;
        }
        self.request_load().await
    }

    /// Two-stage bind: the primary URL directly, then once through the proxy.
    async fn bind_candidate(&self, candidate: MediaCandidate, epoch: u64) -> Result<BoundSource> {
        let inner = &*self.inner;
        let surface = inner.parts.surface.as_ref();

        let direct = bind_and_wait(surface, &candidate.primary_url, inner.ready_timeout).await;
        if direct.is_loaded() {
            return Ok(BoundSource::direct(&candidate.primary_url));
        }
        warn!(
            "session {} direct load of {} failed ({:?}), switching to proxy",
            inner.session_id, candidate.primary_url, direct
        );

        inner.live_epoch(epoch)?;
        let handle = inner.parts.delivery.open_proxy_stream(&candidate)?;
        inner.stats.record_fallback();

        match bind_and_wait(surface, handle.url(), inner.ready_timeout).await {
            Readiness::Failed(reason) => {
                handle.release();
                Err(EngineError::Playback(reason))
            }
            _ => Ok(BoundSource {
                url: handle.url().to_string(),
                origin_url: candidate.primary_url,
                handle: Some(handle),
                seeded: None,
            }),
        }
    }

    fn finish_success(&self, epoch: u64, bound: BoundSource, from_queue: bool) -> LoadOutcome {
        let inner = &*self.inner;
        let via_proxy = bound.handle.is_some();
        {
            let mut st = inner.state.lock();
            if st.epoch != epoch {
                // An adopted source may have been displaced by this bind.
                let displaced = st.current.as_ref().map(BoundSource::rebind_info);
                drop(st);
                bound.release();
                let surface = inner.parts.surface.as_ref();
                match displaced {
                    Some((url, seeded)) => restore_source(surface, &url, seeded.as_ref()),
                    None => surface.unbind(),
                }
                inner.stats.record_stale();
                debug!("session {} discarded load bound after epoch change", inner.session_id);
                return LoadOutcome::Stale;
            }
            info!(
                "session {} playing {} (proxy={})",
                inner.session_id, bound.origin_url, via_proxy
            );
            st.current = Some(bound);
            st.consecutive_failures = 0;
            st.last_retry_delay = None;
        }

        self.watch_surface();
        inner.parts.surface.play();
        inner.stats.record_success();
        inner.set_status(EngineStatus::Playing);
        self.start_preload();

        LoadOutcome::Loaded {
            via_proxy,
            from_queue,
        }
    }

    fn finish_failure(&self, epoch: u64, err: EngineError) -> LoadOutcome {
        let inner = &*self.inner;
        let (delay, failures) = {
            let mut st = inner.state.lock();
            if st.epoch != epoch {
                inner.stats.record_stale();
                return LoadOutcome::Stale;
            }
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            let delay = retry_delay(st.consecutive_failures);
            st.last_retry_delay = Some(delay);
            st.replace_retry(self.schedule_retry(delay));
            (delay, st.consecutive_failures)
        };

        let retry_in_secs = countdown_secs(delay);
        warn!(
            "session {} load failed ({} in a row): {}; retrying in {}ms",
            inner.session_id,
            failures,
            err,
            delay.as_millis()
        );
        inner.stats.record_failure();
        inner.set_status(EngineStatus::Failed {
            message: format!("{}, retrying in {}s", err, retry_in_secs),
            retry_in_secs,
        });

        LoadOutcome::Failed { delay }
    }

    fn schedule_retry(&self, delay: Duration) -> ScheduledRetry {
        let token = CancellationToken::new();
        let fire = token.clone();
        let triggers = self.inner.triggers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = fire.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = triggers.send(Trigger::Retry(fire));
                }
            }
        });
        ScheduledRetry { token }
    }

    /// Follow the events of the source just bound; replaces any earlier watcher.
    fn watch_surface(&self) {
        let token = self.inner.shutdown.child_token();
        let events = self.inner.parts.surface.subscribe();
        if let Some(previous) = self.inner.state.lock().watch.replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(run_event_watcher(Arc::downgrade(&self.inner), events, token));
    }

    /// A bound source failed while playing. Takes the same backoff path as a failed load.
    pub fn on_playback_error(&self, reason: impl Into<String>) -> LoadOutcome {
        let reason = reason.into();
        let epoch = {
            let mut st = self.inner.state.lock();
            if st.is_loading || st.current.is_none() {
                return LoadOutcome::Dropped;
            }
            st.stop_preload();
            st.stop_watch();
            st.epoch
        };
        self.finish_failure(epoch, EngineError::Playback(reason))
    }

    /// Bind a source carried over from another context without resolving anything.
    ///
    /// Starts a new epoch, so a load still in flight comes back `Stale`.
    pub fn adopt(&self, video: &VideoState) {
        let inner = &*self.inner;
        let (previous, epoch) = {
            let mut st = inner.state.lock();
            st.epoch += 1;
            st.queue.clear();
            st.cancel_retry();
            st.stop_preload();
            st.consecutive_failures = 0;
            st.last_retry_delay = None;
            (st.current.replace(BoundSource::adopted(video)), st.epoch)
        };
        self.watch_surface();
        if let Some(previous) = previous {
            previous.release();
        }

        let surface = &inner.parts.surface;
        surface.bind(&video.src);
        surface.apply_playback_state(&video.playback);
        if !video.playback.paused {
            surface.play();
        }
        inner.set_status(EngineStatus::Playing);
        info!(
            "session {} adopted {} at {:.1}s, epoch {}",
            inner.session_id, video.src, video.playback.current_time_seconds, epoch
        );

        if !video.playback.paused {
            self.start_preload();
        }
    }

    /// Drop everything derived from earlier loads and invalidate in-flight work.
    pub fn invalidate_cache(&self) {
        let inner = &*self.inner;
        let (previous, epoch) = {
            let mut st = inner.state.lock();
            st.epoch += 1;
            st.queue.clear();
            st.consecutive_failures = 0;
            st.last_retry_delay = None;
            st.cancel_retry();
            st.stop_preload();
            st.stop_watch();
            (st.current.take(), st.epoch)
        };
        if let Some(previous) = previous {
            previous.release();
        }
        inner.parts.surface.unbind();
        inner.set_status(EngineStatus::Cleared);
        info!("session {} cache cleared, epoch {}", inner.session_id, epoch);
    }

    /// Permanently close the session. Later loads are dropped.
    pub fn destroy(&self) {
        let inner = &*self.inner;
        inner.shutdown.cancel();
        let previous = {
            let mut st = inner.state.lock();
            st.epoch += 1;
            st.queue.clear();
            st.cancel_retry();
            st.stop_preload();
            st.stop_watch();
            st.current.take()
        };
        if let Some(previous) = previous {
            previous.release();
        }
        inner.parts.surface.unbind();
        debug!("session {} destroyed", inner.session_id);
    }

    /// Switch the requested category; queued items from the old one are dropped.
    ///
    /// Unknown categories are rejected and the current one stays in effect.
    pub fn set_category(&self, category: impl Into<String>) -> Result<()> {
        let category = category.into();
        if !self
            .inner
            .parts
            .resolver
            .supports_category(self.inner.kind, &category)
        {
            return Err(EngineError::Config(format!(
                "unknown {:?} category {}",
                self.inner.kind, category
            )));
        }
        *self.inner.request.lock() = MediaRequest::new(category.clone(), self.inner.kind);
        self.inner.state.lock().queue.clear();
        info!("session {} category set to {}", self.inner.session_id, category);
        Ok(())
    }

    pub fn category(&self) -> String {
        self.inner.request.lock().category.clone()
    }

    /// Panel visibility. Hidden sessions pause and stop preloading.
    pub fn set_visible(&self, visible: bool) {
        self.inner.state.lock().visible = visible;
        let surface = &self.inner.parts.surface;
        if !visible {
            if surface.is_playing() {
                surface.pause();
            }
            self.stop_preload();
        } else if surface.is_playing() {
            self.start_preload();
        }
    }

    pub fn set_auto_advance(&self, enabled: bool) {
        self.inner.state.lock().auto_advance = enabled;
    }

    pub fn auto_advance(&self) -> bool {
        self.inner.state.lock().auto_advance
    }

    /// Start the preload loop. No-op when already running, hidden, or not a video session.
    pub fn start_preload(&self) {
        if self.inner.kind != MediaKind::Video {
            return;
        }
        let token = {
            let mut st = self.inner.state.lock();
            if st.preload.is_some() || !st.visible || self.inner.shutdown.is_cancelled() {
                return;
            }
            let token = CancellationToken::new();
            st.preload = Some(token.clone());
            token
        };

        debug!("session {} preload loop started", self.inner.session_id);
        tokio::spawn(run_preload_loop(
            Arc::downgrade(&self.inner),
            token,
            self.inner.preload_interval,
        ));
    }

    /// Stop the preload loop; no new tick starts after this returns.
    pub fn stop_preload(&self) {
        self.inner.state.lock().stop_preload();
    }

    /// One preload step: store one more candidate if playback could use it.
    pub async fn run_preload_tick(&self) -> PreloadTick {
        let inner = &*self.inner;
        if !self.should_preload() {
            return PreloadTick::NotNeeded;
        }
        let _guard = match PreloadGuard::try_new(&inner.preload_in_flight) {
            Some(guard) => guard,
            None => return PreloadTick::Busy,
        };

        let epoch = {
            let st = inner.state.lock();
            if st.queue.is_full() {
                return PreloadTick::Full;
            }
            st.epoch
        };
        let request = inner.request.lock().clone();
        let candidate = match inner.parts.resolver.prefetch(&request).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("session {} preload failed: {}", inner.session_id, e);
                return PreloadTick::Failed(e.to_string());
            }
        };

        if *inner.request.lock() != request {
            return PreloadTick::Stale;
        }
        let mut st = inner.state.lock();
        if st.epoch != epoch {
            inner.stats.record_stale();
            return PreloadTick::Stale;
        }
        match st.queue.push(candidate) {
            Ok(len) => {
                inner.stats.record_preload_stored();
                debug!("session {} preloaded, queue={}", inner.session_id, len);
                PreloadTick::Stored(len)
            }
            Err(_) => PreloadTick::Full,
        }
    }

    fn should_preload(&self) -> bool {
        let inner = &*self.inner;
        if inner.kind != MediaKind::Video {
            return false;
        }
        {
            let st = inner.state.lock();
            if !st.visible || st.is_loading {
                return false;
            }
        }
        let surface = &inner.parts.surface;
        surface.is_playing() && surface.buffered_ahead_secs() < inner.preload_min_buffer_secs
    }

    /// Source currently bound to the surface, as the surface sees it.
    pub fn current_source(&self) -> Option<String> {
        self.inner.state.lock().current.as_ref().map(|c| c.url.clone())
    }

    /// Exportable view of the bound item; `src` is the portable upstream URL.
    pub fn video_state(&self) -> Option<VideoState> {
        let src = self
            .inner
            .state
            .lock()
            .current
            .as_ref()
            .map(|c| c.origin_url.clone())?;
        Some(VideoState {
            src,
            playback: self.inner.parts.surface.playback_state(),
        })
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.inner.state.lock();
        SessionSnapshot {
            epoch: st.epoch,
            current_source: st.current.as_ref().map(|c| c.url.clone()),
            consecutive_failures: st.consecutive_failures,
            auto_advance: st.auto_advance,
            queued: st.queue.len(),
            is_loading: st.is_loading,
            retry_pending: st.retry.is_some(),
            last_retry_delay: st.last_retry_delay,
            preloading: st.preload.is_some(),
            visible: st.visible,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

fn restore_source(surface: &dyn Surface, url: &str, seeded: Option<&PlaybackState>) {
    surface.bind(url);
    if let Some(playback) = seeded {
        surface.apply_playback_state(playback);
    }
    if !seeded.is_some_and(|playback| playback.paused) {
        surface.play();
    }
}

async fn run_trigger_pump(
    inner: Weak<Inner>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    shutdown: CancellationToken,
) {
    loop {
        let trigger = tokio::select! {
            _ = shutdown.cancelled() => break,
            trigger = triggers.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
        };
        let Some(strong) = inner.upgrade() else { break };
        let engine = SessionEngine::from_inner(strong);
        match trigger {
            Trigger::Retry(token) => {
                if token.is_cancelled() {
                    continue;
                }
                debug!("session {} retry fired", engine.session_id());
                engine.request_load().await;
            }
            Trigger::Ended => {
                engine.on_ended().await;
            }
            Trigger::PlaybackError(reason) => {
                engine.on_playback_error(reason);
            }
        }
    }
}

async fn run_event_watcher(
    inner: Weak<Inner>,
    mut events: tokio::sync::broadcast::Receiver<SurfaceEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(strong) = inner.upgrade() else { break };
        let engine = SessionEngine::from_inner(strong);
        match event {
            Ok(SurfaceEvent::Ended) => {
                let _ = engine.inner.triggers.send(Trigger::Ended);
            }
            Ok(SurfaceEvent::Error(reason)) => {
                let _ = engine.inner.triggers.send(Trigger::PlaybackError(reason));
                break;
            }
            Ok(SurfaceEvent::Playing) => engine.start_preload(),
            Ok(SurfaceEvent::Paused) => engine.stop_preload(),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!("session {} event watcher lagged by {}", engine.session_id(), skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_preload_loop(inner: Weak<Inner>, token: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if token.is_cancelled() {
            break;
        }
        let Some(strong) = inner.upgrade() else { break };
        SessionEngine::from_inner(strong).run_preload_tick().await;
    }
    debug!("preload loop stopped");
}
