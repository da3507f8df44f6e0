// Test doubles shared by the session and coordinator tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use media_session_engine::coordinator::context::SurfaceFactory;
use media_session_engine::coordinator::registry::ContextId;
use media_session_engine::error::{EngineError, Result};
use media_session_engine::server::delivery::{ProxyDelivery, ResourceHandle};
use media_session_engine::source::traits::{MediaCandidate, MediaKind, MediaRequest, Resolver};
use media_session_engine::surface::state::PlaybackState;
use media_session_engine::surface::traits::{Surface, SurfaceEvent};

/// Surface that reports `Ready` on bind unless the source is marked failing.
pub struct FakeSurface {
    events: broadcast::Sender<SurfaceEvent>,
    playback: Mutex<PlaybackState>,
    binds: Mutex<Vec<String>>,
    failing_prefixes: Mutex<HashSet<String>>,
    silent_prefixes: Mutex<HashSet<String>>,
    buffered: Mutex<f64>,
    unbinds: AtomicUsize,
}

impl FakeSurface {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            playback: Mutex::new(PlaybackState::default()),
            binds: Mutex::new(Vec::new()),
            failing_prefixes: Mutex::new(HashSet::new()),
            silent_prefixes: Mutex::new(HashSet::new()),
            buffered: Mutex::new(30.0),
            unbinds: AtomicUsize::new(0),
        })
    }

    /// Sources starting with `prefix` fail to load.
    pub fn fail_sources(&self, prefix: &str) {
        self.failing_prefixes.lock().insert(prefix.to_string());
    }

    /// Sources starting with `prefix` only report a stall warning, never Ready or Error.
    pub fn stall_sources(&self, prefix: &str) {
        self.silent_prefixes.lock().insert(prefix.to_string());
    }

    pub fn set_buffered(&self, secs: f64) {
        *self.buffered.lock() = secs;
    }

    pub fn binds(&self) -> Vec<String> {
        self.binds.lock().clone()
    }

    pub fn bind_count(&self) -> usize {
        self.binds.lock().len()
    }

    pub fn unbind_count(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: SurfaceEvent) {
        let _ = self.events.send(event);
    }
}

impl Surface for FakeSurface {
    fn bind(&self, source: &str) {
        self.binds.lock().push(source.to_string());
        let stalled = self
            .silent_prefixes
            .lock()
            .iter()
            .any(|prefix| source.starts_with(prefix.as_str()));
        if stalled {
            self.emit(SurfaceEvent::Warning(format!("{} stalled", source)));
            return;
        }
        let failing = self
            .failing_prefixes
            .lock()
            .iter()
            .any(|prefix| source.starts_with(prefix.as_str()));
        if failing {
            self.emit(SurfaceEvent::Error(format!("cannot decode {}", source)));
        } else {
            self.emit(SurfaceEvent::Ready);
        }
    }

    fn unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        self.playback.lock().paused = true;
    }

    fn subscribe(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }

    fn playback_state(&self) -> PlaybackState {
        self.playback.lock().clone()
    }

    fn apply_playback_state(&self, state: &PlaybackState) {
        *self.playback.lock() = state.clone();
    }

    fn buffered_ahead_secs(&self) -> f64 {
        *self.buffered.lock()
    }

    fn play(&self) {
        self.playback.lock().paused = false;
        self.emit(SurfaceEvent::Playing);
    }

    fn pause(&self) {
        self.playback.lock().paused = true;
        self.emit(SurfaceEvent::Paused);
    }
}

/// Categories the scripted resolver claims to serve.
pub const KNOWN_CATEGORIES: &[&str] = &["random", "dance", "street"];

/// Resolver replaying a script, then serving numbered items once it runs dry.
pub struct ScriptedResolver {
    script: Mutex<VecDeque<Result<MediaCandidate>>>,
    calls: Mutex<Vec<Instant>>,
    prefetches: AtomicUsize,
    served: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(script: Vec<Result<MediaCandidate>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            prefetches: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
        })
    }

    /// Fails every call.
    pub fn always_failing() -> Arc<Self> {
        let script = (0..1000)
            .map(|i| Err(EngineError::Upstream(format!("endpoint down #{}", i))))
            .collect();
        Self::new(script)
    }

    pub fn push(&self, result: Result<MediaCandidate>) {
        self.script.lock().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }

    pub fn prefetches(&self) -> usize {
        self.prefetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(&self, _request: &MediaRequest) -> Result<MediaCandidate> {
        self.calls.lock().push(Instant::now());
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        let n = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MediaCandidate::direct(format!("https://cdn.example/item-{}.mp4", n)))
    }

    async fn prefetch(&self, _request: &MediaRequest) -> Result<MediaCandidate> {
        let n = self.prefetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MediaCandidate::direct(format!("https://cdn.example/pre-{}.mp4", n)))
    }

    fn supports_category(&self, _kind: MediaKind, category: &str) -> bool {
        KNOWN_CATEGORIES.contains(&category)
    }
}

/// Resolver that parks every call until the test opens the gate.
pub struct GatedResolver {
    pub entered: Notify,
    pub gate: Notify,
    calls: AtomicUsize,
}

impl GatedResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for GatedResolver {
    async fn resolve(&self, _request: &MediaRequest) -> Result<MediaCandidate> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(MediaCandidate::direct(format!("https://cdn.example/gated-{}.mp4", n)))
    }
}

/// Proxy delivery that hands out `proxy://N` handles and counts releases per handle.
#[derive(Default)]
pub struct CountingDelivery {
    opened: AtomicUsize,
    releases: Arc<Mutex<HashMap<String, usize>>>,
}

impl CountingDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> HashMap<String, usize> {
        self.releases.lock().clone()
    }

    pub fn release_count(&self, id: &str) -> usize {
        self.releases.lock().get(id).copied().unwrap_or(0)
    }
}

impl ProxyDelivery for CountingDelivery {
    fn open_proxy_stream(&self, _item: &MediaCandidate) -> Result<ResourceHandle> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("h{}", n);
        let releases = self.releases.clone();
        Ok(ResourceHandle::new(
            id.clone(),
            format!("proxy://{}", id),
            move |id| {
                *releases.lock().entry(id.to_string()).or_insert(0) += 1;
            },
        ))
    }
}

/// Hands each context a fresh `FakeSurface` and keeps them for inspection.
#[derive(Default)]
pub struct FakeSurfaces {
    created: Mutex<Vec<(ContextId, Arc<FakeSurface>)>>,
}

impl FakeSurfaces {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn latest(&self, context: &ContextId) -> Option<Arc<FakeSurface>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == context)
            .map(|(_, surface)| surface.clone())
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

impl SurfaceFactory for FakeSurfaces {
    fn create(&self, context: &ContextId) -> Arc<dyn Surface> {
        let surface = FakeSurface::new();
        self.created.lock().push((context.clone(), surface.clone()));
        surface
    }
}

/// Poll `check` until it holds, letting spawned tasks and timers run in between.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
