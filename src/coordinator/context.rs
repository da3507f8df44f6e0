// Surface Coordinator: keeps at most one live surface across hosting contexts.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messaging::{ContextMessenger, ContextRequest, ContextResponse, Envelope};
use super::registry::{ContextId, OwnerRegistry};
use crate::config::EngineConfig;
use crate::engine::session::{SessionEngine, SessionParts};
use crate::error::{self, EngineError};
use crate::server::delivery::ProxyDelivery;
use crate::source::traits::{MediaKind, MediaRequest, Resolver};
use crate::surface::state::{Position, SurfaceState, UiState};
use crate::surface::traits::Surface;

/// Creates the host's surface when a context opens.
pub trait SurfaceFactory: Send + Sync {
    fn create(&self, context: &ContextId) -> Arc<dyn Surface>;
}

/// Shared collaborators of every coordinator in a process.
#[derive(Clone)]
pub struct CoordinatorParts {
    pub resolver: Arc<dyn Resolver>,
    pub delivery: Arc<dyn ProxyDelivery>,
    pub registry: Arc<dyn OwnerRegistry>,
    pub messenger: Arc<dyn ContextMessenger>,
    pub surfaces: Arc<dyn SurfaceFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// No live owner anywhere; opened without a seed.
    OpenedFresh,
    /// Took the live surface over from another context.
    OpenedSeeded,
    /// Was the owner and open; closed.
    Closed,
    /// Was the recorded owner but closed; opened again without a seed.
    Reopened,
}

struct Panel {
    engine: SessionEngine,
    ui: UiState,
}

/// One hosting context's side of the coordination protocol. States: open or closed.
pub struct SurfaceCoordinator {
    context: ContextId,
    parts: CoordinatorParts,
    config: EngineConfig,
    category: Mutex<String>,
    panel: Mutex<Option<Panel>>,
}

impl SurfaceCoordinator {
    pub fn new(context: ContextId, parts: CoordinatorParts, config: &EngineConfig) -> Self {
        Self {
            context,
            parts,
            category: Mutex::new(config.video_category.clone()),
            config: config.clone(),
            panel: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }

    pub fn is_open(&self) -> bool {
        self.panel.lock().is_some()
    }

    /// Engine of the open surface, if any.
    pub fn engine(&self) -> Option<SessionEngine> {
        self.panel.lock().as_ref().map(|p| p.engine.clone())
    }

    /// The user asked for the live surface here.
    pub async fn activate(&self) -> ActivationOutcome {
        let owner = self.parts.registry.get_owner();
        match owner {
            Some(owner) if owner == self.context => {
                if self.is_open() {
                    self.close();
                    ActivationOutcome::Closed
                } else {
                    self.open(None);
                    ActivationOutcome::Reopened
                }
            }
            Some(owner) => {
                if self.take_over(&owner).await {
                    ActivationOutcome::OpenedSeeded
                } else {
                    info!(
                        "context {} owner {} has no live surface, clearing",
                        self.context, owner
                    );
                    self.parts.registry.clear_owner();
                    self.open(None);
                    ActivationOutcome::OpenedFresh
                }
            }
            None => {
                self.open(None);
                ActivationOutcome::OpenedFresh
            }
        }
    }

    /// Move the live surface from `owner` to this context. False when `owner` has nothing to give.
    async fn take_over(&self, owner: &ContextId) -> bool {
        let exported = self
            .parts
            .messenger
            .request(owner, ContextRequest::ExportState)
            .await;

        let state = match exported {
            Ok(ContextResponse::State(Some(state))) => state,
            Ok(other) => {
                debug!("context {} export from {} returned {:?}", self.context, owner, other);
                return false;
            }
            Err(e) => {
                warn!("context {} export from {} failed: {}", self.context, owner, e);
                return false;
            }
        };

        self.open(Some(state));

        if let Err(e) = self
            .parts
            .messenger
            .request(owner, ContextRequest::Close)
            .await
        {
            warn!("context {} could not close {}: {}", self.context, owner, e);
        }
        // Reassert after the former owner closed.
        self.parts.registry.set_owner(self.context.clone());

        info!("context {} took the surface over from {}", self.context, owner);
        true
    }

    /// Snapshot of the open surface; `None` when closed.
    pub fn export_state(&self) -> Option<SurfaceState> {
        let panel = self.panel.lock();
        let panel = panel.as_ref()?;
        Some(SurfaceState {
            auto_advance: panel.engine.auto_advance(),
            minimized: panel.ui.minimized,
            position: panel.ui.position,
            video: panel.engine.video_state(),
        })
    }

    /// Open a surface here, or re-apply `seed` to the one already open.
    ///
    /// A seed carrying a source skips the initial load.
    pub fn open(&self, seed: Option<SurfaceState>) {
        let mut panel = self.panel.lock();
        let fresh = panel.is_none();
        if !fresh && seed.is_none() {
            drop(panel);
            debug!("context {} already open", self.context);
            self.parts.registry.set_owner(self.context.clone());
            return;
        }

        let engine = match panel.as_mut() {
            Some(existing) => {
                if let Some(seed) = seed.as_ref() {
                    existing.ui = seed.ui();
                }
                existing.engine.clone()
            }
            None => {
                let surface = self.parts.surfaces.create(&self.context);
                let request = MediaRequest::new(self.category.lock().clone(), MediaKind::Video);
                let engine = SessionEngine::new(
                    SessionParts {
                        resolver: self.parts.resolver.clone(),
                        delivery: self.parts.delivery.clone(),
                        surface,
                    },
                    request,
                    &self.config,
                );
                *panel = Some(Panel {
                    engine: engine.clone(),
                    ui: seed.as_ref().map(SurfaceState::ui).unwrap_or_default(),
                });
                engine
            }
        };
        drop(panel);

        self.parts.registry.set_owner(self.context.clone());

        match seed {
            Some(seed) => {
                engine.set_auto_advance(seed.auto_advance);
                let seeded = seed.has_source();
                match seed.video {
                    Some(video) if seeded => engine.adopt(&video),
                    _ if fresh => spawn_initial_load(engine),
                    _ => {}
                }
                info!("context {} opened with seeded state", self.context);
            }
            None => {
                spawn_initial_load(engine);
                info!("context {} opened", self.context);
            }
        }
    }

    /// Close the local surface. Closing a closed context is a no-op.
    pub fn close(&self) {
        let panel = self.panel.lock().take();
        if let Some(panel) = panel {
            panel.engine.destroy();
            info!("context {} closed", self.context);
        }
        self.parts.registry.clear_if_owner(&self.context);
    }

    /// The hosting context is going away for good.
    pub fn on_destroyed(&self) {
        self.close();
        debug!("context {} destroyed", self.context);
    }

    /// Category for this context's video sessions, current and future.
    pub fn set_category(&self, category: impl Into<String>) -> error::Result<()> {
        let category = category.into();
        if !self
            .parts
            .resolver
            .supports_category(MediaKind::Video, &category)
        {
            return Err(EngineError::Config(format!("unknown video category {}", category)));
        }
        if let Some(engine) = self.engine() {
            engine.set_category(category.clone())?;
        }
        *self.category.lock() = category;
        Ok(())
    }

    pub fn set_minimized(&self, minimized: bool) {
        if let Some(panel) = self.panel.lock().as_mut() {
            panel.ui.minimized = minimized;
        }
    }

    pub fn move_to(&self, position: Position) {
        if let Some(panel) = self.panel.lock().as_mut() {
            panel.ui.position = Some(position);
        }
    }

    /// Answer one request from another context.
    pub fn handle(&self, request: ContextRequest) -> ContextResponse {
        match request {
            ContextRequest::Status => ContextResponse::Status {
                open: self.is_open(),
            },
            ContextRequest::ExportState => ContextResponse::State(self.export_state()),
            ContextRequest::Open(seed) => {
                self.open(seed);
                ContextResponse::Ack
            }
            ContextRequest::Close => {
                self.close();
                ContextResponse::Ack
            }
        }
    }

    /// Serve this context's inbox until the bus drops it.
    pub fn serve(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let response = self.handle(envelope.request.clone());
                envelope.respond(response);
            }
            debug!("context {} inbox closed", self.context);
        })
    }
}

fn spawn_initial_load(engine: SessionEngine) {
    tokio::spawn(async move {
        engine.request_load().await;
    });
}
