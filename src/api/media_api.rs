// Process-level facade wiring resolver, proxy, registry and bus together.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::EngineConfig;
use crate::coordinator::context::{CoordinatorParts, SurfaceCoordinator, SurfaceFactory};
use crate::coordinator::messaging::LocalBus;
use crate::coordinator::registry::{ContextId, MemoryRegistry, OwnerRegistry};
use crate::engine::session::{SessionEngine, SessionParts};
use crate::server::handler::ProxyServer;
use crate::source::http_resolver::HttpResolver;
use crate::source::traits::{MediaKind, MediaRequest};
use crate::surface::traits::Surface;

/// Everything one process needs to host media sessions in several contexts.
pub struct MediaHub {
    config: EngineConfig,
    resolver: Arc<HttpResolver>,
    proxy: Arc<ProxyServer>,
    registry: Arc<MemoryRegistry>,
    bus: Arc<LocalBus>,
}

impl MediaHub {
    /// Build the HTTP resolver and start the loopback proxy.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let resolver = Arc::new(HttpResolver::new(&config)?);
        let proxy = Arc::new(ProxyServer::start(&config).await?);
        let bus = Arc::new(LocalBus::new(config.coordination_timeout()));
        info!("media hub started, proxy on port {}", proxy.port());

        Ok(Self {
            config,
            resolver,
            proxy,
            registry: Arc::new(MemoryRegistry::new()),
            bus,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<HttpResolver> {
        &self.resolver
    }

    pub fn proxy(&self) -> &Arc<ProxyServer> {
        &self.proxy
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    /// Join a hosting context to the bus and start answering its requests.
    pub fn attach_context(
        &self,
        context: impl Into<ContextId>,
        surfaces: Arc<dyn SurfaceFactory>,
    ) -> Arc<SurfaceCoordinator> {
        let context = context.into();
        let parts = CoordinatorParts {
            resolver: self.resolver.clone(),
            delivery: self.proxy.clone(),
            registry: self.registry.clone(),
            messenger: self.bus.clone(),
            surfaces,
        };
        let coordinator = Arc::new(SurfaceCoordinator::new(context.clone(), parts, &self.config));
        let inbox = self.bus.register(context);
        coordinator.clone().serve(inbox);
        coordinator
    }

    /// Tear a hosting context down: close its surface and leave the bus.
    pub fn detach_context(&self, coordinator: &SurfaceCoordinator) {
        coordinator.on_destroyed();
        self.bus.unregister(coordinator.context());
    }

    pub fn current_owner(&self) -> Option<ContextId> {
        self.registry.get_owner()
    }

    /// A session for an image surface in the configured image category.
    pub fn image_session(&self, surface: Arc<dyn Surface>) -> SessionEngine {
        SessionEngine::new(
            SessionParts {
                resolver: self.resolver.clone(),
                delivery: self.proxy.clone(),
                surface,
            },
            MediaRequest::new(self.config.image_category.clone(), MediaKind::Image),
            &self.config,
        )
    }

    pub fn shutdown(&self) {
        self.proxy.shutdown();
        info!("media hub stopped");
    }
}
